//! MQTT Dashboard - terminal client for the dashboard session core
//!
//! Connects to a broker, subscribes to the requested topics, optionally
//! publishes a message and runs a periodic schedule, then prints new
//! messages on every refresh tick until interrupted.
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success (including graceful shutdown) |
//! | 1 | Configuration/argument error |
//! | 2 | Connection error (including a session lost while running) |
//! | 3 | File, CSV or store error |
//! | 4 | Runtime error |

use std::process::ExitCode;
use std::time::Duration;

use chrono::Local;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use mqtt_dashboard::cli::Args;
use mqtt_dashboard::error::DashboardError;
use mqtt_dashboard::export::export_snapshot;
use mqtt_dashboard::message_log::{LogSnapshot, ParsedJsonMessage, ReceivedMessage};
use mqtt_dashboard::schedule::{default_schedule, load_schedule_file};
use mqtt_dashboard::session::SessionCoordinator;
use mqtt_dashboard::store::JsonStore;
use mqtt_dashboard::util::format_timestamp;

/// Exit code for success (including graceful shutdown)
const EXIT_SUCCESS: u8 = 0;
/// Exit code for configuration/argument errors
const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for connection errors
const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for file I/O errors
const EXIT_IO_ERROR: u8 = 3;
/// Exit code for runtime errors
const EXIT_RUNTIME_ERROR: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = args.validate() {
        eprintln!("Error: Configuration error: {}", e);
        eprintln!("  Hint: Use --help for usage information");
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(error_to_exit_code(&e))
        }
    }
}

async fn run(args: Args) -> Result<(), DashboardError> {
    // Load everything that can fail locally before touching the network.
    let store = args.db.as_deref().map(JsonStore::open).transpose()?;
    let schedule = match &args.schedule {
        Some(path) => Some(load_schedule_file(path)?.entries),
        None if args.default_schedule => Some(default_schedule()),
        None => None,
    };
    let schedule_interval = args.schedule_interval()?;

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            eprintln!("Error setting up signal handler: {}", e);
        }
        let _ = shutdown_tx.send(());
    });

    let session = SessionCoordinator::new(args.log_config());
    session.connect(args.broker_config()).await?;

    let qos = args.get_qos();
    for topic in &args.topics {
        if let Err(e) = session.subscribe(topic, qos) {
            warn!(topic = %topic, "{}", e);
        }
    }

    if let Some(topic) = &args.publish_topic {
        let payload = args.publish_payload.as_deref().unwrap_or_default();
        if let Err(e) = session.publish(topic, payload.as_bytes(), qos, args.retain) {
            warn!("{}", e);
        }
    }

    if let Some(entries) = schedule {
        if let Err(e) = session.start_schedule(entries, schedule_interval) {
            warn!("{}", e);
        }
    }

    let mut follower = Follower::new(store.as_ref());
    let outcome = watch_messages(&session, &mut follower, args.refresh_interval(), &mut shutdown_rx).await;

    // Teardown hands back everything the session logged, including what
    // arrived after the last refresh. A dropped session was already torn down.
    session.disconnect();
    let records = session.closed_session().unwrap_or_default();
    follower.finish(&records);

    if let Some(dir) = &args.export_dir {
        if let Err(e) = export_snapshot(dir, &records, &Local::now()) {
            warn!("Export failed: {}", e);
        }
    }
    outcome
}

/// Prints new raw records and stores new parsed ones, remembering how far
/// it got in each log.
struct Follower<'a> {
    store: Option<&'a JsonStore>,
    seen_raw: u64,
    seen_parsed: u64,
}

impl<'a> Follower<'a> {
    fn new(store: Option<&'a JsonStore>) -> Self {
        Self {
            store,
            seen_raw: 0,
            seen_parsed: 0,
        }
    }

    fn follow(&mut self, raw: Vec<ReceivedMessage>, parsed: Vec<ParsedJsonMessage>) {
        for message in raw {
            println!(
                "[{}] #{} {}: {}",
                format_timestamp(&message.timestamp),
                message.seq,
                message.topic,
                message.payload
            );
            self.seen_raw = message.seq;
        }

        if let Some(last) = parsed.last() {
            self.seen_parsed = last.seq;
            if let Some(store) = self.store {
                if let Err(e) = store.insert_batch(&parsed) {
                    warn!("Failed to store parsed messages: {}", e);
                }
            }
        }
    }

    /// Follow whatever a closed session held past the last refresh.
    fn finish(&mut self, closed: &LogSnapshot) {
        let raw = closed
            .raw
            .iter()
            .filter(|m| m.seq > self.seen_raw)
            .cloned()
            .collect();
        let parsed = closed
            .parsed
            .iter()
            .filter(|m| m.seq > self.seen_parsed)
            .cloned()
            .collect();
        self.follow(raw, parsed);
    }
}

/// Follow the live log on every refresh tick until a shutdown signal
/// arrives or the session is lost.
async fn watch_messages(
    session: &SessionCoordinator,
    follower: &mut Follower<'_>,
    refresh: Duration,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<(), DashboardError> {
    let log = session.log();
    let mut ticker = tokio::time::interval(refresh);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                if !session.is_connected() {
                    let reason = session
                        .last_error()
                        .unwrap_or_else(|| "session closed".to_string());
                    return Err(DashboardError::NotConnected(format!("continue: {}", reason)));
                }
                follower.follow(
                    log.raw_since(follower.seen_raw),
                    log.parsed_since(follower.seen_parsed),
                );
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM (Ctrl+C elsewhere).
async fn wait_for_shutdown_signal() -> Result<(), DashboardError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                eprintln!("\nReceived SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = sigterm.recv() => {
                eprintln!("\nReceived SIGTERM, initiating graceful shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        eprintln!("\nReceived Ctrl+C, initiating graceful shutdown...");
    }

    Ok(())
}

fn error_to_exit_code(error: &DashboardError) -> u8 {
    match error {
        DashboardError::InvalidArgument(_) | DashboardError::ScheduleConfig(_) => EXIT_CONFIG_ERROR,
        DashboardError::Connection(_)
        | DashboardError::Client(_)
        | DashboardError::ConnectRefused(_)
        | DashboardError::ConnectTimeout(_)
        | DashboardError::NotConnected(_) => EXIT_CONNECTION_ERROR,
        DashboardError::Io(_)
        | DashboardError::Csv(_)
        | DashboardError::Json(_)
        | DashboardError::Store(_) => EXIT_IO_ERROR,
        DashboardError::PublishRejected { .. }
        | DashboardError::SubscribeRejected { .. }
        | DashboardError::ConcurrentSchedule(_) => EXIT_RUNTIME_ERROR,
    }
}
