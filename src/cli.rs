//! CLI argument parsing module
//!
//! Handles command-line argument parsing using `clap` derive macros and turns
//! the parsed arguments into the session core's configuration types.

use clap::{ArgAction, Parser};
use rumqttc::QoS;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

use crate::error::DashboardError;
use crate::message_log::LogConfig;
use crate::mqtt::BrokerConfig;
use crate::publisher::interval_from_secs;
use crate::util::{u8_to_qos, DEFAULT_KEEP_ALIVE_SECS};

/// Smallest schedule interval accepted on the command line, in seconds.
pub const MIN_SCHEDULE_INTERVAL_SECS: f64 = 0.1;

/// Command-line arguments for the MQTT dashboard.
///
/// Use the `validate()` method after parsing to ensure argument combinations are valid.
///
/// # Example
///
/// ```rust,ignore
/// use clap::Parser;
/// use mqtt_dashboard::cli::Args;
///
/// let args = Args::parse();
/// args.validate()?;
/// ```
#[derive(Parser, Debug)]
#[command(name = "mqtt-dashboard")]
#[command(about = "Watch, log and publish MQTT messages from the terminal")]
#[command(version)]
pub struct Args {
    /// MQTT broker address
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    pub port: u16,

    /// MQTT client ID (generated when omitted)
    #[arg(long)]
    pub client_id: Option<String>,

    /// MQTT username
    #[arg(long)]
    pub username: Option<String>,

    /// MQTT password
    #[arg(long)]
    pub password: Option<String>,

    /// Topic filter to subscribe (repeatable)
    #[arg(short = 't', long = "topic")]
    pub topics: Vec<String>,

    /// QoS level for subscriptions and the one-off publish (0, 1, or 2)
    #[arg(long, default_value = "0")]
    pub qos: u8,

    /// Publish one message to this topic after connecting
    #[arg(long)]
    pub publish_topic: Option<String>,

    /// Payload of the one-off publish
    #[arg(long)]
    pub publish_payload: Option<String>,

    /// Set the retain flag on the one-off publish
    #[arg(long, default_value = "false")]
    pub retain: bool,

    /// CSV schedule (columns Topic, Payload, QoS, Retain) to publish periodically
    #[arg(long)]
    pub schedule: Option<PathBuf>,

    /// Publish the built-in two-message schedule periodically
    #[arg(long, default_value = "false")]
    pub default_schedule: bool,

    /// Seconds between scheduled messages
    #[arg(long, default_value = "1.0")]
    pub interval: f64,

    /// Seconds between message log refreshes
    #[arg(long, default_value = "2.0")]
    pub refresh: f64,

    /// Seconds to wait for the broker to acknowledge the connection
    #[arg(long, default_value = "5.0")]
    pub connect_timeout: f64,

    /// MQTT keep-alive interval in seconds
    #[arg(long, default_value_t = DEFAULT_KEEP_ALIVE_SECS)]
    pub keep_alive: u64,

    /// SQLite file receiving every parsed JSON message
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Directory to export the message tables to on exit
    #[arg(long)]
    pub export_dir: Option<PathBuf>,

    /// Keep at most this many messages in each log
    #[arg(long)]
    pub max_messages: Option<usize>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Validate argument combinations.
    ///
    /// - QoS must be 0, 1, or 2
    /// - `--username` and `--password` go together
    /// - `--publish-payload` and `--retain` need `--publish-topic`
    /// - `--schedule` and `--default-schedule` are exclusive
    /// - intervals must be positive, the schedule interval at least 0.1 s
    ///
    /// # Returns
    ///
    /// - `Ok(())` if the argument combination is valid
    /// - `Err(String)` with a descriptive error message if validation fails
    pub fn validate(&self) -> Result<(), String> {
        if self.qos > 2 {
            return Err(format!("Invalid QoS level: {}. Must be 0, 1, or 2.", self.qos));
        }

        if self.host.trim().is_empty() {
            return Err("--host must not be empty".to_string());
        }

        if self.port == 0 {
            return Err("--port must be between 1 and 65535".to_string());
        }

        if self.username.is_some() != self.password.is_some() {
            return Err("--username and --password must be given together".to_string());
        }

        if self.publish_topic.is_none() {
            if self.publish_payload.is_some() {
                return Err("--publish-payload requires --publish-topic".to_string());
            }
            if self.retain {
                return Err("--retain requires --publish-topic".to_string());
            }
        }

        if self.schedule.is_some() && self.default_schedule {
            return Err("--schedule cannot be used with --default-schedule".to_string());
        }

        if !self.interval.is_finite() || self.interval < MIN_SCHEDULE_INTERVAL_SECS {
            return Err(format!(
                "Invalid interval: {}. Must be at least {} seconds.",
                self.interval, MIN_SCHEDULE_INTERVAL_SECS
            ));
        }

        if !self.refresh.is_finite() || self.refresh <= 0.0 {
            return Err(format!("Invalid refresh: {}. Must be positive.", self.refresh));
        }

        if !self.connect_timeout.is_finite() || self.connect_timeout <= 0.0 {
            return Err(format!(
                "Invalid connect timeout: {}. Must be positive.",
                self.connect_timeout
            ));
        }

        if self.keep_alive == 0 {
            return Err("--keep-alive must be at least 1 second".to_string());
        }

        if self.max_messages == Some(0) {
            return Err("--max-messages must be at least 1".to_string());
        }

        if self.topics.iter().any(|t| t.is_empty()) {
            return Err("--topic must not be empty".to_string());
        }

        Ok(())
    }

    /// Get QoS as rumqttc QoS enum. Falls back to QoS 0 for values `validate()` rejects.
    pub fn get_qos(&self) -> QoS {
        u8_to_qos(self.qos).unwrap_or(QoS::AtMostOnce)
    }

    /// Broker connection settings.
    pub fn broker_config(&self) -> BrokerConfig {
        let mut config = BrokerConfig::new(self.host.trim(), self.port)
            .with_connect_timeout(Duration::from_secs_f64(self.connect_timeout))
            .with_keep_alive(Duration::from_secs(self.keep_alive));
        if let Some(client_id) = &self.client_id {
            config = config.with_client_id(client_id.trim());
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            config = config.with_credentials(username, password);
        }
        config
    }

    pub fn log_config(&self) -> LogConfig {
        match self.max_messages {
            Some(max) => LogConfig::default().with_max_entries(max),
            None => LogConfig::default(),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(self.refresh)
    }

    pub fn schedule_interval(&self) -> Result<Duration, DashboardError> {
        interval_from_secs(self.interval)
    }

    /// Maximum log level from the `-v` count.
    pub fn log_level(&self) -> Level {
        match self.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}
