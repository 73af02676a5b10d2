//! Periodic publisher
//!
//! Cycles through a schedule, publishing one entry per interval on a
//! background task until stopped. Publish failures are logged and the cycle
//! continues; cancellation is observed between messages and wakes the task
//! out of its sleep immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::DashboardError;
use crate::mqtt::Publish;
use crate::schedule::ScheduledEntry;

/// Validate a schedule interval given in seconds.
pub fn interval_from_secs(secs: f64) -> Result<Duration, DashboardError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(DashboardError::ScheduleConfig(format!(
            "interval must be a positive number of seconds, got {}",
            secs
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Handle to one running publish loop.
///
/// Dropping the handle cancels the loop as well.
pub struct PeriodicPublisher {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl PeriodicPublisher {
    /// Spawn the publish loop.
    ///
    /// # Errors
    ///
    /// [`DashboardError::ScheduleConfig`] for an empty schedule or a
    /// non-positive interval, [`DashboardError::NotConnected`] when `link`
    /// has no live session. No task is started in either case.
    pub fn start<P>(entries: Vec<ScheduledEntry>, interval: Duration, link: Arc<P>) -> Result<Self, DashboardError>
    where
        P: Publish + ?Sized + 'static,
    {
        if entries.is_empty() {
            return Err(DashboardError::ScheduleConfig("schedule has no entries".to_string()));
        }
        if interval.is_zero() {
            return Err(DashboardError::ScheduleConfig("interval must be positive".to_string()));
        }
        if !link.is_connected() {
            warn!("Not connected to MQTT broker. Cannot start periodic publishing.");
            return Err(DashboardError::NotConnected("start periodic publishing".to_string()));
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let count = entries.len();
        let handle = tokio::spawn(run(entries, interval, link, cancel_rx));
        info!(entries = count, interval_secs = interval.as_secs_f64(), "Periodic publishing started");

        Ok(Self { cancel, handle })
    }

    /// Request cancellation. Returns immediately; the task exits at its next
    /// cancellation point.
    pub fn stop(&self) {
        if !self.cancel.send_replace(true) {
            info!("Periodic publishing stop requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// True once the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait for the task, returning how many messages it published.
    pub async fn shutdown(self) -> u64 {
        self.stop();
        let Self { handle, .. } = self;
        handle.await.unwrap_or_default()
    }
}

async fn run<P>(entries: Vec<ScheduledEntry>, interval: Duration, link: Arc<P>, mut cancel: watch::Receiver<bool>) -> u64
where
    P: Publish + ?Sized,
{
    let mut published = 0u64;
    'cycle: loop {
        for entry in &entries {
            if *cancel.borrow() {
                break 'cycle;
            }
            match link.publish(&entry.topic, entry.payload.as_bytes(), entry.qos, entry.retain) {
                Ok(()) => {
                    published += 1;
                    debug!(topic = %entry.topic, "Scheduled message published");
                }
                Err(e) => warn!(topic = %entry.topic, "Scheduled publish failed: {}", e),
            }
            tokio::select! {
                // A closed channel means the handle is gone.
                _ = cancel.changed() => break 'cycle,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
    info!(published, "Periodic publishing stopped");
    published
}
