//! Session coordinator
//!
//! The single owner of dashboard session state. Presentation code issues
//! commands (connect, subscribe, publish, schedule control) and reads the
//! message log; it never touches the broker link directly.
//!
//! # Message flow
//!
//! ```text
//! BrokerLink I/O task --LinkEvent--> pump task --append--> MessageLog <--read-- UI
//! ```
//!
//! The pump task is the only writer of the log. It tags appends with the log
//! epoch captured when its session started, so messages still queued from a
//! torn-down session are discarded instead of leaking into the next one.
//!
//! Tearing down a connected session moves its records out of the log in one
//! step; they stay readable through [`SessionCoordinator::closed_session`]
//! until the next connected session ends.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use rumqttc::QoS;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::DashboardError;
use crate::message_log::{LogConfig, LogSnapshot, MessageLog};
use crate::mqtt::{BrokerConfig, BrokerLink, LinkEvent, Publish};
use crate::publisher::PeriodicPublisher;
use crate::schedule::ScheduledEntry;

/// Lifecycle of the coordinator's broker session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Broker verdict on a subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Pending,
    Granted(QoS),
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    /// QoS that was requested.
    pub qos: QoS,
    pub status: SubscriptionStatus,
}

/// Topics subscribed in the current session, sorted by topic.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    entries: BTreeMap<String, Subscription>,
}

impl SubscriptionSet {
    /// Add or refresh `topic` as pending. Returns true if it was not present.
    pub fn insert(&mut self, topic: &str, qos: QoS) -> bool {
        self.entries
            .insert(
                topic.to_string(),
                Subscription {
                    topic: topic.to_string(),
                    qos,
                    status: SubscriptionStatus::Pending,
                },
            )
            .is_none()
    }

    pub fn remove(&mut self, topic: &str) -> bool {
        self.entries.remove(topic).is_some()
    }

    /// Apply a SUBACK. Ignored for topics no longer in the set.
    pub fn record_ack(&mut self, topic: &str, granted: Option<QoS>) -> bool {
        match self.entries.get_mut(topic) {
            Some(entry) => {
                entry.status = match granted {
                    Some(qos) => SubscriptionStatus::Granted(qos),
                    None => SubscriptionStatus::Rejected,
                };
                true
            }
            None => false,
        }
    }

    pub fn get(&self, topic: &str) -> Option<&Subscription> {
        self.entries.get(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.values()
    }

    pub fn topics(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Whether a periodic publisher is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    Idle,
    Running,
    /// Cancelled, but the task has not exited yet.
    Stopping,
}

#[derive(Default)]
struct Inner {
    state: SessionState,
    link: Option<Arc<BrokerLink>>,
    /// Bumped on every teardown; events and handshakes from older sessions are ignored.
    generation: u64,
    subscriptions: SubscriptionSet,
    publisher: Option<PeriodicPublisher>,
    last_error: Option<String>,
    /// Records of the most recent connected session that was torn down.
    closed_session: Option<LogSnapshot>,
}

struct Shared {
    inner: Mutex<Inner>,
    log: Arc<MessageLog>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop the publisher, close the link, and clear per-session state.
    fn teardown(&self, inner: &mut Inner) {
        if let Some(publisher) = &inner.publisher {
            publisher.stop();
        }
        if let Some(link) = inner.link.take() {
            link.disconnect();
        }
        inner.subscriptions.clear();
        let closed = self.log.reset_session();
        if inner.state == SessionState::Connected {
            inner.closed_session = Some(closed);
        }
        inner.state = SessionState::Disconnected;
        inner.generation += 1;
    }
}

/// Process-wide session state holder. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionCoordinator {
    shared: Arc<Shared>,
}

impl Default for SessionCoordinator {
    fn default() -> Self {
        Self::new(LogConfig::default())
    }
}

impl SessionCoordinator {
    pub fn new(log_config: LogConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                log: Arc::new(MessageLog::with_config(log_config)),
            }),
        }
    }

    /// Open a broker session, replacing any current one.
    ///
    /// Resolves once the broker acknowledged the connection or the handshake
    /// failed. Either way the coordinator ends in a definite state:
    /// `Connected` on success, `Disconnected` otherwise.
    pub async fn connect(&self, config: BrokerConfig) -> Result<(), DashboardError> {
        let (link, generation, events_tx) = {
            let mut inner = self.shared.lock();
            if inner.state != SessionState::Disconnected {
                info!("Replacing current broker session");
            }
            self.shared.teardown(&mut inner);

            let link = Arc::new(BrokerLink::new(config));
            inner.link = Some(Arc::clone(&link));
            inner.state = SessionState::Connecting;

            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(pump(
                Arc::downgrade(&self.shared),
                inner.generation,
                self.shared.log.epoch(),
                rx,
            ));
            (link, inner.generation, tx)
        };

        let result = link.connect(events_tx).await;

        let mut inner = self.shared.lock();
        if inner.generation != generation {
            link.disconnect();
            return Err(DashboardError::NotConnected(
                "complete connect: the session was closed during the handshake".to_string(),
            ));
        }
        match result {
            Ok(()) => {
                inner.state = SessionState::Connected;
                inner.last_error = None;
                Ok(())
            }
            Err(e) => {
                self.shared.teardown(&mut inner);
                inner.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Close the session: stops the periodic publisher, disconnects, and
    /// clears the message log and subscriptions. Safe in any state.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        if inner.state == SessionState::Disconnected && inner.link.is_none() {
            debug!("Disconnect requested while already disconnected");
            return;
        }
        self.shared.teardown(&mut inner);
        info!("Session closed");
    }

    /// Request a subscription. Its status stays `Pending` until the broker's
    /// SUBACK arrives. Subscribing to a topic already in the set re-sends
    /// the request with the new QoS.
    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), DashboardError> {
        if topic.is_empty() {
            return Err(DashboardError::InvalidArgument("topic must not be empty".to_string()));
        }
        let mut inner = self.shared.lock();
        let link = connected_link(&inner, "subscribe")?;
        if inner.subscriptions.contains(topic) {
            info!(topic, "Already subscribed; requesting again");
        }
        // Lock held so the SUBACK cannot be applied before the entry exists.
        link.subscribe(topic, qos)?;
        inner.subscriptions.insert(topic, qos);
        Ok(())
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), DashboardError> {
        let mut inner = self.shared.lock();
        let link = connected_link(&inner, "unsubscribe")?;
        link.unsubscribe(topic)?;
        if !inner.subscriptions.remove(topic) {
            debug!(topic, "Unsubscribed from a topic that was not in the subscription set");
        }
        Ok(())
    }

    /// Publish one message on the current session.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<(), DashboardError> {
        let link = connected_link(&self.shared.lock(), "publish")?;
        link.publish(topic, payload, qos, retain)
    }

    /// Start the periodic publisher.
    ///
    /// Rejected with [`DashboardError::ConcurrentSchedule`] while a previous
    /// publisher has not exited, including one that was stopped but is still
    /// winding down.
    pub fn start_schedule(&self, entries: Vec<ScheduledEntry>, interval: Duration) -> Result<(), DashboardError> {
        let mut inner = self.shared.lock();
        let link = connected_link(&inner, "start periodic publishing")?;
        if let Some(previous) = &inner.publisher {
            if !previous.is_finished() {
                let reason = if previous.is_cancelled() {
                    "the previous publisher is still stopping"
                } else {
                    "a publisher is already running"
                };
                warn!("Cannot start periodic publishing: {}", reason);
                return Err(DashboardError::ConcurrentSchedule(reason.to_string()));
            }
        }
        inner.publisher = Some(PeriodicPublisher::start(entries, interval, link)?);
        Ok(())
    }

    /// Signal the periodic publisher to stop. Returns false if none was running.
    pub fn stop_schedule(&self) -> bool {
        let inner = self.shared.lock();
        match &inner.publisher {
            Some(publisher) if !publisher.is_cancelled() => {
                publisher.stop();
                true
            }
            _ => false,
        }
    }

    pub fn schedule_status(&self) -> ScheduleStatus {
        match &self.shared.lock().publisher {
            Some(p) if p.is_finished() => ScheduleStatus::Idle,
            Some(p) if p.is_cancelled() => ScheduleStatus::Stopping,
            Some(_) => ScheduleStatus::Running,
            None => ScheduleStatus::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Reason the last session ended or failed to start, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    pub fn client_id(&self) -> Option<String> {
        self.shared
            .lock()
            .link
            .as_ref()
            .map(|link| link.client_id().to_string())
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.lock().subscriptions.iter().cloned().collect()
    }

    /// Read access to the message log. Only the coordinator writes to it.
    pub fn log(&self) -> Arc<MessageLog> {
        Arc::clone(&self.shared.log)
    }

    pub fn snapshot(&self) -> LogSnapshot {
        self.shared.log.snapshot()
    }

    /// Empty the message log on user request. Numbering restarts at 1 and the
    /// current session keeps logging.
    pub fn clear_log(&self) {
        self.shared.log.clear();
        info!("Message log cleared");
    }

    /// Everything the last torn-down connected session had logged, whether it
    /// ended by [`disconnect`](Self::disconnect), a reconnect or a broker drop.
    pub fn closed_session(&self) -> Option<LogSnapshot> {
        self.shared.lock().closed_session.clone()
    }
}

fn connected_link(inner: &Inner, action: &str) -> Result<Arc<BrokerLink>, DashboardError> {
    match (&inner.state, &inner.link) {
        (SessionState::Connected, Some(link)) => Ok(Arc::clone(link)),
        _ => {
            warn!("Not connected to MQTT broker. Cannot {}.", action);
            Err(DashboardError::NotConnected(action.to_string()))
        }
    }
}

/// Drain one link's events into the coordinator. Ends when the link's I/O
/// task exits or the coordinator is gone.
async fn pump(
    shared: Weak<Shared>,
    generation: u64,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match event {
            LinkEvent::Message(message) => {
                if shared.log.append_for(epoch, message).is_none() {
                    debug!("Discarded message from a closed session");
                }
            }
            LinkEvent::SubscribeAck { topic, granted } => {
                let mut inner = shared.lock();
                if inner.generation == generation {
                    inner.subscriptions.record_ack(&topic, granted);
                }
            }
            LinkEvent::Dropped { reason } => {
                let mut inner = shared.lock();
                if inner.generation == generation {
                    warn!(%reason, "Broker session lost");
                    shared.teardown(&mut inner);
                    inner.last_error = Some(reason);
                }
                break;
            }
        }
    }
}
