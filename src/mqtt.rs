//! MQTT client module
//!
//! Wraps the `rumqttc` client as a [`BrokerLink`]: one broker session with
//! connect / disconnect, publish, subscribe / unsubscribe, and a network I/O
//! task that forwards everything the broker sends as [`LinkEvent`]s over a
//! channel.
//!
//! Requests are enqueued with the non-blocking `try_*` calls of
//! `rumqttc::AsyncClient`, so publishing or subscribing never waits on the
//! network. Only [`BrokerLink::connect`] awaits, and only for the bounded
//! CONNACK handshake.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Local;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::DashboardError;
use crate::message_log::InboundMessage;
use crate::util::{
    generate_client_id, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_KEEP_ALIVE_SECS,
    DISCONNECT_TIMEOUT_SECS,
};

/// Connection parameters for one broker session.
///
/// Immutable once handed to [`BrokerLink::new`]; connecting with different
/// parameters means building a new link.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// The hostname or IP address of the MQTT broker
    pub host: String,

    /// The port number of the MQTT broker
    pub port: u16,

    /// Client identifier. Generated when empty.
    pub client_id: String,

    /// Optional username for broker authentication
    pub username: Option<String>,

    /// Optional password for broker authentication
    pub password: Option<String>,

    /// MQTT keep-alive interval
    pub keep_alive: Duration,

    /// How long [`BrokerLink::connect`] waits for CONNACK
    pub connect_timeout: Duration,

    /// Capacity of the rumqttc request channel
    pub channel_capacity: usize,
}

impl BrokerConfig {
    /// Creates a configuration for `host:port` with a generated client ID.
    ///
    /// # Example
    ///
    /// ```
    /// use mqtt_dashboard::mqtt::BrokerConfig;
    ///
    /// let config = BrokerConfig::new("localhost", 1883)
    ///     .with_client_id("dashboard")
    ///     .with_credentials("user", "pass");
    /// assert!(config.has_credentials());
    /// ```
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            channel_capacity: 256,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Returns true if both username and password are set.
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        options
    }
}

/// What the network I/O task reports to the owner of a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A PUBLISH from the broker.
    Message(InboundMessage),
    /// SUBACK for `topic`; `granted` is `None` when the broker refused it.
    SubscribeAck { topic: String, granted: Option<QoS> },
    /// The session ended without a local disconnect request.
    Dropped { reason: String },
}

/// Something messages can be published through.
///
/// Implemented by [`BrokerLink`]; the periodic publisher only depends on
/// this trait.
pub trait Publish: Send + Sync {
    fn is_connected(&self) -> bool;

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<(), DashboardError>;
}

/// One MQTT session.
pub struct BrokerLink {
    config: BrokerConfig,
    client: AsyncClient,
    /// Taken by `connect`; a link can only be started once.
    eventloop: Mutex<Option<EventLoop>>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    /// Topics of SUBSCRIBE requests not yet seen leaving the event loop, in request order.
    pending_subscribes: Arc<Mutex<VecDeque<String>>>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerLink {
    /// Builds the client for `config`. Nothing touches the network until
    /// [`connect`](Self::connect).
    pub fn new(mut config: BrokerConfig) -> Self {
        config.client_id = generate_client_id(&Some(config.client_id.clone()));
        let (client, eventloop) = AsyncClient::new(config.mqtt_options(), config.channel_capacity);
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            client,
            eventloop: Mutex::new(Some(eventloop)),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown,
            pending_subscribes: Arc::new(Mutex::new(VecDeque::new())),
            io_task: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Opens the session and starts the network I/O task.
    ///
    /// Waits at most `connect_timeout` for the broker's CONNACK. On success
    /// the link is connected and keeps forwarding [`LinkEvent`]s to `events`
    /// until it is disconnected or the broker drops it. On failure the I/O
    /// task is stopped and the link stays disconnected.
    pub async fn connect(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), DashboardError> {
        let eventloop = self
            .eventloop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| DashboardError::InvalidArgument("broker link was already started".to_string()))?;

        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            "Connecting to MQTT broker"
        );

        let (ack_tx, ack_rx) = oneshot::channel();
        let io = IoTask {
            connected: Arc::clone(&self.connected),
            events,
            pending_subscribes: Arc::clone(&self.pending_subscribes),
            shutdown: self.shutdown.subscribe(),
            ack: Some(ack_tx),
            subscribe_topics: HashMap::new(),
        };
        let handle = tokio::spawn(io.run(eventloop));
        *self.io_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let timeout_ms = saturating_millis(self.config.connect_timeout);
        match tokio::time::timeout(self.config.connect_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(host = %self.config.host, port = self.config.port, "Connected to MQTT broker");
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                warn!("Failed to connect: {}", e);
                self.disconnect();
                Err(e)
            }
            Ok(Err(_)) => {
                self.disconnect();
                Err(DashboardError::ConnectRefused(
                    "network task ended before the broker acknowledged".to_string(),
                ))
            }
            Err(_) => {
                warn!("No CONNACK within {} ms", timeout_ms);
                self.disconnect();
                Err(DashboardError::ConnectTimeout(timeout_ms))
            }
        }
    }

    /// Stops the I/O task and closes the session.
    ///
    /// Idempotent and non-blocking: the DISCONNECT packet is flushed by the
    /// I/O task on its way out.
    pub fn disconnect(&self) {
        if *self.shutdown.borrow() {
            return;
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.client.try_disconnect() {
                debug!("Could not enqueue DISCONNECT: {}", e);
            }
            info!(host = %self.config.host, "Disconnected from MQTT broker");
        }
        self.shutdown.send_replace(true);
    }

    /// True once the I/O task has exited (or was never started).
    pub fn is_closed(&self) -> bool {
        self.io_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    /// Requests a subscription. The broker's verdict arrives later as
    /// [`LinkEvent::SubscribeAck`].
    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), DashboardError> {
        if !self.is_connected() {
            warn!(topic, "Not connected to MQTT broker. Cannot subscribe.");
            return Err(DashboardError::NotConnected("subscribe".to_string()));
        }
        // Held across the request so pending order matches channel order.
        let mut pending = self
            .pending_subscribes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        pending.push_back(topic.to_string());
        match self.client.try_subscribe(topic, qos) {
            Ok(()) => {
                info!(topic, ?qos, "Subscription request sent");
                Ok(())
            }
            Err(e) => {
                pending.pop_back();
                warn!(topic, "Failed to send subscription request: {}", e);
                Err(DashboardError::SubscribeRejected {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), DashboardError> {
        if !self.is_connected() {
            warn!(topic, "Not connected to MQTT broker. Cannot unsubscribe.");
            return Err(DashboardError::NotConnected("unsubscribe".to_string()));
        }
        self.client.try_unsubscribe(topic).map_err(|e| {
            warn!(topic, "Failed to send unsubscribe request: {}", e);
            DashboardError::SubscribeRejected {
                topic: topic.to_string(),
                reason: e.to_string(),
            }
        })?;
        info!(topic, "Unsubscribed");
        Ok(())
    }
}

impl Publish for BrokerLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<(), DashboardError> {
        if !self.is_connected() {
            warn!(topic, "Not connected to MQTT broker. Cannot publish.");
            return Err(DashboardError::NotConnected("publish".to_string()));
        }
        self.client
            .try_publish(topic, qos, retain, payload.to_vec())
            .map_err(|e| {
                warn!(topic, "Failed to publish: {}", e);
                DashboardError::PublishRejected {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                }
            })?;
        debug!(topic, bytes = payload.len(), "Published");
        Ok(())
    }
}

impl Drop for BrokerLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// State owned by the network I/O task.
struct IoTask {
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LinkEvent>,
    pending_subscribes: Arc<Mutex<VecDeque<String>>>,
    shutdown: watch::Receiver<bool>,
    /// Resolved by the first CONNACK or the first error.
    ack: Option<oneshot::Sender<Result<(), DashboardError>>>,
    /// Packet id -> topic of SUBSCRIBEs awaiting SUBACK.
    subscribe_topics: HashMap<u16, String>,
}

impl IoTask {
    async fn run(mut self, mut eventloop: EventLoop) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    self.flush_disconnect(&mut eventloop).await;
                    break;
                }
                polled = eventloop.poll() => {
                    match polled {
                        Ok(event) => {
                            if !self.handle_event(event) {
                                break;
                            }
                        }
                        Err(e) => {
                            self.handle_error(e);
                            break;
                        }
                    }
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        debug!("MQTT network task stopped");
    }

    /// Returns false when the session is over.
    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    self.connected.store(true, Ordering::SeqCst);
                    if let Some(tx) = self.ack.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
            }
            Event::Incoming(Packet::Publish(p)) => {
                let _ = self.events.send(LinkEvent::Message(InboundMessage {
                    topic: p.topic,
                    payload: p.payload.to_vec(),
                    received_at: Local::now(),
                }));
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                let topic = self
                    .pending_subscribes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                if let Some(topic) = topic {
                    self.subscribe_topics.insert(pkid, topic);
                }
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                if let Some(topic) = self.subscribe_topics.remove(&ack.pkid) {
                    let granted = match ack.return_codes.first() {
                        Some(SubscribeReasonCode::Success(qos)) => Some(*qos),
                        _ => None,
                    };
                    match granted {
                        Some(qos) => info!(%topic, ?qos, "Subscription acknowledged"),
                        None => warn!(%topic, "Subscription rejected by broker"),
                    }
                    let _ = self.events.send(LinkEvent::SubscribeAck { topic, granted });
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                self.report_drop("broker sent DISCONNECT".to_string());
                return false;
            }
            _ => {}
        }
        true
    }

    fn handle_error(&mut self, error: rumqttc::ConnectionError) {
        if let Some(tx) = self.ack.take() {
            let err = match error {
                rumqttc::ConnectionError::ConnectionRefused(code) => {
                    DashboardError::ConnectRefused(format!("{:?}", code))
                }
                other => DashboardError::from(other),
            };
            let _ = tx.send(Err(err));
            return;
        }
        if *self.shutdown.borrow() {
            return;
        }
        warn!("MQTT connection lost: {}", error);
        self.report_drop(error.to_string());
    }

    fn report_drop(&self, reason: String) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(LinkEvent::Dropped { reason });
    }

    /// Drive the event loop until the queued DISCONNECT is written, bounded
    /// by [`DISCONNECT_TIMEOUT_SECS`]. Skipped when the handshake never completed.
    async fn flush_disconnect(&self, eventloop: &mut EventLoop) {
        if self.ack.is_some() {
            return;
        }
        let _ = tokio::time::timeout(Duration::from_secs(DISCONNECT_TIMEOUT_SECS), async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
    }
}

/// Whole milliseconds in `duration`, clamped to `u64::MAX`.
fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
