//! Error module
//!
//! Defines the error type shared by the session core, the persistence store
//! and the command-line client.
//!
//! Most of these errors are recoverable by design: the coordinator reports
//! them (as `tracing` warnings) and stays in a well-defined state. Payloads
//! that are not UTF-8 or not JSON are *not* errors; they are recorded in the
//! [`MessageLog`](crate::message_log::MessageLog) with a classification flag.

use thiserror::Error;

/// The main error type for the MQTT dashboard.
///
/// # Error Categories
///
/// - **Connection**: refused, timed out or dropped broker sessions
/// - **Requests**: publish / subscribe requests the client or broker declined
/// - **Schedule**: invalid periodic publisher configuration or a start that
///   would race a still-running publisher
/// - **I/O**: CSV, SQLite and file system failures
#[derive(Error, Debug)]
pub enum DashboardError {
    /// Transport level failure reported by the rumqttc event loop.
    ///
    /// Boxed because `rumqttc::ConnectionError` is large.
    #[error("MQTT connection error: {0}")]
    Connection(#[source] Box<rumqttc::ConnectionError>),

    /// The client refused to enqueue a request (request channel full or closed).
    #[error("MQTT client error: {0}")]
    Client(#[source] Box<rumqttc::ClientError>),

    /// The broker answered CONNECT with a non-success return code.
    #[error("Connection refused by broker: {0}")]
    ConnectRefused(String),

    /// No CONNACK arrived within the handshake window.
    #[error("Timed out after {0} ms waiting for the broker to acknowledge the connection")]
    ConnectTimeout(u64),

    /// A command that needs a live session was issued while disconnected.
    #[error("Not connected to MQTT broker: cannot {0}")]
    NotConnected(String),

    /// A publish request was not accepted.
    #[error("Publish to '{topic}' rejected: {reason}")]
    PublishRejected { topic: String, reason: String },

    /// A subscribe or unsubscribe request was not accepted.
    #[error("Subscription to '{topic}' rejected: {reason}")]
    SubscribeRejected { topic: String, reason: String },

    /// The periodic publisher configuration is unusable.
    #[error("Invalid schedule: {0}")]
    ScheduleConfig(String),

    /// A periodic publisher is still active (running, or cancelled but not yet exited).
    #[error("Periodic publisher still active: {0}")]
    ConcurrentSchedule(String),

    /// CSV reading or writing failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// General I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The SQLite message store failed.
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Invalid command-line argument or configuration value.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<rumqttc::ConnectionError> for DashboardError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        DashboardError::Connection(Box::new(err))
    }
}

impl From<rumqttc::ClientError> for DashboardError {
    fn from(err: rumqttc::ClientError) -> Self {
        DashboardError::Client(Box::new(err))
    }
}

impl DashboardError {
    /// True for errors raised while establishing or holding a broker session.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            DashboardError::Connection(_)
                | DashboardError::ConnectRefused(_)
                | DashboardError::ConnectTimeout(_)
        )
    }
}
