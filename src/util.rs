//! Utility functions shared by the session core and the command-line client.
//!
//! QoS conversions, client ID generation and timestamp formatting.

use chrono::{DateTime, Local};
use rumqttc::QoS;

/// Timeout in seconds for flushing a DISCONNECT packet before the I/O task exits.
pub const DISCONNECT_TIMEOUT_SECS: u64 = 2;

/// Default MQTT keep-alive in seconds.
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Default time to wait for CONNACK after opening the session.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Prefix of generated client identifiers.
pub const CLIENT_ID_PREFIX: &str = "mqtt-dashboard-";

/// Display format of message timestamps (`YYYY-MM-DD HH:MM:SS`).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Convert QoS enum to u8 value.
#[must_use]
pub fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// Convert a u8 value to QoS, returning `None` outside `0..=2`.
#[must_use]
pub fn u8_to_qos(qos: u8) -> Option<QoS> {
    match qos {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Generate a client ID from an optional string.
///
/// If `client_id` is `Some` and non-empty it is returned unchanged.
/// Otherwise a unique ID is derived from the current time in nanoseconds.
#[must_use]
pub fn generate_client_id(client_id: &Option<String>) -> String {
    match client_id {
        Some(id) if !id.is_empty() => id.clone(),
        _ => {
            use std::time::{SystemTime, UNIX_EPOCH};
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            let hash = timestamp ^ (timestamp >> 32) ^ u128::from(std::process::id());
            format!("{}{:08x}", CLIENT_ID_PREFIX, hash as u32)
        }
    }
}

/// Format a timestamp as `YYYY-MM-DD HH:MM:SS`.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Local>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Compact timestamp used in export file names (`YYYYmmdd_HHMMSS`).
#[must_use]
pub fn file_stamp(ts: &DateTime<Local>) -> String {
    ts.format("%Y%m%d_%H%M%S").to_string()
}
