//! MQTT Dashboard Library
//!
//! The session core of an MQTT dashboard: a broker link, a sequenced
//! message log with JSON flattening, a periodic publisher and the session
//! coordinator that owns them, plus the persistence store, CSV export and
//! command-line configuration used by the `mqtt-dashboard` binary.

pub mod cli;
pub mod error;
pub mod export;
pub mod flatten;
pub mod message_log;
pub mod mqtt;
pub mod publisher;
pub mod schedule;
pub mod session;
pub mod store;
pub mod util;
