//! Message log
//!
//! Thread-safe, append-only store of everything received on the current
//! broker session. Every inbound message lands in the *raw* log; messages
//! whose payload decodes as JSON are also added to the *parsed* log together
//! with their flattened `path -> value` mapping.
//!
//! The log has a single writer (the session's event pump, fed by the network
//! I/O task over a channel) and any number of readers. Both logs live behind
//! one `RwLock`, so [`MessageLog::snapshot`] always sees the two logs at the
//! same instant and a record is either fully present or absent.
//!
//! Sequence numbers are 1-based and assigned under the write lock, one
//! counter per log. Clearing resets both counters.
//!
//! Outside the crate the log is read-only; writes go through the session
//! coordinator.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::flatten::flatten_json;

/// Prefix of the text recorded for payloads that are not valid UTF-8.
/// The raw bytes follow base64-encoded after the `b64:` marker.
pub const UNDECODABLE_PREFIX: &str = "Non-UTF-8 payload (b64:";

/// A publish delivered by the broker, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }
}

/// Entry of the raw log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceivedMessage {
    pub seq: u64,
    pub timestamp: DateTime<Local>,
    pub topic: String,
    /// UTF-8 payload text, or the undecodable marker when `decode_failed`.
    pub payload: String,
    pub decode_failed: bool,
}

/// Entry of the parsed-JSON log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedJsonMessage {
    pub seq: u64,
    pub timestamp: DateTime<Local>,
    pub topic: String,
    pub json: Value,
    pub flattened: Map<String, Value>,
}

/// Sequence numbers given to one appended message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub raw_seq: u64,
    /// `None` when the payload was not JSON.
    pub parsed_seq: Option<u64>,
}

/// Retention settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Maximum records kept per log; the oldest are evicted first.
    /// `None` keeps everything.
    pub max_entries: Option<usize>,
}

impl LogConfig {
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }
}

/// Point-in-time copy of both logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogSnapshot {
    pub raw: Vec<ReceivedMessage>,
    pub parsed: Vec<ParsedJsonMessage>,
}

impl LogSnapshot {
    /// Flattened keys holding a number in at least one parsed message,
    /// in order of first appearance. These are the plottable series.
    pub fn numeric_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for msg in &self.parsed {
            for (key, value) in &msg.flattened {
                if value.is_number() && !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }

    /// Union of flattened keys across parsed messages, in order of first appearance.
    pub fn flattened_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for msg in &self.parsed {
            for key in msg.flattened.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }
}

#[derive(Debug, Default)]
struct Logs {
    raw: VecDeque<ReceivedMessage>,
    parsed: VecDeque<ParsedJsonMessage>,
    raw_count: u64,
    parsed_count: u64,
    epoch: u64,
}

/// Classification of a payload, computed outside the lock.
struct Classified {
    text: String,
    decode_failed: bool,
    json: Option<(Value, Map<String, Value>)>,
}

fn classify(payload: &[u8]) -> Classified {
    match std::str::from_utf8(payload) {
        Ok(text) => {
            let json = serde_json::from_str::<Value>(text).ok().map(|value| {
                let flat = flatten_json(&value);
                (value, flat)
            });
            Classified {
                text: text.to_string(),
                decode_failed: false,
                json,
            }
        }
        Err(_) => Classified {
            text: format!("{}{})", UNDECODABLE_PREFIX, BASE64_STANDARD.encode(payload)),
            decode_failed: true,
            json: None,
        },
    }
}

/// Thread-safe message store for one coordinator.
#[derive(Debug, Default)]
pub struct MessageLog {
    logs: RwLock<Logs>,
    config: LogConfig,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LogConfig) -> Self {
        Self {
            logs: RwLock::new(Logs::default()),
            config,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Logs> {
        self.logs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Logs> {
        self.logs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current session epoch. Appends tagged with an older epoch are dropped.
    pub(crate) fn epoch(&self) -> u64 {
        self.read().epoch
    }

    /// Append to the current session.
    #[cfg(test)]
    pub(crate) fn append(&self, inbound: InboundMessage) -> AppendOutcome {
        let classified = classify(&inbound.payload);
        let mut logs = self.write();
        self.push(&mut logs, inbound, classified)
    }

    /// Append on behalf of the session identified by `epoch`.
    ///
    /// Returns `None` (and stores nothing) if the log has been reset since
    /// that session began, so late deliveries from a torn-down link cannot
    /// leak into the next session.
    pub(crate) fn append_for(&self, epoch: u64, inbound: InboundMessage) -> Option<AppendOutcome> {
        let classified = classify(&inbound.payload);
        let mut logs = self.write();
        if logs.epoch != epoch {
            return None;
        }
        Some(self.push(&mut logs, inbound, classified))
    }

    fn push(&self, logs: &mut Logs, inbound: InboundMessage, classified: Classified) -> AppendOutcome {
        logs.raw_count += 1;
        let raw_seq = logs.raw_count;
        logs.raw.push_back(ReceivedMessage {
            seq: raw_seq,
            timestamp: inbound.received_at,
            topic: inbound.topic.clone(),
            payload: classified.text,
            decode_failed: classified.decode_failed,
        });

        let parsed_seq = classified.json.map(|(json, flattened)| {
            logs.parsed_count += 1;
            let seq = logs.parsed_count;
            logs.parsed.push_back(ParsedJsonMessage {
                seq,
                timestamp: inbound.received_at,
                topic: inbound.topic,
                json,
                flattened,
            });
            seq
        });

        if let Some(max) = self.config.max_entries {
            while logs.raw.len() > max {
                logs.raw.pop_front();
            }
            while logs.parsed.len() > max {
                logs.parsed.pop_front();
            }
        }

        AppendOutcome {
            raw_seq,
            parsed_seq,
        }
    }

    /// Consistent copy of both logs.
    pub fn snapshot(&self) -> LogSnapshot {
        let logs = self.read();
        LogSnapshot {
            raw: logs.raw.iter().cloned().collect(),
            parsed: logs.parsed.iter().cloned().collect(),
        }
    }

    /// Raw records with a sequence number greater than `seq`.
    pub fn raw_since(&self, seq: u64) -> Vec<ReceivedMessage> {
        let logs = self.read();
        let start = logs.raw.partition_point(|m| m.seq <= seq);
        logs.raw.range(start..).cloned().collect()
    }

    /// Parsed records with a sequence number greater than `seq`.
    pub fn parsed_since(&self, seq: u64) -> Vec<ParsedJsonMessage> {
        let logs = self.read();
        let start = logs.parsed.partition_point(|m| m.seq <= seq);
        logs.parsed.range(start..).cloned().collect()
    }

    /// Number of records currently held in the raw log.
    pub fn raw_len(&self) -> usize {
        self.read().raw.len()
    }

    /// Number of records currently held in the parsed log.
    pub fn parsed_len(&self) -> usize {
        self.read().parsed.len()
    }

    /// Highest sequence numbers assigned so far (raw, parsed).
    pub fn last_seqs(&self) -> (u64, u64) {
        let logs = self.read();
        (logs.raw_count, logs.parsed_count)
    }

    /// Empty both logs and restart numbering at 1. The epoch is kept, so
    /// the running session keeps appending.
    pub(crate) fn clear(&self) {
        let mut logs = self.write();
        logs.raw.clear();
        logs.parsed.clear();
        logs.raw_count = 0;
        logs.parsed_count = 0;
    }

    /// Clear and start a new session epoch. Returns what the closed
    /// session held, taken under the same lock as the clear.
    pub(crate) fn reset_session(&self) -> LogSnapshot {
        let mut logs = self.write();
        let closed = LogSnapshot {
            raw: logs.raw.drain(..).collect(),
            parsed: logs.parsed.drain(..).collect(),
        };
        logs.raw_count = 0;
        logs.parsed_count = 0;
        logs.epoch += 1;
        closed
    }
}
