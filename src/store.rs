//! SQLite store for parsed JSON messages.
//!
//! Stores each parsed message as its original JSON text together with the
//! serial number, display timestamp and topic it had in the message log.
//! Rows come back newest first.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::DashboardError;
use crate::message_log::ParsedJsonMessage;
use crate::util::format_timestamp;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS json_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    serial_no INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    topic TEXT NOT NULL,
    json_data TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_json_messages_timestamp ON json_messages (timestamp);
CREATE INDEX IF NOT EXISTS idx_json_messages_topic ON json_messages (topic);
";

const SELECT_COLUMNS: &str = "SELECT serial_no, timestamp, topic, json_data, created_at FROM json_messages";
const NEWEST_FIRST: &str = "ORDER BY created_at DESC, id DESC";

/// A row read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub seq: u64,
    pub timestamp: String,
    pub topic: String,
    /// Stored document; an empty object if the stored text no longer parses.
    pub json: Value,
    /// UTC insertion time as written by SQLite.
    pub created_at: String,
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<StoredMessage> {
    let serial_no: i64 = row.get("serial_no")?;
    let json_text: String = row.get("json_data")?;
    let json = serde_json::from_str(&json_text).unwrap_or_else(|_| Value::Object(Map::new()));
    Ok(StoredMessage {
        seq: serial_no.max(0) as u64,
        timestamp: row.get("timestamp")?,
        topic: row.get("topic")?,
        json,
        created_at: row.get::<_, Option<String>>("created_at")?.unwrap_or_default(),
    })
}

/// Persistence for parsed JSON messages.
///
/// `rusqlite::Connection` is `!Sync`, so it lives behind a `Mutex`. The
/// connection is `None` after [`delete_store`](Self::delete_store).
pub struct JsonStore {
    conn: Mutex<Option<Connection>>,
    path: Option<PathBuf>,
}

impl JsonStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, DashboardError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!(path = %path.display(), "Opened message store");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// A store that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self, DashboardError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: None,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T, DashboardError>) -> Result<T, DashboardError> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or_else(|| {
            DashboardError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "message store has been deleted",
            ))
        })?;
        f(conn)
    }

    /// Insert one record.
    pub fn insert_one(&self, seq: u64, timestamp: &str, topic: &str, json: &Value) -> Result<(), DashboardError> {
        let json_text = serde_json::to_string(json)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO json_messages (serial_no, timestamp, topic, json_data) VALUES (?1, ?2, ?3, ?4)",
                params![seq as i64, timestamp, topic, json_text],
            )?;
            Ok(())
        })
    }

    /// Insert parsed log entries in one transaction. Returns the number inserted.
    pub fn insert_batch(&self, messages: &[ParsedJsonMessage]) -> Result<usize, DashboardError> {
        if messages.is_empty() {
            return Ok(0);
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO json_messages (serial_no, timestamp, topic, json_data) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for message in messages {
                    stmt.execute(params![
                        message.seq as i64,
                        format_timestamp(&message.timestamp),
                        &message.topic,
                        serde_json::to_string(&message.json)?,
                    ])?;
                }
            }
            tx.commit()?;
            debug!(count = messages.len(), "Stored parsed messages");
            Ok(messages.len())
        })
    }

    /// All records, newest first.
    pub fn get_all(&self) -> Result<Vec<StoredMessage>, DashboardError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!("{SELECT_COLUMNS} {NEWEST_FIRST}"))?;
            let rows = stmt.query_map([], row_to_message)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Records for one topic, newest first.
    pub fn get_by_topic(&self, topic: &str) -> Result<Vec<StoredMessage>, DashboardError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!("{SELECT_COLUMNS} WHERE topic = ?1 {NEWEST_FIRST}"))?;
            let rows = stmt.query_map(params![topic], row_to_message)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn count(&self) -> Result<u64, DashboardError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM json_messages", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
    }

    /// Topics present in the store, sorted.
    pub fn distinct_topics(&self) -> Result<Vec<String>, DashboardError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT DISTINCT topic FROM json_messages ORDER BY topic")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<String>, _>>()?)
        })
    }

    /// Delete every record. Returns the number removed.
    pub fn clear_all(&self) -> Result<usize, DashboardError> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM json_messages", [])?;
            info!(removed, "Cleared message store");
            Ok(removed)
        })
    }

    /// Close the connection and remove the database file.
    ///
    /// Returns true if a file was removed. Every later operation on this
    /// store fails.
    pub fn delete_store(&self) -> Result<bool, DashboardError> {
        let conn = self.lock().take();
        if let Some(conn) = conn {
            if let Err((_, e)) = conn.close() {
                warn!("Failed to close message store cleanly: {}", e);
            }
        }
        match &self.path {
            Some(path) if path.exists() => {
                std::fs::remove_file(path)?;
                info!(path = %path.display(), "Deleted message store");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
