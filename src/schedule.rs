//! Periodic publishing schedules.
//!
//! A schedule is an ordered list of [`ScheduledEntry`] values, either the
//! built-in [`default_schedule`] or one loaded from a CSV table with the
//! columns `Topic`, `Payload`, `QoS` and `Retain` (any order, extra columns
//! ignored).

use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::ReaderBuilder;
use rumqttc::QoS;
use tracing::{info, warn};

use crate::error::DashboardError;
use crate::util::u8_to_qos;

/// Column names a schedule table must carry.
pub const REQUIRED_COLUMNS: [&str; 4] = ["Topic", "Payload", "QoS", "Retain"];

/// One message the periodic publisher sends per cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEntry {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

impl ScheduledEntry {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Schedule used when no table is loaded.
pub fn default_schedule() -> Vec<ScheduledEntry> {
    vec![
        ScheduledEntry::new("test/message", "Message 1"),
        ScheduledEntry::new("test/message", "Message 2")
            .with_qos(QoS::AtLeastOnce)
            .with_retain(true),
    ]
}

/// Result of loading a schedule table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleLoad {
    pub entries: Vec<ScheduledEntry>,
    /// 1-based data row numbers whose QoS cell was coerced to 0.
    pub coerced_qos_rows: Vec<usize>,
}

/// Interpret a QoS cell.
///
/// Numeric text is truncated toward zero (`"1.9"` is 1). Returns `None` for
/// anything unparseable or outside `0..=2`; callers treat that as QoS 0.
pub fn coerce_qos(raw: &str) -> Option<QoS> {
    let value: f64 = raw.trim().parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    let truncated = value.trunc();
    if !(0.0..=2.0).contains(&truncated) {
        return None;
    }
    u8_to_qos(truncated as u8)
}

/// `true` only for `"true"` or `"1"`, ignoring case and surrounding space.
pub fn coerce_retain(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "true" | "1")
}

/// Load a schedule table from any reader.
///
/// # Errors
///
/// [`DashboardError::ScheduleConfig`] when the input has no header row or
/// lacks a required column (all missing names are listed), and
/// [`DashboardError::Csv`] for malformed CSV.
pub fn load_schedule<R: Read>(reader: R) -> Result<ScheduleLoad, DashboardError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(DashboardError::ScheduleConfig("schedule file is empty".to_string()));
    }

    let position = |name: &str| headers.iter().position(|h| h.trim() == name);
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|name| position(name).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(DashboardError::ScheduleConfig(format!(
            "missing required columns: {}",
            missing.join(", ")
        )));
    }
    // Every required column was found above.
    let [topic_col, payload_col, qos_col, retain_col] =
        REQUIRED_COLUMNS.map(|name| position(name).unwrap_or_default());

    let mut load = ScheduleLoad::default();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let row = index + 1;
        let cell = |col: usize| record.get(col).unwrap_or("");

        let qos = match coerce_qos(cell(qos_col)) {
            Some(qos) => qos,
            None => {
                load.coerced_qos_rows.push(row);
                QoS::AtMostOnce
            }
        };
        load.entries.push(ScheduledEntry {
            topic: cell(topic_col).to_string(),
            payload: cell(payload_col).to_string(),
            qos,
            retain: coerce_retain(cell(retain_col)),
        });
    }

    if !load.coerced_qos_rows.is_empty() {
        warn!(
            rows = ?load.coerced_qos_rows,
            "Invalid QoS values in schedule; defaulting those rows to QoS 0"
        );
    }
    if load.entries.is_empty() {
        warn!("Schedule table has no rows");
    }
    Ok(load)
}

/// Load a schedule table from a CSV file.
pub fn load_schedule_file(path: &Path) -> Result<ScheduleLoad, DashboardError> {
    let file = File::open(path)?;
    let load = load_schedule(file)?;
    info!(path = %path.display(), entries = load.entries.len(), "Loaded schedule");
    Ok(load)
}
