//! CSV export of the message tables.
//!
//! The raw table is written as `Serial No.,Timestamp,Topic,Payload`. The
//! parsed table has `Serial No.,Timestamp,Topic` followed by one column per
//! flattened key; cells are empty where a message lacks the key.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use csv::Writer;
use serde_json::Value;
use tracing::info;

use crate::error::DashboardError;
use crate::message_log::{LogSnapshot, ParsedJsonMessage, ReceivedMessage};
use crate::util::{file_stamp, format_timestamp};

const RAW_HEADER: [&str; 4] = ["Serial No.", "Timestamp", "Topic", "Payload"];

/// Render a flattened value as a CSV cell.
fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Write the raw log table.
pub fn write_received<W: Write>(out: W, messages: &[ReceivedMessage]) -> Result<(), DashboardError> {
    let mut writer = Writer::from_writer(out);
    writer.write_record(RAW_HEADER)?;
    for message in messages {
        writer.write_record([
            message.seq.to_string(),
            format_timestamp(&message.timestamp),
            message.topic.clone(),
            message.payload.clone(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the parsed-JSON table with the given flattened `columns`.
pub fn write_parsed<W: Write>(
    out: W,
    messages: &[ParsedJsonMessage],
    columns: &[String],
) -> Result<(), DashboardError> {
    let mut writer = Writer::from_writer(out);
    let mut header = vec!["Serial No.".to_string(), "Timestamp".to_string(), "Topic".to_string()];
    header.extend(columns.iter().cloned());
    writer.write_record(&header)?;

    for message in messages {
        let mut record = vec![
            message.seq.to_string(),
            format_timestamp(&message.timestamp),
            message.topic.clone(),
        ];
        record.extend(
            columns
                .iter()
                .map(|column| message.flattened.get(column).map(cell).unwrap_or_default()),
        );
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write both tables of `snapshot` into `dir`, named after `now`.
///
/// The parsed table is skipped when there are no parsed messages. Returns
/// the paths written.
pub fn export_snapshot(dir: &Path, snapshot: &LogSnapshot, now: &DateTime<Local>) -> Result<Vec<PathBuf>, DashboardError> {
    std::fs::create_dir_all(dir)?;
    let stamp = file_stamp(now);
    let mut written = Vec::new();

    let raw_path = dir.join(format!("mqtt_received_messages_{stamp}.csv"));
    write_received(File::create(&raw_path)?, &snapshot.raw)?;
    info!(path = %raw_path.display(), rows = snapshot.raw.len(), "Exported received messages");
    written.push(raw_path);

    if !snapshot.parsed.is_empty() {
        let parsed_path = dir.join(format!("mqtt_json_messages_{stamp}.csv"));
        write_parsed(File::create(&parsed_path)?, &snapshot.parsed, &snapshot.flattened_columns())?;
        info!(path = %parsed_path.display(), rows = snapshot.parsed.len(), "Exported parsed JSON messages");
        written.push(parsed_path);
    }
    Ok(written)
}
