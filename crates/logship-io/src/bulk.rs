//! Bulk record rendering and content-addressed batches
//!
//! A bulk record is two JSON objects as newline-delimited text: the action
//! envelope and the document body, each newline-terminated. A batch is the
//! concatenation of one or more records, identified by the hex SHA-1 of
//! its exact bytes, so a replay-read of the same file yields the same id.

use anyhow::Result;
use chrono::format::{Item, StrftimeItems};
use chrono::{Local, TimeZone};
use logship_core::Document;
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use tracing::warn;

/// Render one document into its bulk record.
///
/// `_index`/`_type`/`_id`/`_epoch` are lifted out of the payload; the
/// winning index pattern (document override or default) is strftime-
/// expanded against `_epoch`, falling back to the current time, in local
/// time. Pre-rendered documents pass through verbatim.
pub fn render_record(mut doc: Document, default_index: &str, default_type: &str) -> Result<String> {
    if let Some(mut raw) = doc.raw_bulk.take() {
        if !raw.ends_with('\n') {
            raw.push('\n');
        }
        return Ok(raw);
    }

    let meta = doc.strip_meta();
    let pattern = meta.index.as_deref().unwrap_or(default_index);
    let index = expand_index(pattern, meta.epoch);
    let doc_type = meta.doc_type.unwrap_or_else(|| default_type.to_string());

    let mut action = Map::new();
    action.insert("_index".into(), Value::String(index));
    action.insert("_type".into(), Value::String(doc_type));
    if let Some(id) = meta.id {
        action.insert("_id".into(), Value::String(id));
    }
    let mut envelope = Map::new();
    envelope.insert("index".into(), Value::Object(action));

    Ok(format!(
        "{}\n{}\n",
        serde_json::to_string(&envelope)?,
        serde_json::to_string(&doc.fields)?
    ))
}

/// strftime-expand an index pattern in local time.
///
/// A pattern with a bad conversion is used as a literal rather than
/// aborting the record.
pub fn expand_index(pattern: &str, epoch: Option<i64>) -> String {
    let items: Vec<Item> = StrftimeItems::new(pattern).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        warn!(pattern, "index pattern has an invalid conversion, using it verbatim");
        return pattern.to_string();
    }
    let when = epoch
        .and_then(|secs| Local.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Local::now);
    when.format_with_items(items.iter()).to_string()
}

/// Concatenate records into batch bytes and derive the content-addressed id
pub fn seal(records: &[String]) -> (String, Vec<u8>) {
    let mut bytes = Vec::with_capacity(records.iter().map(String::len).sum());
    for record in records {
        bytes.extend_from_slice(record.as_bytes());
    }
    (batch_id(&bytes), bytes)
}

/// Hex SHA-1 of the exact batch bytes; doubles as the backlog file stem
pub fn batch_id(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Records in a batch: every record contributes exactly two newlines
pub fn record_count(bytes: &[u8]) -> u64 {
    bytes.iter().filter(|&&b| b == b'\n').count() as u64 / 2
}
