//! The document model
//!
//! A document is an untyped JSON object assembled by the transform
//! pipeline. Reserved keys carry bulk routing metadata and are lifted out
//! of the payload at render time; `_raw` and `_path` stay in the payload
//! and are fair game for mutators.

use serde_json::{Map, Value};

/// Payload key holding the originating line
pub const RAW_KEY: &str = "_raw";
/// Payload key holding the source file path
pub const PATH_KEY: &str = "_path";

/// A structured document on its way to the bulk queue
#[derive(Debug, Clone, Default)]
pub struct Document {
    /// The key/value tree, including any reserved keys not yet lifted out
    pub fields: Map<String, Value>,
    /// Pre-rendered bulk text; when set, the queue uses it verbatim
    pub raw_bulk: Option<String>,
}

/// Routing metadata lifted out of a document during bulk rendering
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkMeta {
    pub index: Option<String>,
    pub doc_type: Option<String>,
    pub id: Option<String>,
    /// Epoch seconds selecting the time used to expand the index pattern
    pub epoch: Option<i64>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            raw_bulk: None,
        }
    }

    /// A document carrying pre-rendered bulk text, used verbatim by the queue
    pub fn pre_rendered(bulk: String) -> Self {
        Self {
            fields: Map::new(),
            raw_bulk: Some(bulk),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.raw_bulk.is_none()
    }

    /// Remove the reserved metadata keys from the payload and return them.
    ///
    /// After this call the payload is what goes on the document line of the
    /// bulk record.
    pub fn strip_meta(&mut self) -> BulkMeta {
        let index = self
            .fields
            .remove("_index")
            .and_then(|v| v.as_str().map(str::to_owned));
        let doc_type = self
            .fields
            .remove("_type")
            .and_then(|v| v.as_str().map(str::to_owned));
        let id = self.fields.remove("_id").map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        });
        let epoch = self.fields.remove("_epoch").and_then(|v| match v {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.parse().ok(),
            _ => None,
        });
        BulkMeta {
            index,
            doc_type,
            id,
            epoch,
        }
    }
}
