//! Agent configuration
//!
//! The YAML surface the CLI loads: one `elasticsearch` block for the
//! indexer and a `tail` list with one entry per followed file.
//!
//! # Example configuration
//!
//! ```yaml
//! elasticsearch:
//!   servers: ["es01:9200", "es02:9200"]
//!   timeout: 10
//!   flush_interval: 30
//!   flush_size: 1000
//!   index: "logs-%Y.%m.%d"
//!   type: "log"
//! tail:
//!   - file: /var/log/messages
//!     interval: 1
//!     decode: [syslog]
//!   - file: /var/log/app.log
//!     decode: [json]
//!     mutate:
//!       rename: { lvl: level }
//!       prune: true
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::LogshipError;

/// Complete agent specification loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Indexer configuration
    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,

    /// One entry per tailed file
    #[serde(default)]
    pub tail: Vec<TailSpec>,
}

/// Configuration for the indexer sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    /// Cluster nodes as `host:port`; one is picked at random per request
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,

    /// Per-request timeout in seconds; the HTTP client adds one second of
    /// client-side overhead allowance on top
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Seconds between timer-triggered flushes (jittered at startup)
    #[serde(default = "default_flush_interval")]
    pub flush_interval: f64,

    /// Queue length that forces an immediate flush (jittered at startup)
    #[serde(default = "default_flush_size")]
    pub flush_size: usize,

    /// strftime pattern expanded into the target index for documents
    /// that carry no `_index` of their own
    #[serde(default = "default_index")]
    pub index: String,

    /// Default document type for documents without `_type`
    #[serde(rename = "type", default = "default_type")]
    pub doc_type: String,

    /// Directory holding spilled batches
    #[serde(default = "default_batch_dir")]
    pub batch_dir: PathBuf,

    /// Disk-space ceiling in bytes for the backlog directory; unset
    /// disables reclamation
    #[serde(default)]
    pub batch_disk_space: Option<u64>,

    /// Seconds between stats snapshots
    #[serde(default = "default_stats_interval")]
    pub stats_interval: f64,

    /// Index templates synced to the cluster at startup, name to body
    #[serde(default)]
    pub templates: HashMap<String, serde_json::Value>,
}

/// Per-file tail instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailSpec {
    /// Path of the file to follow
    pub file: PathBuf,

    /// Poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub interval: f64,

    /// Index override for documents from this file
    #[serde(default)]
    pub index: Option<String>,

    /// Type override for documents from this file
    #[serde(rename = "type", default)]
    pub doc_type: Option<String>,

    /// Ordered decoders, results merged left-to-right
    #[serde(default)]
    pub decode: Vec<Decoder>,

    /// Ordered extractors applied after decoding
    #[serde(default)]
    pub extract: Vec<ExtractSpec>,

    /// Mutators applied once the document is non-empty
    #[serde(default)]
    pub mutate: Option<MutateSpec>,
}

/// Line decoders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decoder {
    /// Decode JSON from the first `{` in the line; merge into the document
    Json,
    /// Parse the line as syslog; replaces the document
    Syslog,
}

/// Extractor strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractBy {
    Split,
    /// Reserved; accepted and ignored
    Regex,
}

/// One extractor acting on the raw line or a named field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractSpec {
    pub by: ExtractBy,

    /// Source field; unset means the raw line
    #[serde(default)]
    pub from: Option<String>,

    /// Guard regex; the extractor is skipped when the source doesn't match
    #[serde(default)]
    pub when: Option<String>,

    /// Separator regex for `by: split`
    #[serde(default)]
    pub split_on: Option<String>,

    /// Positional part names; `null`/`undef` (any case) skips a position
    #[serde(default)]
    pub split_parts: Vec<String>,

    /// Destination field; parts nest under it as a map when names are given
    #[serde(rename = "into", default)]
    pub into_key: Option<String>,
}

/// Copy destinations: one target or several
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CopyTarget {
    One(String),
    Many(Vec<String>),
}

impl CopyTarget {
    pub fn targets(&self) -> &[String] {
        match self {
            CopyTarget::One(t) => std::slice::from_ref(t),
            CopyTarget::Many(ts) => ts,
        }
    }
}

/// Mutators, applied in fixed order: copy, rename, remove, append, prune
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutateSpec {
    #[serde(default)]
    pub copy: HashMap<String, CopyTarget>,

    #[serde(default)]
    pub rename: HashMap<String, String>,

    #[serde(default)]
    pub remove: Vec<String>,

    #[serde(default)]
    pub append: HashMap<String, serde_json::Value>,

    /// Delete keys whose value is null or the empty string
    #[serde(default)]
    pub prune: bool,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            timeout: default_timeout(),
            flush_interval: default_flush_interval(),
            flush_size: default_flush_size(),
            index: default_index(),
            doc_type: default_type(),
            batch_dir: default_batch_dir(),
            batch_disk_space: None,
            stats_interval: default_stats_interval(),
            templates: HashMap::new(),
        }
    }
}

impl AgentConfig {
    /// Load and validate an agent config from a YAML file
    pub fn load(path: &Path) -> Result<Self, LogshipError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LogshipError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate an agent config from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, LogshipError> {
        let cfg: AgentConfig =
            serde_yaml::from_str(content).map_err(|e| LogshipError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), LogshipError> {
        if self.tail.is_empty() {
            return Err(LogshipError::Config("no tail entries configured".into()));
        }
        if self.elasticsearch.servers.is_empty() {
            return Err(LogshipError::Config("elasticsearch.servers is empty".into()));
        }
        for spec in &self.tail {
            for ex in &spec.extract {
                if ex.by == ExtractBy::Split && ex.split_on.is_none() {
                    return Err(LogshipError::Config(format!(
                        "tail entry {}: split extractor without split_on",
                        spec.file.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

// Default value functions
fn default_servers() -> Vec<String> {
    vec!["localhost:9200".to_string()]
}
fn default_timeout() -> u64 {
    5
}
fn default_flush_interval() -> f64 {
    30.0
}
fn default_flush_size() -> usize {
    1000
}
fn default_index() -> String {
    "logs-%Y.%m.%d".to_string()
}
fn default_type() -> String {
    "log".to_string()
}
fn default_batch_dir() -> PathBuf {
    PathBuf::from("/tmp/logship/batches")
}
fn default_stats_interval() -> f64 {
    60.0
}
fn default_poll_interval() -> f64 {
    1.0
}
