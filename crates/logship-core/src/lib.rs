//! # Logship Core - Shared Types and Abstractions
//!
//! This crate provides the foundational types, traits, and configuration
//! structures for the logship agent. It defines the message type flowing
//! between pipeline stages, the operator interfaces, the document model,
//! and the YAML configuration surface.
//!
//! ## Key Components
//!
//! - **Message System**: line and document messages passed between stages
//! - **Operator Traits**: Source, Transform, and Sink abstractions
//! - **Document Model**: untyped JSON trees with reserved bulk metadata
//! - **Configuration**: YAML-based agent specification
//!
//! ## Example Usage
//!
//! ```rust
//! use logship_core::{Message, Document};
//!
//! let mut doc = Document::new();
//! doc.insert("msg", serde_json::json!("hello"));
//! let msg = Message::Doc(doc);
//! # let _ = msg;
//! ```

use anyhow::Result;
use arcstr::ArcStr;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod document;

pub use config::{
    AgentConfig, Decoder, ElasticsearchConfig, ExtractBy, ExtractSpec, MutateSpec, TailSpec,
};
pub use document::{BulkMeta, Document};

/// Type alias for the sender side of a pipeline channel
pub type MsgTx = mpsc::Sender<Message>;

/// Type alias for the receiver side of a pipeline channel
pub type MsgRx = mpsc::Receiver<Message>;

/// Messages passed between pipeline stages
///
/// A tailed line travels the first edge, a finished document the second.
/// Tail errors ride the pipeline so the indexer can count them, and `Eos`
/// tells downstream stages that no more data is coming.
#[derive(Debug, Clone)]
pub enum Message {
    /// A raw line read from a tailed file
    Line {
        /// Source file path, shared across every line of the file
        file: ArcStr,
        /// The line content, newline stripped
        line: String,
    },

    /// A finished document ready for bulk rendering
    Doc(Document),

    /// A tail failure; the file has been dropped from the active set
    TailError {
        file: ArcStr,
        /// The operation that failed (open, read, poll)
        op: &'static str,
        message: String,
    },

    /// End-of-stream marker
    ///
    /// Signals that no more data will be sent through this channel,
    /// allowing downstream stages to drain and exit.
    Eos,
}

/// Error types for logship pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum LogshipError {
    /// A pipeline channel closed while a stage was still producing
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Configuration the agent cannot start with
    #[error("config error: {0}")]
    Config(String),

    /// No tailable input was readable at startup
    #[error("no tailable file could be opened")]
    NoTailableInput,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Base trait for all pipeline operators
#[async_trait]
pub trait Operator: Send + Sync {
    /// Returns the unique name/identifier of this operator
    ///
    /// Used for logging and pipeline construction.
    fn name(&self) -> &str;
}

/// Trait for data source operators
///
/// Sources are the entry points of the pipeline, responsible for emitting
/// raw line events from the tailed file set.
#[async_trait]
pub trait Source: Operator {
    /// Run the source operator
    ///
    /// # Arguments
    /// * `tx` - Channel sender for publishing messages downstream
    /// * `cancel` - Cancellation token for graceful shutdown
    async fn run(&mut self, tx: MsgTx, cancel: CancellationToken) -> Result<()>;
}

/// Trait for transformation operators
///
/// Transforms turn raw lines into finished documents, dropping lines that
/// produce nothing.
#[async_trait]
pub trait Transform: Operator {
    /// Run the transform operator
    ///
    /// # Arguments
    /// * `rx` - Channel receiver for consuming input messages
    /// * `tx` - Channel sender for publishing transformed messages
    /// * `cancel` - Cancellation token for graceful shutdown
    async fn run(&mut self, rx: MsgRx, tx: MsgTx, cancel: CancellationToken) -> Result<()>;
}

/// Trait for sink operators
///
/// Sinks are the exit points of the pipeline; the indexer sink owns the
/// bulk queue, the dispatcher, and the backlog store.
#[async_trait]
pub trait Sink: Operator {
    /// Run the sink operator
    ///
    /// # Arguments
    /// * `rx` - Channel receiver for consuming input messages
    /// * `cancel` - Cancellation token for graceful shutdown
    async fn run(&mut self, rx: MsgRx, cancel: CancellationToken) -> Result<()>;
}
