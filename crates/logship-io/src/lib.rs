//! # Logship IO - Tail Source and Indexer Sink
//!
//! The I/O ends of the logship pipeline:
//!
//! - **TailSource**: polls the configured files and emits line events
//! - **ElasticSink**: the durable indexer; queues rendered bulk records,
//!   flushes them by size or timer into content-addressed batches,
//!   dispatches batches over a pooled HTTP client, spills failures to a
//!   disk backlog, and replays the backlog until it drains
//!
//! The sink is a single actor: every piece of mutable state lives on one
//! task, and the spawned HTTP work reports back through a mailbox. The
//! backlog directory is the only cross-process shared state, coordinated
//! with per-entry advisory locks.

pub mod backlog;
pub mod bulk;
pub mod dispatch;
pub mod flock;
pub mod sink_elastic;
pub mod source_tail;

pub use backlog::Backlog;
pub use flock::LockRegistry;
pub use sink_elastic::{ElasticSink, StatsHandler, StatsSnapshot};
pub use source_tail::TailSource;
