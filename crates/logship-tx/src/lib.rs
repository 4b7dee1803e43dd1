//! # Logship Transform - Line-to-Document Pipeline
//!
//! This crate turns raw tailed lines into finished documents. Each tailed
//! file gets its own compiled pipeline of three stages:
//!
//! - **Decode**: `json` and `syslog` decoders grow or replace the document
//! - **Extract**: split fields out of the line or out of decoded values
//! - **Mutate**: copy, rename, remove, append, prune
//!
//! A line that produces an empty document after decode and extract is
//! dropped silently and counted. Finished documents carry the originating
//! line under `_raw` and the source path under `_path`, stamped before the
//! mutate stage so mutators can act on them.
//!
//! ## Example
//!
//! ```rust
//! use logship_core::TailSpec;
//! use logship_tx::FilePipeline;
//!
//! let spec: TailSpec = serde_yaml::from_str(r#"
//! file: /var/log/app.log
//! decode: [json]
//! "#).unwrap();
//! let pipeline = FilePipeline::compile(&spec).unwrap();
//! let doc = pipeline.apply("/var/log/app.log", r#"{"msg":"up"}"#).unwrap();
//! assert_eq!(doc.fields["msg"], "up");
//! ```

use std::collections::HashMap;

use anyhow::{Context, Result};
use arcstr::ArcStr;
use async_trait::async_trait;
use logship_core::document::{PATH_KEY, RAW_KEY};
use logship_core::{Decoder, Document, Message, MsgRx, MsgTx, Operator, TailSpec, Transform};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod decode;
pub mod extract;
pub mod mutate;
pub mod syslog;

use extract::CompiledExtract;
use mutate::CompiledMutate;

/// The compiled pipeline for one tailed file
#[derive(Debug)]
pub struct FilePipeline {
    decoders: Vec<Decoder>,
    extractors: Vec<CompiledExtract>,
    mutate: Option<CompiledMutate>,
    index: Option<String>,
    doc_type: Option<String>,
}

impl FilePipeline {
    /// Compile the pipeline, validating every pattern up front
    pub fn compile(spec: &TailSpec) -> Result<Self> {
        let extractors = spec
            .extract
            .iter()
            .map(CompiledExtract::compile)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("tail entry {}", spec.file.display()))?;
        Ok(Self {
            decoders: spec.decode.clone(),
            extractors,
            mutate: spec.mutate.as_ref().map(CompiledMutate::compile),
            index: spec.index.clone(),
            doc_type: spec.doc_type.clone(),
        })
    }

    /// Run one line through the pipeline; `None` drops the line
    pub fn apply(&self, file: &str, line: &str) -> Option<Document> {
        let mut fields = Map::new();

        decode::apply(&self.decoders, line, &mut fields);
        for extractor in &self.extractors {
            extractor.apply(line, &mut fields);
        }

        // Nothing decoded and nothing extracted: the line has no document.
        if fields.is_empty() {
            return None;
        }

        // Stamped before mutate so remove/prune can reach them.
        fields.insert(RAW_KEY.into(), json!(line));
        fields.insert(PATH_KEY.into(), json!(file));

        if let Some(mutate) = &self.mutate {
            mutate.apply(&mut fields);
        }

        if let Some(index) = &self.index {
            fields.insert("_index".into(), Value::String(index.clone()));
        }
        if let Some(doc_type) = &self.doc_type {
            fields.insert("_type".into(), Value::String(doc_type.clone()));
        }

        Some(Document::from_map(fields))
    }
}

/// The transform stage: routes each line to its file's pipeline
pub struct DocumentTransform {
    pipelines: HashMap<ArcStr, FilePipeline>,
    dropped: u64,
}

impl DocumentTransform {
    pub fn new(specs: &[TailSpec]) -> Result<Self> {
        let mut pipelines = HashMap::with_capacity(specs.len());
        for spec in specs {
            let key = ArcStr::from(spec.file.to_string_lossy().as_ref());
            pipelines.insert(key, FilePipeline::compile(spec)?);
        }
        Ok(Self {
            pipelines,
            dropped: 0,
        })
    }
}

#[async_trait]
impl Operator for DocumentTransform {
    fn name(&self) -> &str {
        "transform"
    }
}

#[async_trait]
impl Transform for DocumentTransform {
    async fn run(&mut self, mut rx: MsgRx, tx: MsgTx, cancel: CancellationToken) -> Result<()> {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            match msg {
                Message::Line { file, line } => {
                    let Some(pipeline) = self.pipelines.get(&file) else {
                        warn!(%file, "line from file with no tail instruction");
                        continue;
                    };
                    match pipeline.apply(&file, &line) {
                        Some(doc) => {
                            if tx.send(Message::Doc(doc)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            self.dropped += 1;
                            debug!(%file, "line produced no document");
                        }
                    }
                }
                // Errors ride through so the indexer can count them.
                err @ Message::TailError { .. } => {
                    if tx.send(err).await.is_err() {
                        break;
                    }
                }
                Message::Eos => break,
                // Already-built documents pass straight through.
                doc @ Message::Doc(_) => {
                    if tx.send(doc).await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = tx.send(Message::Eos).await; // best-effort
        info!(dropped = self.dropped, "transform finished");
        Ok(())
    }
}
