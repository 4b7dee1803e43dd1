//! # Logship CLI - Agent Runner
//!
//! Loads the YAML agent configuration and runs the tail → transform →
//! index pipeline until the tailed file set empties or Ctrl-C arrives.
//!
//! ## Usage
//!
//! ```bash
//! # Run with the default configuration path
//! logship
//!
//! # Run a specific configuration with debug logging
//! logship --config ./logship.yaml --debug
//!
//! # Tighter stats cadence
//! logship --config ./logship.yaml --stats-interval 10
//! ```
//!
//! Exit code is 0 on a normal shutdown and non-zero when startup fails:
//! unreadable configuration, no tailable input, or a bad pattern in a
//! tail entry.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use logship_core::{AgentConfig, Sink, Source, Transform};
use logship_io::{ElasticSink, TailSource};
use logship_tx::DocumentTransform;
use tokio::{signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the logship agent
#[derive(Parser, Debug)]
#[command(name = "logship")]
#[command(about = "Tail files into an Elasticsearch-compatible cluster")]
struct Args {
    /// Agent YAML configuration file
    #[arg(short, long, default_value = "/etc/logship.yaml")]
    config: PathBuf,

    /// Seconds between stats snapshots
    #[arg(long, default_value_t = 60.0)]
    stats_interval: f64,

    /// Default the log filter to debug (RUST_LOG still wins)
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let fallback = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut cfg = AgentConfig::load(&args.config)?;
    cfg.elasticsearch.stats_interval = args.stats_interval;
    info!(config = %args.config.display(), files = cfg.tail.len(), "starting");

    let mut source = TailSource::new(cfg.tail.clone())?;
    let mut transform = DocumentTransform::new(&cfg.tail)?;
    let mut sink = ElasticSink::new(cfg.elasticsearch);

    let cancel = CancellationToken::new();
    let (line_tx, line_rx) = mpsc::channel(1024);
    let (doc_tx, doc_rx) = mpsc::channel(1024);

    let mut handles = Vec::new();
    let c = cancel.child_token();
    handles.push(tokio::spawn(async move { source.run(line_tx, c).await }));
    let c = cancel.child_token();
    handles.push(tokio::spawn(
        async move { transform.run(line_rx, doc_tx, c).await },
    ));
    let c = cancel.child_token();
    handles.push(tokio::spawn(async move { sink.run(doc_rx, c).await }));

    let pipeline = async {
        let mut first_err: Option<anyhow::Error> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e.into());
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    };
    tokio::pin!(pipeline);

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            cancel.cancel();
        }
        result = &mut pipeline => return result,
    }

    // let the indexer drain its queue and in-flight requests
    pipeline.await
}
