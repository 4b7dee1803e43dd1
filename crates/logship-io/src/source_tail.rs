//! The tail source
//!
//! Follows every configured file from its current end, polling each at
//! its own interval and emitting one `Line` event per complete line.
//! A file that errors is dropped from the wheel with a `TailError` event;
//! when the wheel empties the source signals end-of-input. Rotation
//! detection is left to the platform: the reader keeps following the open
//! descriptor.

use std::io::SeekFrom;
use std::path::PathBuf;

use anyhow::Result;
use arcstr::ArcStr;
use async_trait::async_trait;
use logship_core::{LogshipError, Message, MsgTx, Operator, Source, TailSpec};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct TailSource {
    specs: Vec<TailSpec>,
}

struct Tailed {
    id: ArcStr,
    path: PathBuf,
    interval: Duration,
    reader: BufReader<File>,
    /// Bytes of an incomplete trailing line, waiting for its newline
    partial: String,
    next_poll: Instant,
}

impl TailSource {
    /// Startup requires at least one readable file.
    pub fn new(specs: Vec<TailSpec>) -> Result<Self, LogshipError> {
        let readable = specs
            .iter()
            .filter(|spec| std::fs::File::open(&spec.file).is_ok())
            .count();
        if readable == 0 {
            return Err(LogshipError::NoTailableInput);
        }
        Ok(Self { specs })
    }
}

#[async_trait]
impl Operator for TailSource {
    fn name(&self) -> &str {
        "tail"
    }
}

#[async_trait]
impl Source for TailSource {
    async fn run(&mut self, tx: MsgTx, cancel: CancellationToken) -> Result<()> {
        let mut wheel: Vec<Tailed> = Vec::new();
        for spec in &self.specs {
            let id = ArcStr::from(spec.file.to_string_lossy().as_ref());
            match open_at_end(&spec.file).await {
                Ok(reader) => {
                    info!(file = %spec.file.display(), interval = spec.interval, "tailing");
                    wheel.push(Tailed {
                        id,
                        path: spec.file.clone(),
                        interval: Duration::from_secs_f64(spec.interval.max(0.01)),
                        reader,
                        partial: String::new(),
                        next_poll: Instant::now(),
                    });
                }
                Err(e) => {
                    warn!(file = %spec.file.display(), error = %e, "cannot open tail file");
                    let _ = tx
                        .send(Message::TailError {
                            file: id,
                            op: "open",
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        }

        if wheel.is_empty() {
            let _ = tx.send(Message::Eos).await;
            anyhow::bail!("no tailable file could be opened");
        }

        while let Some(next) = wheel.iter().map(|t| t.next_poll).min() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(next) => {}
            }

            let now = Instant::now();
            let mut failed = Vec::new();
            for (i, tailed) in wheel.iter_mut().enumerate() {
                if tailed.next_poll > now {
                    continue;
                }
                tailed.next_poll = now + tailed.interval;
                match poll_lines(tailed, &tx).await {
                    Ok(true) => {}
                    Ok(false) => return Ok(()), // downstream hung up
                    Err(e) => {
                        warn!(file = %tailed.path.display(), error = %e, "tail read error, dropping file");
                        let _ = tx
                            .send(Message::TailError {
                                file: tailed.id.clone(),
                                op: "read",
                                message: e.to_string(),
                            })
                            .await;
                        failed.push(i);
                    }
                }
            }
            for i in failed.into_iter().rev() {
                wheel.remove(i);
            }
        }

        let _ = tx.send(Message::Eos).await; // best-effort
        Ok(())
    }
}

async fn open_at_end(path: &std::path::Path) -> std::io::Result<BufReader<File>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::End(0)).await?;
    Ok(BufReader::new(file))
}

/// Drain every complete line appended since the last poll.
///
/// Returns `Ok(false)` when the downstream channel is gone.
async fn poll_lines(tailed: &mut Tailed, tx: &MsgTx) -> std::io::Result<bool> {
    loop {
        let mut chunk = String::new();
        let n = tailed.reader.read_line(&mut chunk).await?;
        if n == 0 {
            return Ok(true);
        }
        if chunk.ends_with('\n') {
            let mut line = std::mem::take(&mut tailed.partial);
            line.push_str(chunk.trim_end_matches('\n').trim_end_matches('\r'));
            let msg = Message::Line {
                file: tailed.id.clone(),
                line,
            };
            if tx.send(msg).await.is_err() {
                return Ok(false);
            }
        } else {
            // hold the fragment until its newline arrives
            tailed.partial.push_str(&chunk);
        }
    }
}
