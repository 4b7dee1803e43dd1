//! The indexer sink
//!
//! A single actor task owns the bulk queue, the in-memory batch and
//! start-time tables, the counters, and the readiness flag. HTTP
//! dispatches and health probes run in spawned tasks and deliver their
//! completions back through a mailbox channel, so every state mutation
//! happens on this task and a partially built batch is never reachable
//! by a dispatch.
//!
//! Flushes fire when the queue reaches the flush size or when the flush
//! timer expires, whichever comes first. Both thresholds are multiplied
//! by a uniform random factor in [1.00, 1.45] at construction so
//! co-deployed agents don't flush in lockstep.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use logship_core::{Document, ElasticsearchConfig, Message, MsgRx, Operator, Sink};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backlog::{Backlog, REPLAY_PER_PASS};
use crate::bulk;
use crate::dispatch::{parse_bulk_body, EsClient, HttpReply, SinkEvent};

/// A drained counter snapshot, sorted by name
pub type StatsSnapshot = BTreeMap<String, u64>;

/// Callback invoked with each stats snapshot; an `Err` disables it for
/// the rest of the session
pub type StatsHandler = Box<dyn FnMut(&StatsSnapshot) -> Result<()> + Send + Sync>;

/// Session counters, drained at every snapshot
#[derive(Debug, Default)]
struct Stats {
    counters: BTreeMap<&'static str, u64>,
}

impl Stats {
    fn incr(&mut self, name: &'static str, by: u64) {
        if by == 0 {
            return;
        }
        *self.counters.entry(name).or_insert(0) += by;
    }

    fn take(&mut self) -> StatsSnapshot {
        std::mem::take(&mut self.counters)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

/// The indexer sink: bulk queue, dispatcher, and backlog in one actor
pub struct ElasticSink {
    cfg: ElasticsearchConfig,
    flush_size: usize,
    flush_interval: Duration,
    stats_interval: Duration,
    replay_interval: Duration,
    replay_backoff: Duration,
    stats_handler: Option<StatsHandler>,
}

impl ElasticSink {
    pub fn new(cfg: ElasticsearchConfig) -> Self {
        // one factor for both thresholds, drawn fresh per process
        let jitter: f64 = rand::rng().random_range(1.0..=1.45);
        let flush_size = ((cfg.flush_size as f64) * jitter) as usize;
        let flush_interval = Duration::from_secs_f64((cfg.flush_interval * jitter).max(0.05));
        let stats_interval = Duration::from_secs_f64(cfg.stats_interval.max(0.1));
        debug!(
            flush_size,
            flush_interval_ms = flush_interval.as_millis() as u64,
            "flush thresholds after jitter"
        );
        Self {
            cfg,
            flush_size,
            flush_interval,
            stats_interval,
            replay_interval: Duration::from_secs(60),
            replay_backoff: Duration::from_secs(15),
            stats_handler: None,
        }
    }

    /// Receive a snapshot of the counters at every stats interval
    pub fn with_stats_handler(mut self, handler: StatsHandler) -> Self {
        self.stats_handler = Some(handler);
        self
    }

    /// Override the pause before a replay pass (default 60 s)
    pub fn with_replay_interval(mut self, interval: Duration) -> Self {
        self.replay_interval = interval;
        self
    }

    /// Override the backoff between oversized replay passes (default 15 s)
    pub fn with_replay_backoff(mut self, backoff: Duration) -> Self {
        self.replay_backoff = backoff;
        self
    }

    /// Flush size after jitter; the queue never outlives this length
    pub fn effective_flush_size(&self) -> usize {
        self.flush_size
    }
}

#[async_trait]
impl Operator for ElasticSink {
    fn name(&self) -> &str {
        "elasticsearch"
    }
}

#[async_trait]
impl Sink for ElasticSink {
    async fn run(&mut self, rx: MsgRx, cancel: CancellationToken) -> Result<()> {
        let client = EsClient::new(&self.cfg.servers, self.cfg.timeout)?;
        if !self.cfg.templates.is_empty() {
            client.sync_templates(&self.cfg.templates).await;
        }
        let backlog = Backlog::new(self.cfg.batch_dir.clone(), self.cfg.batch_disk_space)?;
        let (evt_tx, evt_rx) = mpsc::channel(64);

        let mut core = Core {
            client,
            backlog,
            evt_tx,
            default_index: self.cfg.index.clone(),
            default_type: self.cfg.doc_type.clone(),
            flush_size: self.flush_size,
            flush_interval: self.flush_interval,
            replay_interval: self.replay_interval,
            replay_backoff: self.replay_backoff,
            stats_handler: self.stats_handler.take(),
            queue: Vec::new(),
            batches: HashMap::new(),
            start: HashMap::new(),
            in_flight: HashSet::new(),
            recs: HashMap::new(),
            stats: Stats::default(),
            es_ready: true,
            shutdown: false,
            flush_at: Instant::now() + self.flush_interval,
            replay_at: None,
        };

        // A backlog left by an earlier run replays without waiting for a
        // fresh spill.
        if !core.backlog.list().is_empty() {
            core.replay_at = Some(Instant::now() + core.replay_interval);
        }

        core.run(rx, evt_rx, self.stats_interval, cancel).await
    }
}

struct Core {
    client: EsClient,
    backlog: Backlog,
    evt_tx: mpsc::Sender<SinkEvent>,
    default_index: String,
    default_type: String,
    flush_size: usize,
    flush_interval: Duration,
    replay_interval: Duration,
    replay_backoff: Duration,
    stats_handler: Option<StatsHandler>,

    /// Rendered records awaiting the next flush
    queue: Vec<String>,
    /// Sealed batches by id, resident until delivered or spilled
    batches: HashMap<String, Vec<u8>>,
    /// First-dispatch times by id; survives failures for retry latency
    start: HashMap<String, Instant>,
    /// Ids with an HTTP request currently on the wire
    in_flight: HashSet<String>,
    /// Record counts of dispatched batches, for the consumed counter
    recs: HashMap<String, u64>,
    stats: Stats,
    es_ready: bool,
    shutdown: bool,
    flush_at: Instant,
    replay_at: Option<Instant>,
}

impl Core {
    async fn run(
        &mut self,
        mut rx: MsgRx,
        mut evt_rx: mpsc::Receiver<SinkEvent>,
        stats_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut stats_tick = interval_at(Instant::now() + stats_interval, stats_interval);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flush_sleep = sleep_until(self.flush_at);
            let replay_sleep = sleep_until(
                self.replay_at
                    .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400)),
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.begin_shutdown();
                    break;
                }
                Some(evt) = evt_rx.recv() => self.on_event(evt),
                maybe = rx.recv() => match maybe {
                    Some(Message::Doc(doc)) => self.enqueue(vec![doc]),
                    Some(Message::TailError { file, op, message }) => {
                        self.stats.incr("wheel_error", 1);
                        warn!(%file, op, %message, "tail error");
                    }
                    Some(Message::Line { .. }) => {
                        // raw lines never reach the sink
                    }
                    Some(Message::Eos) | None => {
                        self.begin_shutdown();
                        break;
                    }
                },
                _ = flush_sleep => self.flush(),
                _ = replay_sleep, if self.replay_at.is_some() => self.replay(),
                _ = stats_tick.tick() => self.on_stats_tick(),
            }
        }

        // In-flight requests run to completion; their responses still
        // spill on failure.
        while !self.in_flight.is_empty() {
            match evt_rx.recv().await {
                Some(evt) => self.on_event(evt),
                None => break,
            }
        }

        self.report_stats();
        info!("indexer drained, exiting");
        Ok(())
    }

    fn begin_shutdown(&mut self) {
        debug!(queued = self.queue.len(), "shutting down");
        self.shutdown = true;
        self.replay_at = None;
        self.flush();
    }

    /// Render and queue documents; a full queue flushes immediately.
    fn enqueue(&mut self, docs: Vec<Document>) {
        self.stats.incr("received", docs.len() as u64);
        for doc in docs {
            match bulk::render_record(doc, &self.default_index, &self.default_type) {
                Ok(record) => {
                    self.queue.push(record);
                    self.stats.incr("docs", 1);
                }
                Err(e) => warn!(error = %e, "dropping unrenderable document"),
            }
        }
        if self.queue.len() >= self.flush_size {
            self.flush();
        }
    }

    /// Seal the queue into a batch and hand it off.
    ///
    /// An empty queue is a no-op that never touches disk. The queue is
    /// empty the moment the batch is sealed.
    fn flush(&mut self) {
        if !self.shutdown {
            self.flush_at = Instant::now() + self.flush_interval;
        }
        if self.queue.is_empty() {
            return;
        }

        let records = std::mem::take(&mut self.queue);
        let (id, bytes) = bulk::seal(&records);
        debug!(batch = %id, records = records.len(), bytes = bytes.len(), "sealed batch");
        self.start.insert(id.clone(), Instant::now());
        self.batches.insert(id.clone(), bytes);

        if self.es_ready {
            self.send(id.clone());
        } else {
            self.spill_resident(&id);
        }

        // Batches whose earlier spill failed ride this cycle too.
        let orphans: Vec<String> = self
            .batches
            .keys()
            .filter(|b| !self.in_flight.contains(*b) && **b != id)
            .cloned()
            .collect();
        for orphan in orphans {
            if self.es_ready {
                self.send(orphan);
            } else {
                self.spill_resident(&orphan);
            }
        }
    }

    /// Dispatch a batch by id, from memory or from disk under its lock.
    fn send(&mut self, id: String) {
        let path = self.backlog.entry_path(&id);
        let bytes = match self.batches.get(&id) {
            Some(bytes) => bytes.clone(),
            None => {
                if let Err(e) = self.backlog.locks.acquire(&path) {
                    debug!(batch = %id, error = %e, "backlog entry locked elsewhere, skipping");
                    return;
                }
                match self.backlog.read(&id) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        info!(batch = %id, error = %e, "backlog entry gone before dispatch");
                        if let Err(e) = self.backlog.locks.release(&path) {
                            warn!(batch = %id, error = %e, "failed to release lock");
                        }
                        return;
                    }
                }
            }
        };

        self.recs.insert(id.clone(), bulk::record_count(&bytes));
        self.start.entry(id.clone()).or_insert_with(Instant::now);
        self.in_flight.insert(id.clone());
        self.stats.incr("http_req", 1);
        self.client.spawn_bulk(id, bytes, self.evt_tx.clone());
    }

    fn on_event(&mut self, evt: SinkEvent) {
        match evt {
            SinkEvent::Bulk { id, outcome } => self.on_response(id, outcome),
            SinkEvent::Health(healthy) => {
                if healthy && !self.es_ready {
                    info!("cluster healthy, resuming direct dispatch");
                    self.es_ready = true;
                }
            }
        }
    }

    fn on_response(&mut self, id: String, outcome: Result<HttpReply, String>) {
        self.in_flight.remove(&id);
        let elapsed = self.start.get(&id).map(|t| t.elapsed());
        let path = self.backlog.entry_path(&id);

        match outcome {
            Ok(reply) if reply.status < 400 => {
                self.stats.incr("bulk_success", 1);
                if let Some(summary) = parse_bulk_body(&reply.body) {
                    self.stats.incr("indexed", summary.indexed);
                    self.stats.incr("errors", summary.item_errors);
                }
                if self.backlog.contains(&id) {
                    let recs = self.recs.get(&id).copied().unwrap_or(0);
                    match self.backlog.remove(&id) {
                        Ok(()) => self.stats.incr("consumed", recs),
                        Err(e) => warn!(batch = %id, error = %e, "failed to remove delivered batch"),
                    }
                }
                self.batches.remove(&id);
                self.start.remove(&id);
                if !self.es_ready {
                    info!("bulk delivery succeeded, resuming direct dispatch");
                    self.es_ready = true;
                }
                debug!(batch = %id, ?elapsed, "bulk delivered");
            }
            Ok(reply) => {
                self.stats.incr("bulk_failure", 1);
                warn!(batch = %id, status = reply.status, ?elapsed, "bulk request rejected");
                self.es_ready = false;
                self.on_failure(&id);
            }
            Err(e) => {
                self.stats.incr("bulk_failure", 1);
                warn!(batch = %id, error = %e, ?elapsed, "bulk request failed");
                self.es_ready = false;
                self.on_failure(&id);
            }
        }

        self.recs.remove(&id);
        if let Err(e) = self.backlog.locks.release(&path) {
            warn!(batch = %id, error = %e, "failed to release lock");
        }
    }

    /// A failed batch goes to disk unless it is already there. Its start
    /// time survives so a later delivery reports true retry latency.
    fn on_failure(&mut self, id: &str) {
        if !self.backlog.contains(id) {
            self.spill_resident(id);
        } else {
            self.schedule_replay();
        }
    }

    /// Move a resident batch to the backlog; on a write failure it stays
    /// resident and the next flush cycle retries.
    fn spill_resident(&mut self, id: &str) {
        let Some(bytes) = self.batches.get(id) else {
            return;
        };
        let recs = bulk::record_count(bytes);
        match self.backlog.spill(id, bytes) {
            Ok(outcome) => {
                if outcome.wrote {
                    self.stats.incr("batches", 1);
                    self.stats.incr("backlogged", recs);
                    info!(batch = %id, records = recs, "batch spilled to backlog");
                }
                if let Some(cleanup) = outcome.cleanup {
                    self.stats.incr("cleanup_success", cleanup.removed);
                    self.stats.incr("cleanup_fail", cleanup.failed);
                }
                self.batches.remove(id);
                self.schedule_replay();
            }
            Err(e) => {
                warn!(batch = %id, error = %e, "spill failed, batch stays in memory");
            }
        }
    }

    fn schedule_replay(&mut self) {
        if self.shutdown || self.replay_at.is_some() {
            return;
        }
        self.replay_at = Some(Instant::now() + self.replay_interval);
    }

    /// Submit up to one pass worth of backlog entries to the dispatcher.
    fn replay(&mut self) {
        self.replay_at = None;
        let mut ids = self.backlog.list();
        ids.shuffle(&mut rand::rng());
        let total = ids.len();
        let submit = total.min(REPLAY_PER_PASS);
        for id in ids.into_iter().take(submit) {
            if self.in_flight.contains(&id) {
                continue;
            }
            self.send(id);
        }
        if submit > 0 {
            info!(submitted = submit, remaining = total - submit, "replaying backlog");
        }
        if self.shutdown {
            return;
        }
        if total > REPLAY_PER_PASS {
            self.replay_at = Some(Instant::now() + self.replay_backoff);
        } else if submit > 0 {
            self.replay_at = Some(Instant::now() + self.replay_interval);
        }
    }

    fn on_stats_tick(&mut self) {
        if !self.es_ready {
            self.client.spawn_health(self.evt_tx.clone());
        }
        self.report_stats();
    }

    fn report_stats(&mut self) {
        let snapshot = self.stats.take();
        if snapshot.is_empty() {
            info!("Nothing to report.");
        } else {
            let line = snapshot
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(" ");
            info!("{line}");
        }

        let mut disable = false;
        if let Some(handler) = self.stats_handler.as_mut() {
            if let Err(e) = handler(&snapshot) {
                error!(error = %e, "stats handler failed, disabling for this session");
                disable = true;
            }
        }
        if disable {
            self.stats_handler = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_drain_on_take() {
        let mut stats = Stats::default();
        stats.incr("docs", 2);
        stats.incr("docs", 1);
        stats.incr("noop", 0);

        let snap = stats.take();
        assert_eq!(snap.get("docs"), Some(&3));
        assert!(!snap.contains_key("noop"));
        assert!(stats.take().is_empty());
    }

    #[test]
    fn jitter_stays_in_band_and_is_shared() {
        for _ in 0..64 {
            let cfg = ElasticsearchConfig {
                flush_size: 1000,
                flush_interval: 30.0,
                ..Default::default()
            };
            let sink = ElasticSink::new(cfg);
            assert!(sink.effective_flush_size() >= 1000);
            assert!(sink.effective_flush_size() <= 1450);
            assert!(sink.flush_interval >= Duration::from_secs(30));
            assert!(sink.flush_interval <= Duration::from_secs_f64(30.0 * 1.45) + Duration::from_millis(1));

            // one factor scales both: the size is the interval's factor
            // times the configured size, minus only integer truncation
            let factor = sink.flush_interval.as_secs_f64() / 30.0;
            let size_factor = sink.effective_flush_size() as f64 / 1000.0;
            assert!(size_factor <= factor + 1e-9);
            assert!(factor - size_factor < 0.0011);
        }
    }

    #[test]
    fn small_flush_size_survives_jitter() {
        // 2 * 1.45 truncates back to 2: a flush size of two really
        // flushes on the second document
        for _ in 0..32 {
            let cfg = ElasticsearchConfig {
                flush_size: 2,
                ..Default::default()
            };
            assert_eq!(ElasticSink::new(cfg).effective_flush_size(), 2);
        }
    }
}
