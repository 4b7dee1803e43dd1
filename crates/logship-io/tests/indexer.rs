//! End-to-end indexer tests against a mock bulk endpoint

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Datelike;
use logship_core::{Document, ElasticsearchConfig, Message, Sink};
use logship_io::{bulk, ElasticSink, StatsSnapshot};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn doc(msg: &str) -> Document {
    let mut d = Document::new();
    d.insert("msg", json!(msg));
    d
}

fn config(servers: Vec<String>, batch_dir: &std::path::Path, flush_size: usize) -> ElasticsearchConfig {
    ElasticsearchConfig {
        servers,
        timeout: 2,
        flush_interval: 30.0,
        flush_size,
        index: "logs-%Y".to_string(),
        doc_type: "log".to_string(),
        batch_dir: batch_dir.to_path_buf(),
        batch_disk_space: None,
        stats_interval: 3600.0,
        templates: Default::default(),
    }
}

fn capture() -> (
    Arc<Mutex<Vec<StatsSnapshot>>>,
    logship_io::StatsHandler,
) {
    let snapshots: Arc<Mutex<Vec<StatsSnapshot>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_side = snapshots.clone();
    let handler: logship_io::StatsHandler = Box::new(move |snap| {
        sink_side.lock().unwrap().push(snap.clone());
        Ok(())
    });
    (snapshots, handler)
}

fn counter(snapshots: &Arc<Mutex<Vec<StatsSnapshot>>>, key: &str) -> u64 {
    snapshots
        .lock()
        .unwrap()
        .iter()
        .filter_map(|s| s.get(key))
        .sum()
}

async fn bulk_ok_mock(items: usize) -> MockServer {
    let server = MockServer::start().await;
    let body = json!({
        "took": 3,
        "errors": false,
        "items": (0..items).map(|_| json!({"create": {}})).collect::<Vec<_>>(),
    });
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .and(header("content-type", "application/x-ndjson"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn happy_path_flushes_on_size() {
    let server = bulk_ok_mock(2).await;
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(vec![server.address().to_string()], dir.path(), 2);
    let (snapshots, handler) = capture();
    let mut sink = ElasticSink::new(cfg).with_stats_handler(handler);

    let (tx, rx) = mpsc::channel(16);
    tx.send(Message::Doc(doc("a"))).await.unwrap();
    tx.send(Message::Doc(doc("b"))).await.unwrap();
    tx.send(Message::Eos).await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), sink.run(rx, CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1, "exactly one bulk POST");

    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 4, "two records, two lines each");

    let year = chrono::Local::now().year();
    let envelope: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(
        envelope,
        json!({"index": {"_index": format!("logs-{year}"), "_type": "log"}})
    );
    assert_eq!(serde_json::from_str::<Value>(lines[1]).unwrap(), json!({"msg": "a"}));
    assert_eq!(serde_json::from_str::<Value>(lines[3]).unwrap(), json!({"msg": "b"}));

    assert_eq!(counter(&snapshots, "received"), 2);
    assert_eq!(counter(&snapshots, "docs"), 2);
    assert_eq!(counter(&snapshots, "http_req"), 1);
    assert_eq!(counter(&snapshots, "bulk_success"), 1);
    assert_eq!(counter(&snapshots, "indexed"), 2);
    assert_eq!(counter(&snapshots, "errors"), 0);

    // delivered from memory: nothing was ever written to the backlog
    assert!(dir.path().read_dir().unwrap().next().is_none());
}

#[tokio::test]
async fn cluster_down_spills_to_backlog() {
    let dir = tempfile::tempdir().unwrap();
    // nothing listens on the discard port; connections are refused
    let cfg = config(vec!["127.0.0.1:9".to_string()], dir.path(), 2);
    let (snapshots, handler) = capture();
    let mut sink = ElasticSink::new(cfg).with_stats_handler(handler);

    let (tx, rx) = mpsc::channel(16);
    tx.send(Message::Doc(doc("a"))).await.unwrap();
    tx.send(Message::Doc(doc("b"))).await.unwrap();
    tx.send(Message::Eos).await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), sink.run(rx, CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();

    let entries: Vec<_> = dir
        .path()
        .read_dir()
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "batch"))
        .collect();
    assert_eq!(entries.len(), 1, "the failed batch was spilled");

    // content-addressed: the file stem is the sha1 of the exact bytes
    let spilled = &entries[0];
    let bytes = std::fs::read(spilled.path()).unwrap();
    let stem = spilled.path().file_stem().unwrap().to_string_lossy().into_owned();
    assert_eq!(stem, bulk::batch_id(&bytes));
    assert_eq!(bulk::record_count(&bytes), 2);

    assert_eq!(counter(&snapshots, "http_req"), 1);
    assert_eq!(counter(&snapshots, "bulk_failure"), 1);
    assert_eq!(counter(&snapshots, "batches"), 1);
    assert_eq!(counter(&snapshots, "backlogged"), 2);
    assert_eq!(counter(&snapshots, "bulk_success"), 0);
}

#[tokio::test]
async fn replay_drains_a_preseeded_backlog() {
    let server = bulk_ok_mock(2).await;
    let dir = tempfile::tempdir().unwrap();

    // a batch left behind by an earlier run
    let records = vec![
        bulk::render_record(doc("a"), "logs-%Y", "log").unwrap(),
        bulk::render_record(doc("b"), "logs-%Y", "log").unwrap(),
    ];
    let (id, bytes) = bulk::seal(&records);
    let entry = dir.path().join(format!("{id}.batch"));
    std::fs::write(&entry, &bytes).unwrap();

    let cfg = config(vec![server.address().to_string()], dir.path(), 100);
    let (snapshots, handler) = capture();
    let mut sink = ElasticSink::new(cfg)
        .with_stats_handler(handler)
        .with_replay_interval(Duration::from_millis(200));

    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { sink.run(rx, cancel).await }
    });

    // wait for the replay pass to deliver and remove the entry
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while entry.exists() {
        assert!(tokio::time::Instant::now() < deadline, "backlog entry never drained");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    tx.send(Message::Eos).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // the replayed request carried exactly the spilled bytes, so the
    // batch id derived from the body matches the filename it came from
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(bulk::batch_id(&requests[0].body), id);

    assert_eq!(counter(&snapshots, "bulk_success"), 1);
    assert_eq!(counter(&snapshots, "consumed"), 2);
    assert_eq!(counter(&snapshots, "indexed"), 2);

    // lock sidecar released and unlinked
    assert!(!dir.path().join(format!("{id}.batch.lock")).exists());
}

#[tokio::test]
async fn shutdown_drains_the_queue() {
    let server = bulk_ok_mock(3).await;
    let dir = tempfile::tempdir().unwrap();
    // neither the size trigger nor the timer fires before shutdown
    let cfg = config(vec![server.address().to_string()], dir.path(), 100);
    let (snapshots, handler) = capture();
    let mut sink = ElasticSink::new(cfg).with_stats_handler(handler);

    let (tx, rx) = mpsc::channel(16);
    for msg in ["a", "b", "c"] {
        tx.send(Message::Doc(doc(msg))).await.unwrap();
    }
    tx.send(Message::Eos).await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), sink.run(rx, CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1, "one final flush on shutdown");
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    assert_eq!(body.lines().count(), 6);

    assert_eq!(counter(&snapshots, "docs"), 3);
    assert_eq!(counter(&snapshots, "bulk_success"), 1);
    assert!(dir.path().read_dir().unwrap().next().is_none());
}

#[tokio::test]
async fn empty_stream_touches_nothing() {
    let server = bulk_ok_mock(0).await;
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(vec![server.address().to_string()], dir.path(), 2);
    let (snapshots, handler) = capture();
    let mut sink = ElasticSink::new(cfg).with_stats_handler(handler);

    let (tx, rx) = mpsc::channel(16);
    tx.send(Message::Eos).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), sink.run(rx, CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();

    assert!(server.received_requests().await.unwrap().is_empty());
    assert!(dir.path().read_dir().unwrap().next().is_none());
    assert_eq!(counter(&snapshots, "http_req"), 0);
}

#[tokio::test]
async fn timer_flush_delivers_without_filling_the_queue() {
    let server = bulk_ok_mock(1).await;
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(vec![server.address().to_string()], dir.path(), 100);
    cfg.flush_interval = 0.1; // jittered to at most 0.145s

    let (snapshots, handler) = capture();
    let mut sink = ElasticSink::new(cfg).with_stats_handler(handler);

    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { sink.run(rx, cancel).await }
    });

    tx.send(Message::Doc(doc("solo"))).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !server.received_requests().await.unwrap().is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "timer flush never fired");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tx.send(Message::Eos).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(counter(&snapshots, "bulk_success"), 1);
    assert_eq!(counter(&snapshots, "docs"), 1);
}

#[tokio::test]
async fn failing_stats_handler_is_disabled() {
    let server = bulk_ok_mock(1).await;
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(vec![server.address().to_string()], dir.path(), 1);
    cfg.stats_interval = 0.2;

    let calls = Arc::new(Mutex::new(0u32));
    let sink_side = calls.clone();
    let handler: logship_io::StatsHandler = Box::new(move |_snap| {
        *sink_side.lock().unwrap() += 1;
        anyhow::bail!("handler exploded")
    });
    let mut sink = ElasticSink::new(cfg).with_stats_handler(handler);

    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { sink.run(rx, cancel).await }
    });

    tx.send(Message::Doc(doc("a"))).await.unwrap();
    // several stats intervals pass; a well-behaved handler would be
    // called repeatedly, a throwing one exactly once
    tokio::time::sleep(Duration::from_millis(900)).await;

    tx.send(Message::Eos).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), 1);
}
