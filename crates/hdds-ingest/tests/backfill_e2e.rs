// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node and ingest service over a loopback broker: outages, duplicates and
//! store failures.

use hdds_ingest::{
    CommitReport, IngestConfig, IngestService, NodeStatus, SqliteStore, StoreError, StreamStats,
    TelemetryStore, Transition, WatermarkRow,
};
use hdds_spool::wire::{all_nodes, decode_telemetry, TELEMETRY_PREFIX};
use hdds_spool::{
    LinkState, LoopbackBroker, LoopbackClient, NodeConfig, NodeHandle, NodeHealth, NodeRuntime,
    Record, StreamHealth, SyncMode, Transport, Value,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Ingest<S: TelemetryStore + 'static> {
    service: Arc<IngestService<S, LoopbackClient>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl<S: TelemetryStore + 'static> Ingest<S> {
    async fn start(broker: &LoopbackBroker, store: Arc<S>) -> Self {
        let service = Arc::new(IngestService::new(
            IngestConfig::default(),
            store,
            Arc::new(broker.client("ingest")),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.run(shutdown_rx).await })
        };
        // Let the service subscribe before nodes publish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Self {
            service,
            shutdown,
            task,
        }
    }

    fn store(&self) -> &S {
        self.service.consumer().store()
    }

    async fn stop(self) {
        self.shutdown.send(true).expect("shutdown");
        self.task.await.expect("join").expect("run");
    }
}

fn node_config(dir: &TempDir) -> NodeConfig {
    let mut config = NodeConfig::new("node-1", dir.path());
    config.spool.sync = SyncMode::None;
    config.spool.segment_max_records = 16;
    config.heartbeat_interval_secs = 1;
    config
}

fn stream<'a>(health: &'a NodeHealth, stream_id: &str) -> Option<&'a StreamHealth> {
    health.streams.iter().find(|s| s.spool.stream_id == stream_id)
}

async fn wait_for(what: &str, check: impl Fn() -> bool) {
    for _ in 0..1_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn acked(handle: &NodeHandle, stream_id: &str) -> u64 {
    stream(&handle.health(), stream_id).map_or(0, |s| s.spool.acked_seq)
}

#[tokio::test]
async fn test_outage_is_backfilled_live_first() {
    let dir = TempDir::new().expect("tempdir");
    let broker = LoopbackBroker::new();
    let ingest = Ingest::start(&broker, Arc::new(SqliteStore::new_in_memory().expect("store"))).await;

    let sniffer = broker.client("sniffer");
    let mut telemetry = sniffer
        .subscribe(&all_nodes(TELEMETRY_PREFIX))
        .expect("subscribe");

    let link = broker.client("node-1");
    let (producer, node) =
        NodeRuntime::start(node_config(&dir), Arc::new(link.clone())).expect("start");

    for _ in 1..=99 {
        producer.record("rain", Value::Counter(1)).expect("submit");
    }
    wait_for("seq 99 acked", || acked(&node, "rain") == 99).await;

    link.set_link(LinkState::Down);
    for _ in 100..=153 {
        producer.record("rain", Value::Counter(1)).expect("submit");
    }
    wait_for("outage records spooled", || {
        stream(&node.health(), "rain").is_some_and(|s| s.spool.next_seq == 154)
    })
    .await;
    let health = node.health();
    let rain = stream(&health, "rain").expect("rain");
    assert_eq!(rain.spool.acked_seq, 99);
    assert_eq!(rain.spool.backlog, 54);

    while telemetry.try_recv().is_some() {}
    link.set_link(LinkState::Up);

    let first = tokio::time::timeout(Duration::from_secs(5), telemetry.recv())
        .await
        .expect("telemetry after reconnect")
        .expect("subscription open");
    let seqs: Vec<u64> = decode_telemetry(&first.payload)
        .expect("decode")
        .iter()
        .map(|r| r.seq)
        .collect();
    assert_eq!(seqs, vec![153], "newest record goes out before the backlog");

    wait_for("backlog drained", || {
        stream(&node.health(), "rain").is_some_and(|s| s.spool.acked_seq == 153 && s.spool.backlog == 0)
    })
    .await;
    let health = node.health();
    let rain = stream(&health, "rain").expect("rain");
    assert_eq!(rain.spool.next_seq, 154);
    assert_eq!(rain.spool.oldest_retained_seq, 154);
    assert_eq!(rain.spool.segment_count, 0);

    let store = ingest.store();
    assert_eq!(store.sample_count("node-1", "rain").expect("count"), 153);
    assert_eq!(store.counter_total("node-1", "rain").expect("total"), 153);
    assert_eq!(
        store.watermark("node-1", "rain").expect("watermark").map(|w| w.acked_seq),
        Some(153)
    );
    let liveness = ingest.service.node_liveness("node-1").expect("known node");
    assert_eq!(liveness.status, NodeStatus::Online);

    node.shutdown().await.expect("shutdown");
    ingest.stop().await;
}

#[tokio::test]
async fn test_duplicate_delivery_is_counted_once() {
    let dir = TempDir::new().expect("tempdir");
    let broker = LoopbackBroker::new();
    broker.set_duplicate_delivery(true);
    let ingest = Ingest::start(&broker, Arc::new(SqliteStore::new_in_memory().expect("store"))).await;

    let (producer, node) =
        NodeRuntime::start(node_config(&dir), Arc::new(broker.client("node-1"))).expect("start");
    for i in 0..30u32 {
        producer.record("rain", Value::Counter(1)).expect("submit");
        producer
            .record("pump", Value::Flag((i / 5) % 2 == 1))
            .expect("submit");
    }
    wait_for("both streams acked", || {
        acked(&node, "rain") == 30 && acked(&node, "pump") == 30
    })
    .await;

    let store = ingest.store();
    assert_eq!(store.counter_total("node-1", "rain").expect("total"), 30);
    assert_eq!(store.sample_count("node-1", "pump").expect("count"), 30);
    // Initial state plus five changes.
    assert_eq!(store.transitions("node-1", "pump").expect("transitions").len(), 6);
    assert!(ingest.service.consumer().stats().duplicates > 0);

    node.shutdown().await.expect("shutdown");
    ingest.stop().await;
}

/// SQLite store whose commits can be switched to fail.
struct FlakyStore {
    inner: SqliteStore,
    failing: AtomicBool,
}

impl TelemetryStore for FlakyStore {
    fn commit(&self, batch: &[Record]) -> Result<CommitReport, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk offline".into()));
        }
        self.inner.commit(batch)
    }

    fn advance_floor(
        &self,
        node_id: &str,
        stream_id: &str,
        floor: u64,
    ) -> Result<Option<WatermarkRow>, StoreError> {
        self.inner.advance_floor(node_id, stream_id, floor)
    }

    fn watermark(&self, node_id: &str, stream_id: &str) -> Result<Option<WatermarkRow>, StoreError> {
        self.inner.watermark(node_id, stream_id)
    }

    fn watermarks(&self) -> Result<Vec<WatermarkRow>, StoreError> {
        self.inner.watermarks()
    }

    fn counter_total(&self, node_id: &str, stream_id: &str) -> Result<u64, StoreError> {
        self.inner.counter_total(node_id, stream_id)
    }

    fn transitions(&self, node_id: &str, stream_id: &str) -> Result<Vec<Transition>, StoreError> {
        self.inner.transitions(node_id, stream_id)
    }

    fn sample_count(&self, node_id: &str, stream_id: &str) -> Result<u64, StoreError> {
        self.inner.sample_count(node_id, stream_id)
    }

    fn samples(
        &self,
        node_id: &str,
        stream_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        self.inner.samples(node_id, stream_id, from_seq, limit)
    }

    fn stream_stats(&self) -> Result<Vec<StreamStats>, StoreError> {
        self.inner.stream_stats()
    }
}

#[tokio::test]
async fn test_failed_commit_is_never_acked_and_replayed_later() {
    let dir = TempDir::new().expect("tempdir");
    let broker = LoopbackBroker::new();
    let store = Arc::new(FlakyStore {
        inner: SqliteStore::new_in_memory().expect("store"),
        failing: AtomicBool::new(true),
    });
    let ingest = Ingest::start(&broker, Arc::clone(&store)).await;

    let mut config = node_config(&dir);
    config.ack_timeout_secs = 1;
    let (producer, node) =
        NodeRuntime::start(config, Arc::new(broker.client("node-1"))).expect("start");
    for _ in 0..10 {
        producer.record("rain", Value::Counter(1)).expect("submit");
    }

    wait_for("a rejected commit", || {
        ingest.service.consumer().stats().retries > 0
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(acked(&node, "rain"), 0);
    assert_eq!(store.sample_count("node-1", "rain").expect("count"), 0);

    store.failing.store(false, Ordering::SeqCst);
    wait_for("replay after store recovery", || acked(&node, "rain") == 10).await;
    assert_eq!(store.counter_total("node-1", "rain").expect("total"), 10);

    node.shutdown().await.expect("shutdown");
    ingest.stop().await;
}
