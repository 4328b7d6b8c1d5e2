// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingest service
//!
//! Subscribes to `telemetry/*` and `status/*`, hands each message to a
//! per-node worker and publishes acknowledgments on `ack/<node>` once the
//! store has committed.
//!
//! # Operation
//!
//! 1. Record server receipt time for liveness (dispatcher)
//! 2. Queue the message on the node's worker (bounded, overflow dropped)
//! 3. Commit on a blocking thread
//! 4. Publish one ack per advanced stream watermark
//!
//! Messages of one node are applied in arrival order; nodes never block
//! each other. A dropped or failed message is never acknowledged, so the
//! node replays it.

use crate::config::IngestConfig;
use crate::consumer::{ApplyOutcome, IngestConsumer};
use crate::liveness::{LivenessTracker, NodeLiveness};
use crate::store::TelemetryStore;
use hdds_spool::record::unix_now_ns;
use hdds_spool::wire::{
    ack_topic, all_nodes, decode_telemetry, node_from_topic, STATUS_PREFIX, TELEMETRY_PREFIX,
};
use hdds_spool::{AckMessage, Envelope, Qos, StatusMessage, Transport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Liveness re-evaluation period upper bound.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Service statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServiceStats {
    /// Telemetry messages received
    pub telemetry_received: u64,
    /// Status heartbeats received
    pub status_received: u64,
    /// Messages dropped because the node worker queue was full
    pub dropped_queue_full: u64,
    /// Messages on unparseable topics or with undecodable status bodies
    pub invalid: u64,
    /// Acks published
    pub acks_published: u64,
    /// Ack publishes that failed or timed out
    pub ack_failures: u64,
}

#[derive(Default)]
struct Counters {
    telemetry_received: AtomicU64,
    status_received: AtomicU64,
    dropped_queue_full: AtomicU64,
    invalid: AtomicU64,
    acks_published: AtomicU64,
    ack_failures: AtomicU64,
}

enum Work {
    Telemetry(Vec<u8>),
    Status(StatusMessage),
}

struct NodeWorker {
    tx: mpsc::Sender<Work>,
    task: JoinHandle<()>,
}

/// Everything a node worker needs, cheap to clone.
struct WorkerContext<S: TelemetryStore, T: Transport> {
    node_id: String,
    consumer: Arc<IngestConsumer<S>>,
    transport: Arc<T>,
    liveness: Arc<Mutex<LivenessTracker>>,
    counters: Arc<Counters>,
    ack_timeout: Duration,
}

/// Server side of the backfill protocol.
pub struct IngestService<S: TelemetryStore + 'static, T: Transport> {
    config: IngestConfig,
    consumer: Arc<IngestConsumer<S>>,
    transport: Arc<T>,
    liveness: Arc<Mutex<LivenessTracker>>,
    counters: Arc<Counters>,
}

impl<S: TelemetryStore + 'static, T: Transport> IngestService<S, T> {
    pub fn new(config: IngestConfig, store: Arc<S>, transport: Arc<T>) -> Self {
        let liveness = LivenessTracker::new(config.liveness_timeout(), config.freshness_threshold());
        Self {
            config,
            consumer: Arc::new(IngestConsumer::new(store)),
            transport,
            liveness: Arc::new(Mutex::new(liveness)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn consumer(&self) -> &IngestConsumer<S> {
        &self.consumer
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            telemetry_received: self.counters.telemetry_received.load(Ordering::Relaxed),
            status_received: self.counters.status_received.load(Ordering::Relaxed),
            dropped_queue_full: self.counters.dropped_queue_full.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
            acks_published: self.counters.acks_published.load(Ordering::Relaxed),
            ack_failures: self.counters.ack_failures.load(Ordering::Relaxed),
        }
    }

    /// Liveness and freshness of every node seen so far.
    pub fn liveness(&self) -> Vec<NodeLiveness> {
        self.liveness.lock().snapshot(unix_now_ns())
    }

    pub fn node_liveness(&self, node_id: &str) -> Option<NodeLiveness> {
        self.liveness.lock().node(node_id, unix_now_ns())
    }

    /// Run until `shutdown` turns true (or its sender is dropped).
    ///
    /// Queued work is finished before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut telemetry = self.transport.subscribe(&all_nodes(TELEMETRY_PREFIX))?;
        let mut status = self.transport.subscribe(&all_nodes(STATUS_PREFIX))?;
        tracing::info!(
            "IngestService started (liveness timeout {:?}, freshness threshold {:?})",
            self.config.liveness_timeout(),
            self.config.freshness_threshold()
        );

        let mut workers: HashMap<String, NodeWorker> = HashMap::new();
        let mut sweep = interval(self.config.liveness_timeout().min(MAX_SWEEP_INTERVAL));

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                msg = telemetry.recv() => {
                    let Some(envelope) = msg else { break };
                    self.on_telemetry(&mut workers, envelope);
                }
                msg = status.recv() => {
                    let Some(envelope) = msg else { break };
                    self.on_status(&mut workers, envelope);
                }
                _ = sweep.tick() => {
                    self.liveness.lock().sweep(unix_now_ns());
                }
            }
        }

        tracing::info!("IngestService stopping, draining {} node workers", workers.len());
        let tasks: Vec<JoinHandle<()>> = workers.into_values().map(|w| w.task).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Node worker panicked: {}", e);
            }
        }
        Ok(())
    }

    fn on_telemetry(&self, workers: &mut HashMap<String, NodeWorker>, envelope: Envelope) {
        let Some(node_id) = node_from_topic(&envelope.topic, TELEMETRY_PREFIX) else {
            tracing::warn!("Ignoring telemetry on unexpected topic {}", envelope.topic);
            self.counters.invalid.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.counters
            .telemetry_received
            .fetch_add(1, Ordering::Relaxed);
        self.liveness.lock().observe_receipt(node_id, unix_now_ns());
        let node_id = node_id.to_string();
        self.enqueue(workers, node_id, Work::Telemetry(envelope.payload));
    }

    fn on_status(&self, workers: &mut HashMap<String, NodeWorker>, envelope: Envelope) {
        let Some(node_id) = node_from_topic(&envelope.topic, STATUS_PREFIX) else {
            tracing::warn!("Ignoring status on unexpected topic {}", envelope.topic);
            self.counters.invalid.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let node_id = node_id.to_string();
        let message: StatusMessage = match serde_json::from_slice(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Undecodable status from {}: {}", node_id, e);
                self.counters.invalid.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if message.node_id != node_id {
            tracing::warn!(
                "Status of node {} published on topic of {}",
                message.node_id,
                node_id
            );
            self.counters.invalid.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.counters.status_received.fetch_add(1, Ordering::Relaxed);
        {
            let mut liveness = self.liveness.lock();
            liveness.observe_receipt(&node_id, unix_now_ns());
            liveness.observe_status(&message);
        }
        self.enqueue(workers, node_id, Work::Status(message));
    }

    fn enqueue(&self, workers: &mut HashMap<String, NodeWorker>, node_id: String, work: Work) {
        let worker = workers
            .entry(node_id.clone())
            .or_insert_with(|| self.spawn_worker(node_id.clone()));

        match worker.tx.try_send(work) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("Dropping message from {} (worker queue full)", node_id);
                self.counters
                    .dropped_queue_full
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("Worker of {} is gone, restarting it", node_id);
                workers.remove(&node_id);
            }
        }
    }

    fn spawn_worker(&self, node_id: String) -> NodeWorker {
        tracing::debug!("Starting ingest worker for {}", node_id);
        let (tx, rx) = mpsc::channel(self.config.worker_queue_depth);
        let ctx = WorkerContext {
            node_id,
            consumer: Arc::clone(&self.consumer),
            transport: Arc::clone(&self.transport),
            liveness: Arc::clone(&self.liveness),
            counters: Arc::clone(&self.counters),
            ack_timeout: self.config.ack_publish_timeout(),
        };
        NodeWorker {
            tx,
            task: tokio::spawn(node_worker(ctx, rx)),
        }
    }
}

async fn node_worker<S, T>(ctx: WorkerContext<S, T>, mut rx: mpsc::Receiver<Work>)
where
    S: TelemetryStore + 'static,
    T: Transport,
{
    while let Some(work) = rx.recv().await {
        let outcome = match work {
            Work::Telemetry(body) => apply_telemetry(&ctx, body).await,
            Work::Status(status) => {
                let consumer = Arc::clone(&ctx.consumer);
                run_blocking(move || consumer.apply_status(&status)).await
            }
        };
        match outcome {
            ApplyOutcome::Ack(acks) => publish_acks(&ctx, acks).await,
            // Logged by the consumer; the node replays.
            ApplyOutcome::Retry(_) | ApplyOutcome::Reject(_) => {}
        }
    }
    tracing::debug!("Ingest worker for {} stopped", ctx.node_id);
}

async fn apply_telemetry<S, T>(ctx: &WorkerContext<S, T>, body: Vec<u8>) -> ApplyOutcome
where
    S: TelemetryStore + 'static,
    T: Transport,
{
    let records = match decode_telemetry(&body) {
        Ok(records) => records,
        Err(e) => {
            return ctx.consumer.reject(format!(
                "undecodable telemetry from {}: {}",
                ctx.node_id, e
            ))
        }
    };
    let last_sample_ns = records.last().map(|r| r.sample_time_ns);

    let consumer = Arc::clone(&ctx.consumer);
    let node_id = ctx.node_id.clone();
    let outcome = run_blocking(move || consumer.apply(&node_id, &records)).await;
    // Freshness follows committed data only.
    if let (ApplyOutcome::Ack(_), Some(sample_ns)) = (&outcome, last_sample_ns) {
        ctx.liveness.lock().observe_sample(&ctx.node_id, sample_ns);
    }
    outcome
}

async fn run_blocking<F>(f: F) -> ApplyOutcome
where
    F: FnOnce() -> ApplyOutcome + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("Commit task failed: {}", e);
            ApplyOutcome::Retry(e.to_string())
        }
    }
}

async fn publish_acks<S, T>(ctx: &WorkerContext<S, T>, acks: Vec<AckMessage>)
where
    S: TelemetryStore + 'static,
    T: Transport,
{
    for ack in acks {
        let payload = match serde_json::to_vec(&ack) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to encode ack for {}: {}", ctx.node_id, e);
                continue;
            }
        };
        let envelope = Envelope::new(ack_topic(&ctx.node_id), payload, Qos::AtLeastOnce);
        match tokio::time::timeout(ctx.ack_timeout, ctx.transport.publish(envelope)).await {
            Ok(Ok(())) => {
                tracing::trace!(
                    "Acked {}/{} up to {}",
                    ack.node_id,
                    ack.stream_id,
                    ack.acked_seq
                );
                ctx.counters.acks_published.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                tracing::debug!("Ack publish to {} failed: {}", ctx.node_id, e);
                ctx.counters.ack_failures.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                tracing::debug!("Ack publish to {} timed out", ctx.node_id);
                ctx.counters.ack_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStore;
    use hdds_spool::frame::encode_frame;
    use hdds_spool::wire::{encode_telemetry, status_topic, telemetry_topic};
    use hdds_spool::{EngineState, LoopbackBroker, Record, Value};

    fn record(seq: u64) -> Record {
        Record {
            node_id: "node-1".into(),
            stream_id: "rain".into(),
            seq,
            sample_time_ns: unix_now_ns(),
            value: Value::Counter(2),
        }
    }

    fn body(seqs: std::ops::RangeInclusive<u64>) -> Vec<u8> {
        let frames: Vec<Vec<u8>> = seqs
            .map(|seq| encode_frame(&record(seq)).expect("frame"))
            .collect();
        encode_telemetry(frames.iter().map(|f| f.as_slice()))
    }

    async fn next_ack(sub: &mut hdds_spool::Subscription) -> AckMessage {
        let envelope = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("ack timeout")
            .expect("subscription closed");
        serde_json::from_slice(&envelope.payload).expect("ack json")
    }

    #[tokio::test]
    async fn test_commit_then_ack() {
        let broker = LoopbackBroker::new();
        let node = broker.client("node-1");
        let mut acks = node.subscribe(&ack_topic("node-1")).expect("subscribe");

        let service = Arc::new(IngestService::new(
            IngestConfig::default(),
            Arc::new(SqliteStore::new_in_memory().expect("store")),
            Arc::new(broker.client("ingest")),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.run(shutdown_rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        node.publish(Envelope::new(telemetry_topic("node-1"), body(1..=3), Qos::AtLeastOnce))
            .await
            .expect("publish");
        let ack = next_ack(&mut acks).await;
        assert_eq!(ack.acked_seq, 3);
        assert_eq!(
            service.consumer().store().counter_total("node-1", "rain").expect("total"),
            6
        );

        let liveness = service.node_liveness("node-1").expect("node known");
        assert_eq!(liveness.status, crate::liveness::NodeStatus::Online);
        assert_eq!(liveness.freshness, crate::liveness::Freshness::Current);

        shutdown_tx.send(true).expect("shutdown");
        runner.await.expect("join").expect("run");
        assert_eq!(service.stats().acks_published, 1);
    }

    #[tokio::test]
    async fn test_status_on_wrong_topic_is_ignored() {
        let broker = LoopbackBroker::new();
        let node = broker.client("node-2");
        let service = Arc::new(IngestService::new(
            IngestConfig::default(),
            Arc::new(SqliteStore::new_in_memory().expect("store")),
            Arc::new(broker.client("ingest")),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.run(shutdown_rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = StatusMessage {
            node_id: "node-1".into(),
            stream_id: "rain".into(),
            state: EngineState::ConnectedSynced,
            oldest_retained_seq: 1,
            next_seq: 1,
            acked_seq: 0,
            sent_at_ns: 0,
        };
        node.publish(Envelope::new(
            status_topic("node-2"),
            serde_json::to_vec(&status).expect("json"),
            Qos::AtMostOnce,
        ))
        .await
        .expect("publish");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(service.stats().invalid, 1);
        assert!(service.node_liveness("node-1").is_none());
        assert!(service.node_liveness("node-2").is_none());

        shutdown_tx.send(true).expect("shutdown");
        runner.await.expect("join").expect("run");
    }

    #[tokio::test]
    async fn test_rejected_batch_leaves_freshness_unknown() {
        let broker = LoopbackBroker::new();
        let node = broker.client("node-2");
        let service = Arc::new(IngestService::new(
            IngestConfig::default(),
            Arc::new(SqliteStore::new_in_memory().expect("store")),
            Arc::new(broker.client("ingest")),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.run(shutdown_rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Records of node-1 on node-2's topic never commit.
        node.publish(Envelope::new(telemetry_topic("node-2"), body(1..=3), Qos::AtLeastOnce))
            .await
            .expect("publish");
        for _ in 0..100 {
            if service.consumer().stats().rejected > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(service.consumer().stats().rejected, 1);

        let liveness = service.node_liveness("node-2").expect("receipt recorded");
        assert_eq!(liveness.status, crate::liveness::NodeStatus::Online);
        assert_eq!(liveness.freshness, crate::liveness::Freshness::Unknown);
        assert!(liveness.last_sample_time.is_none());
        assert_eq!(
            service.consumer().store().sample_count("node-2", "rain").expect("count"),
            0
        );

        shutdown_tx.send(true).expect("shutdown");
        runner.await.expect("join").expect("run");
        assert_eq!(service.stats().acks_published, 0);
    }
}
