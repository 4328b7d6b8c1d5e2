// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Field-node runtime.
//!
//! Wires the pieces of a node together:
//!
//! - a spool writer task draining the transfer queue into one spool per stream
//! - one [`ReplayEngine`] per stream
//! - an ack dispatcher routing `ack/<node>` messages to the stream engines
//!
//! Streams found on disk at startup get their engine immediately, so a
//! backlog left by a previous run is replayed even before new samples arrive.

use crate::ack::AckTracker;
use crate::channel::{transfer_channel, SampleProducer, SpoolFeed};
use crate::config::NodeConfig;
use crate::engine::{EngineInputs, EngineSettings, EngineState, EngineStats, ReplayEngine};
use crate::error::SpoolError;
use crate::health::{HealthRegistry, NodeHealth, StreamHealth};
use crate::record::Sample;
use crate::spool::{stream_id_from_dir_name, Spool};
use crate::transport::{Subscription, Transport};
use crate::wire::{ack_topic, AckMessage};
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Pending acks per stream engine.
const ACK_QUEUE_DEPTH: usize = 64;

struct StreamSlot {
    spool: Arc<Mutex<Spool>>,
    appended: Arc<watch::Sender<u64>>,
    acks: mpsc::Sender<AckMessage>,
    state: watch::Receiver<EngineState>,
    engine: Option<JoinHandle<Result<EngineStats, SpoolError>>>,
}

type Streams = Arc<Mutex<BTreeMap<String, StreamSlot>>>;

struct NodeShared<T: Transport> {
    config: NodeConfig,
    transport: Arc<T>,
    health: HealthRegistry,
    streams: Streams,
    shutdown: watch::Receiver<bool>,
}

impl<T: Transport> NodeShared<T> {
    fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Open the spool of `stream_id` and start its engine.
    fn open_stream(&self, stream_id: &str) -> Result<(), SpoolError> {
        let mut spool = Spool::open(&self.config.spool, self.node_id(), stream_id)?;
        let tracker = AckTracker::load(spool.dir(), self.node_id(), stream_id)?;
        for loss in spool.drain_retention_losses() {
            self.health.retention_loss(loss);
        }

        let state = spool.state();
        tracing::info!(
            "Stream {}/{} open: oldest {}, acked {}, next {}",
            self.node_id(),
            stream_id,
            state.oldest_retained_seq,
            state.acked_seq,
            state.next_seq
        );

        let spool = Arc::new(Mutex::new(spool));
        let (appended_tx, appended_rx) = watch::channel(state.last_seq());
        let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_DEPTH);

        let engine = ReplayEngine::new(
            Arc::clone(&spool),
            tracker,
            Arc::clone(&self.transport),
            EngineSettings::from_config(&self.config),
            self.health.clone(),
            EngineInputs {
                appended: appended_rx,
                acks: ack_rx,
                shutdown: self.shutdown.clone(),
            },
        );
        let engine_state = engine.state();
        let task = tokio::spawn(engine.run());

        self.streams.lock().insert(
            stream_id.to_string(),
            StreamSlot {
                spool,
                appended: Arc::new(appended_tx),
                acks: ack_tx,
                state: engine_state,
                engine: Some(task),
            },
        );
        Ok(())
    }

    /// Open every stream spool already present under the spool root.
    fn open_existing(&self) -> anyhow::Result<()> {
        let root = &self.config.spool.dir;
        for entry in std::fs::read_dir(root)
            .with_context(|| format!("Failed to list spool root {}", root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(stream_id) = entry.file_name().to_str().and_then(stream_id_from_dir_name)
            else {
                continue;
            };
            self.open_stream(&stream_id)
                .with_context(|| format!("Failed to recover stream {}", stream_id))?;
        }
        Ok(())
    }

    async fn spool_sample(&self, sample: Sample) {
        let stream_id = sample.stream_id.clone();
        let slot = self
            .streams
            .lock()
            .get(&stream_id)
            .map(|s| (Arc::clone(&s.spool), Arc::clone(&s.appended)));

        let (spool, appended) = match slot {
            Some(slot) => slot,
            None => {
                if let Err(e) = self.open_stream(&stream_id) {
                    tracing::error!("Cannot open spool for {}: {}", stream_id, e);
                    self.health.spool_fault(&stream_id, e.to_string());
                    return;
                }
                match self.streams.lock().get(&stream_id) {
                    Some(s) => (Arc::clone(&s.spool), Arc::clone(&s.appended)),
                    None => return,
                }
            }
        };

        // Append fsyncs; keep it off the async workers.
        let joined = tokio::task::spawn_blocking(move || {
            let mut spool = spool.lock();
            let result = spool.append(&sample);
            (result, spool.drain_retention_losses())
        })
        .await;
        let (result, losses) = match joined {
            Ok(done) => done,
            Err(e) => (Err(SpoolError::Io(std::io::Error::other(e))), Vec::new()),
        };
        for loss in losses {
            self.health.retention_loss(loss);
        }

        match result {
            Ok(seq) => {
                appended.send_replace(seq);
            }
            Err(SpoolError::Closed) => {
                tracing::debug!("Sample for faulted stream {} rejected", stream_id);
            }
            Err(e) => {
                tracing::error!("Append to {} failed: {}", stream_id, e);
                self.health.spool_fault(&stream_id, e.to_string());
            }
        }
    }
}

async fn write_loop<T: Transport>(shared: Arc<NodeShared<T>>, feed: Arc<SpoolFeed>) {
    let mut reported = 0;
    while let Some(sample) = feed.next().await {
        let displaced = feed.displaced();
        if displaced > reported {
            shared.health.producer_overflow(displaced - reported);
            reported = displaced;
        }
        shared.spool_sample(sample).await;
    }
    let displaced = feed.displaced();
    if displaced > reported {
        shared.health.producer_overflow(displaced - reported);
    }
    tracing::debug!(
        "Spool writer for {} stopped after {} samples",
        shared.node_id(),
        feed.submitted()
    );
}

async fn dispatch_acks(
    mut subscription: Subscription,
    streams: Streams,
    node_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let envelope = tokio::select! {
            _ = shutdown.changed() => break,
            envelope = subscription.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let ack: AckMessage = match serde_json::from_slice(&envelope.payload) {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!("Malformed ack on {}: {}", envelope.topic, e);
                continue;
            }
        };
        if ack.node_id != node_id {
            tracing::debug!("Ack for node {} ignored by {}", ack.node_id, node_id);
            continue;
        }

        let tx = streams.lock().get(&ack.stream_id).map(|s| s.acks.clone());
        match tx {
            Some(tx) => {
                if tx.send(ack).await.is_err() {
                    tracing::debug!("Engine for {} gone; ack dropped", envelope.topic);
                }
            }
            None => tracing::debug!("Ack for unknown stream {}", ack.stream_id),
        }
    }
    tracing::debug!("Ack dispatcher for {} stopped", node_id);
}

/// Node runtime entry point.
pub struct NodeRuntime;

impl NodeRuntime {
    /// Recover the spools under `config.spool.dir` and start the node tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<T: Transport>(
        config: NodeConfig,
        transport: Arc<T>,
    ) -> anyhow::Result<(SampleProducer, NodeHandle)> {
        config.validate().context("Invalid node configuration")?;
        std::fs::create_dir_all(&config.spool.dir).with_context(|| {
            format!("Failed to create spool root {}", config.spool.dir.display())
        })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(NodeShared {
            transport: Arc::clone(&transport),
            health: HealthRegistry::default(),
            streams: Arc::new(Mutex::new(BTreeMap::new())),
            shutdown: shutdown_rx,
            config,
        });
        shared.open_existing()?;

        let node_id = shared.node_id().to_string();
        let subscription = transport
            .subscribe(&ack_topic(&node_id))
            .context("Failed to subscribe to ack topic")?;
        let dispatcher = tokio::spawn(dispatch_acks(
            subscription,
            Arc::clone(&shared.streams),
            node_id.clone(),
            shutdown.subscribe(),
        ));

        let (producer, feed) = transfer_channel(shared.config.channel_capacity);
        let feed = Arc::new(feed);
        let writer = tokio::spawn(write_loop(Arc::clone(&shared), Arc::clone(&feed)));

        tracing::info!(
            "Node {} started ({} streams recovered)",
            node_id,
            shared.streams.lock().len()
        );

        let handle = NodeHandle {
            node_id,
            streams: Arc::clone(&shared.streams),
            health: shared.health.clone(),
            feed,
            shutdown,
            writer,
            dispatcher,
        };
        Ok((producer, handle))
    }
}

/// Control handle of a running node.
pub struct NodeHandle {
    node_id: String,
    streams: Streams,
    health: HealthRegistry,
    feed: Arc<SpoolFeed>,
    shutdown: watch::Sender<bool>,
    writer: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl NodeHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.streams.lock().keys().cloned().collect()
    }

    pub fn engine_state(&self, stream_id: &str) -> Option<EngineState> {
        self.streams
            .lock()
            .get(stream_id)
            .map(|slot| *slot.state.borrow())
    }

    /// Current health of every stream plus the node event log.
    pub fn health(&self) -> NodeHealth {
        let streams = self
            .streams
            .lock()
            .values()
            .map(|slot| StreamHealth {
                spool: slot.spool.lock().health(),
                engine_state: *slot.state.borrow(),
            })
            .collect();
        self.health.snapshot(&self.node_id, streams)
    }

    /// Stop sampling intake, spool what is queued, stop the engines and sync
    /// every spool. Open segments stay recoverable on disk.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.feed.close();
        self.writer.await.context("Spool writer panicked")?;

        self.shutdown.send_replace(true);
        let engines: Vec<_> = self
            .streams
            .lock()
            .iter_mut()
            .filter_map(|(id, slot)| slot.engine.take().map(|task| (id.clone(), task)))
            .collect();
        for (stream_id, task) in engines {
            match task.await {
                Ok(Ok(stats)) => tracing::info!("Engine {} stopped: {:?}", stream_id, stats),
                Ok(Err(e)) => tracing::error!("Engine {} failed: {}", stream_id, e),
                Err(e) => tracing::error!("Engine {} panicked: {}", stream_id, e),
            }
        }
        if let Err(e) = self.dispatcher.await {
            tracing::error!("Ack dispatcher panicked: {}", e);
        }

        let spools: Vec<_> = self
            .streams
            .lock()
            .values()
            .map(|slot| Arc::clone(&slot.spool))
            .collect();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            for spool in spools {
                let mut spool = spool.lock();
                spool
                    .flush()
                    .with_context(|| format!("Failed to sync spool {}", spool.stream_id()))?;
            }
            Ok(())
        })
        .await
        .context("Spool sync task panicked")??;
        tracing::info!("Node {} stopped", self.node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMode;
    use crate::loopback::LoopbackBroker;
    use crate::record::Value;
    use crate::transport::{Envelope, LinkState, Qos};
    use crate::wire::decode_telemetry;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> NodeConfig {
        let mut config = NodeConfig::new("node-1", dir.path());
        config.spool.sync = SyncMode::None;
        config
    }

    async fn collect_seqs(sub: &mut Subscription, stream: &str, want: &BTreeSet<u64>) -> BTreeSet<u64> {
        let mut seen = BTreeSet::new();
        while !want.is_subset(&seen) {
            let envelope = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .expect("telemetry within timeout")
                .expect("subscription open");
            for record in decode_telemetry(&envelope.payload).expect("decode") {
                if record.stream_id == stream {
                    seen.insert(record.seq);
                }
            }
        }
        seen
    }

    async fn wait_until(handle: &NodeHandle, check: impl Fn(&NodeHealth) -> bool) -> NodeHealth {
        for _ in 0..500 {
            let health = handle.health();
            if check(&health) {
                return health;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached: {:?}", handle.health());
    }

    #[tokio::test]
    async fn test_samples_flow_and_acks_trim() {
        let dir = TempDir::new().expect("tempdir");
        let broker = LoopbackBroker::new();
        let server = broker.client("server");
        let mut telemetry = server.subscribe("telemetry/*").expect("subscribe");

        let (producer, handle) =
            NodeRuntime::start(config(&dir), Arc::new(broker.client("node-1"))).expect("start");
        for i in 0..3 {
            producer.record("rain", Value::Counter(i)).expect("submit");
        }
        producer.record("temp", Value::Float(21.5)).expect("submit");

        let want: BTreeSet<u64> = (1..=3).collect();
        collect_seqs(&mut telemetry, "rain", &want).await;

        let ack = AckMessage {
            node_id: "node-1".into(),
            stream_id: "rain".into(),
            acked_seq: 3,
            committed_at_ns: 1,
        };
        server
            .publish(Envelope::new(
                ack_topic("node-1"),
                serde_json::to_vec(&ack).expect("json"),
                Qos::AtLeastOnce,
            ))
            .await
            .expect("publish ack");

        let health = wait_until(&handle, |h| {
            h.streams.len() == 2
                && h.streams
                    .iter()
                    .any(|s| s.spool.stream_id == "rain" && s.spool.acked_seq == 3)
        })
        .await;
        let rain = health
            .streams
            .iter()
            .find(|s| s.spool.stream_id == "rain")
            .expect("rain");
        assert_eq!(rain.spool.backlog, 0);
        assert_eq!(rain.spool.segment_count, 0);
        assert_eq!(handle.stream_ids(), vec!["rain".to_string(), "temp".to_string()]);

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_restart_replays_unacked_backlog() {
        let dir = TempDir::new().expect("tempdir");
        let broker = LoopbackBroker::new();
        let node = broker.client("node-1");
        node.set_link(LinkState::Down);

        let (producer, handle) =
            NodeRuntime::start(config(&dir), Arc::new(node.clone())).expect("start");
        for i in 0..3 {
            producer.record("rain", Value::Integer(i)).expect("submit");
        }
        wait_until(&handle, |h| h.streams.iter().any(|s| s.spool.next_seq == 4)).await;
        assert_eq!(handle.engine_state("rain"), Some(EngineState::Disconnected));
        handle.shutdown().await.expect("shutdown");

        let server = broker.client("server");
        let mut telemetry = server.subscribe("telemetry/*").expect("subscribe");
        node.set_link(LinkState::Up);
        let (_producer, handle) =
            NodeRuntime::start(config(&dir), Arc::new(node)).expect("restart");
        assert_eq!(handle.stream_ids(), vec!["rain".to_string()]);

        let want: BTreeSet<u64> = (1..=3).collect();
        collect_seqs(&mut telemetry, "rain", &want).await;
        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_synced_spool_persists_ack_watermark() {
        let dir = TempDir::new().expect("tempdir");
        let broker = LoopbackBroker::new();
        let node = broker.client("node-1");
        node.set_link(LinkState::Down);
        let mut config = config(&dir);
        config.spool.sync = SyncMode::Data;

        let (producer, handle) =
            NodeRuntime::start(config, Arc::new(node.clone())).expect("start");
        for i in 0..5 {
            producer.record("rain", Value::Integer(i)).expect("submit");
        }
        wait_until(&handle, |h| h.streams.iter().any(|s| s.spool.next_seq == 6)).await;

        let server = broker.client("server");
        let mut telemetry = server.subscribe("telemetry/*").expect("subscribe");
        node.set_link(LinkState::Up);
        let want: BTreeSet<u64> = (1..=5).collect();
        collect_seqs(&mut telemetry, "rain", &want).await;

        let ack = AckMessage {
            node_id: "node-1".into(),
            stream_id: "rain".into(),
            acked_seq: 5,
            committed_at_ns: 7,
        };
        server
            .publish(Envelope::new(
                ack_topic("node-1"),
                serde_json::to_vec(&ack).expect("json"),
                Qos::AtLeastOnce,
            ))
            .await
            .expect("publish ack");
        wait_until(&handle, |h| {
            h.streams
                .iter()
                .any(|s| s.spool.acked_seq == 5 && s.spool.segment_count == 0)
        })
        .await;
        handle.shutdown().await.expect("shutdown");

        let stream_dir = dir.path().join(crate::spool::stream_dir_name("rain"));
        let watermark = crate::ack::load_watermark(&stream_dir)
            .expect("load")
            .expect("watermark on disk");
        assert_eq!(watermark.acked_seq, 5);
        assert_eq!(watermark.committed_at_ns, 7);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let broker = LoopbackBroker::new();
        let config = NodeConfig::new("bad/node", dir.path());
        assert!(NodeRuntime::start(config, Arc::new(broker.client("n"))).is_err());
    }
}
