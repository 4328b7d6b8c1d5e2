// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Idempotent ingest consumer
//!
//! `apply(batch) -> Ack | Retry | Reject`. Acks are produced only from the
//! watermarks returned by a successful commit; a failed commit yields
//! `Retry` and no ack, so the node's own replay is the only retry path.

use crate::store::{StoreError, TelemetryStore, WatermarkRow};
use hdds_spool::record::is_valid_id;
use hdds_spool::wire::decode_telemetry;
use hdds_spool::{AckMessage, Record, StatusMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Result of applying one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Durably committed; publish these acks (empty when no watermark moved
    /// past zero yet).
    Ack(Vec<AckMessage>),
    /// Commit failed; send nothing and let the node replay.
    Retry(String),
    /// Malformed or misrouted; never acknowledged.
    Reject(String),
}

/// Consumer statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Batches committed
    pub batches: u64,
    /// Records stored for the first time
    pub inserted: u64,
    /// Duplicate records skipped
    pub duplicates: u64,
    /// Commit failures (answered with retry)
    pub retries: u64,
    /// Rejected messages
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    inserted: AtomicU64,
    duplicates: AtomicU64,
    retries: AtomicU64,
    rejected: AtomicU64,
}

/// Applies telemetry batches and status floors to a [`TelemetryStore`].
pub struct IngestConsumer<S: TelemetryStore> {
    store: Arc<S>,
    counters: Counters,
}

fn ack_for(row: &WatermarkRow) -> AckMessage {
    AckMessage {
        node_id: row.node_id.clone(),
        stream_id: row.stream_id.clone(),
        acked_seq: row.acked_seq,
        committed_at_ns: row.committed_at_ns,
    }
}

impl<S: TelemetryStore> IngestConsumer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            batches: self.counters.batches.load(Ordering::Relaxed),
            inserted: self.counters.inserted.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reject(&self, reason: String) -> ApplyOutcome {
        tracing::warn!("Rejected telemetry: {}", reason);
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        ApplyOutcome::Reject(reason)
    }

    fn retry(&self, err: StoreError) -> ApplyOutcome {
        if err.is_transient() {
            tracing::warn!("Commit failed (transient), awaiting replay: {}", err);
        } else {
            tracing::error!("Commit failed, awaiting replay: {}", err);
        }
        self.counters.retries.fetch_add(1, Ordering::Relaxed);
        ApplyOutcome::Retry(err.to_string())
    }

    /// Apply a decoded batch received on the telemetry topic of `node_id`.
    pub fn apply(&self, node_id: &str, batch: &[Record]) -> ApplyOutcome {
        if batch.is_empty() {
            return self.reject(format!("empty batch from {}", node_id));
        }
        if let Some(bad) = batch.iter().find(|r| r.node_id != node_id) {
            return self.reject(format!(
                "record of node {} on topic of {}",
                bad.node_id, node_id
            ));
        }
        if let Some(bad) = batch
            .iter()
            .find(|r| r.seq == 0 || !is_valid_id(&r.stream_id))
        {
            return self.reject(format!(
                "invalid record {}/{} seq {}",
                bad.node_id, bad.stream_id, bad.seq
            ));
        }

        match self.store.commit(batch) {
            Ok(report) => {
                self.counters.batches.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .inserted
                    .fetch_add(report.inserted as u64, Ordering::Relaxed);
                self.counters
                    .duplicates
                    .fetch_add(report.duplicates as u64, Ordering::Relaxed);
                if report.duplicates > 0 {
                    tracing::debug!(
                        "{}: {} duplicate records ignored",
                        node_id,
                        report.duplicates
                    );
                }
                // Re-ack on duplicates too: the node may have missed the first ack.
                let acks = report
                    .watermarks
                    .iter()
                    .filter(|w| w.acked_seq > 0)
                    .map(ack_for)
                    .collect();
                ApplyOutcome::Ack(acks)
            }
            Err(e) => self.retry(e),
        }
    }

    /// Decode and apply a telemetry message body.
    pub fn apply_wire(&self, node_id: &str, body: &[u8]) -> ApplyOutcome {
        match decode_telemetry(body) {
            Ok(records) => self.apply(node_id, &records),
            Err(e) => self.reject(format!("undecodable telemetry from {}: {}", node_id, e)),
        }
    }

    /// Handle a status heartbeat.
    ///
    /// Moves the watermark over seqs the node dropped to retention, and
    /// re-sends the watermark when the node reports an older one.
    pub fn apply_status(&self, status: &StatusMessage) -> ApplyOutcome {
        let floor = status.retention_floor();
        let moved = match self
            .store
            .advance_floor(&status.node_id, &status.stream_id, floor)
        {
            Ok(moved) => moved,
            Err(e) => return self.retry(e),
        };
        if let Some(row) = moved {
            return ApplyOutcome::Ack(vec![ack_for(&row)]);
        }

        match self.store.watermark(&status.node_id, &status.stream_id) {
            Ok(Some(row)) if row.acked_seq > status.acked_seq => {
                tracing::debug!(
                    "{}/{} reports acked {} behind committed {}; re-acking",
                    status.node_id,
                    status.stream_id,
                    status.acked_seq,
                    row.acked_seq
                );
                ApplyOutcome::Ack(vec![ack_for(&row)])
            }
            Ok(_) => ApplyOutcome::Ack(Vec::new()),
            Err(e) => self.retry(e),
        }
    }
}
