// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry store abstraction
//!
//! A transactional sink: [`TelemetryStore::commit`] applies a whole batch or
//! nothing, and only a successful return may be acknowledged.

use hdds_spool::Record;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store failures. Every commit failure is answered with "retry" (no ack).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Value encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Counter {node_id}/{stream_id} overflows at seq {seq}")]
    CounterOverflow {
        node_id: String,
        stream_id: String,
        seq: u64,
    },
}

impl StoreError {
    /// Lock contention or an unavailable backend; a later replay will succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Self::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Server-side ack watermark of one (node, stream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkRow {
    pub node_id: String,
    pub stream_id: String,
    /// Every seq `<= acked_seq` is durably committed (or was reported lost).
    pub acked_seq: u64,
    /// When `acked_seq` last advanced (Unix nanoseconds).
    pub committed_at_ns: u64,
}

/// Outcome of one committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Records stored for the first time.
    pub inserted: usize,
    /// Records already present; no derived state touched.
    pub duplicates: usize,
    /// Watermark of every stream present in the batch, after the commit.
    pub watermarks: Vec<WatermarkRow>,
}

/// One change-of-value transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub seq: u64,
    pub sample_time_ns: u64,
    /// `None` for the first known state of the stream.
    pub from: Option<hdds_spool::Value>,
    pub to: hdds_spool::Value,
}

/// Per-stream totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    pub node_id: String,
    pub stream_id: String,
    pub samples: u64,
    pub min_seq: u64,
    pub max_seq: u64,
    pub acked_seq: u64,
}

/// Telemetry store trait
///
/// # Implementations
///
/// - `SqliteStore` -- file-backed or in-memory SQLite
pub trait TelemetryStore: Send + Sync {
    /// Apply a batch atomically, keyed by `(node_id, stream_id, seq)`.
    ///
    /// Already-stored records are skipped entirely (raw values, counters and
    /// transitions). Watermarks advance to the contiguous committed prefix.
    fn commit(&self, batch: &[Record]) -> Result<CommitReport, StoreError>;

    /// Records `<= floor` no longer exist on the node (retention); let the
    /// watermark skip over them. Returns the watermark if it moved.
    fn advance_floor(
        &self,
        node_id: &str,
        stream_id: &str,
        floor: u64,
    ) -> Result<Option<WatermarkRow>, StoreError>;

    fn watermark(&self, node_id: &str, stream_id: &str)
        -> Result<Option<WatermarkRow>, StoreError>;

    fn watermarks(&self) -> Result<Vec<WatermarkRow>, StoreError>;

    /// Sum of counter deltas stored for a stream.
    fn counter_total(&self, node_id: &str, stream_id: &str) -> Result<u64, StoreError>;

    /// Change-of-value transitions in seq order.
    fn transitions(&self, node_id: &str, stream_id: &str)
        -> Result<Vec<Transition>, StoreError>;

    fn sample_count(&self, node_id: &str, stream_id: &str) -> Result<u64, StoreError>;

    /// Stored records from `from_seq` on, in seq order.
    fn samples(
        &self,
        node_id: &str,
        stream_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError>;

    fn stream_stats(&self) -> Result<Vec<StreamStats>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_is_transient() {
        assert!(StoreError::Unavailable("disk".into()).is_transient());
        assert!(!StoreError::Corrupt("row".into()).is_transient());
        let overflow = StoreError::CounterOverflow {
            node_id: "node-1".into(),
            stream_id: "rain".into(),
            seq: 3,
        };
        assert!(!overflow.is_transient());
    }

    #[test]
    fn test_watermark_serialization() {
        let row = WatermarkRow {
            node_id: "node-1".into(),
            stream_id: "rain".into(),
            acked_seq: 42,
            committed_at_ns: 7,
        };
        let json = serde_json::to_string(&row).expect("json");
        let back: WatermarkRow = serde_json::from_str(&json).expect("parse");
        assert_eq!(row, back);
    }
}
