// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Telemetry Ingest
//!
//! Server side of the spool/backfill protocol: stores replayed and live
//! telemetry exactly once and acknowledges it only after a durable commit.
//!
//! # Features
//!
//! - **Idempotent Commit** -- Keyed by `(node_id, stream_id, seq)`; replays and
//!   broker duplicates never double-count counters or change-of-value transitions
//! - **Ack Watermarks** -- Per-stream contiguous committed prefix, published on
//!   `ack/<node>` after commit
//! - **Liveness** -- ONLINE/OFFLINE from server receipt time, freshness from
//!   embedded sample time
//! - **SQLite Backend** -- WAL mode, one transaction per batch
//!
//! # Architecture
//!
//! ```text
//! telemetry/*, status/* --> IngestService --> per-node worker --> IngestConsumer
//!                                |                                     |
//!                         LivenessTracker                        TelemetryStore
//!                                                                      |
//!                                   ack/<node> <-- watermark ---------+
//! ```
//!
//! # Example
//!
//! ```ignore
//! use hdds_ingest::{IngestConfig, IngestService, SqliteStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(SqliteStore::new("ingest.db")?);
//! let service = IngestService::new(IngestConfig::default(), store, Arc::new(transport));
//! service.run(shutdown_rx).await?;
//! ```

pub mod config;
pub mod consumer;
pub mod liveness;
pub mod service;
pub mod sqlite;
pub mod store;

pub use config::IngestConfig;
pub use consumer::{ApplyOutcome, ConsumerStats, IngestConsumer};
pub use liveness::{Freshness, LivenessTracker, NodeLiveness, NodeStatus, StreamView};
pub use service::{IngestService, ServiceStats};
pub use sqlite::SqliteStore;
pub use store::{CommitReport, StoreError, StreamStats, TelemetryStore, Transition, WatermarkRow};
