// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS Telemetry Spool
//!
//! Durable offline buffering and backfill replay for field nodes with an
//! unreliable uplink.
//!
//! # Features
//!
//! - **Segment Spool** -- Crash-recoverable append log of checksummed frames,
//!   one per (node, stream), with size/age retention
//! - **Non-blocking Producer** -- Sampling never waits on disk or network
//! - **Replay Engine** -- Live-first publishing, throttled backlog replay,
//!   resume from the ack watermark after any disconnect
//! - **Ack Tracker** -- Durable watermark persisted before any trim
//! - **Health Surface** -- Spool positions, backlog, retention-loss events
//!
//! # Architecture
//!
//! ```text
//! SampleProducer --(transfer queue)--> spool writer --> Spool (per stream)
//!                                                          |
//!                          ack/<node> --> AckTracker ----> truncate_to
//!                                                          |
//!                                  ReplayEngine <----------+
//!                                       |
//!                                       +--> telemetry/<node>, status/<node>
//! ```
//!
//! # Example
//!
//! ```ignore
//! use hdds_spool::{LoopbackBroker, NodeConfig, NodeRuntime, Value};
//! use std::sync::Arc;
//!
//! let broker = LoopbackBroker::new();
//! let config = NodeConfig::new("node-7", "/var/lib/hdds/spool");
//! let (producer, node) = NodeRuntime::start(config, Arc::new(broker.client("node-7")))?;
//!
//! producer.record("rain_gauge", Value::Counter(1))?;
//! println!("{:?}", node.health());
//! node.shutdown().await?;
//! ```

pub mod ack;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod health;
pub mod loopback;
pub mod node;
pub mod record;
pub mod retention;
pub mod segment;
pub mod spool;
pub mod throttle;
pub mod transport;
pub mod wire;

pub use ack::{AckTracker, Watermark};
pub use channel::{transfer_channel, SampleProducer, SpoolFeed, SubmitError, Submitted};
pub use config::{ConfigError, NodeConfig, ReplayConfig, SpoolConfig, SyncMode};
pub use engine::{EngineSettings, EngineState, EngineStats, ReplayEngine};
pub use error::SpoolError;
pub use frame::{Frame, FrameError, FrameScanner, ScanStop};
pub use health::{HealthEvent, HealthRegistry, NodeHealth, StreamHealth};
pub use loopback::{LoopbackBroker, LoopbackClient};
pub use node::{NodeHandle, NodeRuntime};
pub use record::{Record, Sample, Value, ValueKind};
pub use retention::{RetentionLoss, RetentionPolicy, RetentionReason};
pub use spool::{Spool, SpoolHealth, SpoolReader, SpoolState};
pub use transport::{Envelope, LinkState, Qos, Subscription, Transport, TransportError};
pub use wire::{AckMessage, StatusMessage};
