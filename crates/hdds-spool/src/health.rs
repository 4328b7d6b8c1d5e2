// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node health surface.
//!
//! Collects the auditable events of a node (retention loss, producer
//! overflow, spool faults) and, together with the spools and engines,
//! produces [`NodeHealth`] snapshots for dashboards and alerts.

use crate::engine::EngineState;
use crate::record::unix_now_ns;
use crate::retention::RetentionLoss;
use crate::spool::SpoolHealth;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Events kept for snapshots.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Auditable node event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HealthEvent {
    /// Unacknowledged records dropped by the retention policy.
    RetentionLoss(RetentionLoss),
    /// Samples displaced from the transfer queue before being spooled.
    ProducerOverflow { displaced: u64, at_ns: u64 },
    /// Fatal local fault; the stream no longer accepts appends.
    SpoolFault {
        stream_id: String,
        reason: String,
        at_ns: u64,
    },
}

/// Health of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHealth {
    #[serde(flatten)]
    pub spool: SpoolHealth,
    pub engine_state: EngineState,
}

/// Point-in-time health of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub node_id: String,
    pub streams: Vec<StreamHealth>,
    /// Records lost to retention since start.
    pub retention_lost: u64,
    /// Samples displaced from the transfer queue since start.
    pub producer_displaced: u64,
    /// Most recent events, oldest first.
    pub events: Vec<HealthEvent>,
}

impl NodeHealth {
    pub fn total_backlog(&self) -> u64 {
        self.streams.iter().map(|s| s.spool.backlog).sum()
    }

    pub fn has_fault(&self) -> bool {
        self.streams.iter().any(|s| s.spool.fault.is_some())
    }
}

#[derive(Default)]
struct RegistryInner {
    events: VecDeque<HealthEvent>,
    retention_lost: u64,
    producer_displaced: u64,
}

/// Shared event log.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    capacity: usize,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl HealthRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, event: HealthEvent) {
        let mut inner = self.inner.lock();
        match &event {
            HealthEvent::RetentionLoss(loss) => inner.retention_lost += loss.count(),
            HealthEvent::ProducerOverflow { displaced, .. } => {
                inner.producer_displaced += displaced
            }
            HealthEvent::SpoolFault { .. } => {}
        }
        if inner.events.len() == self.capacity {
            inner.events.pop_front();
        }
        inner.events.push_back(event);
    }

    pub fn retention_loss(&self, loss: RetentionLoss) {
        self.record(HealthEvent::RetentionLoss(loss));
    }

    pub fn spool_fault(&self, stream_id: &str, reason: impl Into<String>) {
        self.record(HealthEvent::SpoolFault {
            stream_id: stream_id.to_string(),
            reason: reason.into(),
            at_ns: unix_now_ns(),
        });
    }

    pub fn producer_overflow(&self, displaced: u64) {
        if displaced > 0 {
            self.record(HealthEvent::ProducerOverflow {
                displaced,
                at_ns: unix_now_ns(),
            });
        }
    }

    pub fn events(&self) -> Vec<HealthEvent> {
        self.inner.lock().events.iter().cloned().collect()
    }

    pub fn retention_lost(&self) -> u64 {
        self.inner.lock().retention_lost
    }

    pub fn producer_displaced(&self) -> u64 {
        self.inner.lock().producer_displaced
    }

    /// Assemble a node snapshot from per-stream views.
    pub fn snapshot(&self, node_id: &str, streams: Vec<StreamHealth>) -> NodeHealth {
        let inner = self.inner.lock();
        NodeHealth {
            node_id: node_id.to_string(),
            streams,
            retention_lost: inner.retention_lost,
            producer_displaced: inner.producer_displaced,
            events: inner.events.iter().cloned().collect(),
        }
    }
}
