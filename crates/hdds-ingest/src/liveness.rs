// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node liveness and data freshness.
//!
//! Two separate questions:
//!
//! - **Status**: is the node talking to us? Driven by server receipt time;
//!   any inbound message counts, backlog replay included.
//! - **Freshness**: how old is the data we just got? Driven by the sample
//!   time embedded in the most recently received record. While a node
//!   drains a backlog it is `Online` but `Lagging`.

use chrono::{DateTime, Utc};
use hdds_spool::{EngineState, StatusMessage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Link-level status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// Data recency, independent of [`NodeStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Current,
    /// Most recent sample is this much older than now.
    Lagging(Duration),
    /// No record received yet.
    Unknown,
}

#[derive(Debug, Clone, Default)]
struct NodeEntry {
    last_rx_at_ns: u64,
    last_sample_time_ns: Option<u64>,
    status: Option<NodeStatus>,
    /// Last heartbeat per stream.
    streams: BTreeMap<String, StatusMessage>,
}

/// Per-stream view taken from the latest heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamView {
    pub stream_id: String,
    pub engine_state: EngineState,
    pub backlog: u64,
    pub acked_seq: u64,
    pub next_seq: u64,
}

/// Snapshot of one node for the health surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLiveness {
    pub node_id: String,
    pub status: NodeStatus,
    pub freshness: Freshness,
    pub last_rx_at: Option<DateTime<Utc>>,
    pub last_sample_time: Option<DateTime<Utc>>,
    pub streams: Vec<StreamView>,
}

impl NodeLiveness {
    /// Sum of reported backlogs.
    pub fn backlog(&self) -> u64 {
        self.streams.iter().map(|s| s.backlog).sum()
    }
}

fn to_datetime(ns: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(ns / 1_000_000_000).ok()?;
    DateTime::<Utc>::from_timestamp(secs, (ns % 1_000_000_000) as u32)
}

/// Derives status and freshness from receipt and sample timestamps.
///
/// All methods take the server clock explicitly (Unix nanoseconds).
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    timeout: Duration,
    freshness_threshold: Duration,
    nodes: BTreeMap<String, NodeEntry>,
}

impl LivenessTracker {
    pub fn new(timeout: Duration, freshness_threshold: Duration) -> Self {
        Self {
            timeout,
            freshness_threshold,
            nodes: BTreeMap::new(),
        }
    }

    /// Any inbound message from `node_id`. Marks the node online.
    pub fn observe_receipt(&mut self, node_id: &str, rx_at_ns: u64) {
        let entry = self.nodes.entry(node_id.to_string()).or_default();
        entry.last_rx_at_ns = entry.last_rx_at_ns.max(rx_at_ns);
        if entry.status != Some(NodeStatus::Online) {
            tracing::info!("Node {} ONLINE", node_id);
            entry.status = Some(NodeStatus::Online);
        }
    }

    /// Sample time of the most recently received record (any seq).
    pub fn observe_sample(&mut self, node_id: &str, sample_time_ns: u64) {
        let entry = self.nodes.entry(node_id.to_string()).or_default();
        entry.last_sample_time_ns = Some(sample_time_ns);
    }

    pub fn observe_status(&mut self, status: &StatusMessage) {
        let entry = self.nodes.entry(status.node_id.clone()).or_default();
        entry
            .streams
            .insert(status.stream_id.clone(), status.clone());
    }

    pub fn status(&self, node_id: &str, now_ns: u64) -> NodeStatus {
        match self.nodes.get(node_id) {
            Some(entry) if now_ns.saturating_sub(entry.last_rx_at_ns) <= self.timeout.as_nanos() as u64 => {
                NodeStatus::Online
            }
            _ => NodeStatus::Offline,
        }
    }

    pub fn freshness(&self, node_id: &str, now_ns: u64) -> Freshness {
        let Some(sample_ns) = self.nodes.get(node_id).and_then(|e| e.last_sample_time_ns) else {
            return Freshness::Unknown;
        };
        let lag = Duration::from_nanos(now_ns.saturating_sub(sample_ns));
        if lag <= self.freshness_threshold {
            Freshness::Current
        } else {
            Freshness::Lagging(lag)
        }
    }

    /// Re-evaluate every node; returns the nodes that just went offline.
    pub fn sweep(&mut self, now_ns: u64) -> Vec<String> {
        let timeout = self.timeout.as_nanos() as u64;
        let mut offline = Vec::new();
        for (node_id, entry) in &mut self.nodes {
            let expired = now_ns.saturating_sub(entry.last_rx_at_ns) > timeout;
            if expired && entry.status == Some(NodeStatus::Online) {
                tracing::info!(
                    "Node {} OFFLINE (silent for {:?})",
                    node_id,
                    Duration::from_nanos(now_ns.saturating_sub(entry.last_rx_at_ns))
                );
                entry.status = Some(NodeStatus::Offline);
                offline.push(node_id.clone());
            }
        }
        offline
    }

    pub fn node(&self, node_id: &str, now_ns: u64) -> Option<NodeLiveness> {
        let entry = self.nodes.get(node_id)?;
        Some(NodeLiveness {
            node_id: node_id.to_string(),
            status: self.status(node_id, now_ns),
            freshness: self.freshness(node_id, now_ns),
            last_rx_at: to_datetime(entry.last_rx_at_ns),
            last_sample_time: entry.last_sample_time_ns.and_then(to_datetime),
            streams: entry
                .streams
                .values()
                .map(|s| StreamView {
                    stream_id: s.stream_id.clone(),
                    engine_state: s.state,
                    backlog: s.backlog(),
                    acked_seq: s.acked_seq,
                    next_seq: s.next_seq,
                })
                .collect(),
        })
    }

    pub fn snapshot(&self, now_ns: u64) -> Vec<NodeLiveness> {
        self.nodes
            .keys()
            .filter_map(|node_id| self.node(node_id, now_ns))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    fn tracker() -> LivenessTracker {
        LivenessTracker::new(Duration::from_secs(60), Duration::from_secs(300))
    }

    #[test]
    fn test_unknown_node_is_offline() {
        let tracker = tracker();
        assert_eq!(tracker.status("ghost", 0), NodeStatus::Offline);
        assert_eq!(tracker.freshness("ghost", 0), Freshness::Unknown);
    }

    #[test]
    fn test_online_offline_online() {
        let mut tracker = tracker();
        tracker.observe_receipt("node-1", 1_000 * SEC);
        assert_eq!(tracker.status("node-1", 1_030 * SEC), NodeStatus::Online);

        assert_eq!(tracker.sweep(1_061 * SEC), vec!["node-1".to_string()]);
        assert_eq!(tracker.status("node-1", 1_061 * SEC), NodeStatus::Offline);
        assert!(tracker.sweep(1_100 * SEC).is_empty());

        tracker.observe_receipt("node-1", 2_000 * SEC);
        assert_eq!(tracker.status("node-1", 2_000 * SEC), NodeStatus::Online);
    }

    #[test]
    fn test_backlog_replay_is_online_but_lagging() {
        let mut tracker = tracker();
        let now = 10_000 * SEC;
        // Replaying a record sampled an hour ago.
        tracker.observe_receipt("node-1", now);
        tracker.observe_sample("node-1", now - 3_600 * SEC);

        assert_eq!(tracker.status("node-1", now), NodeStatus::Online);
        assert_eq!(
            tracker.freshness("node-1", now),
            Freshness::Lagging(Duration::from_secs(3_600))
        );

        // Backlog drained: live sample.
        tracker.observe_receipt("node-1", now + SEC);
        tracker.observe_sample("node-1", now + SEC);
        assert_eq!(tracker.freshness("node-1", now + SEC), Freshness::Current);
    }

    #[test]
    fn test_snapshot_includes_stream_backlog() {
        let mut tracker = tracker();
        tracker.observe_receipt("node-1", 5 * SEC);
        tracker.observe_status(&StatusMessage {
            node_id: "node-1".into(),
            stream_id: "rain".into(),
            state: EngineState::ConnectedCatchingUp,
            oldest_retained_seq: 100,
            next_seq: 154,
            acked_seq: 99,
            sent_at_ns: 5 * SEC,
        });
        let snapshot = tracker.snapshot(6 * SEC);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].backlog(), 54);
        assert_eq!(snapshot[0].status, NodeStatus::Online);
        assert!(snapshot[0].last_rx_at.is_some());
    }
}
