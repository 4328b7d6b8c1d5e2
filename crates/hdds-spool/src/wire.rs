// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topics and control messages exchanged between nodes and ingest.
//!
//! | Topic | Direction | Body |
//! |-------|-----------|------|
//! | `telemetry/<node>` | node -> server | concatenated frames |
//! | `status/<node>` | node -> server | JSON [`StatusMessage`] |
//! | `ack/<node>` | server -> node | JSON [`AckMessage`] |

use crate::engine::EngineState;
use crate::frame::{decode_frames, FrameError};
use crate::record::Record;
use serde::{Deserialize, Serialize};

pub const TELEMETRY_PREFIX: &str = "telemetry";
pub const STATUS_PREFIX: &str = "status";
pub const ACK_PREFIX: &str = "ack";

pub fn telemetry_topic(node_id: &str) -> String {
    format!("{}/{}", TELEMETRY_PREFIX, node_id)
}

pub fn status_topic(node_id: &str) -> String {
    format!("{}/{}", STATUS_PREFIX, node_id)
}

pub fn ack_topic(node_id: &str) -> String {
    format!("{}/{}", ACK_PREFIX, node_id)
}

/// Subscription pattern covering every node under `prefix`.
pub fn all_nodes(prefix: &str) -> String {
    format!("{}/*", prefix)
}

/// Node id encoded in a `<prefix>/<node>` topic.
pub fn node_from_topic<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    let node = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    (!node.is_empty() && !node.contains('/')).then_some(node)
}

/// Server commit confirmation for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub node_id: String,
    pub stream_id: String,
    /// Every seq up to and including this one is durably committed.
    pub acked_seq: u64,
    /// Commit time on the server (Unix nanoseconds).
    pub committed_at_ns: u64,
}

/// Per-stream heartbeat published by the replay engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub node_id: String,
    pub stream_id: String,
    pub state: EngineState,
    pub oldest_retained_seq: u64,
    pub next_seq: u64,
    pub acked_seq: u64,
    /// Node wall-clock at send (Unix nanoseconds).
    pub sent_at_ns: u64,
}

impl StatusMessage {
    /// Records still waiting for acknowledgment.
    pub fn backlog(&self) -> u64 {
        self.next_seq.saturating_sub(1).saturating_sub(self.acked_seq)
    }

    /// Highest seq the node can no longer deliver (dropped by retention).
    pub fn retention_floor(&self) -> u64 {
        self.oldest_retained_seq.saturating_sub(1)
    }
}

/// Build a telemetry message body from encoded frames.
pub fn encode_telemetry<'a>(frames: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut body = Vec::new();
    for frame in frames {
        body.extend_from_slice(frame);
    }
    body
}

/// Decode a telemetry message body; all or nothing.
pub fn decode_telemetry(body: &[u8]) -> Result<Vec<Record>, FrameError> {
    decode_frames(body)
}
