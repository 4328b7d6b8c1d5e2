// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker transport abstraction.
//!
//! Models an ordered, at-least-once publish/subscribe connection with
//! per-message acknowledgment levels. The replay engine and the ingest
//! service are written against [`Transport`] only; [`crate::loopback`]
//! provides an in-process implementation.
//!
//! # Integration
//!
//! ```ignore
//! impl Transport for MqttSession {
//!     fn publish(&self, envelope: Envelope) -> impl Future<Output = Result<(), TransportError>> + Send {
//!         // QoS 1 publish, resolve on PUBACK...
//!     }
//!     // ...
//! }
//! ```

use std::future::Future;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Delivery level requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    /// Fire and forget (heartbeats).
    AtMostOnce,
    /// Broker-acknowledged; may be delivered more than once.
    AtLeastOnce,
}

/// A message on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, qos: Qos) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
        }
    }
}

/// Connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

/// Transient transport faults. Never surfaced beyond engine state.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Link is down")]
    Disconnected,

    #[error("Publish timed out")]
    Timeout,

    #[error("Transport closed")]
    Closed,

    #[error("Publish rejected: {0}")]
    Rejected(String),
}

/// Incoming messages for one subscription pattern.
pub struct Subscription {
    pattern: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    pub fn new(pattern: impl Into<String>, rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            pattern: pattern.into(),
            rx,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next message; `None` once the transport is gone. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

/// Publish/subscribe broker connection.
pub trait Transport: Send + Sync + 'static {
    /// Publish a message. For [`Qos::AtLeastOnce`] the future resolves once
    /// the broker has accepted the message.
    fn publish(&self, envelope: Envelope)
        -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribe to a topic or a `prefix/*` pattern.
    fn subscribe(&self, pattern: &str) -> Result<Subscription, TransportError>;

    /// Link state updates.
    fn link(&self) -> watch::Receiver<LinkState>;
}

/// Check if a topic matches a pattern (`*`, `prefix/*` or exact).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return topic.len() > prefix.len() + 1
            && topic.starts_with(prefix)
            && topic.as_bytes()[prefix.len()] == b'/';
    }
    pattern == topic
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("*", "telemetry/node-1"));
        assert!(topic_matches("telemetry/*", "telemetry/node-1"));
        assert!(!topic_matches("telemetry/*", "status/node-1"));
        assert!(!topic_matches("telemetry/*", "telemetry"));
        assert!(!topic_matches("telemetry/*", "telemetry/"));
        assert!(!topic_matches("telemetry/*", "telemetryx/node-1"));
        assert!(topic_matches("ack/node-1", "ack/node-1"));
        assert!(!topic_matches("ack/node-1", "ack/node-2"));
    }
}
