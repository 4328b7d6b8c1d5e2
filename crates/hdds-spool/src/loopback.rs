// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process loopback broker.
//!
//! Each [`LoopbackClient`] is one broker connection with its own link
//! state. Taking a client's link down makes its publishes fail and drops
//! every message routed to it, the way a real broker session loses
//! in-flight deliveries on disconnect. Optional duplicate redelivery
//! exercises consumer idempotency.

use crate::transport::{
    topic_matches, Envelope, LinkState, Qos, Subscription, Transport, TransportError,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Broker statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BrokerStats {
    /// Messages accepted from publishers
    pub published: u64,
    /// Deliveries to subscribers (duplicates included)
    pub delivered: u64,
    /// Deliveries dropped because the subscriber was offline
    pub dropped_offline: u64,
}

struct Subscriber {
    pattern: String,
    link: watch::Receiver<LinkState>,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct BrokerInner {
    subscribers: Mutex<Vec<Subscriber>>,
    duplicate: AtomicBool,
    publish_delay: Mutex<Option<Duration>>,
    stats: Mutex<BrokerStats>,
}

impl BrokerInner {
    fn route(&self, envelope: Envelope) {
        let duplicate = self.duplicate.load(Ordering::Relaxed) && envelope.qos == Qos::AtLeastOnce;
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        let mut dropped = 0;
        for sub in subscribers
            .iter()
            .filter(|s| topic_matches(&s.pattern, &envelope.topic))
        {
            if *sub.link.borrow() != LinkState::Up {
                dropped += 1;
                continue;
            }
            let copies = if duplicate { 2 } else { 1 };
            for _ in 0..copies {
                if sub.tx.send(envelope.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        drop(subscribers);

        let mut stats = self.stats.lock();
        stats.published += 1;
        stats.delivered += delivered;
        stats.dropped_offline += dropped;
    }
}

/// In-process broker.
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    inner: Arc<BrokerInner>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client connection (link up).
    pub fn client(&self, name: impl Into<String>) -> LoopbackClient {
        let (link, _) = watch::channel(LinkState::Up);
        LoopbackClient {
            name: name.into(),
            inner: Arc::clone(&self.inner),
            link: Arc::new(link),
        }
    }

    /// Deliver every at-least-once message twice.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.inner.duplicate.store(enabled, Ordering::Relaxed);
    }

    /// Delay every publish (simulates a stalled broker).
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        *self.inner.publish_delay.lock() = delay;
    }

    pub fn stats(&self) -> BrokerStats {
        self.inner.stats.lock().clone()
    }
}

/// One connection to a [`LoopbackBroker`].
#[derive(Clone)]
pub struct LoopbackClient {
    name: String,
    inner: Arc<BrokerInner>,
    link: Arc<watch::Sender<LinkState>>,
}

impl LoopbackClient {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the link up or down.
    pub fn set_link(&self, state: LinkState) {
        let changed = self.link.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        if changed {
            tracing::info!("Loopback client {} link {:?}", self.name, state);
        }
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }
}

impl Transport for LoopbackClient {
    fn publish(&self, envelope: Envelope) -> impl Future<Output = Result<(), TransportError>> + Send {
        let inner = Arc::clone(&self.inner);
        let link = self.link.subscribe();
        async move {
            if *link.borrow() != LinkState::Up {
                return Err(TransportError::Disconnected);
            }
            let delay = *inner.publish_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
                if *link.borrow() != LinkState::Up {
                    return Err(TransportError::Disconnected);
                }
            }
            inner.route(envelope);
            Ok(())
        }
    }

    fn subscribe(&self, pattern: &str) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(Subscriber {
            pattern: pattern.to_string(),
            link: self.link.subscribe(),
            tx,
        });
        tracing::debug!("Loopback client {} subscribed to {}", self.name, pattern);
        Ok(Subscription::new(pattern, rx))
    }

    fn link(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(topic: &str, qos: Qos) -> Envelope {
        Envelope::new(topic, vec![1, 2, 3], qos)
    }

    #[tokio::test]
    async fn test_routes_by_pattern() {
        let broker = LoopbackBroker::new();
        let node = broker.client("node");
        let server = broker.client("server");

        let mut all = server.subscribe("telemetry/*").expect("subscribe");
        let mut acks = node.subscribe("ack/node-1").expect("subscribe");

        node.publish(envelope("telemetry/node-1", Qos::AtLeastOnce))
            .await
            .expect("publish");
        server
            .publish(envelope("ack/node-1", Qos::AtLeastOnce))
            .await
            .expect("publish");
        server
            .publish(envelope("ack/node-2", Qos::AtLeastOnce))
            .await
            .expect("publish");

        assert_eq!(all.try_recv().map(|e| e.topic), Some("telemetry/node-1".into()));
        assert_eq!(acks.try_recv().map(|e| e.topic), Some("ack/node-1".into()));
        assert!(acks.try_recv().is_none());
        assert_eq!(broker.stats().published, 3);
    }

    #[tokio::test]
    async fn test_publish_fails_while_link_down() {
        let broker = LoopbackBroker::new();
        let node = broker.client("node");
        node.set_link(LinkState::Down);

        let result = node
            .publish(envelope("telemetry/node-1", Qos::AtLeastOnce))
            .await;
        assert!(matches!(result, Err(TransportError::Disconnected)));

        node.set_link(LinkState::Up);
        assert!(node
            .publish(envelope("telemetry/node-1", Qos::AtLeastOnce))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_offline_subscriber_misses_messages() {
        let broker = LoopbackBroker::new();
        let node = broker.client("node");
        let server = broker.client("server");
        let mut acks = node.subscribe("ack/node-1").expect("subscribe");

        node.set_link(LinkState::Down);
        server
            .publish(envelope("ack/node-1", Qos::AtLeastOnce))
            .await
            .expect("publish");
        assert!(acks.try_recv().is_none());
        assert_eq!(broker.stats().dropped_offline, 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_only_for_at_least_once() {
        let broker = LoopbackBroker::new();
        let node = broker.client("node");
        let server = broker.client("server");
        let mut sub = server.subscribe("*").expect("subscribe");
        broker.set_duplicate_delivery(true);

        node.publish(envelope("telemetry/n", Qos::AtLeastOnce))
            .await
            .expect("publish");
        node.publish(envelope("status/n", Qos::AtMostOnce))
            .await
            .expect("publish");

        let topics: Vec<String> = std::iter::from_fn(|| sub.try_recv().map(|e| e.topic)).collect();
        assert_eq!(topics, vec!["telemetry/n", "telemetry/n", "status/n"]);
    }

    #[tokio::test]
    async fn test_link_watch_reports_changes() {
        let broker = LoopbackBroker::new();
        let node = broker.client("node");
        let mut link = node.link();
        assert_eq!(*link.borrow(), LinkState::Up);

        node.set_link(LinkState::Down);
        link.changed().await.expect("changed");
        assert_eq!(*link.borrow_and_update(), LinkState::Down);
    }
}
