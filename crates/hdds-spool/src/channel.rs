// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer to spool hand-off.
//!
//! A small lock-free ring between the sampling side and the spool writer.
//! [`SampleProducer::submit`] never blocks and never waits on disk or
//! network: when the ring is full, the oldest sample not yet spooled is
//! displaced and counted as a producer overflow.

use crate::record::{is_valid_id, Sample, Value};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

/// Submission failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Transfer channel closed")]
    Closed,

    #[error("Invalid stream id '{0}'")]
    InvalidStream(String),
}

/// Result of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    /// Queued after displacing the oldest unspooled sample.
    DisplacedOldest,
}

struct Shared {
    queue: ArrayQueue<Sample>,
    notify: Notify,
    closed: AtomicBool,
    submitted: AtomicU64,
    displaced: AtomicU64,
}

/// Create a transfer channel holding at most `capacity` samples.
pub fn transfer_channel(capacity: usize) -> (SampleProducer, SpoolFeed) {
    let shared = Arc::new(Shared {
        queue: ArrayQueue::new(capacity.max(1)),
        notify: Notify::new(),
        closed: AtomicBool::new(false),
        submitted: AtomicU64::new(0),
        displaced: AtomicU64::new(0),
    });
    (
        SampleProducer {
            shared: Arc::clone(&shared),
        },
        SpoolFeed { shared },
    )
}

/// Sampling-side handle. Cheap to clone; one per sensor driver is fine.
#[derive(Clone)]
pub struct SampleProducer {
    shared: Arc<Shared>,
}

impl SampleProducer {
    /// Hand a sample to the spool writer without blocking.
    pub fn submit(&self, sample: Sample) -> Result<Submitted, SubmitError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SubmitError::Closed);
        }
        if !is_valid_id(&sample.stream_id) {
            return Err(SubmitError::InvalidStream(sample.stream_id));
        }

        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        let outcome = match self.shared.queue.force_push(sample) {
            None => Submitted::Queued,
            Some(old) => {
                let total = self.shared.displaced.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    "Transfer queue full; displaced unspooled sample of {} ({} total)",
                    old.stream_id,
                    total
                );
                Submitted::DisplacedOldest
            }
        };
        self.shared.notify.notify_one();
        Ok(outcome)
    }

    /// Stamp a reading with the current time and submit it.
    pub fn record(&self, stream_id: &str, value: Value) -> Result<Submitted, SubmitError> {
        self.submit(Sample::now(stream_id, value))
    }

    /// Samples displaced before reaching the spool.
    pub fn displaced(&self) -> u64 {
        self.shared.displaced.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// Spool-writer side of the channel (single consumer).
pub struct SpoolFeed {
    shared: Arc<Shared>,
}

impl SpoolFeed {
    /// Wait for the next sample. `None` once closed and drained.
    pub async fn next(&self) -> Option<Sample> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(sample) = self.shared.queue.pop() {
                return Some(sample);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return self.shared.queue.pop();
            }
            notified.await;
        }
    }

    pub fn try_next(&self) -> Option<Sample> {
        self.shared.queue.pop()
    }

    /// Stop accepting submissions; queued samples stay available.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    pub fn submitted(&self) -> u64 {
        self.shared.submitted.load(Ordering::Relaxed)
    }

    pub fn displaced(&self) -> u64 {
        self.shared.displaced.load(Ordering::Relaxed)
    }
}
