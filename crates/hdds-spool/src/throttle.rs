// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Backlog replay throttle.
//!
//! Two token buckets, one counting messages and one counting bytes. A
//! backlog batch goes out only when both have enough tokens; live frames
//! bypass the throttle entirely.

use crate::config::ReplayConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket rate limiter.
///
/// Tokens are added at a fixed rate up to a maximum capacity (burst size).
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: u64,
    capacity: u64,
    /// Tokens per second.
    rate: u32,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a new token bucket, starting full.
    pub fn new(rate: u32, capacity: u64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume tokens. Returns `false` (consuming nothing) when short.
    pub fn try_consume(&mut self, amount: u64) -> bool {
        self.refill();
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }

    pub fn has_tokens(&mut self, amount: u64) -> bool {
        self.refill();
        self.tokens >= amount
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Time until `amount` tokens will be available.
    ///
    /// Returns `Duration::ZERO` if already available.
    pub fn time_until_available(&mut self, amount: u64) -> Duration {
        self.refill();
        if self.tokens >= amount {
            return Duration::ZERO;
        }
        if self.rate == 0 {
            return Duration::MAX;
        }
        let needed = amount - self.tokens;
        Duration::from_secs_f64(needed as f64 / self.rate as f64)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let add = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        if add > 0 {
            self.tokens = (self.tokens + add).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Reset the bucket to empty.
    pub fn drain(&mut self) {
        self.tokens = 0;
        self.last_refill = Instant::now();
    }
}

/// Messages/s plus bytes/s limiter for backlog batches.
#[derive(Debug, Clone)]
pub struct ReplayThrottle {
    messages: TokenBucket,
    bytes: TokenBucket,
}

impl ReplayThrottle {
    /// One second of burst on each bucket.
    pub fn new(config: &ReplayConfig) -> Self {
        Self {
            messages: TokenBucket::new(
                config.max_messages_per_sec,
                u64::from(config.max_messages_per_sec.max(1)),
            ),
            bytes: TokenBucket::new(
                config.max_bytes_per_sec,
                u64::from(config.max_bytes_per_sec.max(1)),
            ),
        }
    }

    /// Largest batch the byte bucket can ever admit.
    pub fn max_batch_bytes(&self) -> u64 {
        self.bytes.capacity()
    }

    /// Wait needed before a batch of `bytes` may go out.
    pub fn delay_for(&mut self, bytes: u64) -> Duration {
        let bytes = bytes.min(self.bytes.capacity());
        self.messages
            .time_until_available(1)
            .max(self.bytes.time_until_available(bytes))
    }

    /// Take tokens for one batch of `bytes`, if both buckets allow it.
    pub fn try_acquire(&mut self, bytes: u64) -> bool {
        let bytes = bytes.min(self.bytes.capacity());
        if !self.messages.has_tokens(1) || !self.bytes.has_tokens(bytes) {
            return false;
        }
        self.messages.try_consume(1) && self.bytes.try_consume(bytes)
    }
}
