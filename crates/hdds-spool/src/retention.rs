// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Spool retention policy.
//!
//! Bounds the spool by:
//! - Total size on disk
//! - Age of the oldest retained segment
//!
//! Exceeding a bound drops the oldest sealed segment even when it is not
//! acknowledged yet. That is a deliberate data-loss event and is always
//! reported as a [`RetentionLoss`] with the lost sequence range.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retention bounds for one stream spool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Maximum spool size in bytes (0 = unlimited).
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Maximum age of the oldest segment in seconds (0 = unlimited).
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_max_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_max_age_secs() -> u64 {
    7 * 24 * 3600
}

impl RetentionPolicy {
    /// Size-bounded retention.
    ///
    /// # Arguments
    /// * `max_size_mb` - Maximum spool size in megabytes.
    pub fn by_size(max_size_mb: u64) -> Self {
        Self {
            max_bytes: max_size_mb * 1024 * 1024,
            max_age_secs: 0,
        }
    }

    /// Age-bounded retention.
    pub fn by_age(max_age: Duration) -> Self {
        Self {
            max_bytes: 0,
            max_age_secs: max_age.as_secs(),
        }
    }

    /// No bounds at all.
    pub fn unlimited() -> Self {
        Self {
            max_bytes: 0,
            max_age_secs: 0,
        }
    }

    /// Add an age bound.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = max_age.as_secs();
        self
    }

    /// Add a size bound in bytes.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn max_age_ns(&self) -> Option<u64> {
        (self.max_age_secs > 0).then(|| self.max_age_secs.saturating_mul(1_000_000_000))
    }

    /// Which bound (if any) is exceeded.
    pub fn exceeded(
        &self,
        total_bytes: u64,
        oldest_created_ns: Option<u64>,
        now_ns: u64,
    ) -> Option<RetentionReason> {
        if self.max_bytes > 0 && total_bytes > self.max_bytes {
            return Some(RetentionReason::Size);
        }
        if let (Some(max_age), Some(created)) = (self.max_age_ns(), oldest_created_ns) {
            if now_ns.saturating_sub(created) > max_age {
                return Some(RetentionReason::Age);
            }
        }
        None
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

/// Bound that forced a segment drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionReason {
    Size,
    Age,
}

/// Unacknowledged records discarded by retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionLoss {
    pub stream_id: String,
    /// First lost sequence number (inclusive).
    pub lost_from: u64,
    /// Last lost sequence number (inclusive).
    pub lost_to: u64,
    pub reason: RetentionReason,
    /// Wall-clock time of the drop (Unix nanoseconds).
    pub at_ns: u64,
}

impl RetentionLoss {
    pub fn count(&self) -> u64 {
        self.lost_to - self.lost_from + 1
    }
}
