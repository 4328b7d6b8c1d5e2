// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingest service configuration.
//!
//! ```toml
//! db_path = "/var/lib/hdds/ingest.db"
//! liveness_timeout_secs = 60
//! freshness_threshold_secs = 300
//! worker_queue_depth = 256
//! ```

use hdds_spool::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ingest service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// A node with no inbound message for this long is OFFLINE.
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,

    /// Data older than this (by embedded sample time) is reported lagging.
    #[serde(default = "default_freshness_threshold_secs")]
    pub freshness_threshold_secs: u64,

    /// Pending messages per node worker; overflow is dropped unacknowledged.
    #[serde(default = "default_worker_queue_depth")]
    pub worker_queue_depth: usize,

    /// Publish timeout for acknowledgments.
    #[serde(default = "default_ack_publish_timeout_ms")]
    pub ack_publish_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("hdds_ingest.db")
}

fn default_liveness_timeout_secs() -> u64 {
    60
}

fn default_freshness_threshold_secs() -> u64 {
    300
}

fn default_worker_queue_depth() -> usize {
    256
}

fn default_ack_publish_timeout_ms() -> u64 {
    5_000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            freshness_threshold_secs: default_freshness_threshold_secs(),
            worker_queue_depth: default_worker_queue_depth(),
            ack_publish_timeout_ms: default_ack_publish_timeout_ms(),
        }
    }
}

impl IngestConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    pub fn liveness_timeout_secs(mut self, secs: u64) -> Self {
        self.liveness_timeout_secs = secs;
        self
    }

    pub fn freshness_threshold_secs(mut self, secs: u64) -> Self {
        self.freshness_threshold_secs = secs;
        self
    }

    pub fn worker_queue_depth(mut self, depth: usize) -> Self {
        self.worker_queue_depth = depth;
        self
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "liveness_timeout_secs must be non-zero".into(),
            ));
        }
        if self.worker_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "worker_queue_depth must be non-zero".into(),
            ));
        }
        if self.ack_publish_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "ack_publish_timeout_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn freshness_threshold(&self) -> Duration {
        Duration::from_secs(self.freshness_threshold_secs)
    }

    pub fn ack_publish_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_publish_timeout_ms)
    }
}
