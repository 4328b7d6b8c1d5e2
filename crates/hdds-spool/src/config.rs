// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Field-node configuration.
//!
//! Supports both programmatic and file-based (TOML) configuration.
//!
//! ```toml
//! node_id = "greenhouse-04"
//! channel_capacity = 1024
//! ack_timeout_secs = 30
//!
//! [spool]
//! dir = "/var/lib/hdds/spool"
//! segment_max_bytes = 4194304
//! sync = "data"
//!
//! [spool.retention]
//! max_bytes = 268435456
//! max_age_secs = 604800
//!
//! [replay]
//! max_messages_per_sec = 20
//! max_bytes_per_sec = 131072
//! ```

use crate::frame::{FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
use crate::record::is_valid_id;
use crate::retention::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// When segment writes are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Leave it to the OS page cache (fastest, loses the tail on power loss).
    None,
    /// `fdatasync` after every append.
    #[default]
    Data,
    /// `fsync` (data + metadata) after every append.
    All,
}

/// Spool configuration (shared by every stream of a node).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolConfig {
    /// Root directory; each stream gets its own subdirectory.
    #[serde(default = "default_spool_dir")]
    pub dir: PathBuf,

    /// Seal the open segment once it reaches this size.
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,

    /// Seal the open segment once it holds this many records.
    #[serde(default = "default_segment_max_records")]
    pub segment_max_records: u32,

    #[serde(default)]
    pub retention: RetentionPolicy,

    #[serde(default)]
    pub sync: SyncMode,
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("hdds_spool")
}

fn default_segment_max_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_segment_max_records() -> u32 {
    50_000
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            dir: default_spool_dir(),
            segment_max_bytes: default_segment_max_bytes(),
            segment_max_records: default_segment_max_records(),
            retention: RetentionPolicy::default(),
            sync: SyncMode::default(),
        }
    }
}

impl SpoolConfig {
    /// Config rooted at `dir` with default limits.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn segment_max_bytes(mut self, bytes: u64) -> Self {
        self.segment_max_bytes = bytes;
        self
    }

    pub fn segment_max_records(mut self, records: u32) -> Self {
        self.segment_max_records = records;
        self
    }

    pub fn retention(mut self, policy: RetentionPolicy) -> Self {
        self.retention = policy;
        self
    }

    pub fn sync(mut self, mode: SyncMode) -> Self {
        self.sync = mode;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_max_bytes < 1024 {
            return Err(ConfigError::Invalid(
                "spool.segment_max_bytes must be at least 1024".into(),
            ));
        }
        if self.segment_max_records == 0 {
            return Err(ConfigError::Invalid(
                "spool.segment_max_records must be non-zero".into(),
            ));
        }
        let max_bytes = self.retention.max_bytes;
        if max_bytes > 0 && max_bytes < self.segment_max_bytes.saturating_mul(2) {
            return Err(ConfigError::Invalid(format!(
                "spool.retention.max_bytes ({}) must hold at least two segments ({} bytes each)",
                max_bytes, self.segment_max_bytes
            )));
        }
        Ok(())
    }
}

/// Backlog replay throttle and interleaving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Backlog messages per second.
    #[serde(default = "default_max_messages_per_sec")]
    pub max_messages_per_sec: u32,

    /// Backlog bytes per second.
    #[serde(default = "default_max_bytes_per_sec")]
    pub max_bytes_per_sec: u32,

    /// Frames per backlog message.
    #[serde(default = "default_batch_max_frames")]
    pub batch_max_frames: usize,

    /// Live messages allowed ahead of each backlog message.
    #[serde(default = "default_live_ratio")]
    pub live_ratio: u32,
}

fn default_max_messages_per_sec() -> u32 {
    20
}

fn default_max_bytes_per_sec() -> u32 {
    128 * 1024
}

fn default_batch_max_frames() -> usize {
    64
}

fn default_live_ratio() -> u32 {
    4
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_messages_per_sec: default_max_messages_per_sec(),
            max_bytes_per_sec: default_max_bytes_per_sec(),
            batch_max_frames: default_batch_max_frames(),
            live_ratio: default_live_ratio(),
        }
    }
}

impl ReplayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_messages_per_sec == 0 || self.max_bytes_per_sec == 0 {
            return Err(ConfigError::Invalid(
                "replay throttle rates must be non-zero".into(),
            ));
        }
        if self.batch_max_frames == 0 {
            return Err(ConfigError::Invalid(
                "replay.batch_max_frames must be non-zero".into(),
            ));
        }
        let max_frame = MAX_FRAME_PAYLOAD + FRAME_HEADER_SIZE;
        if (self.max_bytes_per_sec as usize) < max_frame {
            return Err(ConfigError::Invalid(format!(
                "replay.max_bytes_per_sec must be at least {} (one maximum frame)",
                max_frame
            )));
        }
        if self.live_ratio == 0 {
            return Err(ConfigError::Invalid(
                "replay.live_ratio must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Field-node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity; part of every record and topic.
    pub node_id: String,

    #[serde(default)]
    pub spool: SpoolConfig,

    #[serde(default)]
    pub replay: ReplayConfig,

    /// Producer-to-spool queue depth.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Rewind to the ack watermark when sent records stay unacknowledged this long.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    /// A publish that takes longer marks the link down.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Status heartbeat period.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_ack_timeout_secs() -> u64 {
    30
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>, spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            spool: SpoolConfig::new(spool_dir),
            replay: ReplayConfig::default(),
            channel_capacity: default_channel_capacity(),
            ack_timeout_secs: default_ack_timeout_secs(),
            publish_timeout_ms: default_publish_timeout_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_id(&self.node_id) || self.node_id.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "invalid node_id '{}'",
                self.node_id
            )));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel_capacity must be non-zero".into(),
            ));
        }
        if self.publish_timeout_ms == 0 || self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "publish_timeout_ms and heartbeat_interval_secs must be non-zero".into(),
            ));
        }
        self.spool.validate()?;
        self.replay.validate()?;
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_config_defaults() {
        let config = NodeConfig::new("node-1", "/tmp/spool");
        assert_eq!(config.channel_capacity, 1024);
        assert_eq!(config.spool.sync, SyncMode::Data);
        assert_eq!(config.replay.max_messages_per_sec, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            node_id = "greenhouse-04"
            ack_timeout_secs = 10

            [spool]
            dir = "/var/lib/hdds/spool"
            segment_max_bytes = 1048576
            sync = "none"

            [spool.retention]
            max_bytes = 8388608

            [replay]
            max_messages_per_sec = 5
        "#;

        let config: NodeConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.node_id, "greenhouse-04");
        assert_eq!(config.ack_timeout_secs, 10);
        assert_eq!(config.spool.sync, SyncMode::None);
        assert_eq!(config.spool.retention.max_bytes, 8 * 1024 * 1024);
        assert_eq!(config.spool.retention.max_age_secs, 7 * 24 * 3600);
        assert_eq!(config.replay.max_messages_per_sec, 5);
        assert_eq!(config.replay.batch_max_frames, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_tiny_retention() {
        let mut config = NodeConfig::new("node-1", "/tmp/spool");
        config.spool.segment_max_bytes = 1024 * 1024;
        config.spool.retention = RetentionPolicy::unlimited().with_max_bytes(1024 * 1024);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_node_id() {
        let config = NodeConfig::new("bad/node", "/tmp/spool");
        assert!(config.validate().is_err());
        let config = NodeConfig::new("", "/tmp/spool");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_throttle() {
        let mut config = NodeConfig::new("node-1", "/tmp/spool");
        config.replay.max_messages_per_sec = 0;
        assert!(config.validate().is_err());
    }
}
