// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node-side acknowledgment tracking.
//!
//! The tracker owns the durable copy of `acked_seq` for one stream. A new
//! watermark is written to `acked.json` (temp file, fsync, rename) before
//! the caller is allowed to trim, so a crash between ack and trim only
//! repeats the trim on restart.

use crate::error::SpoolError;
use crate::segment::sync_dir;
use crate::wire::AckMessage;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Watermark file name inside a stream spool directory.
pub const WATERMARK_FILE: &str = "acked.json";

/// Persisted acknowledgment watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub node_id: String,
    pub stream_id: String,
    pub acked_seq: u64,
    /// Server commit time of `acked_seq` (Unix nanoseconds).
    pub committed_at_ns: u64,
}

/// Load the watermark stored in `dir`, if any.
pub fn load_watermark(dir: &Path) -> Result<Option<Watermark>, SpoolError> {
    let path = dir.join(WATERMARK_FILE);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Atomically replace the watermark stored in `dir`.
pub fn store_watermark(dir: &Path, watermark: &Watermark) -> Result<(), SpoolError> {
    let path = dir.join(WATERMARK_FILE);
    let tmp_path = dir.join(format!("{}.tmp", WATERMARK_FILE));

    let bytes = serde_json::to_vec(watermark)?;
    let mut tmp = File::create(&tmp_path)?;
    tmp.write_all(&bytes)?;
    tmp.sync_all()?;
    drop(tmp);

    fs::rename(&tmp_path, &path)?;
    sync_dir(dir)?;
    Ok(())
}

/// Durable `acked_seq` for one (node, stream).
#[derive(Debug)]
pub struct AckTracker {
    dir: PathBuf,
    node_id: String,
    stream_id: String,
    acked_seq: u64,
    committed_at_ns: u64,
}

impl AckTracker {
    /// Load the tracker for a stream spool directory (0 when never acked).
    pub fn load(
        dir: impl Into<PathBuf>,
        node_id: impl Into<String>,
        stream_id: impl Into<String>,
    ) -> Result<Self, SpoolError> {
        let dir = dir.into();
        let node_id = node_id.into();
        let stream_id = stream_id.into();

        let (acked_seq, committed_at_ns) = match load_watermark(&dir)? {
            Some(w) if w.node_id == node_id && w.stream_id == stream_id => {
                (w.acked_seq, w.committed_at_ns)
            }
            Some(w) => {
                tracing::warn!(
                    "Ignoring watermark for {}/{} found in {}",
                    w.node_id,
                    w.stream_id,
                    dir.display()
                );
                (0, 0)
            }
            None => (0, 0),
        };

        Ok(Self {
            dir,
            node_id,
            stream_id,
            acked_seq,
            committed_at_ns,
        })
    }

    pub fn acked_seq(&self) -> u64 {
        self.acked_seq
    }

    pub fn committed_at_ns(&self) -> u64 {
        self.committed_at_ns
    }

    /// Apply an acknowledgment.
    ///
    /// Returns the new watermark once it is durable, which authorizes
    /// `truncate_to`. Stale and duplicate acks return `None`, as do acks
    /// for seqs this node never assigned (`> max_valid`).
    pub fn observe(&mut self, ack: &AckMessage, max_valid: u64) -> Result<Option<u64>, SpoolError> {
        if ack.node_id != self.node_id || ack.stream_id != self.stream_id {
            tracing::debug!(
                "Ack for {}/{} ignored by tracker {}/{}",
                ack.node_id,
                ack.stream_id,
                self.node_id,
                self.stream_id
            );
            return Ok(None);
        }
        if ack.acked_seq <= self.acked_seq {
            tracing::trace!(
                "Stale ack {} for {} (have {})",
                ack.acked_seq,
                self.stream_id,
                self.acked_seq
            );
            return Ok(None);
        }
        if ack.acked_seq > max_valid {
            tracing::error!(
                "Ack {} for {} beyond last assigned seq {}; ignored",
                ack.acked_seq,
                self.stream_id,
                max_valid
            );
            return Ok(None);
        }

        let watermark = Watermark {
            node_id: self.node_id.clone(),
            stream_id: self.stream_id.clone(),
            acked_seq: ack.acked_seq,
            committed_at_ns: ack.committed_at_ns,
        };
        store_watermark(&self.dir, &watermark)?;

        self.acked_seq = ack.acked_seq;
        self.committed_at_ns = ack.committed_at_ns;
        tracing::debug!("Stream {} acked through {}", self.stream_id, self.acked_seq);
        Ok(Some(self.acked_seq))
    }
}
