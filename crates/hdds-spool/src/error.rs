// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Spool error types.

use crate::frame::FrameError;
use std::path::PathBuf;
use thiserror::Error;

/// Spool errors.
///
/// Everything here is a local fault; transport trouble is reported through
/// [`crate::transport::TransportError`] and never fails an append.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Corrupt sealed segment {path}: {reason}")]
    CorruptSegment { path: PathBuf, reason: String },

    #[error("Sequence gap between segments: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("Segment starting at seq {first_seq} was removed by retention")]
    SegmentGone { first_seq: u64 },

    #[error("Retention exhausted: {0}")]
    RetentionExhausted(String),

    #[error("Record of {size} bytes exceeds segment limit of {limit} bytes")]
    RecordTooLarge { size: u64, limit: u64 },

    #[error("Invalid identifier '{0}'")]
    InvalidId(String),

    #[error("Watermark file error: {0}")]
    Watermark(#[from] serde_json::Error),

    #[error("Spool closed")]
    Closed,
}

impl SpoolError {
    /// Faults that mean the on-disk spool can no longer be trusted.
    pub fn is_integrity_fault(&self) -> bool {
        matches!(
            self,
            Self::CorruptSegment { .. } | Self::SequenceGap { .. }
        )
    }
}
