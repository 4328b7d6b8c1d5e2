// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Durable per-stream segment spool.
//!
//! One [`Spool`] owns the segment files of a single (node, stream) pair
//! under `<spool_dir>/<stream_dir_name>/`. It is the only writer of those
//! files; callers share it behind a mutex so append and truncate never
//! interleave. Replay readers ([`SpoolReader`]) work on a snapshot of the
//! segment list and read files without holding the lock.
//!
//! # Sequence Conventions
//!
//! - Sequence numbers start at 1; `acked_seq == 0` means nothing acked.
//! - `next_seq` is the seq the next append receives.
//! - `oldest_retained_seq` is the first seq still on disk, or `next_seq`
//!   when the spool is empty.

use crate::ack::{load_watermark, WATERMARK_FILE};
use crate::config::SpoolConfig;
use crate::error::SpoolError;
use crate::frame::{Frame, FrameError, FrameScanner, ScanStop};
use crate::record::{is_valid_id, unix_now_ns, Record, Sample};
use crate::retention::{RetentionLoss, RetentionReason};
use crate::segment::{
    list_segments, open_frames, recover_tail, sync_dir, verify_sealed, RecoveredTail,
    SegmentFooter, SegmentHeader, SegmentInfo, SegmentWriter,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

/// Directory name for a stream (`/` is not a valid path component here).
pub fn stream_dir_name(stream_id: &str) -> String {
    stream_id.replace('/', "+")
}

/// Inverse of [`stream_dir_name`].
pub fn stream_id_from_dir_name(name: &str) -> Option<String> {
    let stream_id = name.replace('+', "/");
    is_valid_id(&stream_id).then_some(stream_id)
}

/// Sequence bookkeeping of one spool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpoolState {
    pub oldest_retained_seq: u64,
    pub next_seq: u64,
    pub acked_seq: u64,
}

impl SpoolState {
    /// Highest assigned seq (0 when nothing was ever appended).
    pub fn last_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    /// Records appended but not yet acknowledged.
    pub fn backlog(&self) -> u64 {
        self.last_seq().saturating_sub(self.acked_seq)
    }
}

/// Point-in-time view for the health surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolHealth {
    pub stream_id: String,
    pub oldest_retained_seq: u64,
    pub acked_seq: u64,
    pub next_seq: u64,
    pub backlog: u64,
    pub segment_count: usize,
    pub total_bytes: u64,
    /// Set once a fatal local fault closed the spool for appends.
    pub fault: Option<String>,
}

/// Append log of framed records for one (node, stream).
pub struct Spool {
    dir: PathBuf,
    node_id: String,
    stream_id: String,
    config: SpoolConfig,
    sealed: VecDeque<SegmentInfo>,
    open: Option<SegmentWriter>,
    state: SpoolState,
    losses: Vec<RetentionLoss>,
    fault: Option<String>,
}

impl Spool {
    /// Open (or create) the spool of `stream_id` under `config.dir` and recover it.
    pub fn open(config: &SpoolConfig, node_id: &str, stream_id: &str) -> Result<Self, SpoolError> {
        let dir = config.dir.join(stream_dir_name(stream_id));
        Self::open_at(dir, config, node_id, stream_id)
    }

    /// Open a spool rooted at an explicit stream directory.
    pub fn open_at(
        dir: impl Into<PathBuf>,
        config: &SpoolConfig,
        node_id: &str,
        stream_id: &str,
    ) -> Result<Self, SpoolError> {
        if !is_valid_id(node_id) {
            return Err(SpoolError::InvalidId(node_id.to_string()));
        }
        if !is_valid_id(stream_id) {
            return Err(SpoolError::InvalidId(stream_id.to_string()));
        }

        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut spool = Self {
            dir,
            node_id: node_id.to_string(),
            stream_id: stream_id.to_string(),
            config: config.clone(),
            sealed: VecDeque::new(),
            open: None,
            state: SpoolState::default(),
            losses: Vec::new(),
            fault: None,
        };
        spool.recover()?;
        Ok(spool)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn state(&self) -> SpoolState {
        self.state
    }

    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    /// Rebuild the in-memory state from disk.
    ///
    /// Sealed segments are verified in full; a bad one is a fatal integrity
    /// error. The most recent segment is either sealed, or truncated to its
    /// last valid frame and reopened for appends. Any trim the persisted
    /// watermark allows is re-applied.
    pub fn recover(&mut self) -> Result<(), SpoolError> {
        self.sealed.clear();
        self.open = None;
        self.fault = None;

        let tmp = self.dir.join(format!("{}.tmp", WATERMARK_FILE));
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }

        let files = list_segments(&self.dir)?;
        let last_index = files.len().checked_sub(1);
        let mut expected: Option<u64> = None;

        for (index, (name_seq, path)) in files.iter().enumerate() {
            let info = if Some(index) == last_index {
                match recover_tail(path, self.config.sync)? {
                    RecoveredTail::Sealed(info) => info,
                    RecoveredTail::Open {
                        writer,
                        truncated_bytes,
                    } => {
                        if truncated_bytes > 0 {
                            tracing::warn!(
                                "Spool {}: truncated {} bytes of partial data from {}",
                                self.stream_id,
                                truncated_bytes,
                                path.display()
                            );
                        }
                        let info = writer.info().clone();
                        check_continuity(&info, *name_seq, expected)?;
                        self.open = Some(writer);
                        continue;
                    }
                    RecoveredTail::Discarded => continue,
                }
            } else {
                verify_sealed(path).map_err(|e| {
                    tracing::error!("Spool {}: {}", self.stream_id, e);
                    e
                })?
            };

            check_continuity(&info, *name_seq, expected)?;
            expected = Some(info.end_seq() + 1);
            self.sealed.push_back(info);
        }

        let acked = match load_watermark(&self.dir)? {
            Some(w) if w.node_id == self.node_id && w.stream_id == self.stream_id => w.acked_seq,
            _ => 0,
        };
        let last_on_disk = self
            .open
            .as_ref()
            .map(|w| w.info().end_seq())
            .or_else(|| self.sealed.back().map(SegmentInfo::end_seq))
            .unwrap_or(0);

        self.state.next_seq = last_on_disk.max(acked) + 1;
        self.state.acked_seq = acked;
        self.refresh_oldest();
        self.truncate_to(acked)?;

        tracing::info!(
            "Recovered spool {}/{}: oldest={} next={} acked={} segments={}",
            self.node_id,
            self.stream_id,
            self.state.oldest_retained_seq,
            self.state.next_seq,
            self.state.acked_seq,
            self.segment_count()
        );
        Ok(())
    }

    /// Append a sample; returns the assigned seq.
    ///
    /// Durable on return (per the configured sync mode). Enforces retention
    /// before writing, which may drop unacknowledged sealed segments.
    pub fn append(&mut self, sample: &Sample) -> Result<u64, SpoolError> {
        self.append_at(sample, unix_now_ns())
    }

    /// Append with an explicit wall-clock time (Unix nanoseconds) driving
    /// rollover and age retention.
    pub(crate) fn append_at(&mut self, sample: &Sample, now: u64) -> Result<u64, SpoolError> {
        if self.fault.is_some() {
            return Err(SpoolError::Closed);
        }
        if sample.stream_id != self.stream_id {
            return Err(SpoolError::InvalidId(format!(
                "sample for stream '{}' sent to spool '{}'",
                sample.stream_id, self.stream_id
            )));
        }

        let seq = self.state.next_seq;
        let frame = Frame::encode(&Record {
            node_id: self.node_id.clone(),
            stream_id: self.stream_id.clone(),
            seq,
            sample_time_ns: sample.sample_time_ns,
            value: sample.value.clone(),
        })?;

        let limit = self
            .config
            .segment_max_bytes
            .saturating_sub((SegmentHeader::SIZE + SegmentFooter::SIZE) as u64);
        if frame.encoded_len() > limit {
            return Err(SpoolError::RecordTooLarge {
                size: frame.encoded_len(),
                limit,
            });
        }

        self.maybe_roll(frame.encoded_len(), now)?;
        let incoming = frame.encoded_len()
            + if self.open.is_none() {
                SegmentHeader::SIZE as u64
            } else {
                0
            };
        self.enforce_retention(incoming, now)?;

        if self.open.is_none() {
            let writer = SegmentWriter::create(&self.dir, seq, now, self.config.sync)
                .map_err(|e| self.fail(e))?;
            self.open = Some(writer);
        }
        let appended = match self.open.as_mut() {
            Some(writer) => writer.append(&frame),
            None => Err(SpoolError::Closed),
        };
        if let Err(e) = appended {
            return Err(self.fail(e));
        }

        self.state.next_seq = seq + 1;
        if self.sealed.is_empty() {
            self.refresh_oldest();
        }
        tracing::trace!("Spool {} appended seq {}", self.stream_id, seq);
        Ok(seq)
    }

    /// Remove every segment fully covered by `acked_seq`.
    ///
    /// Idempotent and monotonic: a lower value than already recorded changes
    /// nothing. Values beyond the last assigned seq are clamped. A fully
    /// acknowledged open segment is sealed and removed as well. Returns the
    /// number of segments removed.
    pub fn truncate_to(&mut self, acked_seq: u64) -> Result<usize, SpoolError> {
        let acked = acked_seq.min(self.state.last_seq());
        if acked > self.state.acked_seq {
            self.state.acked_seq = acked;
        }
        let acked = self.state.acked_seq;

        let mut removed = 0;
        while self.sealed.front().is_some_and(|s| s.end_seq() <= acked) {
            if let Some(segment) = self.sealed.pop_front() {
                remove_segment(&segment.path)?;
                removed += 1;
            }
        }

        if self.sealed.is_empty() && self.open.as_ref().is_some_and(|w| w.info().end_seq() <= acked)
        {
            if let Some(writer) = self.open.take() {
                let info = writer.seal()?;
                remove_segment(&info.path)?;
                removed += 1;
            }
        }

        if removed > 0 {
            sync_dir(&self.dir)?;
            self.refresh_oldest();
            tracing::debug!(
                "Spool {} trimmed {} segment(s) through seq {}",
                self.stream_id,
                removed,
                acked
            );
        }
        Ok(removed)
    }

    /// Lazy replay of frames from `seq` (clamped to the oldest retained seq)
    /// through the last seq assigned at call time.
    pub fn read_from(&self, seq: u64) -> SpoolReader {
        let mut segments: VecDeque<(u64, PathBuf)> = self
            .sealed
            .iter()
            .map(|s| (s.first_seq, s.path.clone()))
            .collect();
        if let Some(writer) = &self.open {
            let info = writer.info();
            if !info.is_empty() {
                segments.push_back((info.first_seq, info.path.clone()));
            }
        }

        SpoolReader {
            segments,
            next_seq: seq.max(self.state.oldest_retained_seq),
            end_seq: self.state.last_seq(),
            current: None,
            done: false,
        }
    }

    /// Most recently appended frame, if still retained.
    pub fn last_frame(&self) -> Result<Option<Frame>, SpoolError> {
        let last = self.state.last_seq();
        if last == 0 || last < self.state.oldest_retained_seq {
            return Ok(None);
        }
        self.read_from(last).next().transpose()
    }

    /// Sync the open segment regardless of sync mode.
    pub fn flush(&mut self) -> Result<(), SpoolError> {
        if let Some(writer) = &self.open {
            writer.sync()?;
        }
        Ok(())
    }

    /// Flush and release the spool. The open segment stays open on disk and
    /// is resumed by the next `recover()`.
    pub fn close(mut self) -> Result<(), SpoolError> {
        self.flush()?;
        tracing::debug!("Closed spool {}/{}", self.node_id, self.stream_id);
        Ok(())
    }

    /// Retention-loss events recorded since the last drain.
    pub fn drain_retention_losses(&mut self) -> Vec<RetentionLoss> {
        std::mem::take(&mut self.losses)
    }

    pub fn segment_count(&self) -> usize {
        self.sealed.len() + usize::from(self.open.is_some())
    }

    pub fn total_bytes(&self) -> u64 {
        self.sealed.iter().map(|s| s.size_bytes).sum::<u64>()
            + self.open.as_ref().map_or(0, |w| w.info().size_bytes)
    }

    /// Segment list, oldest first (open segment last).
    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.sealed
            .iter()
            .cloned()
            .chain(self.open.as_ref().map(|w| w.info().clone()))
            .collect()
    }

    pub fn health(&self) -> SpoolHealth {
        SpoolHealth {
            stream_id: self.stream_id.clone(),
            oldest_retained_seq: self.state.oldest_retained_seq,
            acked_seq: self.state.acked_seq,
            next_seq: self.state.next_seq,
            backlog: self.state.backlog(),
            segment_count: self.segment_count(),
            total_bytes: self.total_bytes(),
            fault: self.fault.clone(),
        }
    }

    fn fail(&mut self, err: SpoolError) -> SpoolError {
        tracing::error!(
            "Spool {}/{} closed for appends: {}",
            self.node_id,
            self.stream_id,
            err
        );
        self.fault = Some(err.to_string());
        err
    }

    fn refresh_oldest(&mut self) {
        self.state.oldest_retained_seq = self
            .sealed
            .front()
            .map(|s| s.first_seq)
            .or_else(|| {
                self.open
                    .as_ref()
                    .filter(|w| !w.info().is_empty())
                    .map(|w| w.info().first_seq)
            })
            .unwrap_or(self.state.next_seq);
    }

    fn oldest_created_ns(&self) -> Option<u64> {
        self.sealed
            .front()
            .map(|s| s.created_at_ns)
            .or_else(|| self.open.as_ref().map(|w| w.info().created_at_ns))
    }

    /// Drop oldest sealed segments while a retention bound is exceeded.
    fn enforce_retention(&mut self, incoming: u64, now: u64) -> Result<(), SpoolError> {
        let policy = self.config.retention;
        loop {
            let total = self.total_bytes() + incoming;
            let Some(reason) = policy.exceeded(total, self.oldest_created_ns(), now) else {
                return Ok(());
            };

            let Some(segment) = self.sealed.pop_front() else {
                if reason == RetentionReason::Size && total > policy.max_bytes {
                    if let Some(writer) = self.open.as_ref() {
                        if writer.info().size_bytes + incoming > policy.max_bytes {
                            return Err(SpoolError::RetentionExhausted(format!(
                                "open segment alone exceeds {} bytes",
                                policy.max_bytes
                            )));
                        }
                    }
                }
                // Only the open segment is left; rollover handles its age.
                return Ok(());
            };

            remove_segment(&segment.path)?;
            sync_dir(&self.dir)?;

            let acked = self.state.acked_seq;
            if segment.end_seq() > acked && !segment.is_empty() {
                let loss = RetentionLoss {
                    stream_id: self.stream_id.clone(),
                    lost_from: segment.first_seq.max(acked + 1),
                    lost_to: segment.end_seq(),
                    reason,
                    at_ns: now,
                };
                tracing::warn!(
                    "Retention ({:?}) dropped unacknowledged seq {}..={} of {}/{}",
                    reason,
                    loss.lost_from,
                    loss.lost_to,
                    self.node_id,
                    self.stream_id
                );
                self.losses.push(loss);
            } else {
                tracing::debug!(
                    "Retention ({:?}) reclaimed acknowledged segment {}",
                    reason,
                    segment.path.display()
                );
            }
            self.refresh_oldest();
        }
    }

    /// Seal the open segment when the next frame would exceed a segment limit
    /// or the segment has outlived half the retention age.
    fn maybe_roll(&mut self, incoming: u64, now: u64) -> Result<(), SpoolError> {
        let Some(writer) = self.open.as_ref() else {
            return Ok(());
        };
        let info = writer.info();
        if info.is_empty() {
            return Ok(());
        }

        let footer = SegmentFooter::SIZE as u64;
        let full_bytes = info.size_bytes + incoming + footer > self.config.segment_max_bytes;
        let full_records = info.frame_count >= self.config.segment_max_records;
        let aged = self
            .config
            .retention
            .max_age_ns()
            .is_some_and(|max_age| now.saturating_sub(info.created_at_ns) > max_age / 2);

        if full_bytes || full_records || aged {
            if let Some(writer) = self.open.take() {
                let sealed = writer.seal().map_err(|e| self.fail(e))?;
                self.sealed.push_back(sealed);
            }
        }
        Ok(())
    }
}

fn check_continuity(info: &SegmentInfo, name_seq: u64, expected: Option<u64>) -> Result<(), SpoolError> {
    if info.first_seq != name_seq {
        return Err(SpoolError::CorruptSegment {
            path: info.path.clone(),
            reason: format!(
                "header first_seq {} does not match file name",
                info.first_seq
            ),
        });
    }
    match expected {
        Some(expected) if expected != info.first_seq => Err(SpoolError::SequenceGap {
            expected,
            found: info.first_seq,
        }),
        _ => Ok(()),
    }
}

fn remove_segment(path: &Path) -> Result<(), SpoolError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Lazy, finite replay over a snapshot of the spool.
///
/// Yields frames in seq order without holding the spool lock. If a segment
/// disappears underneath (retention), the reader yields
/// [`SpoolError::SegmentGone`] once and stops; restart with a fresh
/// `read_from`.
pub struct SpoolReader {
    segments: VecDeque<(u64, PathBuf)>,
    next_seq: u64,
    end_seq: u64,
    current: Option<FrameScanner<BufReader<File>>>,
    done: bool,
}

impl SpoolReader {
    /// Seq of the next frame this reader will yield.
    pub fn position(&self) -> u64 {
        self.next_seq
    }

    /// Last seq (inclusive) this reader covers.
    pub fn end_seq(&self) -> u64 {
        self.end_seq
    }

    fn finish(&mut self, err: SpoolError) -> Option<Result<Frame, SpoolError>> {
        self.done = true;
        self.current = None;
        Some(Err(err))
    }

    fn open_next_segment(&mut self) -> Option<Result<(), SpoolError>> {
        while self.segments.len() > 1 && self.segments[1].0 <= self.next_seq {
            self.segments.pop_front();
        }
        let (first_seq, path) = self.segments.pop_front()?;
        if first_seq > self.next_seq {
            return Some(Err(SpoolError::SegmentGone {
                first_seq: self.next_seq,
            }));
        }
        match open_frames(&path) {
            Ok(scanner) => {
                self.current = Some(scanner);
                Some(Ok(()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Some(Err(SpoolError::SegmentGone { first_seq }))
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}

impl Iterator for SpoolReader {
    type Item = Result<Frame, SpoolError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.next_seq > self.end_seq {
                return None;
            }

            let Some(scanner) = self.current.as_mut() else {
                match self.open_next_segment() {
                    Some(Ok(())) => continue,
                    Some(Err(e)) => return self.finish(e),
                    None => {
                        self.done = true;
                        return None;
                    }
                }
            };

            match scanner.next() {
                Some(frame) if frame.seq() < self.next_seq => continue,
                Some(frame) if frame.seq() == self.next_seq => {
                    self.next_seq += 1;
                    return Some(Ok(frame));
                }
                Some(frame) => {
                    let expected = self.next_seq;
                    return self.finish(SpoolError::SequenceGap {
                        expected,
                        found: frame.seq(),
                    });
                }
                None => {
                    let stop = scanner.stop().cloned();
                    self.current = None;
                    match stop {
                        Some(ScanStop::Corrupt { offset, reason }) => {
                            return self.finish(SpoolError::Frame(FrameError::InvalidRecord(
                                format!("replay hit invalid frame at offset {}: {}", offset, reason),
                            )));
                        }
                        Some(ScanStop::Io(msg)) => {
                            return self.finish(SpoolError::Io(io::Error::other(msg)));
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMode;
    use crate::record::Value;
    use crate::retention::RetentionPolicy;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &Path) -> SpoolConfig {
        SpoolConfig::new(dir)
            .sync(SyncMode::None)
            .segment_max_records(10)
            .retention(RetentionPolicy::unlimited())
    }

    fn sample(i: u64) -> Sample {
        Sample::at("field/temp", 1_000 + i, Value::Float(i as f64))
    }

    fn fill(spool: &mut Spool, count: u64) {
        for i in 0..count {
            spool.append(&sample(i)).expect("append");
        }
    }

    fn seqs(reader: SpoolReader) -> Vec<u64> {
        reader.map(|f| f.expect("frame").seq()).collect()
    }

    #[test]
    fn test_append_assigns_gap_free_seqs() {
        let dir = TempDir::new().expect("tempdir");
        let mut spool = Spool::open(&config(dir.path()), "node-1", "field/temp").expect("open");
        let assigned: Vec<u64> = (0..25).map(|i| spool.append(&sample(i)).expect("append")).collect();
        assert_eq!(assigned, (1..=25).collect::<Vec<_>>());
        assert_eq!(spool.segment_count(), 3);
        assert_eq!(spool.state().next_seq, 26);
        assert_eq!(spool.state().oldest_retained_seq, 1);
        assert_eq!(spool.state().backlog(), 25);
        assert!(dir.path().join("field+temp").is_dir());
    }

    #[test]
    fn test_read_from_any_boundary() {
        let dir = TempDir::new().expect("tempdir");
        let mut spool = Spool::open(&config(dir.path()), "node-1", "field/temp").expect("open");
        fill(&mut spool, 25);

        assert_eq!(seqs(spool.read_from(1)), (1..=25).collect::<Vec<_>>());
        assert_eq!(seqs(spool.read_from(10)), (10..=25).collect::<Vec<_>>());
        assert_eq!(seqs(spool.read_from(11)), (11..=25).collect::<Vec<_>>());
        assert!(seqs(spool.read_from(26)).is_empty());
    }

    #[test]
    fn test_reader_is_bounded_by_snapshot() {
        let dir = TempDir::new().expect("tempdir");
        let mut spool = Spool::open(&config(dir.path()), "node-1", "field/temp").expect("open");
        fill(&mut spool, 5);
        let reader = spool.read_from(1);
        fill(&mut spool, 5);
        assert_eq!(seqs(reader), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_truncate_only_removes_acked_segments() {
        let dir = TempDir::new().expect("tempdir");
        let mut spool = Spool::open(&config(dir.path()), "node-1", "field/temp").expect("open");
        fill(&mut spool, 25);

        assert_eq!(spool.truncate_to(15).expect("truncate"), 1);
        assert_eq!(spool.state().oldest_retained_seq, 11);
        assert_eq!(spool.state().acked_seq, 15);
        for segment in spool.segments() {
            assert!(segment.end_seq() > 15);
        }

        // Lower acks change nothing.
        assert_eq!(spool.truncate_to(3).expect("truncate"), 0);
        assert_eq!(spool.state().acked_seq, 15);
        assert_eq!(seqs(spool.read_from(16)), (16..=25).collect::<Vec<_>>());
    }

    #[test]
    fn test_full_ack_empties_spool() {
        let dir = TempDir::new().expect("tempdir");
        let mut spool = Spool::open(&config(dir.path()), "node-1", "field/temp").expect("open");
        fill(&mut spool, 7);
        spool.truncate_to(7).expect("truncate");

        assert_eq!(spool.segment_count(), 0);
        let state = spool.state();
        assert_eq!(state.acked_seq, 7);
        assert_eq!(state.next_seq, 8);
        assert_eq!(state.oldest_retained_seq, 8);
        assert_eq!(state.backlog(), 0);

        assert_eq!(spool.append(&sample(8)).expect("append"), 8);
        assert_eq!(spool.state().oldest_retained_seq, 8);
    }

    #[test]
    fn test_truncate_clamps_to_last_assigned() {
        let dir = TempDir::new().expect("tempdir");
        let mut spool = Spool::open(&config(dir.path()), "node-1", "field/temp").expect("open");
        fill(&mut spool, 3);
        spool.truncate_to(1_000).expect("truncate");
        assert_eq!(spool.state().acked_seq, 3);
    }

    #[test]
    fn test_recover_resumes_sequence() {
        let dir = TempDir::new().expect("tempdir");
        let cfg = config(dir.path());
        {
            let mut spool = Spool::open(&cfg, "node-1", "field/temp").expect("open");
            fill(&mut spool, 14);
            spool.close().expect("close");
        }
        let mut spool = Spool::open(&cfg, "node-1", "field/temp").expect("reopen");
        assert_eq!(spool.state().next_seq, 15);
        assert_eq!(spool.append(&sample(99)).expect("append"), 15);
        assert_eq!(seqs(spool.read_from(1)), (1..=15).collect::<Vec<_>>());
    }

    #[test]
    fn test_recover_never_reuses_acked_seqs() {
        let dir = TempDir::new().expect("tempdir");
        let cfg = config(dir.path());
        {
            let mut spool = Spool::open(&cfg, "node-1", "field/temp").expect("open");
            fill(&mut spool, 5);
            let mut tracker =
                crate::ack::AckTracker::load(spool.dir(), "node-1", "field/temp").expect("tracker");
            let ack = crate::wire::AckMessage {
                node_id: "node-1".into(),
                stream_id: "field/temp".into(),
                acked_seq: 5,
                committed_at_ns: 0,
            };
            let acked = tracker.observe(&ack, 5).expect("observe").expect("advanced");
            spool.truncate_to(acked).expect("truncate");
        }
        let mut spool = Spool::open(&cfg, "node-1", "field/temp").expect("reopen");
        assert_eq!(spool.segment_count(), 0);
        assert_eq!(spool.state().acked_seq, 5);
        assert_eq!(spool.append(&sample(6)).expect("append"), 6);
    }

    #[test]
    fn test_recover_retries_interrupted_trim() {
        let dir = TempDir::new().expect("tempdir");
        let cfg = config(dir.path());
        {
            let mut spool = Spool::open(&cfg, "node-1", "field/temp").expect("open");
            fill(&mut spool, 25);
            // Watermark persisted, crash before truncate_to.
            crate::ack::store_watermark(
                spool.dir(),
                &crate::ack::Watermark {
                    node_id: "node-1".into(),
                    stream_id: "field/temp".into(),
                    acked_seq: 20,
                    committed_at_ns: 0,
                },
            )
            .expect("store");
        }
        let spool = Spool::open(&cfg, "node-1", "field/temp").expect("reopen");
        assert_eq!(spool.state().acked_seq, 20);
        assert_eq!(spool.state().oldest_retained_seq, 21);
        assert_eq!(spool.segment_count(), 1);
    }

    #[test]
    fn test_corrupt_sealed_segment_is_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let cfg = config(dir.path());
        let first_segment;
        {
            let mut spool = Spool::open(&cfg, "node-1", "field/temp").expect("open");
            fill(&mut spool, 15);
            first_segment = spool.segments()[0].path.clone();
        }
        let mut bytes = fs::read(&first_segment).expect("read");
        bytes[SegmentHeader::SIZE + 20] ^= 0xFF;
        fs::write(&first_segment, bytes).expect("write");

        let err = Spool::open(&cfg, "node-1", "field/temp")
            .err()
            .expect("corrupt sealed segment must fail");
        assert!(err.is_integrity_fault());
    }

    #[test]
    fn test_size_retention_reports_loss() {
        let dir = TempDir::new().expect("tempdir");
        let cfg = SpoolConfig::new(dir.path())
            .sync(SyncMode::None)
            .segment_max_bytes(1024)
            .segment_max_records(1_000)
            .retention(RetentionPolicy::unlimited().with_max_bytes(2048));
        let mut spool = Spool::open(&cfg, "node-1", "field/temp").expect("open");
        fill(&mut spool, 200);

        assert!(spool.total_bytes() <= 2048);
        let losses = spool.drain_retention_losses();
        assert!(!losses.is_empty());
        assert_eq!(losses[0].lost_from, 1);
        assert_eq!(losses[0].reason, RetentionReason::Size);
        for pair in losses.windows(2) {
            assert_eq!(pair[1].lost_from, pair[0].lost_to + 1);
        }
        let state = spool.state();
        assert_eq!(losses.last().map(|l| l.lost_to + 1), Some(state.oldest_retained_seq));
        assert!(spool.drain_retention_losses().is_empty());

        // Replay from the old ack watermark starts at the new floor.
        let first = spool.read_from(1).next().expect("frame").expect("ok");
        assert_eq!(first.seq(), state.oldest_retained_seq);
    }

    #[test]
    fn test_age_retention_reports_loss() {
        const SEC: u64 = 1_000_000_000;
        let dir = TempDir::new().expect("tempdir");
        let cfg = SpoolConfig::new(dir.path())
            .sync(SyncMode::None)
            .segment_max_records(1_000)
            .retention(RetentionPolicy::by_age(Duration::from_secs(100)));
        let mut spool = Spool::open(&cfg, "node-1", "field/temp").expect("open");
        let t0 = 1_700_000_000 * SEC;

        for i in 0..5 {
            spool.append_at(&sample(i), t0).expect("append");
        }
        assert_eq!(spool.segment_count(), 1);

        // Open segment rolls once it is older than half the retention age.
        spool.append_at(&sample(5), t0 + 50 * SEC).expect("append");
        assert_eq!(spool.segment_count(), 1);
        spool.append_at(&sample(6), t0 + 51 * SEC).expect("append");
        let segments = spool.segments();
        assert_eq!(segments.len(), 2);
        assert_eq!((segments[0].first_seq, segments[0].end_seq()), (1, 6));
        assert_eq!(segments[1].first_seq, 7);
        assert_eq!(segments[1].created_at_ns, t0 + 51 * SEC);
        assert!(spool.drain_retention_losses().is_empty());

        // The sealed segment has now outlived the bound; the newer one has not.
        let at = t0 + 101 * SEC;
        assert_eq!(spool.append_at(&sample(7), at).expect("append"), 8);

        let losses = spool.drain_retention_losses();
        assert_eq!(losses.len(), 1);
        assert_eq!(losses[0].reason, RetentionReason::Age);
        assert_eq!((losses[0].lost_from, losses[0].lost_to), (1, 6));
        assert_eq!(losses[0].at_ns, at);
        assert!(!segments[0].path.exists());

        let state = spool.state();
        assert_eq!(state.oldest_retained_seq, 7);
        assert_eq!(state.next_seq, 9);
        assert_eq!(spool.segment_count(), 1);
        assert_eq!(seqs(spool.read_from(1)), vec![7, 8]);
    }

    #[test]
    fn test_retention_loss_starts_after_acked() {
        let dir = TempDir::new().expect("tempdir");
        let cfg = SpoolConfig::new(dir.path())
            .sync(SyncMode::None)
            .segment_max_bytes(1024)
            .segment_max_records(1_000)
            .retention(RetentionPolicy::unlimited().with_max_bytes(2048));
        let mut spool = Spool::open(&cfg, "node-1", "field/temp").expect("open");
        fill(&mut spool, 20);
        assert_eq!(spool.truncate_to(10).expect("truncate"), 0);
        fill(&mut spool, 60);

        let losses = spool.drain_retention_losses();
        assert_eq!(losses.first().map(|l| l.lost_from), Some(11));
        assert_eq!(spool.state().acked_seq, 10);
    }

    #[test]
    fn test_reader_reports_removed_segment() {
        let dir = TempDir::new().expect("tempdir");
        let mut spool = Spool::open(&config(dir.path()), "node-1", "field/temp").expect("open");
        fill(&mut spool, 25);
        let reader = spool.read_from(1);
        spool.truncate_to(20).expect("truncate");

        let results: Vec<_> = reader.collect();
        assert!(matches!(
            results.first(),
            Some(Err(SpoolError::SegmentGone { first_seq: 1 }))
        ));
    }

    #[test]
    fn test_last_frame() {
        let dir = TempDir::new().expect("tempdir");
        let mut spool = Spool::open(&config(dir.path()), "node-1", "field/temp").expect("open");
        assert!(spool.last_frame().expect("last").is_none());
        fill(&mut spool, 12);
        let last = spool.last_frame().expect("last").expect("some");
        assert_eq!(last.seq(), 12);
    }

    #[test]
    fn test_rejects_foreign_stream_sample() {
        let dir = TempDir::new().expect("tempdir");
        let mut spool = Spool::open(&config(dir.path()), "node-1", "field/temp").expect("open");
        let other = Sample::at("field/wind", 1, Value::Float(1.0));
        assert!(matches!(spool.append(&other), Err(SpoolError::InvalidId(_))));
    }

    #[test]
    fn test_stream_dir_name_roundtrip() {
        assert_eq!(stream_dir_name("soil/moisture/bed3"), "soil+moisture+bed3");
        assert_eq!(
            stream_id_from_dir_name("soil+moisture+bed3").as_deref(),
            Some("soil/moisture/bed3")
        );
        assert_eq!(stream_id_from_dir_name("+bad"), None);
    }
}
