// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Spool segment files.
//!
//! # Segment Layout
//!
//! ```text
//! +-----------------------------------------------------------+
//! |                 Segment Header (32 bytes)                 |
//! |  Magic (8) | Version (4) | FirstSeq (8) | CreatedAt (8)   |
//! |  Reserved (4)                                             |
//! +-----------------------------------------------------------+
//! |                 Frame[] (see frame.rs)                    |
//! +-----------------------------------------------------------+
//! |                 Footer (24 bytes, sealed only)            |
//! |  Sentinel (4) | LastSeq (8) | FrameCount (4)              |
//! |  DataCrc (4) | FooterCrc (4)                              |
//! +-----------------------------------------------------------+
//! ```
//!
//! File names are `<first_seq:020>.seg` so lexical order equals seq order.
//! A segment with a valid footer is sealed and never written again.

use crate::config::SyncMode;
use crate::error::SpoolError;
use crate::frame::{read_full, Frame, FrameScanner, ScanStop, FOOTER_SENTINEL};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes: "HDDSSPL\0"
pub const SEGMENT_MAGIC: [u8; 8] = [0x48, 0x44, 0x44, 0x53, 0x53, 0x50, 0x4C, 0x00];

/// Current segment format version.
pub const SEGMENT_VERSION: u32 = 1;

/// Segment file extension.
pub const SEGMENT_EXT: &str = "seg";

/// Segment header (32 bytes, fixed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub version: u32,
    /// Sequence number of the first frame this segment holds (or will hold).
    pub first_seq: u64,
    /// Creation time (Unix nanoseconds); drives age-based retention.
    pub created_at_ns: u64,
}

impl SegmentHeader {
    pub const SIZE: usize = 32;

    pub fn new(first_seq: u64, created_at_ns: u64) -> Self {
        Self {
            version: SEGMENT_VERSION,
            first_seq,
            created_at_ns,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&SEGMENT_MAGIC)?;
        w.write_u32::<LittleEndian>(self.version)?;
        w.write_u64::<LittleEndian>(self.first_seq)?;
        w.write_u64::<LittleEndian>(self.created_at_ns)?;
        w.write_u32::<LittleEndian>(0)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if magic != SEGMENT_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid spool segment magic",
            ));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != SEGMENT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unsupported segment version {}", version),
            ));
        }
        let first_seq = r.read_u64::<LittleEndian>()?;
        let created_at_ns = r.read_u64::<LittleEndian>()?;
        let _reserved = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            version,
            first_seq,
            created_at_ns,
        })
    }
}

/// Seal record appended after the last frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFooter {
    pub last_seq: u64,
    pub frame_count: u32,
    /// CRC32 over every frame byte of the segment.
    pub data_crc: u32,
}

impl SegmentFooter {
    pub const SIZE: usize = 24;

    fn body(&self) -> [u8; 20] {
        let mut buf = [0u8; 20];
        buf[..4].copy_from_slice(&FOOTER_SENTINEL.to_le_bytes());
        buf[4..12].copy_from_slice(&self.last_seq.to_le_bytes());
        buf[12..16].copy_from_slice(&self.frame_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.data_crc.to_le_bytes());
        buf
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let body = self.body();
        w.write_all(&body)?;
        w.write_u32::<LittleEndian>(crc32fast::hash(&body))?;
        Ok(())
    }

    /// Read a footer, sentinel included. `None` when the footer is torn or
    /// its checksum does not match.
    pub fn read<R: Read>(r: &mut R) -> io::Result<Option<Self>> {
        let mut buf = [0u8; Self::SIZE];
        if read_full(r, &mut buf)? != Self::SIZE {
            return Ok(None);
        }
        let (body, crc) = buf.split_at(20);
        let mut c = Cursor::new(crc);
        if c.read_u32::<LittleEndian>()? != crc32fast::hash(body) {
            return Ok(None);
        }
        let mut c = Cursor::new(body);
        if c.read_u32::<LittleEndian>()? != FOOTER_SENTINEL {
            return Ok(None);
        }
        Ok(Some(Self {
            last_seq: c.read_u64::<LittleEndian>()?,
            frame_count: c.read_u32::<LittleEndian>()?,
            data_crc: c.read_u32::<LittleEndian>()?,
        }))
    }
}

/// What the spool knows about one segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub path: PathBuf,
    pub first_seq: u64,
    /// Last seq held, `None` while empty.
    pub last_seq: Option<u64>,
    pub frame_count: u32,
    /// File size in bytes, header and footer included.
    pub size_bytes: u64,
    pub created_at_ns: u64,
    pub sealed: bool,
}

impl SegmentInfo {
    /// Upper bound of the seq range, `first_seq - 1` when empty.
    pub fn end_seq(&self) -> u64 {
        self.last_seq.unwrap_or(self.first_seq.saturating_sub(1))
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count == 0
    }
}

/// Segment file name for a given first sequence number.
pub fn segment_file_name(first_seq: u64) -> String {
    format!("{:020}.{}", first_seq, SEGMENT_EXT)
}

/// Parse the first sequence number out of a segment file name.
pub fn parse_segment_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".seg")?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// List segment files in `dir` ordered by first seq.
pub fn list_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(first_seq) = name.to_str().and_then(parse_segment_name) {
            segments.push((first_seq, entry.path()));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Force a directory entry change (create/delete/rename) to disk.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

fn sync_file(file: &File, mode: SyncMode) -> io::Result<()> {
    match mode {
        SyncMode::None => Ok(()),
        SyncMode::Data => file.sync_data(),
        SyncMode::All => file.sync_all(),
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> SpoolError {
    SpoolError::CorruptSegment {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Result of scanning a segment's frame area.
struct FrameArea {
    last_seq: Option<u64>,
    frame_count: u32,
    data_crc: u32,
    hasher: crc32fast::Hasher,
    valid_end: u64,
    stop: ScanStop,
}

/// Scan frames after the header, enforcing seq continuity from `first_seq`.
///
/// A frame with an unexpected seq ends the scan like a corrupt frame.
fn scan_frame_area<R: Read>(reader: R, first_seq: u64) -> FrameArea {
    let mut scanner = FrameScanner::with_offset(reader, SegmentHeader::SIZE as u64);
    let mut hasher = crc32fast::Hasher::new();
    let mut expected = first_seq;
    let mut frame_count = 0u32;
    let mut valid_end = SegmentHeader::SIZE as u64;
    let mut discontinuity = None;

    for frame in scanner.by_ref() {
        if frame.seq() != expected {
            discontinuity = Some(ScanStop::Corrupt {
                offset: frame.offset,
                reason: format!("expected seq {}, found {}", expected, frame.seq()),
            });
            break;
        }
        hasher.update(frame.as_bytes());
        valid_end = frame.offset + frame.encoded_len();
        frame_count += 1;
        expected += 1;
    }

    let stop = match discontinuity {
        Some(stop) => stop,
        None => scanner.stop().cloned().unwrap_or(ScanStop::End),
    };
    let data_crc = hasher.clone().finalize();
    FrameArea {
        last_seq: (frame_count > 0).then(|| expected - 1),
        frame_count,
        data_crc,
        hasher,
        valid_end,
        stop,
    }
}

/// Verify a segment that must be sealed.
///
/// Checks the header, every frame checksum, seq continuity, the footer
/// checksum and that the footer agrees with the frames it covers.
pub fn verify_sealed(path: &Path) -> Result<SegmentInfo, SpoolError> {
    let file = File::open(path)?;
    let size_bytes = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let header = SegmentHeader::read(&mut reader).map_err(|e| corrupt(path, e.to_string()))?;
    let area = scan_frame_area(&mut reader, header.first_seq);

    let footer_at = match area.stop {
        ScanStop::Footer { offset } => offset,
        ScanStop::End => return Err(corrupt(path, "missing footer")),
        ScanStop::TornTail { offset } => {
            return Err(corrupt(path, format!("torn frame at offset {}", offset)))
        }
        ScanStop::Corrupt { offset, reason } => {
            return Err(corrupt(path, format!("offset {}: {}", offset, reason)))
        }
        ScanStop::Io(msg) => return Err(SpoolError::Io(io::Error::other(msg))),
    };

    reader.seek(SeekFrom::Start(footer_at))?;
    let footer = SegmentFooter::read(&mut reader)?
        .ok_or_else(|| corrupt(path, "footer checksum mismatch"))?;

    if footer_at + SegmentFooter::SIZE as u64 != size_bytes {
        return Err(corrupt(path, "trailing bytes after footer"));
    }
    if footer.frame_count != area.frame_count {
        return Err(corrupt(
            path,
            format!(
                "footer counts {} frames, found {}",
                footer.frame_count, area.frame_count
            ),
        ));
    }
    if footer.data_crc != area.data_crc {
        return Err(corrupt(path, "data checksum mismatch"));
    }
    let end_seq = area.last_seq.unwrap_or(header.first_seq.saturating_sub(1));
    if footer.last_seq != end_seq {
        return Err(corrupt(
            path,
            format!("footer last_seq {} but frames end at {}", footer.last_seq, end_seq),
        ));
    }

    Ok(SegmentInfo {
        path: path.to_path_buf(),
        first_seq: header.first_seq,
        last_seq: area.last_seq,
        frame_count: area.frame_count,
        size_bytes,
        created_at_ns: header.created_at_ns,
        sealed: true,
    })
}

/// Outcome of recovering the most recent segment.
pub enum RecoveredTail {
    /// The segment was sealed cleanly before the stop.
    Sealed(SegmentInfo),
    /// Open segment, truncated to its last valid frame and ready for appends.
    Open {
        writer: SegmentWriter,
        /// Bytes cut from the end of the file.
        truncated_bytes: u64,
    },
    /// Crash during creation left an incomplete header; the file was removed.
    Discarded,
}

/// Recover the most recent segment after a restart.
pub fn recover_tail(path: &Path, sync: SyncMode) -> Result<RecoveredTail, SpoolError> {
    let len = fs::metadata(path)?.len();
    if len < SegmentHeader::SIZE as u64 {
        tracing::warn!(
            "Removing segment {} with incomplete header ({} bytes)",
            path.display(),
            len
        );
        fs::remove_file(path)?;
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
        return Ok(RecoveredTail::Discarded);
    }

    if let Ok(info) = verify_sealed(path) {
        return Ok(RecoveredTail::Sealed(info));
    }

    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let header = SegmentHeader::read(&mut file).map_err(|e| corrupt(path, e.to_string()))?;
    let area = scan_frame_area(BufReader::new(&mut file), header.first_seq);

    match &area.stop {
        ScanStop::Io(msg) => return Err(SpoolError::Io(io::Error::other(msg.clone()))),
        ScanStop::End => {}
        other => tracing::warn!("Segment {} tail: {:?}", path.display(), other),
    }

    let truncated_bytes = len - area.valid_end;
    if truncated_bytes > 0 {
        file.set_len(area.valid_end)?;
        sync_file(&file, SyncMode::All)?;
    }
    file.seek(SeekFrom::Start(area.valid_end))?;

    let info = SegmentInfo {
        path: path.to_path_buf(),
        first_seq: header.first_seq,
        last_seq: area.last_seq,
        frame_count: area.frame_count,
        size_bytes: area.valid_end,
        created_at_ns: header.created_at_ns,
        sealed: false,
    };
    Ok(RecoveredTail::Open {
        writer: SegmentWriter {
            file,
            info,
            hasher: area.hasher,
            sync,
        },
        truncated_bytes,
    })
}

/// Append handle for the single open segment.
pub struct SegmentWriter {
    file: File,
    info: SegmentInfo,
    hasher: crc32fast::Hasher,
    sync: SyncMode,
}

impl SegmentWriter {
    /// Create a new segment whose first frame will carry `first_seq`.
    pub fn create(
        dir: &Path,
        first_seq: u64,
        created_at_ns: u64,
        sync: SyncMode,
    ) -> Result<Self, SpoolError> {
        let path = dir.join(segment_file_name(first_seq));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut header = Vec::with_capacity(SegmentHeader::SIZE);
        SegmentHeader::new(first_seq, created_at_ns).write(&mut header)?;
        file.write_all(&header)?;
        sync_file(&file, sync)?;
        if sync != SyncMode::None {
            sync_dir(dir)?;
        }

        tracing::debug!("Opened segment {}", path.display());

        Ok(Self {
            file,
            info: SegmentInfo {
                path,
                first_seq,
                last_seq: None,
                frame_count: 0,
                size_bytes: SegmentHeader::SIZE as u64,
                created_at_ns,
                sealed: false,
            },
            hasher: crc32fast::Hasher::new(),
            sync,
        })
    }

    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    /// Seq the next appended frame must carry.
    pub fn next_seq(&self) -> u64 {
        self.info.end_seq() + 1
    }

    /// Append one frame; durable on return unless sync mode is `none`.
    ///
    /// A failed write is rolled back to the previous frame boundary so the
    /// file never holds a half-written frame followed by more data.
    pub fn append(&mut self, frame: &Frame) -> Result<(), SpoolError> {
        if frame.seq() != self.next_seq() {
            return Err(SpoolError::SequenceGap {
                expected: self.next_seq(),
                found: frame.seq(),
            });
        }

        let before = self.info.size_bytes;
        if let Err(e) = self
            .file
            .write_all(frame.as_bytes())
            .and_then(|_| sync_file(&self.file, self.sync))
        {
            if let Err(rollback) = self
                .file
                .set_len(before)
                .and_then(|_| self.file.seek(SeekFrom::Start(before)).map(|_| ()))
            {
                tracing::error!(
                    "Segment {} rollback failed: {}",
                    self.info.path.display(),
                    rollback
                );
            }
            return Err(e.into());
        }

        self.hasher.update(frame.as_bytes());
        self.info.size_bytes += frame.encoded_len();
        self.info.frame_count += 1;
        self.info.last_seq = Some(frame.seq());
        Ok(())
    }

    /// Force buffered data to disk regardless of sync mode.
    pub fn sync(&self) -> Result<(), SpoolError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Write the footer and close the segment for good.
    pub fn seal(mut self) -> Result<SegmentInfo, SpoolError> {
        let footer = SegmentFooter {
            last_seq: self.info.end_seq(),
            frame_count: self.info.frame_count,
            data_crc: self.hasher.clone().finalize(),
        };
        let mut buf = Vec::with_capacity(SegmentFooter::SIZE);
        footer.write(&mut buf)?;
        self.file.write_all(&buf)?;
        self.file.sync_all()?;

        self.info.size_bytes += SegmentFooter::SIZE as u64;
        self.info.sealed = true;

        tracing::debug!(
            "Sealed segment {} (seq {}..={}, {} frames)",
            self.info.path.display(),
            self.info.first_seq,
            footer.last_seq,
            footer.frame_count
        );
        Ok(self.info)
    }
}

/// Scan the frames of a segment file from the first one.
///
/// Stops at the footer. On the open segment a torn tail just ends the
/// iteration, since an append may be in progress.
pub fn open_frames(path: &Path) -> io::Result<FrameScanner<BufReader<File>>> {
    let mut reader = BufReader::new(File::open(path)?);
    SegmentHeader::read(&mut reader)?;
    Ok(FrameScanner::with_offset(reader, SegmentHeader::SIZE as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, Value};
    use tempfile::TempDir;

    fn frame(seq: u64) -> Frame {
        Frame::encode(&Record {
            node_id: "node-1".into(),
            stream_id: "tank/level".into(),
            seq,
            sample_time_ns: seq * 1_000,
            value: Value::Float(seq as f64),
        })
        .expect("encode")
    }

    fn write_segment(dir: &Path, first: u64, last: u64) -> SegmentWriter {
        let mut w = SegmentWriter::create(dir, first, 42, SyncMode::None).expect("create");
        for seq in first..=last {
            w.append(&frame(seq)).expect("append");
        }
        w
    }

    #[test]
    fn test_segment_name_roundtrip() {
        let name = segment_file_name(100);
        assert_eq!(name, "00000000000000000100.seg");
        assert_eq!(parse_segment_name(&name), Some(100));
        assert_eq!(parse_segment_name("100.seg"), None);
        assert_eq!(parse_segment_name("acked.json"), None);
    }

    #[test]
    fn test_seal_and_verify() {
        let dir = TempDir::new().expect("tempdir");
        let info = write_segment(dir.path(), 1, 10).seal().expect("seal");
        assert!(info.sealed);

        let verified = verify_sealed(&info.path).expect("verify");
        assert_eq!(verified, info);
        assert_eq!(verified.last_seq, Some(10));
        assert_eq!(verified.frame_count, 10);
    }

    #[test]
    fn test_verify_detects_flipped_byte() {
        let dir = TempDir::new().expect("tempdir");
        let info = write_segment(dir.path(), 1, 5).seal().expect("seal");

        let mut bytes = fs::read(&info.path).expect("read");
        bytes[SegmentHeader::SIZE + 12] ^= 0x55;
        fs::write(&info.path, &bytes).expect("write");

        assert!(matches!(
            verify_sealed(&info.path),
            Err(SpoolError::CorruptSegment { .. })
        ));
    }

    #[test]
    fn test_verify_rejects_unsealed() {
        let dir = TempDir::new().expect("tempdir");
        let w = write_segment(dir.path(), 1, 3);
        let path = w.info().path.clone();
        drop(w);
        assert!(matches!(
            verify_sealed(&path),
            Err(SpoolError::CorruptSegment { .. })
        ));
    }

    #[test]
    fn test_recover_tail_truncates_partial_frame() {
        let dir = TempDir::new().expect("tempdir");
        let w = write_segment(dir.path(), 1, 4);
        let path = w.info().path.clone();
        let good_len = w.info().size_bytes;
        drop(w);

        let partial = frame(5);
        let mut f = OpenOptions::new().append(true).open(&path).expect("open");
        f.write_all(&partial.as_bytes()[..partial.as_bytes().len() / 2])
            .expect("write");
        drop(f);

        match recover_tail(&path, SyncMode::None).expect("recover") {
            RecoveredTail::Open {
                mut writer,
                truncated_bytes,
            } => {
                assert!(truncated_bytes > 0);
                assert_eq!(writer.info().size_bytes, good_len);
                assert_eq!(writer.info().last_seq, Some(4));
                writer.append(&frame(5)).expect("resume append");
                let sealed = writer.seal().expect("seal");
                assert_eq!(verify_sealed(&sealed.path).expect("verify").last_seq, Some(5));
            }
            _ => panic!("expected open tail"),
        }
    }

    #[test]
    fn test_recover_tail_keeps_sealed() {
        let dir = TempDir::new().expect("tempdir");
        let info = write_segment(dir.path(), 7, 9).seal().expect("seal");
        assert!(matches!(
            recover_tail(&info.path, SyncMode::None).expect("recover"),
            RecoveredTail::Sealed(_)
        ));
    }

    #[test]
    fn test_recover_tail_drops_torn_footer() {
        let dir = TempDir::new().expect("tempdir");
        let info = write_segment(dir.path(), 1, 3).seal().expect("seal");
        let len = fs::metadata(&info.path).expect("meta").len();
        let f = OpenOptions::new().write(true).open(&info.path).expect("open");
        f.set_len(len - 5).expect("truncate");
        drop(f);

        match recover_tail(&info.path, SyncMode::None).expect("recover") {
            RecoveredTail::Open { writer, .. } => {
                assert_eq!(writer.info().last_seq, Some(3));
                assert_eq!(writer.next_seq(), 4);
            }
            _ => panic!("expected open tail"),
        }
    }

    #[test]
    fn test_recover_tail_discards_partial_header() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(segment_file_name(1));
        fs::write(&path, &SEGMENT_MAGIC[..5]).expect("write");
        assert!(matches!(
            recover_tail(&path, SyncMode::None).expect("recover"),
            RecoveredTail::Discarded
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_append_rejects_out_of_order_seq() {
        let dir = TempDir::new().expect("tempdir");
        let mut w = write_segment(dir.path(), 1, 2);
        assert!(matches!(
            w.append(&frame(4)),
            Err(SpoolError::SequenceGap {
                expected: 3,
                found: 4
            })
        ));
    }

    #[test]
    fn test_list_segments_sorted() {
        let dir = TempDir::new().expect("tempdir");
        write_segment(dir.path(), 11, 20).seal().expect("seal");
        write_segment(dir.path(), 1, 10).seal().expect("seal");
        fs::write(dir.path().join("acked.json"), b"{}").expect("write");

        let listed = list_segments(dir.path()).expect("list");
        let firsts: Vec<u64> = listed.iter().map(|(s, _)| *s).collect();
        assert_eq!(firsts, vec![1, 11]);
    }
}
