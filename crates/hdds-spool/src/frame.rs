// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame codec shared by the spool files and the wire.
//!
//! # Frame Layout
//!
//! ```text
//! +-----------------------------------------------------------+
//! | payload_len (4, LE) | crc32(payload) (4, LE) | payload    |
//! +-----------------------------------------------------------+
//! ```
//!
//! # Payload Layout
//!
//! ```text
//! +-----------------------------------------------------------+
//! | version (1) | kind (1) | seq (8) | sample_time_ns (8)     |
//! | node_len (2) | stream_len (2) | node | stream | value     |
//! +-----------------------------------------------------------+
//! ```
//!
//! Telemetry messages carry the exact same bytes, concatenated, so nothing
//! is re-encoded between disk and wire.

use crate::record::{is_valid_id, Record, Value, ValueKind};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;

/// Record payload version.
pub const RECORD_VERSION: u8 = 1;

/// Length + checksum prefix.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Upper bound on a single payload; anything larger is a corrupt length.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Length value reserved to introduce a segment footer. Never a valid frame.
pub const FOOTER_SENTINEL: u32 = u32::MAX;

/// Frame codec errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame payload too large: {0} bytes")]
    TooLarge(usize),

    #[error("Checksum mismatch at offset {offset}")]
    ChecksumMismatch { offset: u64 },

    #[error("Truncated frame at offset {offset}")]
    Truncated { offset: u64 },

    #[error("Unsupported record version {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// A checksum-valid frame together with its decoded record.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Byte offset of the frame within its source.
    pub offset: u64,
    pub record: Record,
    bytes: Vec<u8>,
}

impl Frame {
    /// Encode a record into a frame (offset 0).
    pub fn encode(record: &Record) -> Result<Self, FrameError> {
        let bytes = encode_frame(record)?;
        Ok(Self {
            offset: 0,
            record: record.clone(),
            bytes,
        })
    }

    pub fn seq(&self) -> u64 {
        self.record.seq
    }

    /// Full encoded frame, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn encoded_len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn into_record(self) -> Record {
        self.record
    }
}

/// Encode a record payload.
pub fn encode_record(record: &Record) -> Result<Vec<u8>, FrameError> {
    if !is_valid_id(&record.node_id) {
        return Err(FrameError::InvalidRecord(format!(
            "invalid node id '{}'",
            record.node_id
        )));
    }
    if !is_valid_id(&record.stream_id) {
        return Err(FrameError::InvalidRecord(format!(
            "invalid stream id '{}'",
            record.stream_id
        )));
    }

    let mut buf = Vec::with_capacity(32 + record.node_id.len() + record.stream_id.len());
    buf.write_u8(RECORD_VERSION)?;
    buf.write_u8(record.value_kind() as u8)?;
    buf.write_u64::<LittleEndian>(record.seq)?;
    buf.write_u64::<LittleEndian>(record.sample_time_ns)?;
    buf.write_u16::<LittleEndian>(record.node_id.len() as u16)?;
    buf.write_u16::<LittleEndian>(record.stream_id.len() as u16)?;
    buf.write_all(record.node_id.as_bytes())?;
    buf.write_all(record.stream_id.as_bytes())?;

    match &record.value {
        Value::Float(v) => buf.write_f64::<LittleEndian>(*v)?,
        Value::Integer(v) => buf.write_i64::<LittleEndian>(*v)?,
        Value::Counter(v) => buf.write_u64::<LittleEndian>(*v)?,
        Value::Flag(v) => buf.write_u8(u8::from(*v))?,
        Value::State(s) => {
            buf.write_u16::<LittleEndian>(s.len() as u16)?;
            buf.write_all(s.as_bytes())?;
        }
    }

    if buf.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::TooLarge(buf.len()));
    }
    Ok(buf)
}

/// Decode a record payload.
pub fn decode_record(payload: &[u8]) -> Result<Record, FrameError> {
    let mut r = Cursor::new(payload);

    let version = r.read_u8()?;
    if version != RECORD_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let kind_raw = r.read_u8()?;
    let kind = ValueKind::from_u8(kind_raw)
        .ok_or_else(|| FrameError::InvalidRecord(format!("unknown value kind {}", kind_raw)))?;
    let seq = r.read_u64::<LittleEndian>()?;
    let sample_time_ns = r.read_u64::<LittleEndian>()?;
    let node_len = r.read_u16::<LittleEndian>()? as usize;
    let stream_len = r.read_u16::<LittleEndian>()? as usize;
    let node_id = read_string(&mut r, node_len)?;
    let stream_id = read_string(&mut r, stream_len)?;

    let value = match kind {
        ValueKind::Float => Value::Float(r.read_f64::<LittleEndian>()?),
        ValueKind::Integer => Value::Integer(r.read_i64::<LittleEndian>()?),
        ValueKind::Counter => Value::Counter(r.read_u64::<LittleEndian>()?),
        ValueKind::Flag => Value::Flag(r.read_u8()? != 0),
        ValueKind::State => {
            let len = r.read_u16::<LittleEndian>()? as usize;
            Value::State(read_string(&mut r, len)?)
        }
    };

    if (r.position() as usize) != payload.len() {
        return Err(FrameError::InvalidRecord("trailing bytes in payload".into()));
    }
    if seq == 0 {
        return Err(FrameError::InvalidRecord("sequence number 0".into()));
    }

    Ok(Record {
        node_id,
        stream_id,
        seq,
        sample_time_ns,
        value,
    })
}

/// Encode a record into a complete frame (header + payload).
pub fn encode_frame(record: &Record) -> Result<Vec<u8>, FrameError> {
    let payload = encode_record(record)?;
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.write_u32::<LittleEndian>(payload.len() as u32)?;
    out.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode a telemetry message body (concatenated frames).
///
/// The message is accepted only if every byte belongs to a valid frame.
pub fn decode_frames(bytes: &[u8]) -> Result<Vec<Record>, FrameError> {
    let mut scanner = FrameScanner::new(Cursor::new(bytes));
    let records: Vec<Record> = scanner.by_ref().map(Frame::into_record).collect();
    match scanner.stop() {
        Some(ScanStop::End) => Ok(records),
        Some(ScanStop::TornTail { offset }) => Err(FrameError::Truncated { offset: *offset }),
        Some(ScanStop::Corrupt { offset, reason }) => Err(FrameError::InvalidRecord(format!(
            "invalid frame at offset {}: {}",
            offset, reason
        ))),
        Some(ScanStop::Footer { offset }) => Err(FrameError::InvalidRecord(format!(
            "unexpected footer marker at offset {}",
            offset
        ))),
        Some(ScanStop::Io(msg)) => Err(FrameError::Io(io::Error::other(msg.clone()))),
        None => Ok(records),
    }
}

/// Why a [`FrameScanner`] stopped yielding frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStop {
    /// Clean end of input on a frame boundary.
    End,
    /// Input ended inside a frame (crash mid-write).
    TornTail { offset: u64 },
    /// A complete but invalid frame (bad length, checksum or payload).
    Corrupt { offset: u64, reason: String },
    /// Footer sentinel found; no more frames follow.
    Footer { offset: u64 },
    /// Underlying read failed.
    Io(String),
}

/// Lazy sequence of valid frames read from a byte source.
///
/// Finite: stops at the first frame that is incomplete or invalid and
/// records the reason in [`FrameScanner::stop`]. Not restartable mid-scan;
/// reopen the source to scan again.
pub struct FrameScanner<R: Read> {
    reader: R,
    offset: u64,
    stop: Option<ScanStop>,
}

impl<R: Read> FrameScanner<R> {
    pub fn new(reader: R) -> Self {
        Self::with_offset(reader, 0)
    }

    /// Scanner whose reported offsets start at `offset`.
    pub fn with_offset(reader: R, offset: u64) -> Self {
        Self {
            reader,
            offset,
            stop: None,
        }
    }

    /// Offset just past the last valid frame yielded so far.
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    /// Reason the scan stopped, once it has.
    pub fn stop(&self) -> Option<&ScanStop> {
        self.stop.as_ref()
    }

    fn halt(&mut self, stop: ScanStop) -> Option<Frame> {
        self.stop = Some(stop);
        None
    }

    fn next_frame(&mut self) -> Option<Frame> {
        let start = self.offset;

        let mut header = [0u8; FRAME_HEADER_SIZE];
        match read_full(&mut self.reader, &mut header[..4]) {
            Ok(0) => return self.halt(ScanStop::End),
            Ok(4) => {}
            Ok(_) => return self.halt(ScanStop::TornTail { offset: start }),
            Err(e) => return self.halt(ScanStop::Io(e.to_string())),
        }

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if len == FOOTER_SENTINEL {
            return self.halt(ScanStop::Footer { offset: start });
        }
        let len = len as usize;
        if len > MAX_FRAME_PAYLOAD {
            return self.halt(ScanStop::Corrupt {
                offset: start,
                reason: format!("frame length {} exceeds maximum", len),
            });
        }

        match read_full(&mut self.reader, &mut header[4..]) {
            Ok(4) => {}
            Ok(_) => return self.halt(ScanStop::TornTail { offset: start }),
            Err(e) => return self.halt(ScanStop::Io(e.to_string())),
        }
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut bytes = vec![0u8; FRAME_HEADER_SIZE + len];
        bytes[..FRAME_HEADER_SIZE].copy_from_slice(&header);
        match read_full(&mut self.reader, &mut bytes[FRAME_HEADER_SIZE..]) {
            Ok(n) if n == len => {}
            Ok(_) => return self.halt(ScanStop::TornTail { offset: start }),
            Err(e) => return self.halt(ScanStop::Io(e.to_string())),
        }

        let payload = &bytes[FRAME_HEADER_SIZE..];
        if crc32fast::hash(payload) != expected_crc {
            return self.halt(ScanStop::Corrupt {
                offset: start,
                reason: "checksum mismatch".into(),
            });
        }

        let record = match decode_record(payload) {
            Ok(record) => record,
            Err(e) => {
                return self.halt(ScanStop::Corrupt {
                    offset: start,
                    reason: e.to_string(),
                })
            }
        };

        self.offset = start + bytes.len() as u64;
        Some(Frame {
            offset: start,
            record,
            bytes,
        })
    }
}

impl<R: Read> Iterator for FrameScanner<R> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.stop.is_some() {
            return None;
        }
        self.next_frame()
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_string<R: Read>(r: &mut R, len: usize) -> Result<String, FrameError> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| FrameError::InvalidRecord("identifier is not UTF-8".into()))
}
