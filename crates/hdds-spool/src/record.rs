// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry samples and spooled records.
//!
//! A [`Sample`] is what the producer hands over: a typed reading for one
//! stream, stamped with its sampling time. Once the spool accepts it, the
//! sample becomes a [`Record`] carrying the node identity and the per-stream
//! sequence number used for deduplication and acknowledgment.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum length of node and stream identifiers.
pub const MAX_ID_LEN: usize = 128;

/// Typed sample value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Analog reading (temperature, moisture, voltage).
    Float(f64),
    /// Discrete integer reading.
    Integer(i64),
    /// Counter increment since the previous sample (rain gauge tips, pulses).
    Counter(u64),
    /// Binary state (pump on/off, door open).
    Flag(bool),
    /// Enumerated state label (valve mode, alarm level).
    State(String),
}

/// Wire/disk discriminant for [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueKind {
    Float = 1,
    Integer = 2,
    Counter = 3,
    Flag = 4,
    State = 5,
}

impl ValueKind {
    /// Decode a kind byte.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Float),
            2 => Some(Self::Integer),
            3 => Some(Self::Counter),
            4 => Some(Self::Flag),
            5 => Some(Self::State),
            _ => None,
        }
    }

    /// Kinds whose derived state tracks change-of-value transitions.
    pub fn is_change_of_value(self) -> bool {
        matches!(self, Self::Flag | Self::State)
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Float(_) => ValueKind::Float,
            Self::Integer(_) => ValueKind::Integer,
            Self::Counter(_) => ValueKind::Counter,
            Self::Flag(_) => ValueKind::Flag,
            Self::State(_) => ValueKind::State,
        }
    }
}

/// A reading produced by a sensor driver, not yet spooled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Stream the reading belongs to (e.g. `soil/moisture/bed3`).
    pub stream_id: String,

    /// Sampling time (Unix nanoseconds).
    pub sample_time_ns: u64,

    /// Reading.
    pub value: Value,
}

impl Sample {
    /// Create a sample stamped with the current wall-clock time.
    pub fn now(stream_id: impl Into<String>, value: Value) -> Self {
        Self {
            stream_id: stream_id.into(),
            sample_time_ns: unix_now_ns(),
            value,
        }
    }

    /// Create a sample with an explicit sampling time.
    pub fn at(stream_id: impl Into<String>, sample_time_ns: u64, value: Value) -> Self {
        Self {
            stream_id: stream_id.into(),
            sample_time_ns,
            value,
        }
    }
}

/// A spooled sample: the unit of dedup, replay and acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub node_id: String,
    pub stream_id: String,

    /// Monotonic, gap-free per (node_id, stream_id). Starts at 1.
    pub seq: u64,

    /// Sampling time (Unix nanoseconds).
    pub sample_time_ns: u64,

    pub value: Value,
}

impl Record {
    pub fn value_kind(&self) -> ValueKind {
        self.value.kind()
    }
}

/// Check that an identifier can be used as a topic segment and a directory name.
///
/// Allowed: ASCII alphanumerics plus `-`, `_`, `.` and `/` as a hierarchy
/// separator (never leading, trailing or doubled, never `.`/`..` components).
pub fn is_valid_id(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return false;
    }
    id.split('/').all(|part| {
        !part.is_empty()
            && part != "."
            && part != ".."
            && part
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    })
}

/// Current wall-clock time in Unix nanoseconds.
pub fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_kind_roundtrip() {
        for kind in [
            ValueKind::Float,
            ValueKind::Integer,
            ValueKind::Counter,
            ValueKind::Flag,
            ValueKind::State,
        ] {
            assert_eq!(ValueKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(ValueKind::from_u8(0), None);
        assert_eq!(ValueKind::from_u8(42), None);
    }

    #[test]
    fn test_change_of_value_kinds() {
        assert!(Value::Flag(true).kind().is_change_of_value());
        assert!(Value::State("auto".into()).kind().is_change_of_value());
        assert!(!Value::Counter(3).kind().is_change_of_value());
        assert!(!Value::Float(1.5).kind().is_change_of_value());
    }

    #[test]
    fn test_valid_ids() {
        assert!(is_valid_id("node-07"));
        assert!(is_valid_id("soil/moisture/bed_3"));
        assert!(is_valid_id("tank.level"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("/leading"));
        assert!(!is_valid_id("trailing/"));
        assert!(!is_valid_id("a//b"));
        assert!(!is_valid_id("../escape"));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id(&"x".repeat(MAX_ID_LEN + 1)));
    }

    #[test]
    fn test_value_json_shape() {
        let json = serde_json::to_string(&Value::Counter(4)).expect("serialize");
        assert_eq!(json, r#"{"kind":"counter","value":4}"#);
        let back: Value = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, Value::Counter(4));
    }
}
