// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite telemetry store
//!
//! Every derived table is updated in the same transaction as the raw
//! sample insert, and only when that insert actually added a row. A
//! replayed duplicate therefore changes nothing.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE samples (
//!     node_id TEXT, stream_id TEXT, seq INTEGER,
//!     sample_time_ns INTEGER, kind INTEGER, value TEXT, received_at_ns INTEGER,
//!     PRIMARY KEY (node_id, stream_id, seq)
//! );
//! CREATE TABLE counters (node_id, stream_id, total, PRIMARY KEY (node_id, stream_id));
//! CREATE TABLE transitions (node_id, stream_id, seq, sample_time_ns, from_value, to_value,
//!     PRIMARY KEY (node_id, stream_id, seq));
//! CREATE TABLE watermarks (node_id, stream_id, acked_seq, committed_at_ns,
//!     PRIMARY KEY (node_id, stream_id));
//! ```
//!
//! Change-of-value transitions are recomputed around each newly inserted
//! seq against its stored neighbors, so the final set depends only on which
//! records are stored, not on the order they arrived in.

use crate::store::{
    CommitReport, StoreError, StreamStats, TelemetryStore, Transition, WatermarkRow,
};
use hdds_spool::record::unix_now_ns;
use hdds_spool::{Record, Value, ValueKind};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeSet;
use std::path::Path;

/// SQLite telemetry store
///
/// Thread-safe via internal Mutex (SQLite Connection is not Sync).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a file-backed store. WAL journal, full sync on commit.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))?;
        conn.execute_batch("PRAGMA synchronous=FULL;")?;
        tracing::debug!("Opened telemetry store {}", path.display());

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS samples (
                node_id TEXT NOT NULL,
                stream_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                sample_time_ns INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                value TEXT NOT NULL,
                received_at_ns INTEGER NOT NULL,
                PRIMARY KEY (node_id, stream_id, seq)
            ) WITHOUT ROWID;

            CREATE TABLE IF NOT EXISTS counters (
                node_id TEXT NOT NULL,
                stream_id TEXT NOT NULL,
                total INTEGER NOT NULL,
                PRIMARY KEY (node_id, stream_id)
            );

            CREATE TABLE IF NOT EXISTS transitions (
                node_id TEXT NOT NULL,
                stream_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                sample_time_ns INTEGER NOT NULL,
                from_value TEXT,
                to_value TEXT NOT NULL,
                PRIMARY KEY (node_id, stream_id, seq)
            );

            CREATE TABLE IF NOT EXISTS watermarks (
                node_id TEXT NOT NULL,
                stream_id TEXT NOT NULL,
                acked_seq INTEGER NOT NULL,
                committed_at_ns INTEGER NOT NULL,
                PRIMARY KEY (node_id, stream_id)
            );",
        )?;
        Ok(())
    }
}

fn decode_value(text: &str, column: usize) -> rusqlite::Result<Value> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn load_watermark(
    tx: &Transaction<'_>,
    node_id: &str,
    stream_id: &str,
) -> Result<Option<WatermarkRow>, StoreError> {
    let row = tx
        .query_row(
            "SELECT acked_seq, committed_at_ns FROM watermarks
             WHERE node_id = ?1 AND stream_id = ?2",
            params![node_id, stream_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    Ok(row.map(|(acked, at)| WatermarkRow {
        node_id: node_id.to_string(),
        stream_id: stream_id.to_string(),
        acked_seq: acked as u64,
        committed_at_ns: at as u64,
    }))
}

/// Move the watermark over `floor` and then over every contiguous stored seq.
fn advance_watermark(
    tx: &Transaction<'_>,
    node_id: &str,
    stream_id: &str,
    floor: u64,
    now_ns: u64,
) -> Result<WatermarkRow, StoreError> {
    let current = load_watermark(tx, node_id, stream_id)?;
    let start = current.as_ref().map_or(0, |w| w.acked_seq);
    let mut acked = start.max(floor);

    {
        let mut stmt = tx.prepare_cached(
            "SELECT seq FROM samples
             WHERE node_id = ?1 AND stream_id = ?2 AND seq > ?3
             ORDER BY seq",
        )?;
        let mut rows = stmt.query(params![node_id, stream_id, acked as i64])?;
        while let Some(row) = rows.next()? {
            let seq = row.get::<_, i64>(0)? as u64;
            if seq != acked + 1 {
                break;
            }
            acked = seq;
        }
    }

    if acked == start {
        return Ok(current.unwrap_or(WatermarkRow {
            node_id: node_id.to_string(),
            stream_id: stream_id.to_string(),
            acked_seq: 0,
            committed_at_ns: 0,
        }));
    }

    tx.execute(
        "INSERT INTO watermarks (node_id, stream_id, acked_seq, committed_at_ns)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(node_id, stream_id)
         DO UPDATE SET acked_seq = excluded.acked_seq, committed_at_ns = excluded.committed_at_ns",
        params![node_id, stream_id, acked as i64, now_ns as i64],
    )?;
    Ok(WatermarkRow {
        node_id: node_id.to_string(),
        stream_id: stream_id.to_string(),
        acked_seq: acked,
        committed_at_ns: now_ns,
    })
}

/// Nearest stored change-of-value sample before (or after) `seq`.
fn cov_neighbor(
    tx: &Transaction<'_>,
    node_id: &str,
    stream_id: &str,
    seq: u64,
    after: bool,
) -> Result<Option<(u64, u64, String)>, StoreError> {
    let sql = if after {
        "SELECT seq, sample_time_ns, value FROM samples
         WHERE node_id = ?1 AND stream_id = ?2 AND seq > ?3 AND kind IN (?4, ?5)
         ORDER BY seq ASC LIMIT 1"
    } else {
        "SELECT seq, sample_time_ns, value FROM samples
         WHERE node_id = ?1 AND stream_id = ?2 AND seq < ?3 AND kind IN (?4, ?5)
         ORDER BY seq DESC LIMIT 1"
    };
    let row = tx
        .query_row(
            sql,
            params![
                node_id,
                stream_id,
                seq as i64,
                ValueKind::Flag as u8,
                ValueKind::State as u8
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    Ok(row)
}

/// Accumulate a counter delta. Totals stay within `i64`; a delta that
/// would leave that range fails the whole batch.
fn add_counter(tx: &Transaction<'_>, record: &Record, delta: u64) -> Result<(), StoreError> {
    let current: i64 = tx
        .query_row(
            "SELECT total FROM counters WHERE node_id = ?1 AND stream_id = ?2",
            params![record.node_id, record.stream_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    let total = i64::try_from(delta)
        .ok()
        .and_then(|delta| current.checked_add(delta))
        .ok_or_else(|| StoreError::CounterOverflow {
            node_id: record.node_id.clone(),
            stream_id: record.stream_id.clone(),
            seq: record.seq,
        })?;
    tx.execute(
        "INSERT INTO counters (node_id, stream_id, total) VALUES (?1, ?2, ?3)
         ON CONFLICT(node_id, stream_id) DO UPDATE SET total = excluded.total",
        params![record.node_id, record.stream_id, total],
    )?;
    Ok(())
}

fn set_transition(
    tx: &Transaction<'_>,
    node_id: &str,
    stream_id: &str,
    seq: u64,
    sample_time_ns: u64,
    from: Option<&str>,
    to: &str,
) -> Result<(), StoreError> {
    if from == Some(to) {
        tx.execute(
            "DELETE FROM transitions WHERE node_id = ?1 AND stream_id = ?2 AND seq = ?3",
            params![node_id, stream_id, seq as i64],
        )?;
    } else {
        tx.execute(
            "INSERT OR REPLACE INTO transitions
             (node_id, stream_id, seq, sample_time_ns, from_value, to_value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![node_id, stream_id, seq as i64, sample_time_ns as i64, from, to],
        )?;
    }
    Ok(())
}

fn apply_change_of_value(
    tx: &Transaction<'_>,
    record: &Record,
    value: &str,
) -> Result<(), StoreError> {
    let (node, stream) = (record.node_id.as_str(), record.stream_id.as_str());

    let prev = cov_neighbor(tx, node, stream, record.seq, false)?;
    set_transition(
        tx,
        node,
        stream,
        record.seq,
        record.sample_time_ns,
        prev.as_ref().map(|(_, _, v)| v.as_str()),
        value,
    )?;

    if let Some((next_seq, next_time, next_value)) = cov_neighbor(tx, node, stream, record.seq, true)? {
        set_transition(tx, node, stream, next_seq, next_time, Some(value), &next_value)?;
    }
    Ok(())
}

impl TelemetryStore for SqliteStore {
    fn commit(&self, batch: &[Record]) -> Result<CommitReport, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = unix_now_ns();
        let mut report = CommitReport::default();
        let mut touched = BTreeSet::new();

        for record in batch {
            let value = serde_json::to_string(&record.value)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO samples
                 (node_id, stream_id, seq, sample_time_ns, kind, value, received_at_ns)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.node_id,
                    record.stream_id,
                    record.seq as i64,
                    record.sample_time_ns as i64,
                    record.value_kind() as u8,
                    value,
                    now as i64
                ],
            )?;
            touched.insert((record.node_id.as_str(), record.stream_id.as_str()));

            if inserted == 0 {
                report.duplicates += 1;
                continue;
            }
            report.inserted += 1;

            match &record.value {
                Value::Counter(delta) => add_counter(&tx, record, *delta)?,
                Value::Flag(_) | Value::State(_) => apply_change_of_value(&tx, record, &value)?,
                Value::Float(_) | Value::Integer(_) => {}
            }
        }

        for (node_id, stream_id) in touched {
            report
                .watermarks
                .push(advance_watermark(&tx, node_id, stream_id, 0, now)?);
        }
        tx.commit()?;

        tracing::trace!(
            "Committed batch: {} inserted, {} duplicates",
            report.inserted,
            report.duplicates
        );
        Ok(report)
    }

    fn advance_floor(
        &self,
        node_id: &str,
        stream_id: &str,
        floor: u64,
    ) -> Result<Option<WatermarkRow>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let before = load_watermark(&tx, node_id, stream_id)?.map_or(0, |w| w.acked_seq);
        if floor <= before {
            return Ok(None);
        }
        let row = advance_watermark(&tx, node_id, stream_id, floor, unix_now_ns())?;
        tx.commit()?;

        tracing::warn!(
            "{}/{}: seq {}..={} reported lost to node retention; watermark now {}",
            node_id,
            stream_id,
            before + 1,
            floor,
            row.acked_seq
        );
        Ok(Some(row))
    }

    fn watermark(
        &self,
        node_id: &str,
        stream_id: &str,
    ) -> Result<Option<WatermarkRow>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        load_watermark(&tx, node_id, stream_id)
    }

    fn watermarks(&self) -> Result<Vec<WatermarkRow>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT node_id, stream_id, acked_seq, committed_at_ns FROM watermarks
             ORDER BY node_id, stream_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(WatermarkRow {
                    node_id: row.get(0)?,
                    stream_id: row.get(1)?,
                    acked_seq: row.get::<_, i64>(2)? as u64,
                    committed_at_ns: row.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn counter_total(&self, node_id: &str, stream_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let total = conn
            .query_row(
                "SELECT total FROM counters WHERE node_id = ?1 AND stream_id = ?2",
                params![node_id, stream_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(total.unwrap_or(0) as u64)
    }

    fn transitions(&self, node_id: &str, stream_id: &str) -> Result<Vec<Transition>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, sample_time_ns, from_value, to_value FROM transitions
             WHERE node_id = ?1 AND stream_id = ?2 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![node_id, stream_id], |row| {
                let from = row
                    .get::<_, Option<String>>(2)?
                    .map(|text| decode_value(&text, 2))
                    .transpose()?;
                Ok(Transition {
                    seq: row.get::<_, i64>(0)? as u64,
                    sample_time_ns: row.get::<_, i64>(1)? as u64,
                    from,
                    to: decode_value(&row.get::<_, String>(3)?, 3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn sample_count(&self, node_id: &str, stream_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM samples WHERE node_id = ?1 AND stream_id = ?2",
            params![node_id, stream_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count as u64)
    }

    fn samples(
        &self,
        node_id: &str,
        stream_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, sample_time_ns, value FROM samples
             WHERE node_id = ?1 AND stream_id = ?2 AND seq >= ?3
             ORDER BY seq LIMIT ?4",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![node_id, stream_id, from_seq as i64, limit], |row| {
                Ok(Record {
                    node_id: node_id.to_string(),
                    stream_id: stream_id.to_string(),
                    seq: row.get::<_, i64>(0)? as u64,
                    sample_time_ns: row.get::<_, i64>(1)? as u64,
                    value: decode_value(&row.get::<_, String>(2)?, 2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn stream_stats(&self) -> Result<Vec<StreamStats>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT s.node_id, s.stream_id, COUNT(*), MIN(s.seq), MAX(s.seq),
                    COALESCE(MAX(w.acked_seq), 0)
             FROM samples s
             LEFT JOIN watermarks w ON w.node_id = s.node_id AND w.stream_id = s.stream_id
             GROUP BY s.node_id, s.stream_id
             ORDER BY s.node_id, s.stream_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StreamStats {
                    node_id: row.get(0)?,
                    stream_id: row.get(1)?,
                    samples: row.get::<_, i64>(2)? as u64,
                    min_seq: row.get::<_, i64>(3)? as u64,
                    max_seq: row.get::<_, i64>(4)? as u64,
                    acked_seq: row.get::<_, i64>(5)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
