// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish/replay engine.
//!
//! Drains one stream spool to the transport. New records go out as soon as
//! they are appended; backlog is replayed in throttled batches behind them.
//!
//! # State Machine
//!
//! ```text
//!   DISCONNECTED --link up--> CONNECTED_LIVE_ONLY --first publish ok--+
//!        ^                                                            |
//!        |                         +----------------------------------+
//!        |                         v
//!        +--publish fails-- CONNECTED_CATCHING_UP --backlog sent + acked--> CONNECTED_SYNCED
//!        +--link down------        ^                                          |
//!                                  +---------------ack stall (rewind)---------+
//! ```
//!
//! On connect the most recent record (or a status heartbeat when nothing is
//! pending) goes first, then backlog replay starts at
//! `max(acked_seq + 1, oldest_retained_seq)`. After a disconnect the resume
//! point is always the ack watermark, never the last sent seq. The only
//! retransmission trigger while connected is an ack stall longer than the
//! configured ack timeout, which rewinds the cursor to the watermark.

use crate::ack::AckTracker;
use crate::config::{NodeConfig, ReplayConfig};
use crate::error::SpoolError;
use crate::frame::Frame;
use crate::health::HealthRegistry;
use crate::record::unix_now_ns;
use crate::spool::{Spool, SpoolReader};
use crate::throttle::ReplayThrottle;
use crate::transport::{Envelope, LinkState, Qos, Transport, TransportError};
use crate::wire::{encode_telemetry, status_topic, telemetry_topic, AckMessage, StatusMessage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

/// Replay engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Disconnected,
    ConnectedLiveOnly,
    ConnectedCatchingUp,
    ConnectedSynced,
}

impl EngineState {
    pub fn is_connected(self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

/// Engine timing and throttle settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub replay: ReplayConfig,
    /// Rewind to the watermark after this long without ack progress (zero disables).
    pub ack_timeout: Duration,
    pub publish_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// First reconnect delay after a failed publish; doubles up to the heartbeat interval.
    pub reconnect_backoff: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            replay: config.replay.clone(),
            ack_timeout: config.ack_timeout(),
            publish_timeout: config.publish_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            reconnect_backoff: Duration::from_secs(1).min(config.heartbeat_interval()),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            replay: ReplayConfig::default(),
            ack_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            reconnect_backoff: Duration::from_secs(1),
        }
    }
}

/// Engine statistics
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    /// Live messages published
    pub live_messages: u64,
    /// Frames carried by live messages
    pub live_frames: u64,
    /// Backlog batches published
    pub backlog_messages: u64,
    /// Frames carried by backlog batches
    pub backlog_frames: u64,
    /// Status heartbeats published
    pub heartbeats: u64,
    /// Acks that advanced the watermark
    pub acks_applied: u64,
    /// Ack-stall rewinds
    pub rewinds: u64,
    /// Transitions to DISCONNECTED
    pub disconnects: u64,
}

/// Channels feeding one engine.
pub struct EngineInputs {
    /// Last appended seq, bumped by the spool writer.
    pub appended: watch::Receiver<u64>,
    /// Acks routed to this stream.
    pub acks: mpsc::Receiver<AckMessage>,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Default)]
struct Batch {
    frames: Vec<Frame>,
    bytes: u64,
}

impl Batch {
    fn seq_range(&self) -> (u64, u64) {
        let first = self.frames.first().map_or(0, Frame::seq);
        let last = self.frames.last().map_or(0, Frame::seq);
        (first, last)
    }

    fn body(&self) -> Vec<u8> {
        encode_telemetry(self.frames.iter().map(Frame::as_bytes))
    }
}

/// Publish/replay engine for one (node, stream).
pub struct ReplayEngine<T: Transport> {
    node_id: String,
    stream_id: String,
    spool: Arc<Mutex<Spool>>,
    tracker: Arc<Mutex<AckTracker>>,
    transport: Arc<T>,
    settings: EngineSettings,
    health: HealthRegistry,
    inputs: EngineInputs,
    state_tx: watch::Sender<EngineState>,
    throttle: ReplayThrottle,
    /// Next backlog seq to batch.
    cursor: u64,
    /// Last backlog seq (inclusive) of the current catch-up.
    backlog_end: u64,
    /// Next live seq to publish.
    live_cursor: u64,
    sent_high: u64,
    last_progress: Instant,
    live_since_backlog: u32,
    reader: Option<SpoolReader>,
    carry: Option<Frame>,
    pending: Option<Batch>,
    retry_at: Option<Instant>,
    backoff: Duration,
    stats: EngineStats,
}

impl<T: Transport> ReplayEngine<T> {
    pub fn new(
        spool: Arc<Mutex<Spool>>,
        tracker: AckTracker,
        transport: Arc<T>,
        settings: EngineSettings,
        health: HealthRegistry,
        inputs: EngineInputs,
    ) -> Self {
        let (node_id, stream_id) = {
            let spool = spool.lock();
            (spool.node_id().to_string(), spool.stream_id().to_string())
        };
        let (state_tx, _) = watch::channel(EngineState::Disconnected);
        let throttle = ReplayThrottle::new(&settings.replay);
        let backoff = settings.reconnect_backoff;

        Self {
            node_id,
            stream_id,
            spool,
            tracker: Arc::new(Mutex::new(tracker)),
            transport,
            settings,
            health,
            inputs,
            state_tx,
            throttle,
            cursor: 1,
            backlog_end: 0,
            live_cursor: 1,
            sent_high: 0,
            last_progress: Instant::now(),
            live_since_backlog: 0,
            reader: None,
            carry: None,
            pending: None,
            retry_at: None,
            backoff,
            stats: EngineStats::default(),
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    fn current(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    fn acked_seq(&self) -> u64 {
        self.tracker.lock().acked_seq()
    }

    /// Run until shutdown. Fails only on a spool integrity fault during replay.
    pub async fn run(mut self) -> Result<EngineStats, SpoolError> {
        let mut link = self.transport.link();
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut appended_open = true;

        tracing::debug!("Replay engine {}/{} started", self.node_id, self.stream_id);

        loop {
            if *self.inputs.shutdown.borrow() {
                break;
            }
            let link_up = *link.borrow_and_update() == LinkState::Up;
            while let Ok(ack) = self.inputs.acks.try_recv() {
                self.handle_ack(ack).await;
            }

            if !self.current().is_connected() {
                let ready = self.retry_at.map_or(true, |at| Instant::now() >= at);
                if link_up && ready {
                    self.connect().await;
                    heartbeat.reset();
                    continue;
                }

                let retry_at = self.retry_at;
                tokio::select! {
                    biased;
                    changed = self.inputs.shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = link.changed() => {
                        if changed.is_err() {
                            tracing::warn!("Transport closed; stopping engine {}", self.stream_id);
                            break;
                        }
                    }
                    Some(ack) = self.inputs.acks.recv() => self.handle_ack(ack).await,
                    changed = self.inputs.appended.changed(), if appended_open => {
                        if changed.is_err() {
                            appended_open = false;
                        }
                    }
                    _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)),
                        if retry_at.is_some() && link_up => {}
                }
                continue;
            }

            if !link_up {
                self.disconnect("link down", false);
                continue;
            }

            if self.pending.is_none() && self.cursor <= self.backlog_end {
                if let Err(e) = self.prepare_backlog() {
                    return Err(self.fatal(e));
                }
                self.check_synced();
            }

            let upto = *self.inputs.appended.borrow_and_update();
            let live_pending = upto >= self.live_cursor;
            let backlog_due = match &self.pending {
                Some(batch) => self.throttle.delay_for(batch.bytes).is_zero(),
                None => false,
            };

            if live_pending
                && !(backlog_due && self.live_since_backlog >= self.settings.replay.live_ratio)
            {
                if let Err(e) = self.publish_live(upto).await {
                    return Err(self.fatal(e));
                }
                continue;
            }
            if backlog_due {
                self.publish_backlog().await;
                continue;
            }

            let stall = self.stall_deadline();
            if stall.is_some_and(|deadline| Instant::now() >= deadline) {
                self.rewind();
                continue;
            }

            let delay = self
                .pending
                .as_ref()
                .map(|batch| batch.bytes)
                .map(|bytes| self.throttle.delay_for(bytes));

            tokio::select! {
                biased;
                changed = self.inputs.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = link.changed() => {
                    if changed.is_err() {
                        tracing::warn!("Transport closed; stopping engine {}", self.stream_id);
                        break;
                    }
                }
                Some(ack) = self.inputs.acks.recv() => self.handle_ack(ack).await,
                changed = self.inputs.appended.changed(), if appended_open => {
                    if changed.is_err() {
                        appended_open = false;
                    }
                }
                _ = tokio::time::sleep(delay.unwrap_or_default()), if delay.is_some() => {}
                _ = heartbeat.tick() => self.publish_status().await,
                _ = tokio::time::sleep_until(stall.unwrap_or_else(Instant::now)), if stall.is_some() => {}
            }
        }

        self.set_state(EngineState::Disconnected);
        tracing::debug!(
            "Replay engine {}/{} stopped: {:?}",
            self.node_id,
            self.stream_id,
            self.stats
        );
        Ok(self.stats)
    }

    fn set_state(&mut self, state: EngineState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::info!(
                "Engine {}/{}: {:?} -> {:?}",
                self.node_id,
                self.stream_id,
                previous,
                state
            );
        }
    }

    fn fatal(&mut self, err: SpoolError) -> SpoolError {
        tracing::error!(
            "Replay engine {}/{} stopped on spool fault: {}",
            self.node_id,
            self.stream_id,
            err
        );
        self.health.spool_fault(&self.stream_id, err.to_string());
        self.set_state(EngineState::Disconnected);
        err
    }

    async fn publish(&self, envelope: Envelope) -> Result<(), TransportError> {
        match tokio::time::timeout(self.settings.publish_timeout, self.transport.publish(envelope))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    fn status(&self) -> StatusMessage {
        let state = self.spool.lock().state();
        StatusMessage {
            node_id: self.node_id.clone(),
            stream_id: self.stream_id.clone(),
            state: self.current(),
            oldest_retained_seq: state.oldest_retained_seq,
            next_seq: state.next_seq,
            acked_seq: self.acked_seq(),
            sent_at_ns: unix_now_ns(),
        }
    }

    fn status_envelope(&self) -> Option<Envelope> {
        match serde_json::to_vec(&self.status()) {
            Ok(body) => Some(Envelope::new(
                status_topic(&self.node_id),
                body,
                Qos::AtMostOnce,
            )),
            Err(e) => {
                tracing::error!("Failed to encode status for {}: {}", self.stream_id, e);
                None
            }
        }
    }

    async fn publish_status(&mut self) {
        let Some(envelope) = self.status_envelope() else {
            return;
        };
        match self.publish(envelope).await {
            Ok(()) => self.stats.heartbeats += 1,
            Err(e) => self.disconnect(e, true),
        }
    }

    async fn connect(&mut self) {
        self.set_state(EngineState::ConnectedLiveOnly);

        let (state, last) = {
            let spool = self.spool.lock();
            (spool.state(), spool.last_frame())
        };
        let last = last.unwrap_or_else(|e| {
            tracing::warn!("Could not read latest record of {}: {}", self.stream_id, e);
            None
        });
        let acked = self.acked_seq();

        // Latest record first so the server sees the node is back.
        let latest = last.filter(|frame| frame.seq() > acked);
        let first = match &latest {
            Some(frame) => Some(Envelope::new(
                telemetry_topic(&self.node_id),
                frame.as_bytes().to_vec(),
                Qos::AtLeastOnce,
            )),
            None => self.status_envelope(),
        };
        if let Some(envelope) = first {
            if let Err(e) = self.publish(envelope).await {
                self.disconnect(e, true);
                return;
            }
        }
        match &latest {
            Some(frame) => {
                self.stats.live_messages += 1;
                self.stats.live_frames += 1;
                self.sent_high = self.sent_high.max(frame.seq());
                tracing::debug!("Engine {} sent seq {} live-first", self.stream_id, frame.seq());
                self.publish_status().await;
                if !self.current().is_connected() {
                    return;
                }
            }
            None => self.stats.heartbeats += 1,
        }

        self.cursor = (acked + 1).max(state.oldest_retained_seq);
        self.backlog_end = state.last_seq();
        self.live_cursor = state.next_seq;
        self.reader = None;
        self.carry = None;
        self.pending = None;
        self.live_since_backlog = 0;
        self.last_progress = Instant::now();
        self.retry_at = None;
        self.backoff = self.settings.reconnect_backoff;

        if self.cursor <= self.backlog_end {
            tracing::info!(
                "Engine {}: replaying backlog {}..={}",
                self.stream_id,
                self.cursor,
                self.backlog_end
            );
            self.set_state(EngineState::ConnectedCatchingUp);
        } else {
            self.set_state(EngineState::ConnectedSynced);
        }
    }

    /// Drop to DISCONNECTED. Anything sent but unacknowledged is resent from
    /// the watermark on the next connect.
    fn disconnect(&mut self, reason: impl Display, backoff: bool) {
        if self.current().is_connected() {
            self.stats.disconnects += 1;
            tracing::info!(
                "Engine {}/{} disconnected ({}); resume from acked {}",
                self.node_id,
                self.stream_id,
                reason,
                self.acked_seq()
            );
        }
        self.set_state(EngineState::Disconnected);
        self.reader = None;
        self.carry = None;
        self.pending = None;

        if backoff {
            self.retry_at = Some(Instant::now() + self.backoff);
            self.backoff = (self.backoff * 2).min(self.settings.heartbeat_interval);
        } else {
            self.retry_at = None;
            self.backoff = self.settings.reconnect_backoff;
        }
    }

    async fn handle_ack(&mut self, ack: AckMessage) {
        let spool = Arc::clone(&self.spool);
        let tracker = Arc::clone(&self.tracker);
        // Watermark fsync and segment removal run off the async workers.
        let persisted = tokio::task::spawn_blocking(move || persist_ack(&spool, &tracker, &ack))
            .await
            .unwrap_or_else(|e| Err(SpoolError::Io(std::io::Error::other(e))));

        match persisted {
            Ok(Some((acked, trimmed))) => {
                if let Err(e) = trimmed {
                    tracing::error!("Trim of {} to {} failed: {}", self.stream_id, acked, e);
                    self.health
                        .spool_fault(&self.stream_id, format!("trim failed: {}", e));
                }
                self.stats.acks_applied += 1;
                self.last_progress = Instant::now();

                // Nothing batched so far still needs sending.
                if acked >= self.cursor {
                    self.cursor = acked + 1;
                    self.reader = None;
                    self.carry = None;
                    self.pending = None;
                }
                self.check_synced();
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Persisting ack watermark for {} failed: {}", self.stream_id, e);
                self.health
                    .spool_fault(&self.stream_id, format!("watermark persist failed: {}", e));
            }
        }
    }

    fn check_synced(&mut self) {
        if self.current() == EngineState::ConnectedCatchingUp
            && self.cursor > self.backlog_end
            && self.pending.is_none()
            && self.carry.is_none()
            && self.acked_seq() >= self.backlog_end
        {
            self.set_state(EngineState::ConnectedSynced);
        }
    }

    fn stall_deadline(&self) -> Option<Instant> {
        if self.settings.ack_timeout.is_zero() || self.sent_high <= self.acked_seq() {
            return None;
        }
        Some(self.last_progress + self.settings.ack_timeout)
    }

    fn rewind(&mut self) {
        let acked = self.acked_seq();
        let oldest = self.spool.lock().state().oldest_retained_seq;
        tracing::warn!(
            "Engine {}: no ack progress for {:?} (sent {}, acked {}); replaying from watermark",
            self.stream_id,
            self.settings.ack_timeout,
            self.sent_high,
            acked
        );
        self.stats.rewinds += 1;
        self.cursor = (acked + 1).max(oldest);
        self.backlog_end = self.live_cursor.saturating_sub(1);
        self.reader = None;
        self.carry = None;
        self.pending = None;
        self.last_progress = Instant::now();
        if self.cursor <= self.backlog_end {
            self.set_state(EngineState::ConnectedCatchingUp);
        }
    }

    fn next_backlog_frame(&mut self) -> Result<Option<Frame>, SpoolError> {
        for _ in 0..2 {
            if self.reader.is_none() {
                self.reader = Some(self.spool.lock().read_from(self.cursor));
            }
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };
            match reader.next() {
                Some(Ok(frame)) if frame.seq() <= self.backlog_end => return Ok(Some(frame)),
                Some(Ok(_)) | None => {
                    self.reader = None;
                    return Ok(None);
                }
                Some(Err(SpoolError::SegmentGone { .. })) => {
                    self.reader = None;
                    let oldest = self.spool.lock().state().oldest_retained_seq;
                    if oldest > self.cursor {
                        tracing::warn!(
                            "Engine {}: seq {}..{} left the spool during replay",
                            self.stream_id,
                            self.cursor,
                            oldest
                        );
                        self.cursor = oldest;
                    }
                }
                Some(Err(e)) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Fill the next backlog batch (up to the frame and byte limits).
    fn prepare_backlog(&mut self) -> Result<(), SpoolError> {
        let max_frames = self.settings.replay.batch_max_frames;
        let max_bytes = self.throttle.max_batch_bytes();
        let mut batch = Batch::default();

        while self.cursor <= self.backlog_end {
            let frame = match self.carry.take() {
                Some(frame) => frame,
                None => match self.next_backlog_frame()? {
                    Some(frame) => frame,
                    None => {
                        // Nothing left on disk in range.
                        self.cursor = self.backlog_end + 1;
                        break;
                    }
                },
            };
            if !batch.frames.is_empty()
                && (batch.frames.len() >= max_frames
                    || batch.bytes + frame.encoded_len() > max_bytes)
            {
                self.carry = Some(frame);
                break;
            }
            batch.bytes += frame.encoded_len();
            self.cursor = frame.seq() + 1;
            batch.frames.push(frame);
        }

        if !batch.frames.is_empty() {
            self.pending = Some(batch);
        }
        Ok(())
    }

    async fn publish_backlog(&mut self) {
        let Some(batch) = self.pending.take() else {
            return;
        };
        if !self.throttle.try_acquire(batch.bytes) {
            self.pending = Some(batch);
            return;
        }

        let (first, last) = batch.seq_range();
        let envelope = Envelope::new(telemetry_topic(&self.node_id), batch.body(), Qos::AtLeastOnce);
        match self.publish(envelope).await {
            Ok(()) => {
                tracing::trace!("Engine {} replayed {}..={}", self.stream_id, first, last);
                self.stats.backlog_messages += 1;
                self.stats.backlog_frames += batch.frames.len() as u64;
                self.sent_high = self.sent_high.max(last);
                self.live_since_backlog = 0;
                self.check_synced();
            }
            Err(e) => self.disconnect(e, true),
        }
    }

    async fn publish_live(&mut self, upto: u64) -> Result<(), SpoolError> {
        let reader = self.spool.lock().read_from(self.live_cursor);
        let mut batch = Batch::default();
        for item in reader {
            let frame = match item {
                Ok(frame) => frame,
                Err(SpoolError::SegmentGone { .. }) => break,
                Err(e) => return Err(e),
            };
            if frame.seq() > upto {
                break;
            }
            batch.bytes += frame.encoded_len();
            batch.frames.push(frame);
            if batch.frames.len() >= self.settings.replay.batch_max_frames {
                break;
            }
        }

        if batch.frames.is_empty() {
            tracing::debug!(
                "Engine {}: live seq {}..={} no longer retained",
                self.stream_id,
                self.live_cursor,
                upto
            );
            self.live_cursor = upto + 1;
            return Ok(());
        }

        let (first, last) = batch.seq_range();
        let envelope = Envelope::new(telemetry_topic(&self.node_id), batch.body(), Qos::AtLeastOnce);
        match self.publish(envelope).await {
            Ok(()) => {
                tracing::trace!("Engine {} live {}..={}", self.stream_id, first, last);
                self.live_cursor = last + 1;
                self.sent_high = self.sent_high.max(last);
                self.live_since_backlog = self.live_since_backlog.saturating_add(1);
                self.stats.live_messages += 1;
                self.stats.live_frames += batch.frames.len() as u64;
            }
            Err(e) => self.disconnect(e, true),
        }
        Ok(())
    }
}

type PersistedAck = Option<(u64, Result<usize, SpoolError>)>;

/// Make an ack durable, then trim the spool up to it.
///
/// The outer error is a watermark persist failure (nothing trimmed); the
/// inner one a failed trim after the watermark is already on disk.
fn persist_ack(
    spool: &Mutex<Spool>,
    tracker: &Mutex<AckTracker>,
    ack: &AckMessage,
) -> Result<PersistedAck, SpoolError> {
    let max_valid = spool.lock().state().last_seq();
    let Some(acked) = tracker.lock().observe(ack, max_valid)? else {
        return Ok(None);
    };
    let trimmed = spool.lock().truncate_to(acked);
    Ok(Some((acked, trimmed)))
}
