//! Standby status updates.
//!
//! The client acknowledges its positions to the server with an `r` message
//! on the same copy-both channel it reads from:
//!
//! | offset | bytes | field |
//! |--------|-------|-------|
//! | 0  | 1 | `r` |
//! | 1  | 8 | received LSN |
//! | 9  | 8 | flushed LSN |
//! | 17 | 8 | applied LSN |
//! | 25 | 8 | client clock, microseconds since 2000-01-01 |
//! | 33 | 1 | reply requested (always 1 = "no reply requested") |

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::lsn::Lsn;
use super::protocol::datetime_to_pg_clock;

pub const STATUS_UPDATE_TAG: u8 = b'r';
pub const STATUS_UPDATE_LEN: usize = 1 + 8 + 8 + 8 + 8 + 1;

const NO_REPLY_REQUESTED: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    pub received: Lsn,
    pub flushed: Lsn,
    pub applied: Lsn,
    pub clock: DateTime<Utc>,
}

impl StandbyStatusUpdate {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STATUS_UPDATE_LEN);
        buf.put_u8(STATUS_UPDATE_TAG);
        buf.put_u64(self.received.as_u64());
        buf.put_u64(self.flushed.as_u64());
        buf.put_u64(self.applied.as_u64());
        buf.put_i64(datetime_to_pg_clock(self.clock));
        buf.put_u8(NO_REPLY_REQUESTED);
        buf.freeze()
    }
}

/// The engine's view of the stream positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LsnPositions {
    /// Last position reported by a server keepalive.
    pub server: Lsn,
    pub received: Lsn,
    pub flushed: Lsn,
    pub applied: Lsn,
}

/// Positions shared between the message loop and consumer handles.
///
/// All reads and writes go through one lock, so a status update is always
/// built from a consistent snapshot.
#[derive(Debug, Clone, Default)]
pub struct LsnTracker {
    inner: Arc<Mutex<LsnPositions>>,
}

impl LsnTracker {
    pub fn new(received: Lsn) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LsnPositions {
                received,
                ..LsnPositions::default()
            })),
        }
    }

    pub fn snapshot(&self) -> LsnPositions {
        *self.inner.lock()
    }

    pub fn received(&self) -> Lsn {
        self.inner.lock().received
    }

    pub fn set_received(&self, lsn: Lsn) {
        self.inner.lock().received = lsn;
    }

    /// Records a keepalive position; `received` only ever moves forward on
    /// keepalives.
    pub fn observe_server(&self, server: Lsn) {
        let mut positions = self.inner.lock();
        positions.server = server;
        if server > positions.received {
            positions.received = server;
        }
    }

    pub fn set_flushed(&self, lsn: Lsn) {
        self.inner.lock().flushed = lsn;
    }

    pub fn set_applied(&self, lsn: Lsn) {
        self.inner.lock().applied = lsn;
    }

    /// Marks everything received as flushed and applied.
    pub fn acknowledge_received(&self) {
        let mut positions = self.inner.lock();
        positions.flushed = positions.received;
        positions.applied = positions.received;
    }

    /// The status update for the current positions, or `None` while the
    /// received position is still unknown.
    pub fn status_update(&self, clock: DateTime<Utc>) -> Option<StandbyStatusUpdate> {
        let positions = self.inner.lock();
        if positions.received.is_empty() {
            return None;
        }
        Some(StandbyStatusUpdate {
            received: positions.received,
            flushed: positions.flushed,
            applied: positions.applied,
            clock,
        })
    }
}

/// Decides when a status update is owed to the server.
///
/// Updates are sent when the server asks for one, or when the configured
/// interval has elapsed since the previous update. A zero interval leaves
/// only server-requested updates.
#[derive(Debug)]
pub struct FeedbackScheduler {
    interval: Duration,
    last_status_update: Option<Instant>,
}

impl FeedbackScheduler {
    /// The first interval check is due immediately.
    pub fn new(update_interval: Duration) -> Self {
        Self {
            interval: update_interval,
            last_status_update: None,
        }
    }

    /// A scheduler whose interval starts at `last_status_update`.
    pub fn starting_at(update_interval: Duration, last_status_update: Instant) -> Self {
        Self {
            interval: update_interval,
            last_status_update: Some(last_status_update),
        }
    }

    pub fn last_status_update(&self) -> Option<Instant> {
        self.last_status_update
    }

    pub fn is_due(&self, now: Instant) -> bool {
        if self.interval.is_zero() {
            return false;
        }
        match self.last_status_update {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        }
    }

    pub fn should_send(&self, reply_required: bool, now: Instant) -> bool {
        reply_required || self.is_due(now)
    }

    /// Builds the wire bytes of a status update and restarts the interval.
    ///
    /// Returns `None`, leaving the interval untouched, while the received
    /// position is empty.
    pub fn emit(&mut self, positions: &LsnTracker, now: Instant, clock: DateTime<Utc>) -> Option<Bytes> {
        let update = positions.status_update(clock)?;
        debug!(
            received = %update.received,
            flushed = %update.flushed,
            applied = %update.applied,
            "Sending standby status update"
        );
        self.last_status_update = Some(now);
        Some(update.encode())
    }
}
