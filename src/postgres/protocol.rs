//! Replication copy-stream messages.
//!
//! Inside a `START_REPLICATION` copy-both channel the server sends two kinds
//! of CopyData payloads:
//!
//! | tag | message | body |
//! |-----|---------|------|
//! | `k` | primary keepalive | server LSN (8) + clock (8) + reply-requested (1) |
//! | `w` | XLogData | start LSN (8) + end LSN (8) + clock (8) + plugin payload (rest of frame) |
//!
//! [`FrameParser`] reassembles these from arbitrarily fragmented chunks.

use bytes::{Buf, Bytes};
use chrono::{DateTime, TimeZone, Utc};
use tracing::trace;

use super::buffer::ByteQueue;
use super::lsn::Lsn;
use crate::{Error, Result};

pub const KEEPALIVE_TAG: u8 = b'k';
pub const XLOG_DATA_TAG: u8 = b'w';

const KEEPALIVE_BODY_LEN: usize = 8 + 8 + 1;
const XLOG_DATA_HEADER_LEN: usize = 8 + 8 + 8;

/// Milliseconds between 1970-01-01 and 2000-01-01, the PostgreSQL epoch.
pub const PG_EPOCH_OFFSET_MS: i64 = 946_684_800_000;

/// Converts a server clock (microseconds since 2000-01-01) to an instant,
/// truncated to millisecond precision.
pub fn pg_clock_to_datetime(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(micros / 1000 + PG_EPOCH_OFFSET_MS)
        .single()
        .unwrap_or_default()
}

/// Converts an instant to microseconds since 2000-01-01.
pub fn datetime_to_pg_clock(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_micros() - PG_EPOCH_OFFSET_MS * 1000
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeepalive {
    pub server_lsn: Lsn,
    pub clock: DateTime<Utc>,
    pub reply_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    pub clock: DateTime<Utc>,
    /// Raw output-plugin bytes (wal2json JSON).
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    Keepalive(PrimaryKeepalive),
    XLogData(XLogData),
}

#[derive(Debug)]
enum State {
    AwaitCode,
    AwaitBody(u8),
    Halted(String),
}

/// Incremental decoder for the replication copy-stream.
///
/// Feed CopyData payload bytes with [`push`](Self::push) and call
/// [`end_frame`](Self::end_frame) when a CopyData frame is complete; the
/// XLogData payload runs to the end of its frame. Each call to
/// [`next_message`](Self::next_message) extracts at most one message and
/// never reads past what has been pushed.
#[derive(Debug)]
pub struct FrameParser {
    queue: ByteQueue,
    state: State,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            queue: ByteQueue::new(),
            state: State::AwaitCode,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        trace!(len = chunk.len(), buffered = self.queue.available(), "Copy chunk received");
        self.queue.push(chunk);
    }

    pub fn end_frame(&mut self) {
        self.queue.mark_frame_end();
    }

    pub fn buffered(&self) -> usize {
        self.queue.available()
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state, State::Halted(_))
    }

    /// Decodes the next complete message, or `Ok(None)` if more bytes are
    /// needed.
    ///
    /// An unknown tag or a truncated frame halts the parser: this and every
    /// later call return [`Error::Protocol`].
    pub fn next_message(&mut self) -> Result<Option<ReplicationMessage>> {
        let tag = match &self.state {
            State::Halted(reason) => return Err(Error::Protocol(reason.clone())),
            State::AwaitBody(tag) => *tag,
            State::AwaitCode => {
                self.queue.discard_finished_frames();
                match self.queue.take_exact(1) {
                    Some(code) => {
                        let tag = code[0];
                        self.state = State::AwaitBody(tag);
                        tag
                    }
                    None => return Ok(None),
                }
            }
        };

        let message = match tag {
            KEEPALIVE_TAG => self.decode_keepalive()?.map(ReplicationMessage::Keepalive),
            XLOG_DATA_TAG => self.decode_xlog_data()?.map(ReplicationMessage::XLogData),
            other => {
                return Err(self.halt(format!("wrong message code: 0x{other:02x}")));
            }
        };

        if message.is_some() {
            self.state = State::AwaitCode;
        }
        Ok(message)
    }

    fn decode_keepalive(&mut self) -> Result<Option<PrimaryKeepalive>> {
        if let Some(remaining) = self.queue.frame_remaining() {
            if remaining < KEEPALIVE_BODY_LEN {
                return Err(self.halt(format!(
                    "truncated keepalive: {remaining} of {KEEPALIVE_BODY_LEN} body bytes"
                )));
            }
        }

        let Some(body) = self.queue.take_exact(KEEPALIVE_BODY_LEN) else {
            return Ok(None);
        };
        let mut cursor = &body[..];

        let server_lsn = Lsn::new(cursor.get_u64());
        let clock = pg_clock_to_datetime(cursor.get_i64());
        let reply_required = cursor.get_u8() != 0;

        trace!(%server_lsn, reply_required, "Decoded primary keepalive");
        Ok(Some(PrimaryKeepalive {
            server_lsn,
            clock,
            reply_required,
        }))
    }

    fn decode_xlog_data(&mut self) -> Result<Option<XLogData>> {
        // The payload length is only known once the frame end is.
        let Some(remaining) = self.queue.frame_remaining() else {
            return Ok(None);
        };
        if remaining < XLOG_DATA_HEADER_LEN {
            return Err(self.halt(format!(
                "truncated XLogData: {remaining} of {XLOG_DATA_HEADER_LEN} header bytes"
            )));
        }

        let Some(header) = self.queue.take_exact(XLOG_DATA_HEADER_LEN) else {
            return Ok(None);
        };
        let payload = self
            .queue
            .take_exact(remaining - XLOG_DATA_HEADER_LEN)
            .unwrap_or_default();
        let mut cursor = &header[..];

        let start_lsn = Lsn::new(cursor.get_u64());
        let end_lsn = Lsn::new(cursor.get_u64());
        let clock = pg_clock_to_datetime(cursor.get_i64());

        trace!(%start_lsn, %end_lsn, len = payload.len(), "Decoded XLogData");
        Ok(Some(XLogData {
            start_lsn,
            end_lsn,
            clock,
            payload,
        }))
    }

    fn halt(&mut self, reason: String) -> Error {
        self.state = State::Halted(reason.clone());
        Error::Protocol(reason)
    }
}
