//! Streaming replication over a copy-both channel.
//!
//! [`StreamingReplication`] issues `START_REPLICATION SLOT <slot> LOGICAL
//! <lsn>`, decodes keepalive and XLogData messages as bytes arrive, sends
//! standby status updates back on the same channel and hands decoded
//! [`Change`]s to the consumer one at a time.
//!
//! The engine never reads ahead of its consumer: a CopyData chunk is only
//! pulled off the channel once every change decoded so far has been taken.

use chrono::Utc;
use futures::stream::{self, Stream};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::postgres::{
    decode_stream_payload, ensure_slot, Change, CopyBothDuplex, CopyMessage, FeedbackScheduler, FrameParser, Lsn,
    LsnPositions, LsnTracker, ReplicationMessage, ReplicationTransport, SqlClient,
};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct StreamingOptions {
    pub slot_name: String,
    /// Text LSN to start from; see [`StreamingReplication::start`] for the
    /// fallbacks when unset.
    pub start_lsn: Option<String>,
    /// Zero sends status updates only when the server asks for one.
    pub update_interval: Duration,
    /// Acknowledge everything received as flushed and applied.
    pub auto_ack_lsn: bool,
    /// Create the slot through the SQL client if it does not exist.
    pub ensure_slot: bool,
    pub temporary: bool,
    pub destroy_slot_on_close: bool,
    pub checkpoint_file: Option<PathBuf>,
}

impl StreamingOptions {
    pub fn new(slot_name: impl Into<String>) -> Self {
        Self {
            slot_name: slot_name.into(),
            start_lsn: None,
            update_interval: Duration::ZERO,
            auto_ack_lsn: false,
            ensure_slot: false,
            temporary: false,
            destroy_slot_on_close: false,
            checkpoint_file: None,
        }
    }
}

/// Cloneable control surface for a running [`StreamingReplication`].
#[derive(Debug, Clone)]
pub struct StreamingHandle {
    positions: LsnTracker,
    shutdown: CancellationToken,
}

impl StreamingHandle {
    /// Position reported as flushed in subsequent status updates.
    pub fn set_last_flushed_lsn(&self, lsn: Lsn) {
        self.positions.set_flushed(lsn);
    }

    /// Position reported as applied in subsequent status updates.
    pub fn set_last_applied_lsn(&self, lsn: Lsn) {
        self.positions.set_applied(lsn);
    }

    pub fn positions(&self) -> LsnPositions {
        self.positions.snapshot()
    }

    /// Asks the engine to end the copy stream.
    ///
    /// This only takes effect on the next `next_change` call or stream
    /// poll, which sends CopyDone and closes the connection. An engine
    /// dropped without being polled again skips that cleanup, including
    /// `destroy_slot_on_close`.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

pub struct StreamingReplication<T> {
    transport: T,
    sql: Option<Box<dyn SqlClient>>,
    options: StreamingOptions,
    checkpoints: Option<CheckpointManager>,
    parser: FrameParser,
    positions: LsnTracker,
    scheduler: FeedbackScheduler,
    duplex: Option<CopyBothDuplex>,
    pending: VecDeque<Change>,
    shutdown: CancellationToken,
    started: bool,
    closed: bool,
    change_count: u64,
    last_checkpoint: Lsn,
}

impl<T: ReplicationTransport> StreamingReplication<T> {
    pub fn new(transport: T, options: StreamingOptions) -> Self {
        let checkpoints = options.checkpoint_file.as_ref().map(CheckpointManager::new);
        let scheduler = FeedbackScheduler::new(options.update_interval);

        Self {
            transport,
            sql: None,
            checkpoints,
            parser: FrameParser::new(),
            positions: LsnTracker::default(),
            scheduler,
            duplex: None,
            pending: VecDeque::new(),
            shutdown: CancellationToken::new(),
            started: false,
            closed: false,
            change_count: 0,
            last_checkpoint: Lsn::INVALID,
            options,
        }
    }

    /// Attaches the SQL session used to look up the current WAL position and
    /// to create or drop the slot.
    pub fn with_sql_client(mut self, client: impl SqlClient + 'static) -> Self {
        self.sql = Some(Box::new(client));
        self
    }

    pub fn handle(&self) -> StreamingHandle {
        StreamingHandle {
            positions: self.positions.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn positions(&self) -> LsnPositions {
        self.positions.snapshot()
    }

    pub fn set_last_flushed_lsn(&self, lsn: Lsn) {
        self.positions.set_flushed(lsn);
    }

    pub fn set_last_applied_lsn(&self, lsn: Lsn) {
        self.positions.set_applied(lsn);
    }

    /// Enters copy-both mode.
    ///
    /// The start position is, in order: `start_lsn`, the checkpoint file,
    /// then the server's `pg_current_wal_lsn()`. On failure the connection
    /// is closed before the error is returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::Lifecycle(
                "Streaming replication can only be started once per instance".to_string(),
            ));
        }
        self.started = true;

        info!(slot = %self.options.slot_name, "Starting streaming replication");
        if let Err(e) = self.open().await {
            error!(slot = %self.options.slot_name, error = %e, "Failed to start streaming replication");
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    async fn open(&mut self) -> Result<()> {
        if self.options.ensure_slot {
            let sql = self.sql.as_deref().ok_or_else(missing_sql_client)?;
            ensure_slot(sql, &self.options.slot_name, self.options.temporary).await?;
        }

        let start_lsn = resolve_start_lsn(
            &self.options,
            self.checkpoints.as_ref(),
            self.sql.as_deref(),
        )
        .await?;
        self.positions.set_received(start_lsn);

        let command = format!(
            "START_REPLICATION SLOT {} LOGICAL {}",
            self.options.slot_name, start_lsn
        );
        info!(%start_lsn, "Issuing {}", command);

        let duplex = self.transport.start_replication(&command).await?;
        self.duplex = Some(duplex);
        Ok(())
    }

    /// Returns the next change, or `None` once the stream has ended.
    ///
    /// A protocol, connection or decoding error closes the connection and
    /// is returned once; later calls return `None`.
    pub async fn next_change(&mut self) -> Result<Option<Change>> {
        if !self.started {
            return Err(Error::Lifecycle(
                "Streaming replication has not been started".to_string(),
            ));
        }

        loop {
            if let Some(change) = self.pending.pop_front() {
                return Ok(Some(change));
            }
            if self.closed {
                return Ok(None);
            }

            match self.step().await {
                Ok(true) => {}
                Ok(false) => {
                    self.close().await;
                }
                Err(e) => {
                    error!(slot = %self.options.slot_name, error = %e, "Streaming replication failed");
                    self.close().await;
                    return Err(e);
                }
            }
        }
    }

    /// Handles one decoded message, or reads one chunk when nothing complete
    /// is buffered. Returns `false` once the stream has ended.
    async fn step(&mut self) -> Result<bool> {
        if let Some(message) = self.parser.next_message()? {
            self.handle_message(message).await?;
            return Ok(true);
        }

        let shutdown = self.shutdown.clone();
        let duplex = self
            .duplex
            .as_mut()
            .ok_or_else(|| Error::Connection("copy-both channel is closed".to_string()))?;

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Stop requested, ending copy stream");
                Ok(false)
            }
            chunk = duplex.inbound.next() => match chunk {
                Some(Ok(chunk)) => {
                    self.parser.push(&chunk.data);
                    if chunk.end_of_frame {
                        self.parser.end_frame();
                    }
                    Ok(true)
                }
                Some(Err(e)) => Err(e),
                None => {
                    info!("Server ended the copy stream");
                    Ok(false)
                }
            }
        }
    }

    async fn handle_message(&mut self, message: ReplicationMessage) -> Result<()> {
        match message {
            ReplicationMessage::Keepalive(keepalive) => {
                debug!(
                    server_lsn = %keepalive.server_lsn,
                    reply_required = keepalive.reply_required,
                    "Primary keepalive"
                );
                self.positions.observe_server(keepalive.server_lsn);
                if self.options.auto_ack_lsn {
                    self.positions.acknowledge_received();
                }
                if self.scheduler.should_send(keepalive.reply_required, Instant::now()) {
                    self.send_feedback().await?;
                }
            }
            ReplicationMessage::XLogData(data) => {
                debug!(
                    start_lsn = %data.start_lsn,
                    end_lsn = %data.end_lsn,
                    len = data.payload.len(),
                    "XLogData"
                );
                self.positions.set_received(data.start_lsn);
                if self.options.auto_ack_lsn {
                    self.positions.acknowledge_received();
                }
                if self.scheduler.is_due(Instant::now()) {
                    self.send_feedback().await?;
                }

                let changes = decode_stream_payload(data.start_lsn, data.clock, &data.payload)?;
                self.change_count += changes.len() as u64;
                self.pending.extend(changes);
            }
        }
        Ok(())
    }

    async fn send_feedback(&mut self) -> Result<()> {
        let Some(update) = self.scheduler.emit(&self.positions, Instant::now(), Utc::now()) else {
            return Ok(());
        };

        let duplex = self
            .duplex
            .as_mut()
            .ok_or_else(|| Error::Connection("copy-both channel is closed".to_string()))?;
        duplex.outbound.send(CopyMessage::Data(update)).await?;

        self.save_checkpoint().await
    }

    async fn save_checkpoint(&mut self) -> Result<()> {
        let Some(manager) = &self.checkpoints else {
            return Ok(());
        };

        let flushed = self.positions.snapshot().flushed;
        if flushed.is_empty() || flushed == self.last_checkpoint {
            return Ok(());
        }

        manager.save(&Checkpoint::new(flushed, self.change_count)).await?;
        self.last_checkpoint = flushed;
        Ok(())
    }

    /// Ends the copy stream and closes the connection.
    ///
    /// Changes already decoded are still returned by
    /// [`next_change`](Self::next_change).
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Err(Error::Lifecycle(
                "Streaming replication is not running; call start() first".to_string(),
            ));
        }
        self.close().await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shutdown.cancel();

        if let Some(mut duplex) = self.duplex.take() {
            if let Err(e) = duplex.outbound.send(CopyMessage::Done).await {
                debug!(error = %e, "Copy-both channel already closed");
            }
        }

        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Failed to close replication connection");
        }

        if let Some(sql) = self.sql.as_mut() {
            if self.options.destroy_slot_on_close {
                if let Err(e) = sql.drop_slot(&self.options.slot_name).await {
                    warn!(slot = %self.options.slot_name, error = %e, "Failed to drop replication slot");
                }
            }
            if let Err(e) = sql.close().await {
                warn!(error = %e, "Failed to close SQL connection");
            }
        }

        info!(
            slot = %self.options.slot_name,
            changes = self.change_count,
            "Streaming replication closed"
        );
    }

    /// Consumes the started engine as a stream of changes.
    pub fn into_stream(self) -> impl Stream<Item = Result<Change>> + Send
    where
        T: 'static,
    {
        stream::try_unfold(self, |mut engine| async move {
            Ok(engine.next_change().await?.map(|change| (change, engine)))
        })
    }
}

impl<T> Drop for StreamingReplication<T> {
    fn drop(&mut self) {
        if self.started && !self.closed {
            warn!(
                slot = %self.options.slot_name,
                "Streaming replication dropped without closing; the slot is left in place"
            );
            self.shutdown.cancel();
        }
    }
}

async fn resolve_start_lsn(
    options: &StreamingOptions,
    checkpoints: Option<&CheckpointManager>,
    sql: Option<&dyn SqlClient>,
) -> Result<Lsn> {
    if let Some(text) = &options.start_lsn {
        return Ok(Lsn::parse(text));
    }

    if let Some(manager) = checkpoints {
        if let Some(checkpoint) = manager.load().await? {
            if !checkpoint.lsn.is_empty() {
                info!(lsn = %checkpoint.lsn, "Resuming from checkpoint");
                return Ok(checkpoint.lsn);
            }
        }
    }

    let sql = sql.ok_or_else(missing_sql_client)?;
    match sql.current_wal_lsn().await? {
        Some(text) => {
            debug!(lsn = %text, "Using current WAL position");
            Ok(Lsn::parse(&text))
        }
        None => Err(Error::Replication {
            message: format!(
                "Could not determine pg_current_wal_lsn() for slot {}",
                options.slot_name
            ),
        }),
    }
}

fn missing_sql_client() -> Error {
    Error::Config("A SQL client is required to create the slot or look up the start LSN".to_string())
}
