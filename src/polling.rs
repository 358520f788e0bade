//! Polling replication through `pg_logical_slot_get_changes`.
//!
//! [`PollingReplication`] owns the slot lifecycle on an ordinary SQL
//! session: it creates the slot on start if it is missing, drains it every
//! `poll_timeout`, and optionally drops it on stop.

use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::postgres::{decode_polling_rows, ensure_slot, Change, SqlClient};
use crate::{Error, Result};

const MIN_RECOMMENDED_POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PollingOptions {
    pub slot_name: String,
    /// Pause between two drains of the slot.
    pub poll_timeout: Duration,
    pub temporary: bool,
    pub destroy_slot_on_close: bool,
}

impl PollingOptions {
    pub fn new(slot_name: impl Into<String>) -> Self {
        Self {
            slot_name: slot_name.into(),
            poll_timeout: Duration::from_secs(1),
            temporary: false,
            destroy_slot_on_close: false,
        }
    }
}

/// Stops a [`PollingReplication`] from another task.
#[derive(Debug, Clone)]
pub struct PollingHandle {
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl PollingHandle {
    /// Ends the polling loop after the current drain; the engine then
    /// releases the slot and connection.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(Error::Lifecycle(
                "Polling replication is not running; call start() first".to_string(),
            ));
        }
        self.shutdown.cancel();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct PollingReplication<C> {
    client: C,
    options: PollingOptions,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    closed: bool,
}

impl<C: SqlClient> PollingReplication<C> {
    pub fn new(client: C, options: PollingOptions) -> Self {
        if options.poll_timeout < MIN_RECOMMENDED_POLL_TIMEOUT {
            warn!(
                poll_timeout_ms = options.poll_timeout.as_millis() as u64,
                "Poll timeouts below 100ms can overwhelm the database"
            );
        }

        Self {
            client,
            options,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            closed: false,
        }
    }

    pub fn handle(&self) -> PollingHandle {
        PollingHandle {
            running: self.running.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Creates the slot if it does not exist yet.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(Error::Lifecycle(
                "Polling replication is already running; call stop() first".to_string(),
            ));
        }
        if self.closed {
            return Err(Error::Lifecycle(
                "Polling replication was stopped; create a new instance".to_string(),
            ));
        }
        self.running.store(true, Ordering::SeqCst);

        info!(slot = %self.options.slot_name, "Starting polling replication");
        if let Err(e) = ensure_slot(&self.client, &self.options.slot_name, self.options.temporary).await {
            error!(slot = %self.options.slot_name, error = %e, "Failed to prepare replication slot");
            self.release().await;
            return Err(e);
        }
        Ok(())
    }

    /// Drains and normalizes everything currently pending on the slot.
    ///
    /// Returns no changes while the connection is not ready.
    pub async fn read_changes(&mut self) -> Result<Vec<Change>> {
        if !self.is_running() {
            return Err(Error::Lifecycle(
                "Polling replication is not running; call start() first".to_string(),
            ));
        }
        if !self.client.is_ready() {
            debug!("Connection not ready, skipping poll");
            return Ok(Vec::new());
        }

        let result = match self.client.slot_get_changes(&self.options.slot_name).await {
            Ok(rows) => decode_polling_rows(&rows),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            error!(slot = %self.options.slot_name, error = %e, "Failed to read changes");
            self.release().await;
        }
        result
    }

    /// Stops polling, drops the slot if configured and closes the session.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(Error::Lifecycle(
                "Polling replication is not running; call start() first".to_string(),
            ));
        }
        self.close().await
    }

    async fn close(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut result = Ok(());
        if self.options.destroy_slot_on_close {
            if let Err(e) = self.client.drop_slot(&self.options.slot_name).await {
                warn!(slot = %self.options.slot_name, error = %e, "Failed to drop replication slot");
                result = Err(e);
            }
        }
        if let Err(e) = self.client.close().await {
            warn!(error = %e, "Failed to close SQL connection");
            result = result.and(Err(e));
        }

        info!(slot = %self.options.slot_name, "Polling replication closed");
        result
    }

    /// Closes after a failure; the original error is what gets reported.
    async fn release(&mut self) {
        if let Err(e) = self.close().await {
            debug!(error = %e, "Error while closing after failure");
        }
    }

    /// Starts the engine if needed and yields changes until stopped through
    /// a [`PollingHandle`], sleeping `poll_timeout` between drains.
    pub fn into_stream(self) -> impl Stream<Item = Result<Change>> + Send
    where
        C: 'static,
    {
        let state = PollState {
            engine: self,
            pending: VecDeque::new(),
            phase: Phase::Starting,
        };

        stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(change) = state.pending.pop_front() {
                    return Ok(Some((change, state)));
                }

                match state.phase {
                    Phase::Starting => {
                        if !state.engine.is_running() {
                            state.engine.start().await?;
                        }
                        state.phase = Phase::Polling;
                    }
                    Phase::Polling => {
                        if !state.engine.is_running() {
                            state.engine.close().await?;
                            return Ok(None);
                        }
                        let changes = state.engine.read_changes().await?;
                        state.pending.extend(changes);
                        state.phase = Phase::Sleeping;
                    }
                    Phase::Sleeping => {
                        let shutdown = state.engine.shutdown.clone();
                        tokio::select! {
                            _ = tokio::time::sleep(state.engine.options.poll_timeout) => {}
                            _ = shutdown.cancelled() => {}
                        }
                        state.phase = Phase::Polling;
                    }
                }
            }
        })
    }
}

enum Phase {
    Starting,
    Polling,
    Sleeping,
}

struct PollState<C> {
    engine: PollingReplication<C>,
    pending: VecDeque<Change>,
    phase: Phase,
}
