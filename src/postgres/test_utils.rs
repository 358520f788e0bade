use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::connection::{CopyBothDuplex, CopyChunk, CopyMessage, ReplicationTransport, SqlClient};
use super::types::RawChangeRow;
use crate::{Error, Result};

/// Builds the CopyData payload of a primary keepalive.
pub fn keepalive_frame(server_lsn: u64, clock_micros: i64, reply_required: bool) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'k');
    buf.put_u64(server_lsn);
    buf.put_i64(clock_micros);
    buf.put_u8(u8::from(reply_required));
    buf.freeze()
}

/// Builds the CopyData payload of an XLogData message.
pub fn xlog_data_frame(start_lsn: u64, end_lsn: u64, clock_micros: i64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'w');
    buf.put_u64(start_lsn);
    buf.put_u64(end_lsn);
    buf.put_i64(clock_micros);
    buf.put_slice(payload);
    buf.freeze()
}

/// A wal2json transaction with one insert into `public.users`.
pub fn insert_payload(id: i64, name: &str) -> Vec<u8> {
    serde_json::json!({
        "change": [{
            "kind": "insert",
            "schema": "public",
            "table": "users",
            "columnnames": ["id", "name"],
            "columntypes": ["integer", "text"],
            "columnvalues": [id, name]
        }]
    })
    .to_string()
    .into_bytes()
}

#[derive(Debug)]
struct MockSqlState {
    calls: Vec<String>,
    slot_exists: bool,
    current_wal_lsn: Option<String>,
    batches: VecDeque<std::result::Result<Vec<RawChangeRow>, String>>,
    ready: bool,
    fail_create: Option<String>,
}

/// Recording [`SqlClient`]; clones share state.
#[derive(Debug, Clone)]
pub struct MockSqlClient {
    state: Arc<Mutex<MockSqlState>>,
}

impl MockSqlClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockSqlState {
                calls: Vec::new(),
                slot_exists: false,
                current_wal_lsn: None,
                batches: VecDeque::new(),
                ready: true,
                fail_create: None,
            })),
        }
    }

    pub fn with_slot(self) -> Self {
        self.state.lock().slot_exists = true;
        self
    }

    pub fn with_current_wal_lsn(self, lsn: &str) -> Self {
        self.state.lock().current_wal_lsn = Some(lsn.to_string());
        self
    }

    pub fn fail_create(self, message: &str) -> Self {
        self.state.lock().fail_create = Some(message.to_string());
        self
    }

    pub fn push_rows(&self, rows: Vec<RawChangeRow>) {
        self.state.lock().batches.push_back(Ok(rows));
    }

    pub fn push_failure(&self, message: &str) {
        self.state.lock().batches.push_back(Err(message.to_string()));
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.lock().ready = ready;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| c.as_str() == call).count()
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().calls.push(call.into());
    }
}

#[async_trait]
impl SqlClient for MockSqlClient {
    async fn current_wal_lsn(&self) -> Result<Option<String>> {
        self.record("current_wal_lsn");
        Ok(self.state.lock().current_wal_lsn.clone())
    }

    async fn slot_exists(&self, slot_name: &str) -> Result<bool> {
        self.record(format!("slot_exists {slot_name}"));
        Ok(self.state.lock().slot_exists)
    }

    async fn create_logical_slot(&self, slot_name: &str, temporary: bool) -> Result<()> {
        self.record(format!("create_slot {slot_name} temporary={temporary}"));
        let mut state = self.state.lock();
        if let Some(message) = &state.fail_create {
            return Err(Error::Connection(message.clone()));
        }
        state.slot_exists = true;
        Ok(())
    }

    async fn drop_slot(&self, slot_name: &str) -> Result<()> {
        self.record(format!("drop_slot {slot_name}"));
        self.state.lock().slot_exists = false;
        Ok(())
    }

    async fn slot_get_changes(&self, slot_name: &str) -> Result<Vec<RawChangeRow>> {
        self.record(format!("get_changes {slot_name}"));
        match self.state.lock().batches.pop_front() {
            Some(Ok(rows)) => Ok(rows),
            Some(Err(message)) => Err(Error::Connection(message)),
            None => Ok(Vec::new()),
        }
    }

    fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    async fn close(&mut self) -> Result<()> {
        self.record("close");
        self.state.lock().ready = false;
        Ok(())
    }
}

/// In-memory [`ReplicationTransport`] driven by a [`MockServer`].
pub struct MockTransport {
    inbound: Option<mpsc::UnboundedReceiver<Result<CopyChunk>>>,
    outbound: mpsc::UnboundedSender<CopyMessage>,
    commands: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
    fail_start: Option<String>,
}

impl MockTransport {
    pub fn failing(mut self, message: &str) -> Self {
        self.fail_start = Some(message.to_string());
        self
    }
}

/// The server side of a [`MockTransport`].
pub struct MockServer {
    inbound: mpsc::UnboundedSender<Result<CopyChunk>>,
    outbound: mpsc::UnboundedReceiver<CopyMessage>,
    commands: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
}

pub fn mock_transport() -> (MockTransport, MockServer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded();
    let (outbound_tx, outbound_rx) = mpsc::unbounded();
    let commands = Arc::new(Mutex::new(Vec::new()));
    let closes = Arc::new(AtomicUsize::new(0));

    (
        MockTransport {
            inbound: Some(inbound_rx),
            outbound: outbound_tx,
            commands: commands.clone(),
            closes: closes.clone(),
            fail_start: None,
        },
        MockServer {
            inbound: inbound_tx,
            outbound: outbound_rx,
            commands,
            closes,
        },
    )
}

impl MockServer {
    /// Sends one whole CopyData frame.
    pub fn send_frame(&self, frame: &[u8]) {
        self.send_chunk(frame, true);
    }

    pub fn send_chunk(&self, data: &[u8], end_of_frame: bool) {
        let chunk = CopyChunk {
            data: Bytes::copy_from_slice(data),
            end_of_frame,
        };
        let _ = self.inbound.unbounded_send(Ok(chunk));
    }

    pub fn send_error(&self, error: Error) {
        let _ = self.inbound.unbounded_send(Err(error));
    }

    /// Ends the copy stream from the server side.
    pub fn finish(&self) {
        self.inbound.close_channel();
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Everything the client has written so far.
    pub fn received(&mut self) -> Vec<CopyMessage> {
        let mut messages = Vec::new();
        while let Ok(Some(message)) = self.outbound.try_next() {
            messages.push(message);
        }
        messages
    }

    /// Only the status updates the client has written so far.
    pub fn status_updates(&mut self) -> Vec<Bytes> {
        self.received()
            .into_iter()
            .filter_map(|message| match message {
                CopyMessage::Data(bytes) => Some(bytes),
                CopyMessage::Done => None,
            })
            .collect()
    }
}

#[async_trait]
impl ReplicationTransport for MockTransport {
    async fn start_replication(&mut self, command: &str) -> Result<CopyBothDuplex> {
        self.commands.lock().push(command.to_string());
        if let Some(message) = &self.fail_start {
            return Err(Error::Replication {
                message: message.clone(),
            });
        }

        let inbound = self
            .inbound
            .take()
            .ok_or_else(|| Error::Connection("mock transport already started".to_string()))?;
        let outbound = self
            .outbound
            .clone()
            .sink_map_err(|e| Error::Connection(e.to_string()));

        Ok(CopyBothDuplex {
            inbound: inbound.boxed(),
            outbound: Box::pin(outbound),
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
