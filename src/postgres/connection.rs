use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use futures::sink::{self, Sink};
use futures::stream::{self, BoxStream, StreamExt};
use postgres_protocol::message::{backend, frontend};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_postgres::{Config, NoTls};
use tracing::{debug, error, info, trace, warn};

use super::types::RawChangeRow;
use crate::{Error, Result};

const COPY_DATA_TAG: u8 = b'd';
const COPY_DONE_TAG: u8 = b'c';
const COPY_BOTH_RESPONSE_TAG: u8 = b'W';
const ERROR_RESPONSE_TAG: u8 = b'E';
const HEADER_LEN: usize = 5;
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// The ordinary SQL session used for slot management and polling.
#[async_trait]
pub trait SqlClient: Send + Sync {
    async fn current_wal_lsn(&self) -> Result<Option<String>>;

    async fn slot_exists(&self, slot_name: &str) -> Result<bool>;

    /// Creates a logical slot using the `wal2json` plugin.
    async fn create_logical_slot(&self, slot_name: &str, temporary: bool) -> Result<()>;

    async fn drop_slot(&self, slot_name: &str) -> Result<()>;

    /// Consumes everything pending on the slot, with transaction timestamps.
    async fn slot_get_changes(&self, slot_name: &str) -> Result<Vec<RawChangeRow>>;

    fn is_ready(&self) -> bool;

    async fn close(&mut self) -> Result<()>;
}

/// Creates the slot unless it already exists. Returns whether it was created.
pub async fn ensure_slot<C: SqlClient + ?Sized>(client: &C, slot_name: &str, temporary: bool) -> Result<bool> {
    if client.slot_exists(slot_name).await? {
        debug!(slot = slot_name, "Replication slot already exists");
        return Ok(false);
    }

    info!(slot = slot_name, temporary, "Creating logical replication slot");
    client.create_logical_slot(slot_name, temporary).await?;
    Ok(true)
}

/// One piece of a CopyData frame as it arrived off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyChunk {
    pub data: Bytes,
    /// Set on the chunk that completes its CopyData frame.
    pub end_of_frame: bool,
}

/// What the client writes into the copy-both channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyMessage {
    Data(Bytes),
    /// Ends the copy and the session.
    Done,
}

pub type CopyInbound = BoxStream<'static, Result<CopyChunk>>;
pub type CopyOutbound = Pin<Box<dyn Sink<CopyMessage, Error = Error> + Send>>;

/// Both directions of an open copy-both channel.
pub struct CopyBothDuplex {
    pub inbound: CopyInbound,
    pub outbound: CopyOutbound,
}

/// A replication-mode session able to enter copy-both mode.
#[async_trait]
pub trait ReplicationTransport: Send {
    /// Sends `command` and waits for the server to enter copy-both mode.
    async fn start_replication(&mut self, command: &str) -> Result<CopyBothDuplex>;

    async fn close(&mut self) -> Result<()>;
}

pub struct PgSqlClient {
    client: tokio_postgres::Client,
    connection_task: tokio::task::JoinHandle<()>,
}

impl PgSqlClient {
    pub async fn connect(config: &Config) -> Result<Self> {
        info!("Connecting to PostgreSQL");

        let (client, connection) = config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        info!("Successfully connected to PostgreSQL");

        Ok(Self {
            client,
            connection_task,
        })
    }
}

#[async_trait]
impl SqlClient for PgSqlClient {
    async fn current_wal_lsn(&self) -> Result<Option<String>> {
        let row = self
            .client
            .query_opt("SELECT pg_current_wal_lsn()::text", &[])
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<_, Option<String>>(0)?),
            None => Ok(None),
        }
    }

    async fn slot_exists(&self, slot_name: &str) -> Result<bool> {
        let row = self
            .client
            .query_opt("SELECT 1 FROM pg_replication_slots WHERE slot_name = $1", &[&slot_name])
            .await?;
        Ok(row.is_some())
    }

    async fn create_logical_slot(&self, slot_name: &str, temporary: bool) -> Result<()> {
        self.client
            .execute(
                "SELECT pg_create_logical_replication_slot($1, 'wal2json', $2)",
                &[&slot_name, &temporary],
            )
            .await?;
        info!("Created replication slot '{}'", slot_name);
        Ok(())
    }

    async fn drop_slot(&self, slot_name: &str) -> Result<()> {
        self.client
            .execute("SELECT pg_drop_replication_slot($1)", &[&slot_name])
            .await?;
        info!("Dropped replication slot '{}'", slot_name);
        Ok(())
    }

    async fn slot_get_changes(&self, slot_name: &str) -> Result<Vec<RawChangeRow>> {
        let rows = self
            .client
            .query(
                "SELECT lsn::text, xid::text, data FROM pg_logical_slot_get_changes($1, NULL, NULL, 'include-timestamp', '1')",
                &[&slot_name],
            )
            .await?;

        rows.iter()
            .map(|row| -> Result<RawChangeRow> {
                Ok(RawChangeRow {
                    lsn: row.try_get(0)?,
                    xid: row.try_get(1)?,
                    data: row.try_get(2)?,
                })
            })
            .collect()
    }

    fn is_ready(&self) -> bool {
        !self.client.is_closed()
    }

    async fn close(&mut self) -> Result<()> {
        info!("Closing PostgreSQL connection");
        self.connection_task.abort();
        Ok(())
    }
}

/// Speaks the copy-both sub-protocol over an already authenticated
/// replication-mode socket.
pub struct CopyBothSocket<S> {
    socket: Option<S>,
}

impl<S> CopyBothSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(socket: S) -> Self {
        Self {
            socket: Some(socket),
        }
    }
}

#[async_trait]
impl<S> ReplicationTransport for CopyBothSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn start_replication(&mut self, command: &str) -> Result<CopyBothDuplex> {
        let mut socket = self
            .socket
            .take()
            .ok_or_else(|| Error::Connection("replication socket already consumed".to_string()))?;

        let mut out = BytesMut::new();
        frontend::query(command, &mut out)?;
        socket.write_all(&out).await?;
        socket.flush().await?;

        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            let raw = read_message(&mut socket, &mut buf).await?;
            match raw[0] {
                COPY_BOTH_RESPONSE_TAG => break,
                ERROR_RESPONSE_TAG => {
                    return Err(Error::Replication {
                        message: error_response_message(raw),
                    })
                }
                other => trace!(tag = %char::from(other), "Skipping message before CopyBothResponse"),
            }
        }
        info!("Server entered copy-both mode");

        let (reader, writer) = tokio::io::split(socket);
        let inbound = InboundFrames {
            reader,
            buf,
            frame_remaining: 0,
            done: false,
        };

        Ok(CopyBothDuplex {
            inbound: inbound.into_stream(),
            outbound: outbound_sink(writer),
        })
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut socket) = self.socket.take() {
            socket.shutdown().await?;
        }
        Ok(())
    }
}

/// Reads one whole backend message, header included.
async fn read_message<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut BytesMut) -> Result<BytesMut> {
    loop {
        if let Some(total) = message_len(buf)? {
            if buf.len() >= total {
                return Ok(buf.split_to(total));
            }
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(Error::Connection("server closed the connection".to_string()));
        }
    }
}

fn message_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 {
        return Err(Error::Protocol(format!("invalid message length {len}")));
    }
    Ok(Some(len as usize + 1))
}

fn error_response_message(mut raw: BytesMut) -> String {
    let body = match backend::Message::parse(&mut raw) {
        Ok(Some(backend::Message::ErrorResponse(body))) => body,
        _ => return "unparseable ErrorResponse".to_string(),
    };

    let mut severity = String::new();
    let mut code = String::new();
    let mut message = String::new();
    let mut fields = body.fields();
    while let Ok(Some(field)) = fields.next() {
        let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
        match field.type_() {
            b'S' => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }
    format!("{severity}: {message} ({code})")
}

/// Unwraps CopyData envelopes, forwarding payload bytes as they arrive.
struct InboundFrames<R> {
    reader: R,
    buf: BytesMut,
    frame_remaining: usize,
    done: bool,
}

impl<R> InboundFrames<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn into_stream(self) -> CopyInbound {
        stream::try_unfold(self, |mut frames| async move {
            Ok(frames.next_chunk().await?.map(|chunk| (chunk, frames)))
        })
        .boxed()
    }

    async fn next_chunk(&mut self) -> Result<Option<CopyChunk>> {
        loop {
            if self.done {
                return Ok(None);
            }

            if self.frame_remaining > 0 {
                if !self.buf.is_empty() {
                    let n = self.frame_remaining.min(self.buf.len());
                    self.frame_remaining -= n;
                    return Ok(Some(CopyChunk {
                        data: self.buf.split_to(n).freeze(),
                        end_of_frame: self.frame_remaining == 0,
                    }));
                }
            } else if let Some(total) = self.envelope_len()? {
                let tag = self.buf[0];
                if tag == COPY_DATA_TAG {
                    self.buf.advance(HEADER_LEN);
                    self.frame_remaining = total - HEADER_LEN;
                    if self.frame_remaining == 0 {
                        return Ok(Some(CopyChunk {
                            data: Bytes::new(),
                            end_of_frame: true,
                        }));
                    }
                    continue;
                }

                if self.buf.len() >= total {
                    let raw = self.buf.split_to(total);
                    match tag {
                        COPY_DONE_TAG => {
                            debug!("Server ended the copy stream");
                            self.done = true;
                            return Ok(None);
                        }
                        ERROR_RESPONSE_TAG => {
                            self.done = true;
                            return Err(Error::Replication {
                                message: error_response_message(raw),
                            });
                        }
                        other => {
                            trace!(tag = %char::from(other), "Skipping message inside copy stream");
                            continue;
                        }
                    }
                }
            }

            if self.reader.read_buf(&mut self.buf).await? == 0 {
                self.done = true;
                warn!("Replication connection closed mid-stream");
                return Err(Error::Connection("replication connection closed by server".to_string()));
            }
        }
    }

    fn envelope_len(&mut self) -> Result<Option<usize>> {
        message_len(&self.buf).map_err(|e| {
            self.done = true;
            e
        })
    }
}

fn outbound_sink<W>(writer: W) -> CopyOutbound
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    Box::pin(sink::unfold(writer, |mut writer, message: CopyMessage| async move {
        let mut buf = BytesMut::new();
        let done = message == CopyMessage::Done;
        match message {
            CopyMessage::Data(data) => frontend::CopyData::new(data)?.write(&mut buf),
            CopyMessage::Done => {
                frontend::copy_done(&mut buf);
                frontend::terminate(&mut buf);
            }
        }

        writer.write_all(&buf).await?;
        writer.flush().await?;
        if done {
            writer.shutdown().await?;
        }
        Ok::<_, Error>(writer)
    }))
}
