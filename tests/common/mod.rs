#![allow(dead_code)]

use pg_logical_cdc::config::{Config, PostgresConfig, ReplicationConfig};
use pg_logical_cdc::CopyBothSocket;
use std::env;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const CLOCK_MICROS: i64 = 752_169_600_123_456;

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 30,
    };

    let replication = ReplicationConfig {
        slot_name: format!("test_slot_{}", std::process::id()),
        temporary: false,
        destroy_slot_on_close: true,
        poll_timeout_ms: 100,
        start_lsn: None,
        update_interval_ms: 0,
        auto_ack_lsn: false,
        checkpoint_file: None,
    };

    Config {
        postgres,
        replication,
    }
}

/// A replication socket wired to an in-memory server.
pub fn replication_pair() -> (CopyBothSocket<DuplexStream>, FakeServer) {
    let (client, server) = duplex(1 << 20);
    (CopyBothSocket::new(client), FakeServer { stream: server })
}

/// The server end of a replication connection, after startup and
/// authentication.
pub struct FakeServer {
    stream: DuplexStream,
}

impl FakeServer {
    /// Reads one frontend message.
    pub async fn read_message(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 5];
        self.stream.read_exact(&mut header).await.unwrap();
        let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body).await.unwrap();
        (header[0], body)
    }

    /// Reads the simple query and enters copy-both mode. Returns the query.
    pub async fn accept_replication(&mut self) -> String {
        let command = self.expect_query().await;
        self.write_raw(&backend_message(b'W', &[0, 0, 0])).await;
        command
    }

    pub async fn expect_query(&mut self) -> String {
        let (tag, mut body) = self.read_message().await;
        assert_eq!(tag, b'Q');
        assert_eq!(body.pop(), Some(0));
        String::from_utf8(body).unwrap()
    }

    pub async fn reject(&mut self, code: &str, message: &str) {
        self.write_raw(&error_response(code, message)).await;
    }

    pub async fn copy_data(&mut self, payload: &[u8]) {
        self.write_raw(&backend_message(b'd', payload)).await;
    }

    pub async fn copy_done(&mut self) {
        self.write_raw(&backend_message(b'c', &[])).await;
    }

    /// Writes several CopyData frames split into `piece`-byte writes that
    /// ignore frame boundaries.
    pub async fn copy_data_fragmented(&mut self, payloads: &[&[u8]], piece: usize) {
        let wire: Vec<u8> = payloads.iter().flat_map(|p| backend_message(b'd', p)).collect();
        for chunk in wire.chunks(piece) {
            self.write_raw(chunk).await;
            tokio::task::yield_now().await;
        }
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Reads a CopyData message and returns its payload.
    pub async fn expect_copy_data(&mut self) -> Vec<u8> {
        let (tag, body) = self.read_message().await;
        assert_eq!(tag, b'd', "expected CopyData");
        body
    }
}

pub fn backend_message(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn error_response(code: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [(b'S', "ERROR"), (b'C', code), (b'M', message)] {
        body.push(field);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    backend_message(b'E', &body)
}

pub fn keepalive(server_lsn: u64, reply_required: bool) -> Vec<u8> {
    let mut out = vec![b'k'];
    out.extend_from_slice(&server_lsn.to_be_bytes());
    out.extend_from_slice(&CLOCK_MICROS.to_be_bytes());
    out.push(u8::from(reply_required));
    out
}

pub fn xlog_data(start_lsn: u64, payload: &serde_json::Value) -> Vec<u8> {
    let mut out = vec![b'w'];
    out.extend_from_slice(&start_lsn.to_be_bytes());
    out.extend_from_slice(&(start_lsn + 8).to_be_bytes());
    out.extend_from_slice(&CLOCK_MICROS.to_be_bytes());
    out.extend_from_slice(payload.to_string().as_bytes());
    out
}

pub fn insert_transaction(xid: u64, id: i64, name: &str) -> serde_json::Value {
    serde_json::json!({
        "xid": xid,
        "change": [{
            "kind": "insert",
            "schema": "public",
            "table": "users",
            "columnnames": ["id", "name"],
            "columntypes": ["integer", "text"],
            "columnvalues": [id, name]
        }]
    })
}

pub fn lsn_at(update: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(update[offset..offset + 8].try_into().unwrap())
}
