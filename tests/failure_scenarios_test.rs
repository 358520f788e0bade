mod common;

use common::{backend_message, insert_transaction, replication_pair, xlog_data};
use pg_logical_cdc::{Error, StreamingOptions, StreamingReplication};

fn options() -> StreamingOptions {
    StreamingOptions {
        start_lsn: Some("0/100".to_string()),
        ..StreamingOptions::new("cdc_slot")
    }
}

#[tokio::test]
async fn test_server_rejects_start_replication() {
    let (socket, mut server) = replication_pair();
    let mut engine = StreamingReplication::new(socket, options());

    let (started, _) = tokio::join!(engine.start(), async {
        server.expect_query().await;
        server
            .reject("42704", "replication slot \"cdc_slot\" does not exist")
            .await;
    });

    match started {
        Err(Error::Replication { message }) => assert!(message.contains("does not exist")),
        other => panic!("expected a replication error, got {other:?}"),
    }
    assert!(engine.is_closed());
}

#[tokio::test]
async fn test_unknown_message_code_is_fatal() {
    let (socket, mut server) = replication_pair();
    let mut engine = StreamingReplication::new(socket, options());

    let (started, _) = tokio::join!(engine.start(), server.accept_replication());
    started.unwrap();

    server.copy_data(b"q\x00\x01").await;
    server.copy_data(&xlog_data(0x200, &insert_transaction(1, 1, "a"))).await;

    match engine.next_change().await {
        Err(Error::Protocol(message)) => assert!(message.contains("wrong message code")),
        other => panic!("expected a protocol error, got {other:?}"),
    }
    // No resynchronisation: the valid frame after the bad one is never decoded.
    assert!(engine.next_change().await.unwrap().is_none());
    assert_eq!(server.read_message().await.0, b'c');
}

#[tokio::test]
async fn test_server_error_mid_stream() {
    let (socket, mut server) = replication_pair();
    let mut engine = StreamingReplication::new(socket, options());

    let (started, _) = tokio::join!(engine.start(), server.accept_replication());
    started.unwrap();

    server
        .reject("57P01", "terminating connection due to administrator command")
        .await;

    assert!(matches!(engine.next_change().await, Err(Error::Replication { .. })));
    assert!(engine.is_closed());
}

#[tokio::test]
async fn test_connection_drop_mid_frame() {
    let (socket, mut server) = replication_pair();
    let mut engine = StreamingReplication::new(socket, options());

    let (started, _) = tokio::join!(engine.start(), server.accept_replication());
    started.unwrap();

    let frame = backend_message(b'd', &xlog_data(0x200, &insert_transaction(1, 1, "a")));
    server.write_raw(&frame[..frame.len() / 2]).await;
    drop(server);

    assert!(matches!(engine.next_change().await, Err(Error::Connection(_))));
    assert!(engine.next_change().await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_wal2json_payload_is_fatal() {
    let (socket, mut server) = replication_pair();
    let mut engine = StreamingReplication::new(socket, options());

    let (started, _) = tokio::join!(engine.start(), server.accept_replication());
    started.unwrap();

    let delete_without_keys = serde_json::json!({
        "change": [{"kind": "delete", "schema": "public", "table": "users"}]
    });
    server.copy_data(&xlog_data(0x200, &delete_without_keys)).await;

    assert!(matches!(engine.next_change().await, Err(Error::InvalidMessage { .. })));
    assert!(engine.is_closed());
}

#[tokio::test]
async fn test_lifecycle_misuse() {
    let (socket, mut server) = replication_pair();
    let mut engine = StreamingReplication::new(socket, options());

    assert!(matches!(engine.stop().await, Err(Error::Lifecycle(_))));
    assert!(matches!(engine.next_change().await, Err(Error::Lifecycle(_))));

    let (started, _) = tokio::join!(engine.start(), server.accept_replication());
    started.unwrap();
    assert!(matches!(engine.start().await, Err(Error::Lifecycle(_))));

    engine.stop().await.unwrap();
    assert_eq!(server.read_message().await.0, b'c');
}
