#![cfg(unix)]

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tt_core::ipc::{
    decode_frame, encode_frame, ClientRole, HelloPayload, WireEnvelope, WireMsg,
    DEFAULT_MAX_FRAME_BYTES,
};
use tt_core::ThreadStatus;
use tt_hub::{Coordinator, HubConfig, MemoryAlertSurface, Notifier};
use tt_storage::{load_threads, SqliteStore};

async fn wait_for_socket(path: &std::path::Path) {
    for _ in 0..100 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("socket did not appear: {}", path.display());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_is_durable_across_hub_restart() {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join("threads.sqlite");
    let socket_path = dir.path().join("run").join("hub.sock");

    let store = Arc::new(SqliteStore::open(&db_path).expect("open db"));
    let surface = Arc::new(MemoryAlertSurface::new());
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        Notifier::new(store.clone(), surface.clone()),
    ));
    coordinator.initialize().await.expect("initialize");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(tt_hub::run(
        HubConfig::new(socket_path.clone()),
        coordinator,
        shutdown_rx,
    ));
    wait_for_socket(&socket_path).await;

    let stream = UnixStream::connect(&socket_path).await.expect("connect");
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let hello = WireEnvelope::new(
        "observer-it",
        None,
        WireMsg::Hello(HelloPayload {
            client_id: "observer-it".to_string(),
            role: ClientRole::Observer,
            capabilities: vec!["threads".to_string()],
        }),
    );
    let snapshot = WireEnvelope::request(
        "observer-it",
        WireMsg::ThreadsUpdated(vec![
            json!({
                "id": 1,
                "subject": "Project Status Update",
                "lastActivity": chrono::Utc::now().timestamp_millis() - 86_400_000,
                "participants": ["john.doe@example.com", "jane.smith@example.com"],
                "status": "active"
            }),
            json!({
                "id": 2,
                "subject": "Budget Approval Request",
                "lastActivity": chrono::Utc::now().timestamp_millis() - 6 * 86_400_000,
                "participants": ["finance@example.com"],
                "status": "active"
            }),
        ]),
    );
    for envelope in [&hello, &snapshot] {
        let frame = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        writer.write_all(&frame).await.expect("write");
    }
    writer.flush().await.expect("flush");

    let ack = loop {
        let mut line = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(3), reader.read_until(b'\n', &mut line))
            .await
            .expect("read timeout")
            .expect("read");
        assert!(read > 0, "unexpected EOF");
        let envelope: WireEnvelope = decode_frame(&line, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        if let WireMsg::Ack(ack) = envelope.msg {
            assert_eq!(envelope.request_id, snapshot.request_id);
            break ack;
        }
    };
    assert!(ack.success, "ack failed: {ack:?}");
    assert_eq!(surface.delivery_count(), 1);

    let _ = shutdown_tx.send(true);
    handle.await.expect("join").expect("hub run");
    drop(store);

    let reopened = SqliteStore::open(&db_path).expect("reopen db");
    let threads = load_threads(&reopened).await.expect("threads");
    assert_eq!(threads.len(), 2);
    assert_eq!(threads[0].id, "1");
    assert_eq!(threads[0].status, ThreadStatus::Active);
    assert_eq!(threads[1].status, ThreadStatus::Stalled);
}
