//! Persistence integration tests.
//!
//! Verifies:
//! - Recorded logs land in RocksDB and survive a reopen
//! - Room logs are isolated and capped
//! - Expired keys are swept
//! - The full server stack records into a disk-backed store

use portal_collab::auth::Identity;
use portal_collab::change::{Change, ChangeKind, ChangeRequest};
use portal_collab::client::CollabClient;
use portal_collab::recorder::{ActivityAction, ActivityEntry, ChatMessage, HistoryEntry, LogKind, Recorder};
use portal_collab::server::{CollabServer, ServerConfig};
use portal_collab::storage::{KvStore, RocksStore, StoreConfig};
use portal_collab::value::Value;

use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn chat(room: &str, n: u64) -> ChatMessage {
    ChatMessage {
        id: format!("m{n}"),
        room_id: room.to_string(),
        user_id: "u1".into(),
        user_name: "Alice".into(),
        message: format!("message {n}"),
        widget_id: None,
        timestamp: n,
    }
}

fn edit(widget: &str, ts: u64) -> HistoryEntry {
    let change = Change::new(
        widget,
        ChangeKind::Content,
        Value::from(format!("text {ts}")),
        "u1",
        ts,
    );
    HistoryEntry::new("dash-1", "Alice", change)
}

/// Wait until the recorder's writer task has released its store handle.
async fn wait_for_release(store: &Arc<RocksStore>) {
    for _ in 0..100 {
        if Arc::strong_count(store) == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("recorder kept the store open");
}

// ─── Recorder over RocksDB ───────────────────────────────────────────────────

#[tokio::test]
async fn test_logs_survive_reopen() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path().join("db"));

    {
        let store = Arc::new(RocksStore::open(config.clone()).unwrap());
        let recorder = Recorder::spawn(store.clone());
        for n in 1..=3 {
            recorder.append_chat(&chat("dash-1", n));
        }
        recorder.append_history(&edit("w1", 10));
        recorder.record_activity(
            &ActivityEntry::new("dash-1", "u1", "Alice", ActivityAction::Edited, 10).on_widget("w1"),
        );
        recorder.flush().await;
        drop(recorder);
        wait_for_release(&store).await;
    }

    let store = Arc::new(RocksStore::open(config).unwrap());
    let recorder = Recorder::spawn(store);
    let transcript = recorder.read_chat("dash-1", 100).await;
    let ids: Vec<&str> = transcript.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);

    let history = recorder.read_history("dash-1", 50).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].change.widget_id, "w1");

    let activity = recorder.read_activity("dash-1", 50).await;
    assert_eq!(activity[0].action, ActivityAction::Edited);
    assert_eq!(activity[0].widget_id.as_deref(), Some("w1"));
}

#[tokio::test]
async fn test_history_capped_on_disk() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let recorder = Recorder::spawn(store.clone());

    let cap = LogKind::History.cap() as u64;
    for ts in 1..=cap + 20 {
        recorder.append_history(&edit("w1", ts));
    }

    assert_eq!(recorder.count(LogKind::History, "dash-1").await, cap as usize);
    let window = recorder.read_history("dash-1", 5).await;
    let stamps: Vec<u64> = window.iter().map(|h| h.change.timestamp).collect();
    assert_eq!(stamps, vec![cap + 16, cap + 17, cap + 18, cap + 19, cap + 20]);
}

#[tokio::test]
async fn test_clear_room_removes_all_logs() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let recorder = Recorder::spawn(store.clone());

    recorder.append_chat(&chat("dash-1", 1));
    recorder.append_chat(&chat("dash-2", 1));
    recorder.append_history(&edit("w1", 1));
    recorder.clear("dash-1");
    recorder.flush().await;

    for kind in LogKind::ALL {
        assert_eq!(store.get(&kind.key("dash-1")).unwrap(), None);
    }
    assert!(store.get(&LogKind::Chat.key("dash-2")).unwrap().is_some());
}

#[test]
fn test_expired_keys_swept() {
    let dir = tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();

    store.set("short", "a", Duration::ZERO).unwrap();
    store.set("long", "b", Duration::from_secs(3600)).unwrap();

    assert_eq!(store.purge_expired().unwrap(), 1);
    assert_eq!(store.get("short").unwrap(), None);
    assert_eq!(store.get("long").unwrap().as_deref(), Some("b"));
}

// ─── Full stack ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_records_to_disk() {
    let dir = tempdir().unwrap();
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let server = CollabServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        http_bind_addr: None,
        storage_path: Some(dir.path().join("collab")),
        jwt_secret: "disk-secret".into(),
        ..ServerConfig::default()
    })
    .unwrap();
    let service = server.service().clone();
    let token = server
        .verifier()
        .issue(&Identity::new("u1", "ws1", "Alice"), Duration::from_secs(600))
        .unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = CollabClient::new(format!("ws://127.0.0.1:{port}"), token);
    client.connect().await.unwrap();
    client.join("dash-1").await.unwrap();
    client
        .change(
            "dash-1",
            ChangeRequest {
                widget_id: "w1".into(),
                change_type: ChangeKind::Size,
                old_value: Value::Null,
                new_value: Value::map([("width", Value::from(4)), ("height", Value::from(3))]),
            },
        )
        .await
        .unwrap();
    client.chat("dash-1", "resized", Some("w1".into())).await.unwrap();

    let recorder = service.recorder();
    let history = recorder.read_history("dash-1", 50).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].user_name, "Alice");
    assert_eq!(history[0].change.change_type, ChangeKind::Size);

    let chat = recorder.read_chat("dash-1", 100).await;
    assert_eq!(chat.len(), 1);
    assert_eq!(chat[0].message, "resized");

    let stats = service.stats("dash-1").await;
    assert!(stats.active);
    assert_eq!(stats.history_entries, 1);
    assert_eq!(stats.chat_messages, 1);
    // joined, edited, commented
    assert_eq!(stats.activity_entries, 3);
}
