use criterion::{criterion_group, criterion_main, Criterion};
use portal_collab::broadcast::{outbox_channel, BroadcastGroup};
use portal_collab::change::{Change, ChangeKind};
use portal_collab::protocol::{Cursor, Inbound, ServerMessage};
use portal_collab::storage::{KvStore, RocksStore, StoreConfig};
use portal_collab::transform::transform_all;
use portal_collab::value::Value;
use portal_collab::version::VersionTracker;
use std::hint::black_box;
use std::time::Duration;
use uuid::Uuid;

fn position(user: &str, x: i64, ts: u64) -> Change {
    Change::new(
        "w1",
        ChangeKind::Position,
        Value::map([("x", Value::from(x)), ("y", Value::from(ts as i64))]),
        user,
        ts,
    )
}

fn nested_config(depth: usize, ts: u64) -> Change {
    let mut value = Value::map([("color", Value::from("#336699")), ("ts", Value::from(ts as i64))]);
    for level in 0..depth {
        value = Value::map([(format!("level{level}"), value), ("title".to_string(), Value::from("Revenue"))]);
    }
    Change::new("w1", ChangeKind::Config, value, "u1", ts)
}

fn bench_transform_position_50(c: &mut Criterion) {
    let concurrent: Vec<Change> = (0..50).map(|i| position("other", i, i as u64)).collect();
    let incoming = position("me", 999, 100);

    c.bench_function("transform_position_50_concurrent", |b| {
        b.iter(|| black_box(transform_all(black_box(&incoming), black_box(&concurrent))))
    });
}

fn bench_transform_config_deep(c: &mut Criterion) {
    let concurrent: Vec<Change> = (0..20).map(|i| nested_config(6, i)).collect();
    let incoming = nested_config(6, 100);

    c.bench_function("transform_config_depth6_20_concurrent", |b| {
        b.iter(|| black_box(transform_all(black_box(&incoming), black_box(&concurrent))))
    });
}

fn bench_version_tracker_record(c: &mut Criterion) {
    c.bench_function("version_tracker_record_1000", |b| {
        b.iter(|| {
            let mut tracker = VersionTracker::new();
            for ts in 1..=1000u64 {
                let user = if ts % 2 == 0 { "a" } else { "b" };
                black_box(tracker.record_and_get_concurrent(&position(user, ts as i64, ts)));
            }
        })
    });
}

fn bench_inbound_decode(c: &mut Criterion) {
    let frame = r#"{"type":"widget:change","requestId":"17","roomId":"dash-1","change":{"widgetId":"w1","changeType":"position","oldValue":{"x":1,"y":2},"newValue":{"x":10,"y":20}}}"#;

    c.bench_function("inbound_decode_change", |b| {
        b.iter(|| black_box(Inbound::decode(black_box(frame)).unwrap()))
    });
}

fn bench_broadcast_100_members(c: &mut Criterion) {
    let mut group = BroadcastGroup::new();
    let mut inboxes = Vec::new();
    for i in 0..100 {
        let (tx, rx) = outbox_channel(64);
        group.add_member(Uuid::new_v4(), format!("user{i}"), tx);
        inboxes.push(rx);
    }
    let msg = ServerMessage::CursorUpdate {
        room_id: "dash-1".into(),
        user_id: "user0".into(),
        display_name: "User 0".into(),
        cursor: Cursor::at(10.0, 20.0),
    };

    c.bench_function("broadcast_cursor_100_members", |b| {
        b.iter(|| {
            black_box(group.broadcast(black_box(&msg), None));
            for rx in inboxes.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_rocks_set_get(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("portal_bench_rocks_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    })
    .unwrap();
    let value = r#"[{"id":"m1","message":"looks good"}]"#.repeat(20);

    c.bench_function("rocks_set_get_1KB", |b| {
        b.iter(|| {
            store
                .set("collab:chat:dash-1", black_box(&value), Duration::from_secs(3600))
                .unwrap();
            black_box(store.get("collab:chat:dash-1").unwrap());
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_transform_position_50,
    bench_transform_config_deep,
    bench_version_tracker_record,
    bench_inbound_decode,
    bench_broadcast_100_members,
    bench_rocks_set_get,
);
criterion_main!(benches);
