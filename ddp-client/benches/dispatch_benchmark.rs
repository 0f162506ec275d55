use criterion::{criterion_group, criterion_main, Criterion};
use ddp_client::{
    ClientMessage, CollectionCache, Connection, ConnectionConfig, Envelope, MemoryTransport,
};
use serde_json::{json, Value};
use std::hint::black_box;
use std::sync::Arc;

fn connected() -> (Connection, Arc<MemoryTransport>) {
    let transport = MemoryTransport::new();
    let conn = Connection::new(ConnectionConfig::new("ws://bench/websocket"), transport.clone());
    conn.connect().unwrap();
    transport.deliver(r#"{"msg":"connected","session":"bench"}"#);
    transport.take_sent();
    (conn, transport)
}

fn bench_envelope_parse(c: &mut Criterion) {
    let frame = json!({
        "msg": "changed",
        "collection": "tasks",
        "id": "t1",
        "fields": {"title": "write benchmarks", "done": false, "tags": ["a", "b"]}
    })
    .to_string();

    c.bench_function("envelope_parse_changed", |b| {
        b.iter(|| {
            black_box(Envelope::parse(black_box(&frame)).unwrap());
        })
    });
}

fn bench_method_encode(c: &mut Criterion) {
    let params = vec![json!({"title": "x", "priority": 3}), json!([1, 2, 3])];

    c.bench_function("method_encode", |b| {
        b.iter(|| {
            let msg = ClientMessage::Method {
                method: "tasks.insert",
                params: black_box(&params),
                id: "42",
            };
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_collection_fanout(c: &mut Criterion) {
    let (conn, transport) = connected();
    let caches: Vec<Arc<CollectionCache>> = (0..4)
        .map(|_| Arc::new(CollectionCache::new("tasks")))
        .collect();
    for cache in &caches {
        conn.register_observer::<Value, _>("tasks", cache.clone());
    }
    let added = r#"{"msg":"added","collection":"tasks","id":"t1","fields":{"title":"a","n":1}}"#;
    let changed = r#"{"msg":"changed","collection":"tasks","id":"t1","fields":{"n":2},"cleared":["title"]}"#;

    c.bench_function("collection_fanout_4_observers", |b| {
        b.iter(|| {
            transport.deliver(black_box(added));
            transport.deliver(black_box(changed));
        })
    });
    assert_eq!(caches[0].len(), 1);
}

fn bench_unobserved_drop(c: &mut Criterion) {
    let (_conn, transport) = connected();
    let frame = r#"{"msg":"added","collection":"nobody","id":"x","fields":{"big":[1,2,3,4,5,6,7,8]}}"#;

    c.bench_function("unobserved_collection_drop", |b| {
        b.iter(|| transport.deliver(black_box(frame)))
    });
}

fn bench_result_correlation(c: &mut Criterion) {
    let (conn, transport) = connected();

    c.bench_function("call_and_resolve", |b| {
        b.iter(|| {
            let id = conn.call_with("m", vec![], |outcome| {
                black_box(outcome.is_ok());
            })
            .unwrap();
            transport.take_sent();
            transport.deliver(format!(r#"{{"msg":"result","id":"{id}","result":1}}"#));
        })
    });
    assert_eq!(conn.pending_calls(), 0);
}

criterion_group!(
    benches,
    bench_envelope_parse,
    bench_method_encode,
    bench_collection_fanout,
    bench_unobserved_drop,
    bench_result_correlation,
);
criterion_main!(benches);
