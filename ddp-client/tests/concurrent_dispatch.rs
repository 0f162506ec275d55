//! Outbound calls from application threads racing inbound dispatch on an
//! I/O thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use ddp_client::{Connection, ConnectionConfig, MemoryTransport, SubscriptionHandle};
use serde_json::json;

const CALLERS: usize = 4;
const CALLS_PER_THREAD: usize = 250;
const SUBS_PER_THREAD: usize = 25;

enum Answer {
    Result(String),
    Ready(String),
}

fn connected() -> (Connection, Arc<MemoryTransport>) {
    let transport = MemoryTransport::new();
    let conn = Connection::new(ConnectionConfig::new("ws://threads/websocket"), transport.clone());
    conn.connect().unwrap();
    transport.deliver(r#"{"msg":"connected","session":"threads"}"#);
    (conn, transport)
}

#[test]
fn test_calls_and_subscriptions_across_threads() {
    let (conn, transport) = connected();
    let (answer_tx, answer_rx) = mpsc::channel::<Answer>();

    // Answers every request twice, so duplicates race the first delivery.
    let io = {
        let transport = transport.clone();
        thread::spawn(move || {
            for answer in answer_rx {
                let frame = match answer {
                    Answer::Result(id) => json!({"msg": "result", "id": id, "result": id}),
                    Answer::Ready(id) => json!({"msg": "ready", "subs": [id]}),
                };
                transport.deliver(frame.to_string());
                transport.deliver(frame.to_string());
            }
        })
    };

    let callers: Vec<_> = (0..CALLERS)
        .map(|_| {
            let conn = conn.clone();
            let answer_tx = answer_tx.clone();
            thread::spawn(move || {
                let mut calls = Vec::new();
                let mut subs: Vec<(SubscriptionHandle, Arc<AtomicUsize>)> = Vec::new();
                for n in 0..CALLS_PER_THREAD {
                    let hits = Arc::new(AtomicUsize::new(0));
                    let h = hits.clone();
                    let id = conn
                        .call_with("echo", vec![], move |outcome| {
                            assert!(outcome.is_ok());
                            h.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                    answer_tx.send(Answer::Result(id)).unwrap();
                    calls.push(hits);

                    if n % (CALLS_PER_THREAD / SUBS_PER_THREAD) == 0 {
                        let handle = conn.subscribe("feed", vec![json!(n)]).unwrap();
                        answer_tx.send(Answer::Ready(handle.id().to_string())).unwrap();
                        // The ready may already have been dispatched.
                        let ready = Arc::new(AtomicUsize::new(0));
                        let r = ready.clone();
                        handle.on_ready(move |_| {
                            r.fetch_add(1, Ordering::SeqCst);
                        });
                        subs.push((handle, ready));
                    }
                }
                (calls, subs)
            })
        })
        .collect();
    drop(answer_tx);

    let mut calls = Vec::new();
    let mut subs = Vec::new();
    for caller in callers {
        let (c, s) = caller.join().unwrap();
        calls.extend(c);
        subs.extend(s);
    }
    io.join().unwrap();

    assert_eq!(calls.len(), CALLERS * CALLS_PER_THREAD);
    assert!(calls.iter().all(|hits| hits.load(Ordering::SeqCst) == 1));
    assert_eq!(conn.pending_calls(), 0);

    assert_eq!(subs.len(), CALLERS * SUBS_PER_THREAD);
    for (handle, ready) in &subs {
        assert!(handle.is_ready());
        assert_eq!(ready.load(Ordering::SeqCst), 1, "subscription {}", handle.id());
    }
    assert_eq!(conn.subscriptions().len(), subs.len());
}

#[test]
fn test_close_races_inbound_results() {
    let (conn, transport) = connected();
    let hits = Arc::new(AtomicUsize::new(0));
    let mut ids = Vec::new();
    for _ in 0..500 {
        let h = hits.clone();
        ids.push(
            conn.call_with("slow", vec![], move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap(),
        );
    }

    let io = {
        let transport = transport.clone();
        thread::spawn(move || {
            for id in ids {
                transport.deliver(json!({"msg": "result", "id": id, "result": null}).to_string());
            }
        })
    };
    conn.close();
    io.join().unwrap();

    // Every call completed once, either with its result or with the close.
    assert_eq!(hits.load(Ordering::SeqCst), 500);
    assert_eq!(conn.pending_calls(), 0);
}
