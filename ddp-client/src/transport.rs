//! Transport boundary.
//!
//! The connection only needs a full-duplex text channel: five operations
//! ([`Transport`]) and four notification points ([`TransportListener`]).
//! Framing, compression and reconnection belong to the implementation.
//!
//! [`MemoryTransport`] is an in-process implementation that records what is
//! sent and lets the owner inject inbound events. It backs the test suites
//! and is handy for driving a [`crate::Connection`] without a server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::listeners::{lock, read, write};

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport is not open")]
    NotAlive,
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Transport failure: {0}")]
    Io(String),
}

/// Inbound notification points. Implementations may be invoked from any
/// thread, but never concurrently for the same transport.
pub trait TransportListener: Send + Sync {
    fn on_open(&self);
    fn on_close(&self);
    fn on_error(&self, error: &TransportError);
    fn on_text_frame(&self, text: &str);
}

/// A full-duplex text channel.
pub trait Transport: Send + Sync {
    /// Install the single inbound listener. Replaces any previous one.
    fn set_listener(&self, listener: Arc<dyn TransportListener>);

    /// Start opening a channel to `url` and return immediately.
    /// `on_open` fires once the channel is usable.
    fn open(&self, url: &str) -> Result<(), TransportError>;

    /// Open a channel to `url`, resolving once the channel is usable.
    fn open_async<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move { self.open(url) })
    }

    fn close(&self);

    fn is_alive(&self) -> bool;

    /// Queue one whole text frame for sending.
    fn send(&self, text: String) -> Result<(), TransportError>;
}

/// In-process transport.
///
/// `open` and `close` complete synchronously and notify the listener on
/// the calling thread. Inbound frames are injected with [`deliver`].
///
/// [`deliver`]: MemoryTransport::deliver
#[derive(Default)]
pub struct MemoryTransport {
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
    alive: AtomicBool,
    url: Mutex<Option<String>>,
    sent: Mutex<VecDeque<String>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        read(&self.listener).clone()
    }

    /// URL passed to the last `open`.
    pub fn url(&self) -> Option<String> {
        lock(&self.url).clone()
    }

    /// Inject an inbound text frame.
    pub fn deliver(&self, text: impl AsRef<str>) {
        if let Some(listener) = self.listener() {
            listener.on_text_frame(text.as_ref());
        }
    }

    /// Inject a transport error followed by a close.
    pub fn fail(&self, error: TransportError) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(listener) = self.listener() {
            listener.on_error(&error);
            listener.on_close();
        }
    }

    /// Simulate the remote side dropping the channel.
    pub fn drop_remote(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            if let Some(listener) = self.listener() {
                listener.on_close();
            }
        }
    }

    /// Remove and return every frame sent so far, oldest first.
    pub fn take_sent(&self) -> Vec<String> {
        lock(&self.sent).drain(..).collect()
    }

    /// Remove and return sent frames parsed as JSON.
    pub fn take_sent_json(&self) -> Vec<serde_json::Value> {
        self.take_sent()
            .iter()
            .filter_map(|frame| serde_json::from_str(frame).ok())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.sent).len()
    }
}

impl Transport for MemoryTransport {
    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *write(&self.listener) = Some(listener);
    }

    fn open(&self, url: &str) -> Result<(), TransportError> {
        *lock(&self.url) = Some(url.to_string());
        self.alive.store(true, Ordering::SeqCst);
        if let Some(listener) = self.listener() {
            listener.on_open();
        }
        Ok(())
    }

    fn close(&self) {
        self.drop_remote();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn send(&self, text: String) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::NotAlive);
        }
        lock(&self.sent).push_back(text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl TransportListener for Recorder {
        fn on_open(&self) {
            self.events.lock().unwrap().push("open".into());
        }
        fn on_close(&self) {
            self.events.lock().unwrap().push("close".into());
        }
        fn on_error(&self, error: &TransportError) {
            self.events.lock().unwrap().push(format!("error:{error}"));
        }
        fn on_text_frame(&self, text: &str) {
            self.events.lock().unwrap().push(format!("text:{text}"));
        }
    }

    #[test]
    fn test_memory_transport_lifecycle() {
        let transport = MemoryTransport::new();
        let recorder = Arc::new(Recorder::default());
        transport.set_listener(recorder.clone());

        assert!(!transport.is_alive());
        assert_eq!(transport.send("x".into()), Err(TransportError::NotAlive));

        transport.open("ws://example/websocket").unwrap();
        assert!(transport.is_alive());
        assert_eq!(transport.url().as_deref(), Some("ws://example/websocket"));

        transport.send("a".into()).unwrap();
        transport.send("b".into()).unwrap();
        assert_eq!(transport.sent_count(), 2);
        assert_eq!(transport.take_sent(), vec!["a", "b"]);
        assert_eq!(transport.sent_count(), 0);

        transport.deliver("hello");
        transport.close();
        assert!(!transport.is_alive());
        // Second close does not notify again.
        transport.close();

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["open", "text:hello", "close"]);
    }

    #[test]
    fn test_memory_transport_failure() {
        let transport = MemoryTransport::new();
        let recorder = Arc::new(Recorder::default());
        transport.set_listener(recorder.clone());
        transport.open("ws://x").unwrap();

        transport.fail(TransportError::Io("reset".into()));
        assert!(!transport.is_alive());
        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["open", "error:Transport failure: reset", "close"]);
    }

    #[tokio::test]
    async fn test_default_open_async_delegates_to_open() {
        let transport = MemoryTransport::new();
        transport.open_async("ws://y").await.unwrap();
        assert!(transport.is_alive());
    }
}
