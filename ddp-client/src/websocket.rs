//! WebSocket transport over tokio-tungstenite.
//!
//! ```text
//!            ┌──────────── writer task ◄── mpsc ◄── send(text)
//! WebSocket ─┤
//!            └──────────── reader task ──► TransportListener::on_text_frame
//! ```
//!
//! Each `open` starts a new generation. Closing (or reopening) retires the
//! current generation, and late notifications from retired tasks are
//! swallowed so they cannot be mistaken for the new channel's.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::listeners::{lock, read, write};
use crate::transport::{Transport, TransportError, TransportListener};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Shared {
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
    outgoing: Mutex<Option<mpsc::Sender<Message>>>,
    alive: AtomicBool,
    generation: AtomicU64,
}

impl Shared {
    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        read(&self.listener).clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Retire the current channel and return the next generation number.
    fn retire(&self) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.alive.store(false, Ordering::SeqCst);
        if let Some(tx) = lock(&self.outgoing).take() {
            let _ = tx.try_send(Message::Close(None));
        }
        next
    }

    /// Wire up reader and writer tasks for a freshly opened stream, then
    /// report open. Must run inside a tokio runtime.
    fn start(self: &Arc<Self>, stream: Stream, generation: u64, capacity: usize) {
        if !self.is_current(generation) {
            log::debug!("Discarding stale WebSocket (generation {generation})");
            return;
        }
        let (mut ws_writer, mut ws_reader) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *lock(&self.outgoing) = Some(out_tx);
        self.alive.store(true, Ordering::SeqCst);
        log::info!("WebSocket open (generation {generation})");
        if let Some(listener) = self.listener() {
            listener.on_open();
        }

        let shared = self.clone();
        tokio::spawn(async move {
            let mut failure = None;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if !shared.is_current(generation) {
                            break;
                        }
                        if let Some(listener) = shared.listener() {
                            listener.on_text_frame(text.as_str());
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        failure = Some(TransportError::Io(e.to_string()));
                        break;
                    }
                }
            }
            shared.finish(generation, failure);
        });
    }

    fn finish(&self, generation: u64, failure: Option<TransportError>) {
        if !self.is_current(generation) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);
        lock(&self.outgoing).take();
        log::info!("WebSocket closed (generation {generation})");
        if let Some(listener) = self.listener() {
            if let Some(error) = failure {
                listener.on_error(&error);
            }
            listener.on_close();
        }
    }
}

/// [`Transport`] backed by a tokio-tungstenite client.
///
/// `open` needs to be called from within a tokio runtime.
pub struct WebSocketTransport {
    capacity: usize,
    shared: Arc<Shared>,
}

impl WebSocketTransport {
    /// `capacity` bounds the outgoing frame buffer; `send` fails fast when
    /// it is full.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            shared: Arc::new(Shared {
                listener: RwLock::new(None),
                outgoing: Mutex::new(None),
                alive: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Transport for WebSocketTransport {
    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *write(&self.shared.listener) = Some(listener);
    }

    fn open(&self, url: &str) -> Result<(), TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let generation = self.shared.retire();
        let shared = self.shared.clone();
        let capacity = self.capacity;
        let url = url.to_string();

        runtime.spawn(async move {
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((stream, _)) => shared.start(stream, generation, capacity),
                Err(e) => {
                    log::warn!("WebSocket connect to {url} failed: {e}");
                    shared.finish(generation, Some(TransportError::Connect(e.to_string())));
                }
            }
        });
        Ok(())
    }

    fn open_async<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let generation = self.shared.retire();
            let (stream, _) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            self.shared.start(stream, generation, self.capacity);
            Ok(())
        })
    }

    fn close(&self) {
        if self.shared.alive.load(Ordering::SeqCst) {
            log::debug!("Closing WebSocket");
        }
        self.shared.retire();
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    fn send(&self, text: String) -> Result<(), TransportError> {
        let outgoing = lock(&self.shared.outgoing);
        let Some(tx) = outgoing.as_ref() else {
            return Err(TransportError::NotAlive);
        };
        tx.try_send(Message::text(text)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::Send("outgoing buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::NotAlive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transport_is_not_alive() {
        let transport = WebSocketTransport::new(8);
        assert!(!transport.is_alive());
        assert_eq!(transport.send("x".into()), Err(TransportError::NotAlive));
    }

    #[test]
    fn test_open_outside_runtime_fails() {
        let transport = WebSocketTransport::default();
        assert!(matches!(
            transport.open("ws://127.0.0.1:1/websocket"),
            Err(TransportError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn test_open_async_reports_connect_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = WebSocketTransport::default();
        let result = transport.open_async(&format!("ws://127.0.0.1:{port}/websocket")).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert!(!transport.is_alive());
    }

    #[test]
    fn test_close_bumps_generation() {
        let transport = WebSocketTransport::default();
        transport.close();
        transport.close();
        assert_eq!(transport.shared.generation.load(Ordering::SeqCst), 2);
        assert!(!transport.shared.is_current(1));
    }
}
