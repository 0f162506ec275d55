//! # ddp-client — DDP (Distributed Data Protocol) client
//!
//! One persistent message channel carries remote method calls, live-query
//! subscriptions and the collection diffs that keep a local cache in sync
//! with the server.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  text frames  ┌──────────────┐
//! │ Transport  │ ────────────► │ Envelope     │
//! │ (WebSocket)│ ◄──────────── │ reader       │
//! └────────────┘               └──────┬───────┘
//!                                     │ dispatch by `msg`
//!        ┌───────────────┬────────────┼──────────────┬─────────────┐
//!        ▼               ▼            ▼              ▼             ▼
//!  ┌───────────┐  ┌─────────────┐ ┌──────────┐ ┌────────────┐ ┌──────────┐
//!  │ handshake │  │ Method      │ │ Subscr.  │ │ Collection │ │ ping /   │
//!  │ (session) │  │ registry    │ │ registry │ │ sync engine│ │ pong     │
//!  └───────────┘  └─────────────┘ └──────────┘ └─────┬──────┘ └──────────┘
//!                                                    ▼
//!                                             observers / cache
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Message kinds, envelope reader, outbound encoding
//! - [`connection`] — Handshake state machine and public call surface
//! - [`methods`] — Method call correlation
//! - [`subscriptions`] — Subscription lifecycle
//! - [`collections`] — Diff fan-out to collection observers
//! - [`cache`] — Ordered in-memory collection kept by diffs
//! - [`transport`] / [`websocket`] — Transport boundary and implementations
//! - [`ejson`] — `$date` / `$binary` extended values
//! - [`auth`] — Login credentials
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ddp_client::{CollectionCache, Connection, ConnectionConfig, ConnectionEvent};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = Connection::websocket(ConnectionConfig::new("ws://localhost:3000/websocket"));
//! let mut events = conn.events();
//! conn.connect_async().await?;
//! if let Some(ConnectionEvent::Connected(Ok(session))) = events.recv().await {
//!     println!("session {}", session.session_id);
//! }
//!
//! let tasks = Arc::new(CollectionCache::new("tasks"));
//! conn.register_observer::<serde_json::Value, _>("tasks", tasks.clone());
//! conn.subscribe("tasks.open", vec![])?.wait_ready().await?;
//! println!("{} open tasks", tasks.len());
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod cache;
pub mod collections;
pub mod config;
pub mod connection;
pub mod ejson;
pub mod error;
pub mod listeners;
pub mod methods;
pub mod protocol;
pub mod subscriptions;
pub mod transport;
pub mod websocket;

// Re-exports for convenience
pub use auth::{LoginCredential, LoginToken};
pub use cache::CollectionCache;
pub use collections::{CollectionDiff, CollectionObserver, CollectionSyncEngine, FieldChanges, ObserverId};
pub use config::ConnectionConfig;
pub use connection::{
    Connection, ConnectionEvent, ConnectionState, HandshakeFailure, Session, SessionInfo,
};
pub use error::DdpError;
pub use listeners::{ListenerId, Listeners};
pub use methods::{CallError, CallOutcome, MethodRegistry, RemoteError};
pub use protocol::{ClientMessage, Envelope, MessageKind, ProtocolError};
pub use subscriptions::{StopCause, SubscriptionHandle, SubscriptionRegistry, SubscriptionState};
pub use transport::{MemoryTransport, Transport, TransportError, TransportListener};
pub use websocket::WebSocketTransport;
