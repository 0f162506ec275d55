//! DDP connection: session handshake, inbound routing and the outbound API.
//!
//! ```text
//!           connect()           on_open / send connect
//!   Idle ──────────────► Opening ─────────────────────► AwaitingHandshake
//!                                                          │        │
//!                                              connected   │        │ failed
//!                                                          ▼        ▼
//!                                  Closed ◄──────────── Connected  Failed
//!                                      transport close / close()
//! ```
//!
//! Every inbound frame is handled synchronously on the transport's callback:
//! the envelope is parsed, then routed to the method registry, the
//! subscription registry, the collection engine or the keep-alive handler.
//! Frames that cannot be parsed or routed are dropped.
//!
//! Outbound calls may come from any thread. Locks are never held while a
//! user callback runs.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::auth::{LoginCredential, LoginToken, LOGIN_METHOD};
use crate::collections::{CollectionObserver, CollectionSyncEngine, ObserverId};
use crate::config::ConnectionConfig;
use crate::error::DdpError;
use crate::listeners::{lock, ListenerId, Listeners};
use crate::methods::{CallError, CallOutcome, Completion, MethodRegistry, RemoteError};
use crate::protocol::{
    ClientMessage, ConnectedMessage, Envelope, FailedMessage, HeartbeatMessage, MessageKind,
    NoSubMessage, ReadyMessage, ResultMessage, ServerErrorMessage, UpdatedMessage,
};
use crate::subscriptions::{StopCause, SubscriptionHandle, SubscriptionRegistry};
use crate::transport::{Transport, TransportError, TransportListener};
use crate::websocket::WebSocketTransport;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, never opened
    Idle,
    /// Transport open requested
    Opening,
    /// `connect` sent, waiting for `connected` or `failed`
    AwaitingHandshake,
    /// Session established
    Connected,
    /// Transport closed, locally or by the peer
    Closed,
    /// The server rejected every offered protocol version
    Failed,
}

/// Session data established by the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub session_id: String,
    pub version: String,
}

/// Handshake rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeFailure {
    /// Version the server asked for.
    pub server_version: String,
    /// Versions the client offered.
    pub offered: Vec<String>,
}

/// Session state, replaced on each handshake.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    /// Server-issued id; resent in the next `connect` to resume.
    pub session_id: Option<String>,
    pub supported_versions: Vec<String>,
    pub negotiated_version: Option<String>,
    pub failure: Option<HandshakeFailure>,
}

/// Events delivered to connection listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Handshake outcome
    Connected(Result<SessionInfo, HandshakeFailure>),
    /// Transport closed; pending calls and subscriptions have been failed
    Closed,
    /// Transport failure, passed through verbatim
    Error(TransportError),
    /// Answer to a `ping`, with the id it carried
    Pong(Option<String>),
    /// Outcome of a `login` call
    LoginResult(Result<LoginToken, CallError>),
    /// Writes of these method ids are reflected in the data sent so far
    Updated(Vec<String>),
    /// The server rejected a client message
    ServerError {
        reason: Option<String>,
        offending_message: Option<Value>,
    },
}

struct ConnectionInner {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
    session: Mutex<Session>,
    login: Mutex<Option<LoginToken>>,
    methods: MethodRegistry,
    subscriptions: SubscriptionRegistry,
    collections: CollectionSyncEngine,
    listeners: Listeners<ConnectionEvent>,
}

/// Transport listener bound to a connection without owning it.
struct Dispatcher {
    inner: Weak<ConnectionInner>,
}

impl TransportListener for Dispatcher {
    fn on_open(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_open();
        }
    }

    fn on_close(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_closed();
        }
    }

    fn on_error(&self, error: &TransportError) {
        if let Some(inner) = self.inner.upgrade() {
            log::warn!("Transport error: {error}");
            inner.emit(ConnectionEvent::Error(error.clone()));
        }
    }

    fn on_text_frame(&self, text: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_frame(text);
        }
    }
}

/// A DDP client connection. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Bind a connection to `transport`. Nothing is sent until [`connect`].
    ///
    /// [`connect`]: Connection::connect
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        let session = Session {
            session_id: config.session.clone(),
            supported_versions: config.supported_versions.clone(),
            ..Session::default()
        };
        let inner = Arc::new(ConnectionInner {
            config,
            transport: transport.clone(),
            state: Mutex::new(ConnectionState::Idle),
            session: Mutex::new(session),
            login: Mutex::new(None),
            methods: MethodRegistry::new(),
            subscriptions: SubscriptionRegistry::new(),
            collections: CollectionSyncEngine::new(),
            listeners: Listeners::new(),
        });
        transport.set_listener(Arc::new(Dispatcher {
            inner: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    /// Connection over a [`WebSocketTransport`].
    pub fn websocket(config: ConnectionConfig) -> Self {
        let transport = Arc::new(WebSocketTransport::new(config.outgoing_capacity));
        Self::new(config, transport)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn session(&self) -> Session {
        lock(&self.inner.session).clone()
    }

    /// Session id and version of the current handshake, once connected.
    pub fn session_info(&self) -> Option<SessionInfo> {
        if !self.is_connected() {
            return None;
        }
        let session = lock(&self.inner.session);
        Some(SessionInfo {
            session_id: session.session_id.clone()?,
            version: session.negotiated_version.clone()?,
        })
    }

    /// Token from the last successful login.
    pub fn login_token(&self) -> Option<LoginToken> {
        lock(&self.inner.login).clone()
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Start opening the transport and return. The handshake runs once the
    /// transport reports open; watch for [`ConnectionEvent::Connected`].
    ///
    /// Allowed from `Idle`, `Closed` and `Failed`. A session id from the
    /// previous handshake is offered for resumption.
    pub fn connect(&self) -> Result<(), DdpError> {
        self.inner.begin_open()?;
        if let Err(e) = self.inner.transport.open(&self.inner.config.url) {
            self.inner.abort_open();
            return Err(e.into());
        }
        Ok(())
    }

    /// Like [`connect`](Connection::connect), but resolves once the
    /// transport is open and `connect` has been sent.
    pub async fn connect_async(&self) -> Result<(), DdpError> {
        self.inner.begin_open()?;
        if let Err(e) = self.inner.transport.open_async(&self.inner.config.url).await {
            self.inner.abort_open();
            return Err(e.into());
        }
        Ok(())
    }

    /// Close the transport. Pending calls fail with
    /// [`CallError::ConnectionClosed`] and live subscriptions stop.
    pub fn close(&self) {
        self.inner.transport.close();
        self.inner.handle_closed();
    }

    // ─── Events ─────────────────────────────────────────────────────

    pub fn add_listener(
        &self,
        callback: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.listeners.add(callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Stream of every event from now on. The backing listener goes away
    /// with the first event after the receiver is dropped.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let own_id: Arc<OnceLock<ListenerId>> = Arc::new(OnceLock::new());
        let weak = Arc::downgrade(&self.inner);
        let slot = own_id.clone();
        let id = self.inner.listeners.add(move |event: &ConnectionEvent| {
            if tx.send(event.clone()).is_err() {
                if let (Some(inner), Some(id)) = (weak.upgrade(), slot.get()) {
                    inner.listeners.remove(*id);
                }
            }
        });
        let _ = own_id.set(id);
        rx
    }

    // ─── Methods ────────────────────────────────────────────────────

    /// Fire-and-forget call. Returns the correlation id.
    pub fn call(&self, method: &str, params: Vec<Value>) -> Result<String, DdpError> {
        self.inner.call(method, params, None)
    }

    /// Call `method`; `on_result` runs exactly once with the result or the
    /// remote error, or with [`CallError::ConnectionClosed`] if the
    /// connection closes first.
    pub fn call_with<F>(&self, method: &str, params: Vec<Value>, on_result: F) -> Result<String, DdpError>
    where
        F: FnOnce(CallOutcome) + Send + 'static,
    {
        self.inner.call(method, params, Some(Box::new(on_result)))
    }

    /// Like [`call_with`](Connection::call_with), decoding the result as `T`.
    pub fn call_typed<T, F>(&self, method: &str, params: Vec<Value>, on_result: F) -> Result<String, DdpError>
    where
        T: DeserializeOwned,
        F: FnOnce(Result<T, CallError>) + Send + 'static,
    {
        self.call_with(method, params, move |outcome| {
            on_result(outcome.and_then(|value| {
                serde_json::from_value(value).map_err(|e| CallError::Decode(e.to_string()))
            }))
        })
    }

    /// Call `method` and await its outcome.
    pub async fn call_async(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        let (tx, rx) = oneshot::channel();
        self.call_with(method, params, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        rx.await.unwrap_or(Err(CallError::ConnectionClosed))
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.methods.len()
    }

    // ─── Login ──────────────────────────────────────────────────────

    /// Issue a `login` call. The outcome arrives as
    /// [`ConnectionEvent::LoginResult`].
    pub fn login(&self, credential: &LoginCredential) -> Result<String, DdpError> {
        let weak = Arc::downgrade(&self.inner);
        let completion: Completion = Box::new(move |outcome| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_login(outcome);
            }
        });
        self.inner
            .call(LOGIN_METHOD, vec![credential.to_params()], Some(completion))
    }

    pub fn login_with_username(&self, username: &str, password: &str) -> Result<String, DdpError> {
        self.login(&LoginCredential::username(username, password))
    }

    pub fn login_with_email(&self, email: &str, password: &str) -> Result<String, DdpError> {
        self.login(&LoginCredential::email(email, password))
    }

    pub fn login_with_token(&self, token: &str) -> Result<String, DdpError> {
        self.login(&LoginCredential::token(token))
    }

    // ─── Subscriptions ──────────────────────────────────────────────

    /// Send `sub` and return its handle in `Requested` state.
    ///
    /// Fails with [`DdpError::NotConnected`] when the transport is down;
    /// nothing is queued.
    pub fn subscribe(&self, name: &str, params: Vec<Value>) -> Result<SubscriptionHandle, DdpError> {
        self.inner.ensure_sendable()?;
        let handle = self.inner.subscriptions.create(name, params);
        let sent = self.inner.send(&ClientMessage::Sub {
            id: handle.id(),
            name: handle.name(),
            params: handle.params(),
        });
        if let Err(e) = sent {
            self.inner.subscriptions.remove(handle.id());
            return Err(e);
        }
        Ok(handle)
    }

    /// Send `unsub`. The handle stays in its current state until the
    /// server answers with `nosub`.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), DdpError> {
        self.inner.ensure_sendable()?;
        self.inner.send(&ClientMessage::Unsub { id: handle.id() })
    }

    pub fn subscription(&self, id: &str) -> Option<SubscriptionHandle> {
        self.inner.subscriptions.get(id)
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionHandle> {
        self.inner.subscriptions.handles()
    }

    // ─── Collections ────────────────────────────────────────────────

    pub fn register_observer<T, O>(&self, collection: impl Into<String>, observer: Arc<O>) -> ObserverId
    where
        T: DeserializeOwned + 'static,
        O: CollectionObserver<T> + ?Sized + 'static,
    {
        self.inner.collections.register_observer::<T, O>(collection, observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.inner.collections.unregister_observer(id)
    }

    pub fn collections(&self) -> &CollectionSyncEngine {
        &self.inner.collections
    }

    // ─── Keep-alive ─────────────────────────────────────────────────

    /// Send `ping`. The answer arrives as [`ConnectionEvent::Pong`].
    pub fn ping(&self, id: Option<&str>) -> Result<(), DdpError> {
        if !self.inner.transport.is_alive() {
            return Err(DdpError::NotConnected);
        }
        self.inner.send(&ClientMessage::Ping { id })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .field("pending_calls", &self.inner.methods.len())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish()
    }
}

impl ConnectionInner {
    fn emit(&self, event: ConnectionEvent) {
        self.listeners.notify(&event);
    }

    fn set_state(&self, state: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *lock(&self.state), state)
    }

    fn begin_open(&self) -> Result<(), DdpError> {
        let current = *lock(&self.state);
        match current {
            ConnectionState::Idle | ConnectionState::Closed => {}
            ConnectionState::Failed => {
                // The rejected channel may still be up.
                if self.transport.is_alive() {
                    self.transport.close();
                }
                self.handle_closed();
            }
            other => return Err(DdpError::InvalidState(other)),
        }

        let mut state = lock(&self.state);
        match *state {
            ConnectionState::Idle | ConnectionState::Closed => {
                *state = ConnectionState::Opening;
                Ok(())
            }
            other => Err(DdpError::InvalidState(other)),
        }
    }

    fn abort_open(&self) {
        let mut state = lock(&self.state);
        if *state == ConnectionState::Opening {
            *state = ConnectionState::Closed;
        }
    }

    fn ensure_sendable(&self) -> Result<(), DdpError> {
        if *lock(&self.state) == ConnectionState::Failed {
            let server_version = lock(&self.session)
                .failure
                .as_ref()
                .map(|f| f.server_version.clone())
                .unwrap_or_default();
            return Err(DdpError::HandshakeFailed { server_version });
        }
        if !self.transport.is_alive() {
            return Err(DdpError::NotConnected);
        }
        Ok(())
    }

    fn send(&self, message: &ClientMessage<'_>) -> Result<(), DdpError> {
        let frame = message.encode()?;
        log::trace!("→ {frame}");
        self.transport.send(frame)?;
        Ok(())
    }

    fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        completion: Option<Completion>,
    ) -> Result<String, DdpError> {
        self.ensure_sendable()?;
        let id = self.methods.next_id();
        let tracked = completion.is_some();
        // Registered before sending so a fast result always finds it.
        if let Some(completion) = completion {
            self.methods.register(id.clone(), completion);
        }
        let sent = self.send(&ClientMessage::Method {
            method,
            params: &params,
            id: &id,
        });
        if let Err(e) = sent {
            if tracked {
                self.methods.unregister(&id);
            }
            return Err(e);
        }
        Ok(id)
    }

    fn handle_login(&self, outcome: CallOutcome) {
        let result = outcome.and_then(|value| {
            serde_json::from_value::<LoginToken>(value).map_err(|e| CallError::Decode(e.to_string()))
        });
        match &result {
            Ok(token) => {
                log::info!("Logged in as {}", token.id);
                *lock(&self.login) = Some(token.clone());
            }
            Err(e) => log::info!("Login failed: {e}"),
        }
        self.emit(ConnectionEvent::LoginResult(result));
    }

    // ─── Inbound ────────────────────────────────────────────────────

    fn handle_open(&self) {
        let session = {
            let mut session = lock(&self.session);
            session.failure = None;
            session.negotiated_version = None;
            session.session_id.clone()
        };
        self.set_state(ConnectionState::AwaitingHandshake);
        let connect = ClientMessage::Connect {
            version: self.config.preferred_version(),
            support: &self.config.supported_versions,
            session: session.as_deref(),
        };
        log::debug!("Transport open; sending connect (resume: {session:?})");
        if let Err(e) = self.send(&connect) {
            log::warn!("Failed to send connect: {e}");
        }
    }

    fn handle_closed(&self) {
        let previous = {
            let mut state = lock(&self.state);
            let previous = *state;
            if matches!(previous, ConnectionState::Idle | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closed;
            previous
        };
        let failed = self.methods.fail_all(CallError::ConnectionClosed);
        let stopped = self.subscriptions.stop_all(StopCause::ConnectionClosed);
        log::info!(
            "Connection closed from {previous:?}: {failed} pending calls failed, {stopped} subscriptions stopped"
        );
        self.emit(ConnectionEvent::Closed);
    }

    fn handle_frame(&self, text: &str) {
        log::trace!("← {text}");
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::debug!("Dropping frame: {e}");
                return;
            }
        };

        match envelope.kind {
            kind if kind.is_collection_diff() => {
                self.collections.dispatch(&envelope);
            }
            MessageKind::Connected => {
                if let Some(msg) = decode_or_drop::<ConnectedMessage>(&envelope) {
                    self.handle_connected(msg);
                }
            }
            MessageKind::Failed => {
                if let Some(msg) = decode_or_drop::<FailedMessage>(&envelope) {
                    self.handle_failed(msg);
                }
            }
            MessageKind::Ping => {
                if let Some(msg) = decode_or_drop::<HeartbeatMessage>(&envelope) {
                    if let Err(e) = self.send(&ClientMessage::Pong { id: msg.id.as_deref() }) {
                        log::warn!("Failed to answer ping: {e}");
                    }
                }
            }
            MessageKind::Pong => {
                if let Some(msg) = decode_or_drop::<HeartbeatMessage>(&envelope) {
                    self.emit(ConnectionEvent::Pong(msg.id));
                }
            }
            MessageKind::Result => {
                if let Some(msg) = decode_or_drop::<ResultMessage>(&envelope) {
                    self.methods.resolve(msg);
                }
            }
            MessageKind::Updated => {
                if let Some(msg) = decode_or_drop::<UpdatedMessage>(&envelope) {
                    self.emit(ConnectionEvent::Updated(msg.methods));
                }
            }
            MessageKind::Ready => {
                if let Some(msg) = decode_or_drop::<ReadyMessage>(&envelope) {
                    self.subscriptions.mark_ready(&msg.subs);
                }
            }
            MessageKind::NoSub => {
                if let Some(msg) = decode_or_drop::<NoSubMessage>(&envelope) {
                    let error = msg.error.map(RemoteError::from_value);
                    self.subscriptions.mark_stopped(&msg.id, error);
                }
            }
            MessageKind::Error => {
                if let Some(msg) = decode_or_drop::<ServerErrorMessage>(&envelope) {
                    log::warn!("Server rejected a message: {:?}", msg.reason);
                    self.emit(ConnectionEvent::ServerError {
                        reason: msg.reason,
                        offending_message: msg.offending_message,
                    });
                }
            }
            // connect / method / sub / unsub only travel client to server.
            other => {
                log::debug!("Dropping client-only message kind {other}");
            }
        }
    }

    fn handle_connected(&self, msg: ConnectedMessage) {
        {
            let mut state = lock(&self.state);
            if *state != ConnectionState::AwaitingHandshake {
                log::debug!("Ignoring connected while {:?}", *state);
                return;
            }
            *state = ConnectionState::Connected;
        }
        let version = self.config.preferred_version().to_string();
        {
            let mut session = lock(&self.session);
            session.session_id = Some(msg.session.clone());
            session.negotiated_version = Some(version.clone());
            session.failure = None;
        }
        log::info!("Connected: session {} (version {version})", msg.session);
        self.emit(ConnectionEvent::Connected(Ok(SessionInfo {
            session_id: msg.session,
            version,
        })));
    }

    fn handle_failed(&self, msg: FailedMessage) {
        {
            let mut state = lock(&self.state);
            if *state != ConnectionState::AwaitingHandshake {
                log::debug!("Ignoring failed while {:?}", *state);
                return;
            }
            *state = ConnectionState::Failed;
        }
        let failure = HandshakeFailure {
            server_version: msg.version,
            offered: self.config.supported_versions.clone(),
        };
        lock(&self.session).failure = Some(failure.clone());
        let failed = self.methods.fail_all(CallError::HandshakeFailed {
            server_version: failure.server_version.clone(),
        });
        log::warn!(
            "Handshake failed: server wants version {}, offered {:?}; {failed} pending calls failed",
            failure.server_version,
            failure.offered
        );
        self.emit(ConnectionEvent::Connected(Err(failure)));
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if self.transport.is_alive() {
            self.transport.close();
        }
    }
}

fn decode_or_drop<T: DeserializeOwned>(envelope: &Envelope) -> Option<T> {
    match envelope.decode() {
        Ok(msg) => Some(msg),
        Err(e) => {
            log::debug!("Dropping frame: {e}");
            None
        }
    }
}
