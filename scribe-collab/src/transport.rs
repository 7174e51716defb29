//! The persistent connection to the collaboration server.
//!
//! ```text
//!   DocumentSession ──on/off──┐
//!   CursorBroadcaster ─on/off─┤
//!                             ▼
//!                     HandlerRegistry ◄── dispatch ── reader ◄── WebSocket
//!                             ▲                                     ▲
//!   emit(event, payload) ─────┼────────────── outgoing channel ─────┘
//!                             │
//!         connected / disconnected / connect_error /
//!         max-reconnect-attempts-reached (internal)
//! ```
//!
//! Handlers live in the registry, not on the socket, so they survive
//! reconnects and may be registered before the first connection exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::config::{CollabConfig, ReconnectPolicy};
use crate::editor::CredentialStore;
use crate::error::TransportError;
use crate::protocol::{events, Envelope};

/// Callback invoked with the payload of a named event.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one registration so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Connection state of a [`TransportSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Publish/subscribe view of the server connection.
///
/// Implemented by [`TransportSession`] and by in-process fakes in tests.
pub trait Transport: Send + Sync {
    /// Register `handler` for `event`. Several handlers may share an event.
    fn on(&self, event: &str, handler: Handler) -> HandlerId;

    /// Remove one registration. Returns `false` if it was already gone.
    fn off(&self, event: &str, id: HandlerId) -> bool;

    /// Fire-and-forget send; a logged no-op while disconnected.
    fn emit(&self, event: &str, payload: Value);

    fn is_connected(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn on(&self, event: &str, handler: Handler) -> HandlerId {
        (**self).on(event, handler)
    }

    fn off(&self, event: &str, id: HandlerId) -> bool {
        (**self).off(event, id)
    }

    fn emit(&self, event: &str, payload: Value) {
        (**self).emit(event, payload)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

// ───────────────────────────────────────────────────────────────────
// Handler registry
// ───────────────────────────────────────────────────────────────────

/// Event name → handlers, independent of any live socket.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: &str, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn unregister(&self, event: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    /// Invoke every handler of `event`. Returns how many ran.
    ///
    /// The list is cloned first, so handlers may register or unregister
    /// without deadlocking.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(event)
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.read().get(event).map_or(0, Vec::len)
    }

    /// Registrations across all events.
    pub fn len(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// WebSocket transport
// ───────────────────────────────────────────────────────────────────

/// State shared between the session handle and its connection task.
struct Link {
    state: RwLock<ConnectionState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    session_id: RwLock<Option<String>>,
    /// Bumped by every connect/disconnect; stale tasks stop touching state
    generation: AtomicU64,
}

impl Link {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, generation: u64, state: ConnectionState) {
        if self.is_current(generation) {
            *self.state.write() = state;
        }
    }

    fn mark_connected(&self, generation: u64, tx: mpsc::UnboundedSender<Message>, session_id: String) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        *self.outgoing.lock() = Some(tx);
        *self.session_id.write() = Some(session_id);
        *self.state.write() = ConnectionState::Connected;
        true
    }

    fn mark_disconnected(&self, generation: u64) {
        if self.is_current(generation) {
            self.outgoing.lock().take();
            self.session_id.write().take();
            *self.state.write() = ConnectionState::Disconnected;
        }
    }
}

/// One owned WebSocket connection with automatic reconnection.
///
/// Constructed explicitly and passed to its consumers; call
/// [`dispose`](Self::dispose) at the end of its life.
pub struct TransportSession {
    url: String,
    policy: ReconnectPolicy,
    credentials: Arc<dyn CredentialStore>,
    registry: Arc<HandlerRegistry>,
    link: Arc<Link>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportSession {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            url: url.into(),
            policy,
            credentials,
            registry: Arc::new(HandlerRegistry::new()),
            link: Arc::new(Link {
                state: RwLock::new(ConnectionState::Disconnected),
                outgoing: Mutex::new(None),
                session_id: RwLock::new(None),
                generation: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn from_config(config: &CollabConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        Self::new(config.server_url.clone(), config.reconnect.clone(), credentials)
    }

    /// Start connecting in the background.
    ///
    /// Fails fast without a credential. Already running connections are
    /// left alone. Progress is reported through the internal events.
    pub fn connect(&self) -> Result<(), TransportError> {
        let Some(token) = current_token(self.credentials.as_ref()) else {
            log::warn!("Not connecting to {}: no access credential", self.url);
            return Err(TransportError::MissingCredential);
        };
        build_request(&self.url, &token)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        let generation = self.link.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.link.state.write() = ConnectionState::Connecting;
        log::info!("Connecting to {}", self.url);

        *task = Some(runtime.spawn(run_connection(
            self.url.clone(),
            self.policy.clone(),
            self.credentials.clone(),
            self.registry.clone(),
            self.link.clone(),
            generation,
        )));
        Ok(())
    }

    /// Close the connection and stop reconnecting. Handlers stay registered.
    pub fn disconnect(&self) {
        self.link.generation.fetch_add(1, Ordering::SeqCst);
        let was_connected = self.link.outgoing.lock().take().is_some();
        if let Some(handle) = self.task.lock().take() {
            if !was_connected {
                handle.abort();
            }
        }
        self.link.session_id.write().take();
        *self.link.state.write() = ConnectionState::Disconnected;

        if was_connected {
            log::info!("Disconnected from {}", self.url);
            self.registry
                .dispatch(events::DISCONNECTED, &json!({ "reason": "client disconnect" }));
        }
    }

    /// Disconnect and drop every registered handler.
    pub fn dispose(&self) {
        self.disconnect();
        self.registry.clear();
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.link.state.read()
    }

    /// Per-connection id, present while connected.
    pub fn session_id(&self) -> Option<String> {
        self.link.session_id.read().clone()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wait until connected, polling every few milliseconds.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

impl Transport for TransportSession {
    fn on(&self, event: &str, handler: Handler) -> HandlerId {
        self.registry.register(event, handler)
    }

    fn off(&self, event: &str, id: HandlerId) -> bool {
        self.registry.unregister(event, id)
    }

    fn emit(&self, event: &str, payload: Value) {
        let outgoing = self.link.outgoing.lock();
        let Some(tx) = outgoing.as_ref() else {
            log::debug!("Dropping `{event}`: not connected");
            return;
        };
        match Envelope::new(event, payload).encode() {
            Ok(text) => {
                if tx.send(Message::text(text)).is_err() {
                    log::debug!("Dropping `{event}`: connection closing");
                }
            }
            Err(e) => log::warn!("Failed to encode `{event}`: {e}"),
        }
    }

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// In-process transport
// ───────────────────────────────────────────────────────────────────

/// Transport without a network: records what is emitted and lets the
/// caller deliver inbound events by hand.
///
/// Used by headless hosts and tests to drive sessions deterministically.
#[derive(Default)]
pub struct MemoryTransport {
    registry: HandlerRegistry,
    connected: std::sync::atomic::AtomicBool,
    sent: Mutex<Vec<Envelope>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Already connected, without announcing it.
    pub fn connected() -> Self {
        let transport = Self::default();
        transport.connected.store(true, Ordering::SeqCst);
        transport
    }

    /// Become connected and dispatch the `connected` notification.
    pub fn open(&self, session_id: &str) {
        self.connected.store(true, Ordering::SeqCst);
        self.registry
            .dispatch(events::CONNECTED, &json!({ "sessionId": session_id }));
    }

    /// Become disconnected and dispatch the `disconnected` notification.
    pub fn close(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.registry
            .dispatch(events::DISCONNECTED, &json!({ "reason": reason }));
    }

    /// Deliver an inbound event. Returns how many handlers ran.
    pub fn deliver(&self, event: &str, payload: Value) -> usize {
        self.registry.dispatch(event, &payload)
    }

    /// Every frame emitted while connected, oldest first.
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    /// Payloads emitted under `event`.
    pub fn sent_payloads(&self, event: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|frame| frame.event == event)
            .map(|frame| frame.data.clone())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }
}

impl Transport for MemoryTransport {
    fn on(&self, event: &str, handler: Handler) -> HandlerId {
        self.registry.register(event, handler)
    }

    fn off(&self, event: &str, id: HandlerId) -> bool {
        self.registry.unregister(event, id)
    }

    fn emit(&self, event: &str, payload: Value) {
        if !self.is_connected() {
            log::debug!("Dropping `{event}`: not connected");
            return;
        }
        self.sent.lock().push(Envelope::new(event, payload));
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn current_token(credentials: &dyn CredentialStore) -> Option<String> {
    credentials.access_token().filter(|token| !token.is_empty())
}

fn build_request(url: &str, token: &str) -> Result<Request, TransportError> {
    let invalid = |reason: String| TransportError::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let mut request = url.into_client_request().map_err(|e| invalid(e.to_string()))?;
    let header = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| invalid(e.to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, header);
    Ok(request)
}

/// Connect, pump frames, reconnect with backoff until the policy gives up
/// or the session moves to a newer generation.
async fn run_connection(
    url: String,
    policy: ReconnectPolicy,
    credentials: Arc<dyn CredentialStore>,
    registry: Arc<HandlerRegistry>,
    link: Arc<Link>,
    generation: u64,
) {
    let mut failures = 0u32;

    while link.is_current(generation) {
        let attempt = match current_token(credentials.as_ref()) {
            None => Err(TransportError::MissingCredential),
            Some(token) => match build_request(&url, &token) {
                Ok(request) => tokio_tungstenite::connect_async(request)
                    .await
                    .map_err(|e| TransportError::Connect(e.to_string())),
                Err(e) => Err(e),
            },
        };

        match attempt {
            Ok((stream, _)) => {
                failures = 0;
                let reason = pump(stream, &registry, &link, generation).await;
                if !link.is_current(generation) {
                    return;
                }
                link.mark_disconnected(generation);
                log::info!("Connection to {url} lost: {reason}");
                registry.dispatch(events::DISCONNECTED, &json!({ "reason": reason }));
            }
            Err(e) => {
                if !link.is_current(generation) {
                    return;
                }
                failures += 1;
                log::warn!("Connection attempt {failures} to {url} failed: {e}");
                registry.dispatch(
                    events::CONNECT_ERROR,
                    &json!({ "message": e.to_string(), "attempt": failures }),
                );
                if failures >= policy.max_attempts {
                    link.set_state(generation, ConnectionState::Disconnected);
                    log::error!("Giving up on {url} after {failures} attempts");
                    registry.dispatch(
                        events::MAX_RECONNECT_ATTEMPTS_REACHED,
                        &json!({ "attempts": failures }),
                    );
                    return;
                }
            }
        }

        link.set_state(generation, ConnectionState::Reconnecting);
        tokio::time::sleep(policy.delay_for(failures.max(1))).await;
    }
}

/// Shuttle frames until either side closes. Returns the close reason.
async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    registry: &HandlerRegistry,
    link: &Link,
    generation: u64,
) -> String {
    let (mut writer, mut reader) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let session_id = Uuid::new_v4().to_string();

    if !link.mark_connected(generation, tx, session_id.clone()) {
        let _ = writer.send(Message::Close(None)).await;
        return "superseded".to_string();
    }
    log::info!("Connected with session {session_id}");
    registry.dispatch(events::CONNECTED, &json!({ "sessionId": session_id }));

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(message) => {
                    if let Err(e) = writer.send(message).await {
                        return format!("send failed: {e}");
                    }
                }
                None => {
                    let _ = writer.send(Message::Close(None)).await;
                    return "client disconnect".to_string();
                }
            },
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => dispatch_frame(registry, text.as_str()),
                Some(Ok(Message::Close(_))) | None => return "server closed the connection".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => return e.to_string(),
            },
        }
    }
}

fn dispatch_frame(registry: &HandlerRegistry, text: &str) {
    match Envelope::decode(text) {
        Ok(envelope) => {
            let handled = registry.dispatch(&envelope.event, &envelope.data);
            if handled == 0 {
                log::trace!("No handler for `{}`", envelope.event);
            }
        }
        Err(e) => log::warn!("Ignoring undecodable frame: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::StaticCredentials;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Handler) {
        let hits = Arc::new(AtomicUsize::new(0));
        let clone = hits.clone();
        let handler: Handler = Arc::new(move |_: &Value| {
            clone.fetch_add(1, Ordering::SeqCst);
        });
        (hits, handler)
    }

    #[test]
    fn test_registry_multiple_handlers_per_event() {
        let registry = HandlerRegistry::new();
        let (a_hits, a) = counter();
        let (b_hits, b) = counter();
        let a_id = registry.register("cursor:moved", a);
        registry.register("cursor:moved", b);

        assert_eq!(registry.dispatch("cursor:moved", &Value::Null), 2);
        assert!(registry.unregister("cursor:moved", a_id));
        assert!(!registry.unregister("cursor:moved", a_id));
        assert_eq!(registry.dispatch("cursor:moved", &Value::Null), 1);

        assert_eq!(a_hits.load(Ordering::SeqCst), 1);
        assert_eq!(b_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_registry_unknown_event() {
        let registry = HandlerRegistry::new();
        assert_eq!(registry.dispatch("nothing", &Value::Null), 0);
        assert!(!registry.unregister("nothing", HandlerId(7)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_handler_may_unregister_itself() {
        let registry = Arc::new(HandlerRegistry::new());
        let slot: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));
        let reg = registry.clone();
        let slot_clone = slot.clone();
        let id = registry.register(
            "once",
            Arc::new(move |_: &Value| {
                if let Some(id) = *slot_clone.lock() {
                    reg.unregister("once", id);
                }
            }),
        );
        *slot.lock() = Some(id);
        assert_eq!(registry.dispatch("once", &Value::Null), 1);
        assert_eq!(registry.handler_count("once"), 0);
    }

    #[test]
    fn test_connect_without_credential_fails_fast() {
        let session = TransportSession::new(
            "ws://127.0.0.1:1",
            ReconnectPolicy::default(),
            Arc::new(StaticCredentials::none()),
        );
        assert_eq!(session.connect(), Err(TransportError::MissingCredential));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);

        let empty = TransportSession::new(
            "ws://127.0.0.1:1",
            ReconnectPolicy::default(),
            Arc::new(StaticCredentials::new("")),
        );
        assert_eq!(empty.connect(), Err(TransportError::MissingCredential));
    }

    #[test]
    fn test_connect_rejects_bad_url() {
        let session = TransportSession::new(
            "not a url",
            ReconnectPolicy::default(),
            Arc::new(StaticCredentials::new("token")),
        );
        assert!(matches!(session.connect(), Err(TransportError::InvalidUrl { .. })));
    }

    #[test]
    fn test_emit_while_disconnected_is_noop() {
        let session = TransportSession::new(
            "ws://127.0.0.1:1",
            ReconnectPolicy::default(),
            Arc::new(StaticCredentials::new("token")),
        );
        session.emit(events::DOCUMENT_EDIT, json!({ "noteId": "n" }));
        assert!(!session.is_connected());
    }

    #[test]
    fn test_handlers_registered_before_connect_survive_disconnect() {
        let session = TransportSession::new(
            "ws://127.0.0.1:1",
            ReconnectPolicy::default(),
            Arc::new(StaticCredentials::new("token")),
        );
        let (_, handler) = counter();
        let id = session.on(events::DOCUMENT_UPDATED, handler);
        session.disconnect();
        assert_eq!(session.registry().handler_count(events::DOCUMENT_UPDATED), 1);
        assert!(session.off(events::DOCUMENT_UPDATED, id));

        let (_, handler) = counter();
        session.on(events::DOCUMENT_UPDATED, handler);
        session.dispose();
        assert!(session.registry().is_empty());
    }

    #[test]
    fn test_memory_transport_records_only_while_connected() {
        let transport = MemoryTransport::new();
        transport.emit(events::CURSOR_UPDATE, json!({ "noteId": "n" }));
        assert!(transport.sent().is_empty());

        let (opened, on_open) = counter();
        transport.on(events::CONNECTED, on_open);
        transport.open("sock-1");
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        transport.emit(events::CURSOR_UPDATE, json!({ "noteId": "n" }));
        assert_eq!(transport.sent_payloads(events::CURSOR_UPDATE).len(), 1);
        transport.close("test");
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_bearer_header_attached() {
        let request = build_request("ws://127.0.0.1:5000/", "abc").unwrap();
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer abc");
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        // Reserve a port, then free it so nothing is listening
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let policy = ReconnectPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        };
        let session = TransportSession::new(
            format!("ws://127.0.0.1:{port}"),
            policy,
            Arc::new(StaticCredentials::new("token")),
        );

        let (errors, on_error) = counter();
        let (gave_up, on_give_up) = counter();
        session.on(events::CONNECT_ERROR, on_error);
        session.on(events::MAX_RECONNECT_ATTEMPTS_REACHED, on_give_up);

        session.connect().unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while gave_up.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(gave_up.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }
}
