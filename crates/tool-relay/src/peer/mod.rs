//! The peer-side request/response multiplexer used by both providers and
//! callers (spec §4.3).
//!
//! Correlation of outbound requests with their eventual responses follows
//! the same discipline as a `oneshot`-per-pending-id map: the id is
//! registered *before* the request is sent so a reply racing the send
//! can never be lost, and a timeout simply removes the entry — whichever
//! of "response arrives" or "timer fires" wins the race, the loser finds
//! nothing left to act on.

pub mod browser;
mod state;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Buf;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::config::PeerConfig;
use crate::error::{ErrorKind, PeerError};
use crate::protocol::{ContentItem, ErrorObject, Message, MessageId, RawMessage, ToolDescriptor};

pub use state::ConnectionState;

/// Loose return type produced by a registered handler, bridged to the
/// fixed content-item union by [`normalize`].
#[derive(Debug, Clone)]
pub enum HandlerValue {
    /// Already a list of content items — passed through unchanged.
    Content(Vec<ContentItem>),
    /// A bare string — text, unless it looks like image data.
    Text(String),
    /// Anything else — JSON-serialized into a text item.
    Json(serde_json::Value),
}

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type HandlerFn = Arc<dyn Fn(serde_json::Value) -> BoxFuture<Result<HandlerValue, PeerError>> + Send + Sync>;

/// An observation delivered to subscribers of the peer's event stream
/// (spec §9 "Event emission").
#[derive(Debug, Clone)]
pub enum Observation {
    Connect { peer_id: String },
    Disconnect,
    Error { message: String },
    Message { method: String },
    ToolCall { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Error,
    Message,
    ToolCall,
}

pub type Observer = Box<dyn Fn(&Observation) + Send + Sync>;

/// Peer role, mirrored from `relay::session::Role` to keep the peer crate
/// module independent of the relay's internal session bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Provider,
    Caller,
}

struct Inner {
    config: PeerConfig,
    client: reqwest::Client,
    role: Role,
    nonce: String,
    id_counter: AtomicU64,
    state: Mutex<ConnectionState>,
    peer_id: Mutex<Option<String>>,
    session_id: Mutex<Option<String>>,
    pending: Mutex<HashMap<MessageId, oneshot::Sender<Message>>>,
    handlers: Mutex<HashMap<String, HandlerFn>>,
    tools: Mutex<Vec<ToolDescriptor>>,
    observers: Mutex<HashMap<EventKind, Vec<Observer>>>,
    reader_task: Mutex<Option<AbortHandle>>,
    reconnect_attempts: AtomicU32,
}

/// Library used by both provider and caller peers to attach to the relay,
/// post requests, and dispatch inbound requests to a handler table.
#[derive(Clone)]
pub struct PeerMultiplexer {
    inner: Arc<Inner>,
}

impl PeerMultiplexer {
    #[must_use]
    pub fn new(config: PeerConfig, role: Role) -> Self {
        let session_id = config.session_id.clone();
        let inner = Arc::new(Inner {
            config,
            client: reqwest::Client::new(),
            role,
            nonce: uuid::Uuid::new_v4().to_string(),
            id_counter: AtomicU64::new(1),
            state: Mutex::new(ConnectionState::Idle),
            peer_id: Mutex::new(None),
            session_id: Mutex::new(session_id),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            tools: Mutex::new(Vec::new()),
            observers: Mutex::new(HashMap::new()),
            reader_task: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
        });
        Self { inner }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    #[must_use]
    pub fn peer_id(&self) -> Option<String> {
        self.inner.peer_id.lock().unwrap().clone()
    }

    #[must_use]
    pub fn tool_names(&self) -> Vec<String> {
        self.inner.tools.lock().unwrap().iter().map(|t| t.name.clone()).collect()
    }

    /// Register a named handler. A tool catalogue entry is added alongside
    /// it when `descriptor` is given, so a later `register_tools(None)`
    /// picks it up automatically (spec §4.3 `registerHandler`).
    pub fn register_handler<F, Fut>(&self, method: impl Into<String>, descriptor: Option<ToolDescriptor>, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerValue, PeerError>> + Send + 'static,
    {
        let method = method.into();
        let boxed: HandlerFn = Arc::new(move |params| Box::pin(handler(params)));
        self.inner.handlers.lock().unwrap().insert(method, boxed);
        if let Some(descriptor) = descriptor {
            self.inner.tools.lock().unwrap().push(descriptor);
        }
    }

    pub fn subscribe(&self, kind: EventKind, observer: Observer) {
        self.inner.observers.lock().unwrap().entry(kind).or_default().push(observer);
    }

    fn emit(&self, kind: EventKind, observation: Observation) {
        if let Some(observers) = self.inner.observers.lock().unwrap().get(&kind) {
            for observer in observers {
                observer(&observation);
            }
        }
    }

    fn next_id(&self) -> MessageId {
        let n = self.inner.id_counter.fetch_add(1, Ordering::SeqCst);
        MessageId::String(format!("peer-{}-{n}", self.inner.nonce))
    }

    /// Open the push-channel connection, retrying with exponential backoff
    /// when `autoReconnect` is set (spec §4.3 `attach`).
    pub async fn attach(&self) -> Result<(), PeerError> {
        *self.inner.state.lock().unwrap() = ConnectionState::Connecting;
        self.reconnect_loop().await
    }

    /// Retry `open_stream` with exponential backoff until it succeeds or
    /// the attempt budget is exhausted (spec §4.3 `Disconnected →
    /// Reconnecting → Connecting`). Shared by the initial `attach()` and by
    /// `on_transport_closed` re-entering the same loop after an established
    /// connection drops.
    async fn reconnect_loop(&self) -> Result<(), PeerError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.open_stream().await {
                Ok(()) => {
                    *self.inner.state.lock().unwrap() = ConnectionState::Connected;
                    self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) => {
                    if !self.inner.config.auto_reconnect || attempt >= self.inner.config.max_reconnect_attempts {
                        *self.inner.state.lock().unwrap() = ConnectionState::Terminal;
                        return Err(e);
                    }
                    *self.inner.state.lock().unwrap() = ConnectionState::Reconnecting;
                    self.inner.reconnect_attempts.store(attempt, Ordering::SeqCst);
                    let delay = self.inner.config.reconnect_base_delay * 2u32.pow(attempt - 1);
                    tokio::time::sleep(delay).await;
                    *self.inner.state.lock().unwrap() = ConnectionState::Connecting;
                }
            }
        }
    }

    async fn open_stream(&self) -> Result<(), PeerError> {
        let session_id = self.inner.session_id.lock().unwrap().clone().unwrap_or_else(|| {
            let generated = uuid::Uuid::new_v4().to_string();
            *self.inner.session_id.lock().unwrap() = Some(generated.clone());
            generated
        });
        let role_param = match self.inner.role {
            Role::Provider => "provider",
            Role::Caller => "caller",
        };
        let url = format!(
            "{}/events?sessionId={session_id}&role={role_param}",
            self.inner.config.server_url
        );

        let response = tokio::time::timeout(
            self.inner.config.connection_timeout,
            self.inner.client.get(&url).send(),
        )
        .await
        .map_err(|_| PeerError::timeout("attach timed out"))?
        .map_err(|e| PeerError::connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PeerError::connection(format!("attach failed: {}", response.status())));
        }

        let byte_stream = Box::pin(response.bytes_stream());
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.read_events(byte_stream).await;
            this.on_transport_closed();
        });
        // A retried open_stream (handshake timeout on the previous attempt)
        // must not leave the earlier reader task running in the background.
        let previous = self.inner.reader_task.lock().unwrap().replace(handle.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }

        // The relay assigns our peer id in the "connected" notification that
        // opens the stream; every subsequent post must carry it, so wait for
        // the reader task to have seen it before declaring the attach done.
        let deadline = tokio::time::Instant::now() + self.inner.config.connection_timeout;
        while self.inner.peer_id.lock().unwrap().is_none() {
            if tokio::time::Instant::now() >= deadline {
                return Err(PeerError::timeout("timed out waiting for connected handshake"));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    async fn read_events(
        &self,
        mut byte_stream: Pin<Box<dyn futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    ) {
        let mut buffer = String::new();
        while let Some(chunk) = byte_stream.next().await {
            let Ok(chunk) = chunk else { break };
            buffer.push_str(&String::from_utf8_lossy(chunk.chunk()));
            while let Some(pos) = buffer.find("\n\n") {
                let frame = buffer[..pos].to_string();
                buffer.drain(..pos + 2);
                self.handle_frame(&frame);
            }
        }
    }

    fn handle_frame(&self, frame: &str) {
        if frame.starts_with(':') {
            return; // heartbeat comment line
        }
        let Some(data_line) = frame.lines().find_map(|l| l.strip_prefix("data: ").or_else(|| l.strip_prefix("data:"))) else {
            return;
        };
        let Ok(raw) = serde_json::from_str::<RawMessage>(data_line) else { return };
        let Ok(message) = Message::classify(raw) else { return };
        self.dispatch_inbound(message);
    }

    fn dispatch_inbound(&self, message: Message) {
        match message {
            Message::Response { id, result, error } => {
                let sender = self.inner.pending.lock().unwrap().remove(&id);
                if let Some(sender) = sender {
                    let _ = sender.send(Message::Response { id, result, error });
                }
            }
            Message::Notification { method, params } => {
                self.emit(EventKind::Message, Observation::Message { method: method.clone() });
                if method == "connected" {
                    if let Some(peer_id) = params.as_ref().and_then(|p| p.get("peerId")).and_then(|v| v.as_str()) {
                        *self.inner.peer_id.lock().unwrap() = Some(peer_id.to_string());
                        self.emit(EventKind::Connect, Observation::Connect { peer_id: peer_id.to_string() });
                    }
                }
            }
            Message::Request { id, method, params } => {
                let this = self.clone();
                tokio::spawn(async move { this.dispatch_request(id, method, params).await });
            }
        }
    }

    async fn dispatch_request(&self, id: MessageId, method: String, params: Option<serde_json::Value>) {
        self.emit(EventKind::Message, Observation::Message { method: method.clone() });

        let response = if method == "tools/call" {
            self.handle_tools_call(id.clone(), params).await
        } else {
            match self.lookup_handler(&method) {
                Some(handler) => {
                    let params = params.unwrap_or(serde_json::Value::Null);
                    match handler(params).await {
                        Ok(value) => Message::success(
                            id.clone(),
                            serde_json::json!({ "content": normalize(value) }),
                        ),
                        Err(e) => Message::failure(id.clone(), ErrorObject::new(e.kind.code(), e.message)),
                    }
                }
                None => Message::failure(
                    id.clone(),
                    ErrorObject::new(ErrorKind::MethodNotFound.code(), format!("method not found: {method}")),
                ),
            }
        };

        let _ = self.post_message(response).await;
    }

    async fn handle_tools_call(&self, id: MessageId, params: Option<serde_json::Value>) -> Message {
        let params = params.unwrap_or(serde_json::Value::Null);
        let name = params.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let arguments = params.get("arguments").cloned().unwrap_or(serde_json::Value::Null);
        self.emit(EventKind::ToolCall, Observation::ToolCall { name: name.clone() });

        let Some(handler) = self.lookup_handler(&name) else {
            let message = format!("tool not found: {name}");
            return Message::Response {
                id,
                result: Some(serde_json::json!({
                    "content": [ContentItem::text(message.as_str())],
                    "isError": true,
                })),
                error: Some(ErrorObject::new(ErrorKind::ToolNotFound.code(), message)),
            };
        };

        match handler(arguments).await {
            Ok(value) => Message::Response {
                id,
                result: Some(serde_json::json!({
                    "content": normalize(value),
                    "isError": false,
                })),
                error: None,
            },
            Err(e) => Message::Response {
                id,
                result: Some(serde_json::json!({
                    "content": [ContentItem::text(e.message.as_str())],
                    "isError": true,
                })),
                error: Some(ErrorObject::new(e.kind.code(), e.message)),
            },
        }
    }

    /// Clone the `Arc` for a registered handler out of the table so it can
    /// be invoked without holding the table lock across the `.await`.
    fn lookup_handler(&self, name: &str) -> Option<HandlerFn> {
        self.inner.handlers.lock().unwrap().get(name).cloned()
    }

    async fn post_message(&self, message: Message) -> Result<(), PeerError> {
        let session_id = self.inner.session_id.lock().unwrap().clone().unwrap_or_default();
        let peer_id = self.peer_id();
        let mut url = format!("{}/message?sessionId={session_id}", self.inner.config.server_url);
        if let Some(peer_id) = peer_id {
            url.push_str(&format!("&peerId={peer_id}"));
        }
        self.inner
            .client
            .post(url)
            .json(&message)
            .send()
            .await
            .map_err(|e| PeerError::connection(e.to_string()))?;
        Ok(())
    }

    /// Send a request and await its correlated response (spec §4.3
    /// `request`).
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, PeerError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id.clone(), tx);

        if let Err(e) = self.post_message(Message::request(id.clone(), method, params)).await {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            // A tool-call failure carries both a populated `result`
            // (content with `isError: true`) and a top-level `error`; the
            // result takes precedence so the caller sees the content. A
            // pure protocol failure (session/timeout/invalid-request) has
            // no result at all, and surfaces as `Err`.
            Ok(Ok(Message::Response { result: Some(result), .. })) => {
                // A successful session/join moves this peer to a new
                // session on the relay; track it so later requests target
                // where we actually ended up rather than the session we
                // first attached under.
                if method == "session/join" {
                    if let Some(new_session) = result.get("sessionId").and_then(|v| v.as_str()) {
                        *self.inner.session_id.lock().unwrap() = Some(new_session.to_string());
                    }
                }
                Ok(result)
            }
            Ok(Ok(Message::Response { result: None, error: Some(err), .. })) => {
                Err(PeerError::from_error_object(&err))
            }
            Ok(Ok(Message::Response { result: None, error: None, .. })) => Ok(serde_json::Value::Null),
            Ok(Ok(_)) | Ok(Err(_)) => {
                self.inner.pending.lock().unwrap().remove(&id);
                Err(PeerError::connection("pending request channel closed"))
            }
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&id);
                Err(PeerError::timeout(format!("{method} timed out after {timeout:?}")))
            }
        }
    }

    /// Announce the tool catalogue (explicit set, or everything registered
    /// via `register_handler` with a descriptor).
    pub async fn register_tools(
        &self,
        tools: Option<Vec<ToolDescriptor>>,
    ) -> Result<serde_json::Value, PeerError> {
        let tools = tools.unwrap_or_else(|| self.inner.tools.lock().unwrap().clone());
        self.request("tools/register", Some(serde_json::json!({ "tools": tools }))).await
    }

    fn on_transport_closed(&self) {
        *self.inner.state.lock().unwrap() = ConnectionState::Disconnected;
        self.emit(EventKind::Disconnect, Observation::Disconnect);

        let failed: Vec<_> = self.inner.pending.lock().unwrap().drain().collect();
        for (_, sender) in failed {
            let _ = sender.send(Message::failure(
                MessageId::Number(0),
                ErrorObject::new(ErrorKind::Connection.code(), "transport closed"),
            ));
        }

        // An established connection dropping out from under us re-enters
        // the same backoff loop `attach()` used on the way up, rather than
        // leaving the peer stuck `Disconnected` forever.
        if self.inner.config.auto_reconnect {
            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.reconnect_loop().await;
            });
        }
    }

    /// Close the push channel, fail every in-flight request, and inhibit
    /// further reconnection (spec §4.3 `disconnect`).
    pub fn disconnect(&self) {
        *self.inner.state.lock().unwrap() = ConnectionState::Terminal;
        let reader_task = self.inner.reader_task.lock().unwrap().take();
        if let Some(handle) = reader_task {
            handle.abort();
        }
        let failed: Vec<_> = self.inner.pending.lock().unwrap().drain().collect();
        for (_, sender) in failed {
            let _ = sender.send(Message::failure(
                MessageId::Number(0),
                ErrorObject::new(ErrorKind::Connection.code(), "disconnected"),
            ));
        }
    }
}

/// Coerce a handler's loose return type into a list of content items
/// (spec §4.3 "Result normalization").
#[must_use]
pub fn normalize(value: HandlerValue) -> Vec<ContentItem> {
    match value {
        HandlerValue::Content(items) => items,
        HandlerValue::Text(text) => vec![normalize_text(&text)],
        HandlerValue::Json(json) => vec![ContentItem::text(
            serde_json::to_string(&json).unwrap_or_default(),
        )],
    }
}

fn normalize_text(text: &str) -> ContentItem {
    if let Some(mime) = data_uri_mime(text) {
        return ContentItem::Image { data: text.to_string(), mime_type: mime };
    }
    if looks_like_base64_image(text) {
        return ContentItem::Image {
            data: text.to_string(),
            mime_type: std::borrow::Cow::Borrowed("image/png"),
        };
    }
    ContentItem::text(text)
}

fn data_uri_mime(text: &str) -> Option<std::borrow::Cow<'static, str>> {
    let rest = text.strip_prefix("data:image/")?;
    let mime = rest.split(';').next().unwrap_or("png");
    Some(match mime {
        "jpeg" | "jpg" => std::borrow::Cow::Borrowed("image/jpeg"),
        "gif" => std::borrow::Cow::Borrowed("image/gif"),
        "webp" => std::borrow::Cow::Borrowed("image/webp"),
        "svg+xml" | "svg" => std::borrow::Cow::Borrowed("image/svg+xml"),
        _ => std::borrow::Cow::Borrowed("image/png"),
    })
}

/// A long, base64-shaped run with no whitespace is treated as inferred
/// image data absent a data-URI prefix (spec §4.3).
fn looks_like_base64_image(text: &str) -> bool {
    text.len() >= 100
        && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_passes_content_through() {
        let items = normalize(HandlerValue::Content(vec![ContentItem::text("hi")]));
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn normalize_plain_string_is_text() {
        let items = normalize(HandlerValue::Text("hello world".to_string()));
        assert!(matches!(items[0], ContentItem::Text { .. }));
    }

    #[test]
    fn normalize_data_uri_is_image() {
        let items = normalize(HandlerValue::Text("data:image/png;base64,AAAA".to_string()));
        match &items[0] {
            ContentItem::Image { mime_type, .. } => assert_eq!(mime_type, "image/png"),
            _ => panic!("expected image"),
        }
    }

    #[test]
    fn normalize_long_base64_run_is_image() {
        let run = "A".repeat(120);
        let items = normalize(HandlerValue::Text(run));
        assert!(matches!(items[0], ContentItem::Image { .. }));
    }

    #[test]
    fn normalize_json_becomes_text() {
        let items = normalize(HandlerValue::Json(serde_json::json!({"a": 1})));
        assert!(matches!(items[0], ContentItem::Text { .. }));
    }
}
