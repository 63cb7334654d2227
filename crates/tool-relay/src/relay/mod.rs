//! The relay: session ownership, routing, and timeout enforcement.
//!
//! All session and peer mutations happen while holding `Relay::sessions`,
//! which is the single logical serialization point per spec §5. The lock
//! is a plain [`std::sync::Mutex`] scoped tightly around synchronous
//! bookkeeping; nothing holds it across an `.await` point.

pub mod session;
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::protocol::{ContentItem, ErrorObject, Message, MessageId, ToolDescriptor};
use session::{new_peer, PendingRoute, PushEvent, Role, SessionRegistry};

/// Snapshot of a session for the `/sessions` probe and the discovery
/// message callers receive on attach (spec §4.2, §6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub id: String,
    #[serde(rename = "hasProvider")]
    pub has_provider: bool,
    #[serde(rename = "callerCount")]
    pub caller_count: usize,
    #[serde(rename = "toolCount")]
    pub tool_count: usize,
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Result of attaching a push channel.
pub struct Attachment {
    pub peer_id: String,
    pub receiver: mpsc::UnboundedReceiver<PushEvent>,
    /// The peer's current session id, live-updated by `session/join`
    /// (spec §4.2) so a later transport close disconnects it from wherever
    /// it actually ended up rather than where it first attached.
    pub current_session: Arc<Mutex<String>>,
}

pub struct Relay {
    sessions: Mutex<SessionRegistry>,
    next_internal_id: AtomicU64,
    config: RelayConfig,
    started_at: Instant,
}

impl Relay {
    #[must_use]
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(SessionRegistry::new()),
            next_internal_id: AtomicU64::new(1),
            config,
            started_at: Instant::now(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    #[must_use]
    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.sessions.lock().unwrap().peer_count()
    }

    #[must_use]
    pub fn sessions_snapshot(&self) -> Vec<SessionSummary> {
        self.sessions.lock().unwrap().summarize(chrono::Utc::now())
    }

    /// Attach a push channel for `session_id` under `role` (spec §4.2
    /// "Attach"). Handles provider takeover (I1) when a second provider
    /// attaches to an occupied session.
    pub fn attach(self: &Arc<Self>, session_id: &str, role: Role) -> Attachment {
        let peer_id = uuid::Uuid::new_v4().to_string();
        let (peer, receiver) = new_peer(peer_id.clone(), role, session_id.to_string());
        let current_session = Arc::clone(&peer.current_session);

        let connected = Message::notification(
            "connected",
            Some(serde_json::json!({
                "peerId": peer_id,
                "sessionId": session_id,
                "role": match role { Role::Provider => "provider", Role::Caller => "caller" },
            })),
        );
        peer.push(PushEvent::message(&connected));

        let mut sessions_list = None;
        {
            let mut registry = self.sessions.lock().unwrap();
            let session = registry.get_or_create(session_id);

            match role {
                Role::Provider => {
                    if let Some(incumbent) = session.provider.take() {
                        let err = RelayError::session("another provider connected").to_error_object();
                        incumbent.push(PushEvent::message(&Message::failure(
                            MessageId::Number(0),
                            err,
                        )));
                        tracing::info!(session_id, peer_id = incumbent.id, "provider takeover");
                    }
                    session.provider = Some(peer);
                }
                Role::Caller => {
                    session.callers.insert(peer_id.clone(), peer);
                }
            }

            if role == Role::Caller {
                sessions_list = Some(registry.summarize(chrono::Utc::now()));
            }
        }

        if let Some(sessions) = sessions_list {
            let discovery = Message::success(
                MessageId::String("discovery".to_string()),
                serde_json::json!({ "sessions": sessions }),
            );
            let registry = self.sessions.lock().unwrap();
            if let Some(session) = registry.get(session_id) {
                if let Some(caller) = session.callers.get(&peer_id) {
                    caller.push(PushEvent::message(&discovery));
                }
            }
        }

        Attachment { peer_id, receiver, current_session }
    }

    /// Handle a peer's push-channel connection closing (spec §4.2
    /// "Liveness" / disconnect).
    pub fn disconnect(&self, session_id: &str, peer_id: &str) {
        let mut registry = self.sessions.lock().unwrap();
        let Some(session) = registry.get_mut(session_id) else { return };

        if session.provider.as_ref().is_some_and(|p| p.id == peer_id) {
            session.provider = None;
            let notice = Message::notification(
                "provider/disconnected",
                Some(serde_json::json!({ "sessionId": session_id })),
            );
            session.broadcast_to_callers(&PushEvent::message(&notice));
        } else {
            session.callers.remove(peer_id);
        }

        registry.reap_if_idle(session_id);
    }

    /// Accept one ingested message (spec §4.2 "Ingest" + routing matrix).
    /// The HTTP layer acknowledges the POST as soon as this returns; all
    /// further processing and delivery happens asynchronously on the
    /// push channel, so this function does the minimal synchronous
    /// routing work and spawns the rest.
    pub fn ingest(self: &Arc<Self>, session_id: String, sender_peer_id: Option<String>, message: Message) {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            relay.route(&session_id, sender_peer_id.as_deref(), message);
        });
    }

    fn route(self: &Arc<Self>, session_id: &str, sender_peer_id: Option<&str>, message: Message) {
        match message {
            Message::Request { id, method, params } => {
                self.route_request(session_id, sender_peer_id, id, &method, params);
            }
            Message::Response { id, result, error } => {
                self.route_provider_response(session_id, id, result, error);
            }
            Message::Notification { method, .. } => {
                tracing::debug!(session_id, method, "dropping unrouted notification");
            }
        }
    }

    fn route_request(
        self: &Arc<Self>,
        session_id: &str,
        sender_peer_id: Option<&str>,
        id: MessageId,
        method: &str,
        params: Option<serde_json::Value>,
    ) {
        match method {
            "tools/register" => self.handle_tools_register(session_id, id, params),
            "tools/list" => self.handle_tools_list(session_id, sender_peer_id, id),
            "tools/call" => self.handle_tools_call(session_id, sender_peer_id, id, params),
            "session/join" => self.handle_session_join(session_id, sender_peer_id, id, params),
            "ping" => self.handle_ping(session_id, sender_peer_id, id),
            other => {
                tracing::debug!(session_id, method = other, "dropping unrecognized method");
            }
        }
    }

    fn handle_tools_register(
        self: &Arc<Self>,
        session_id: &str,
        id: MessageId,
        params: Option<serde_json::Value>,
    ) {
        let tools: Vec<ToolDescriptor> = params
            .as_ref()
            .and_then(|p| p.get("tools"))
            .and_then(|t| serde_json::from_value(t.clone()).ok())
            .unwrap_or_default();

        let mut registry = self.sessions.lock().unwrap();
        let Some(session) = registry.get_mut(session_id) else { return };
        session.tools.clone_from(&tools); // I3: wholesale replace

        let response = Message::success(id, serde_json::json!({ "tools": tools }));
        if let Some(provider) = &session.provider {
            provider.push(PushEvent::message(&response));
        }

        let notice = Message::notification(
            "tools/updated",
            Some(serde_json::json!({ "tools": tools })),
        );
        session.broadcast_to_callers(&PushEvent::message(&notice));
    }

    fn handle_tools_list(
        self: &Arc<Self>,
        session_id: &str,
        sender_peer_id: Option<&str>,
        id: MessageId,
    ) {
        let Some(caller_peer_id) = sender_peer_id else { return };
        let mut registry = self.sessions.lock().unwrap();
        let Some(session) = registry.get_mut(session_id) else { return };

        if session.provider.is_some() {
            self.forward_to_provider(session_id, session, caller_peer_id, id, "tools/list", None, true);
        } else {
            let cached = Message::success(id, serde_json::json!({ "tools": session.tools }));
            if let Some(caller) = session.callers.get(caller_peer_id) {
                caller.push(PushEvent::message(&cached));
            }
        }
    }

    fn handle_tools_call(
        self: &Arc<Self>,
        session_id: &str,
        sender_peer_id: Option<&str>,
        id: MessageId,
        params: Option<serde_json::Value>,
    ) {
        let Some(caller_peer_id) = sender_peer_id else { return };
        let mut registry = self.sessions.lock().unwrap();
        let Some(session) = registry.get_mut(session_id) else { return };

        if session.provider.is_some() {
            self.forward_to_provider(session_id, session, caller_peer_id, id, "tools/call", params, false);
        } else if let Some(caller) = session.callers.get(caller_peer_id) {
            let err = RelayError::session("no provider attached to this session").to_error_object();
            caller.push(PushEvent::message(&Message::failure(id, err)));
        }
    }

    /// Id-rewriting forward of a caller request to the session's provider
    /// (spec §4.2 "Id rewriting").
    fn forward_to_provider(
        self: &Arc<Self>,
        session_id: &str,
        session: &mut session::Session,
        caller_peer_id: &str,
        original_id: MessageId,
        method: &str,
        params: Option<serde_json::Value>,
        is_tools_list: bool,
    ) {
        let internal_id = self.next_internal_id.fetch_add(1, Ordering::SeqCst); // I2
        session.pending.insert(
            internal_id,
            PendingRoute {
                caller_peer_id: caller_peer_id.to_string(),
                original_id,
                enqueued_at: Instant::now(),
                is_tools_list,
            },
        );

        let forwarded = Message::request(MessageId::Number(internal_id as i64), method, params);
        if let Some(provider) = &session.provider {
            provider.push(PushEvent::message(&forwarded));
        }

        let relay = Arc::clone(self);
        let session_id = session_id.to_string();
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            relay.expire_pending(&session_id, internal_id);
        });
    }

    fn expire_pending(&self, session_id: &str, internal_id: u64) {
        let mut registry = self.sessions.lock().unwrap();
        let Some(session) = registry.get_mut(session_id) else { return };
        // Whichever of (provider response, this timer) arrives first wins:
        // `remove` only succeeds once, so a response that already resolved
        // this route makes the timer a no-op.
        let Some(route) = session.pending.remove(&internal_id) else { return };
        let Some(caller) = session.callers.get(&route.caller_peer_id) else { return };

        let response = if route.is_tools_list {
            Message::success(route.original_id, serde_json::json!({ "tools": session.tools }))
        } else {
            let err = RelayError::timeout(format!(
                "provider did not respond within {:?}",
                self.config.request_timeout
            ))
            .to_error_object();
            Message::failure(route.original_id, err)
        };
        caller.push(PushEvent::message(&response));
    }

    fn route_provider_response(
        self: &Arc<Self>,
        session_id: &str,
        id: MessageId,
        result: Option<serde_json::Value>,
        error: Option<ErrorObject>,
    ) {
        let MessageId::Number(internal_id) = id else { return };
        let mut registry = self.sessions.lock().unwrap();
        let Some(session) = registry.get_mut(session_id) else { return };
        let Some(route) = session.pending.remove(&(internal_id as u64)) else { return };
        let Some(caller) = session.callers.get(&route.caller_peer_id) else { return };

        let response = Message::Response { id: route.original_id, result, error };
        caller.push(PushEvent::message(&response));
    }

    fn handle_session_join(
        self: &Arc<Self>,
        home_session_id: &str,
        sender_peer_id: Option<&str>,
        id: MessageId,
        params: Option<serde_json::Value>,
    ) {
        let Some(caller_peer_id) = sender_peer_id else { return };
        let Some(target_id) = params.as_ref().and_then(|p| p.get("sessionId")).and_then(|v| v.as_str())
        else {
            return;
        };

        let mut registry = self.sessions.lock().unwrap();

        if registry.get(target_id).is_none() {
            let err = RelayError::session(format!("unknown session: {target_id}")).to_error_object();
            if let Some(home) = registry.get(home_session_id) {
                if let Some(caller) = home.callers.get(caller_peer_id) {
                    caller.push(PushEvent::message(&Message::failure(id, err)));
                }
            }
            return;
        }

        let Some(home) = registry.get_mut(home_session_id) else { return };
        let Some(peer) = home.callers.remove(caller_peer_id) else { return };
        registry.reap_if_idle(home_session_id);

        *peer.current_session.lock().unwrap() = target_id.to_string();

        let target = registry.get_mut(target_id).expect("checked above");
        let tools = target.tools.clone();
        target.callers.insert(caller_peer_id.to_string(), peer);

        let response = Message::success(
            id,
            serde_json::json!({ "success": true, "sessionId": target_id, "tools": tools }),
        );
        if let Some(caller) = target.callers.get(caller_peer_id) {
            caller.push(PushEvent::message(&response));
        }
    }

    fn handle_ping(self: &Arc<Self>, session_id: &str, sender_peer_id: Option<&str>, id: MessageId) {
        let Some(peer_id) = sender_peer_id else { return };
        let registry = self.sessions.lock().unwrap();
        let Some(session) = registry.get(session_id) else { return };
        let response = Message::success(
            id,
            serde_json::json!({ "pong": true, "timestamp": chrono::Utc::now().to_rfc3339() }),
        );
        if let Some(provider) = &session.provider {
            if provider.id == peer_id {
                provider.push(PushEvent::message(&response));
                return;
            }
        }
        if let Some(caller) = session.callers.get(peer_id) {
            caller.push(PushEvent::message(&response));
        }
    }

    #[must_use]
    pub fn content_text(text: impl Into<String>) -> Vec<ContentItem> {
        vec![ContentItem::text(text)]
    }
}
