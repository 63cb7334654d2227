//! Session, peer, and pending-route bookkeeping.
//!
//! Mirrors the teacher's `Session`/`SessionManager` split (ring-buffer +
//! broadcast channel for replay) but adapted to single-subscriber push
//! channels: each peer owns exactly one channel for the lifetime of its
//! connection, so an `mpsc` channel stands in for the teacher's
//! `broadcast::Sender`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;

use crate::protocol::{Message, MessageId, ToolDescriptor};

/// One frame pushed down a peer's event stream.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub event: &'static str,
    pub data: String,
}

impl PushEvent {
    #[must_use]
    pub fn message(message: &Message) -> Self {
        Self { event: "message", data: serde_json::to_string(message).unwrap_or_default() }
    }
}

/// Peer role (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Provider,
    Caller,
}

/// A connected peer: one push channel, one role, one current session.
///
/// `current_session` is shared with the transport layer's disconnect hook
/// (see `relay::transport::DisconnectOnDrop`) so that a `session/join` move
/// (`Relay::handle_session_join`) is visible to a later transport close
/// without the caller having to re-learn which session it ended up in.
pub struct Peer {
    pub id: String,
    pub role: Role,
    pub current_session: Arc<Mutex<String>>,
    sender: mpsc::UnboundedSender<PushEvent>,
}

impl Peer {
    /// Send a frame down this peer's push channel. Returns `false` if the
    /// peer's connection has already gone away (send-on-closed-channel is
    /// the liveness signal the relay uses to detect a dead peer). Most
    /// callers push fire-and-forget; `broadcast_to_callers` is the one
    /// that acts on the result.
    #[allow(clippy::must_use_candidate)]
    pub fn push(&self, event: PushEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// The relay-side record that pairs a forwarded request's internal id with
/// the caller that originated it (spec §3 `PendingRoute`).
pub struct PendingRoute {
    pub caller_peer_id: String,
    pub original_id: MessageId,
    pub enqueued_at: Instant,
    /// `tools/list` gets a cached-list fallback on timeout instead of a
    /// timeout error (spec §4.2); every other method does not.
    pub is_tools_list: bool,
}

/// A named meeting point between one provider and zero-or-more callers.
pub struct Session {
    pub id: String,
    pub provider: Option<Peer>,
    pub callers: HashMap<String, Peer>,
    pub tools: Vec<ToolDescriptor>,
    pub pending: HashMap<u64, PendingRoute>,
    pub created_at: Instant,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            provider: None,
            callers: HashMap::new(),
            tools: Vec::new(),
            pending: HashMap::new(),
            created_at: Instant::now(),
        }
    }

    /// Invariant I4: a session is live iff it has a provider or at least
    /// one caller.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.provider.is_some() || !self.callers.is_empty()
    }

    /// Push a frame to every attached caller.
    pub fn broadcast_to_callers(&mut self, event: &PushEvent) {
        self.callers.retain(|_, caller| caller.push(event.clone()));
    }
}

/// Owns every live session.
///
/// All mutation goes through `&mut self` methods called while holding the
/// manager's lock (see `relay::Relay`), which is the single logical
/// serialization point per session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { sessions: HashMap::new() }
    }

    pub fn get_or_create(&mut self, id: &str) -> &mut Session {
        self.sessions.entry(id.to_string()).or_insert_with(|| Session::new(id.to_string()))
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Destroy a session if it is no longer live (I4). Idempotent.
    pub fn reap_if_idle(&mut self, id: &str) {
        if self.sessions.get(id).is_some_and(|s| !s.is_live()) {
            self.sessions.remove(id);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.sessions
            .values()
            .map(|s| usize::from(s.provider.is_some()) + s.callers.len())
            .sum()
    }

    /// Build the `/sessions` summary shape, also used for the discovery
    /// message a caller receives on attach (spec §4.2, §6).
    #[must_use]
    pub fn summarize(&self, now: chrono::DateTime<chrono::Utc>) -> Vec<super::SessionSummary> {
        self.sessions
            .values()
            .map(|s| super::SessionSummary {
                id: s.id.clone(),
                has_provider: s.provider.is_some(),
                caller_count: s.callers.len(),
                tool_count: s.tools.len(),
                created_at: now - chrono::Duration::from_std(s.created_at.elapsed()).unwrap_or_default(),
            })
            .collect()
    }
}

pub(crate) fn new_peer(
    id: String,
    role: Role,
    session_id: String,
) -> (Peer, mpsc::UnboundedReceiver<PushEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let current_session = Arc::new(Mutex::new(session_id));
    (Peer { id, role, current_session, sender }, receiver)
}
