//! Notification channel: named events to a session audience or one identity.
//!
//! Each identity has at most one live connection. Audiences are keyed by
//! identity rather than connection, so a reconnecting player keeps
//! receiving session broadcasts without re-subscribing. Delivery is
//! fire-and-forget; a full or closed queue drops the event.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use knockout_core::{ConnectionId, IdentityId, ServerEvent, SessionId};

/// Per-connection outbound queue depth.
pub const CONNECTION_QUEUE: usize = 256;

struct Conn {
    identity: IdentityId,
    tx: mpsc::Sender<ServerEvent>,
}

#[derive(Default)]
struct State {
    connections: HashMap<ConnectionId, Conn>,
    by_identity: HashMap<IdentityId, ConnectionId>,
    rooms: HashMap<SessionId, HashSet<IdentityId>>,
}

#[derive(Default)]
pub struct Notifier {
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a new live connection for `identity`.
    ///
    /// An older connection of the same identity is superseded: it receives
    /// `superseded` and its queue is closed.
    pub fn register(&self, identity: &IdentityId) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);
        let mut state = self.lock();
        if let Some(old) = state.by_identity.insert(identity.clone(), id) {
            if let Some(conn) = state.connections.remove(&old) {
                debug!(identity = %identity, old = %old, new = %id, "connection superseded");
                let _ = conn.tx.try_send(ServerEvent::Superseded);
            }
        }
        state.connections.insert(
            id,
            Conn {
                identity: identity.clone(),
                tx,
            },
        );
        (id, rx)
    }

    /// Detach a connection. Returns the identity only when `connection` was
    /// still that identity's current one.
    pub fn unregister(&self, connection: ConnectionId) -> Option<IdentityId> {
        let mut state = self.lock();
        let conn = state.connections.remove(&connection)?;
        if state.by_identity.get(&conn.identity) == Some(&connection) {
            state.by_identity.remove(&conn.identity);
            Some(conn.identity)
        } else {
            None
        }
    }

    pub fn connection_of(&self, identity: &IdentityId) -> Option<ConnectionId> {
        self.lock().by_identity.get(identity).copied()
    }

    pub fn subscribe(&self, session_id: SessionId, identity: &IdentityId) {
        self.lock()
            .rooms
            .entry(session_id)
            .or_default()
            .insert(identity.clone());
    }

    pub fn unsubscribe(&self, session_id: SessionId, identity: &IdentityId) {
        let mut state = self.lock();
        if let Some(room) = state.rooms.get_mut(&session_id) {
            room.remove(identity);
            if room.is_empty() {
                state.rooms.remove(&session_id);
            }
        }
    }

    pub fn drop_room(&self, session_id: SessionId) {
        self.lock().rooms.remove(&session_id);
    }

    pub fn audience(&self, session_id: SessionId) -> usize {
        self.lock().rooms.get(&session_id).map_or(0, HashSet::len)
    }

    /// Deliver to one identity. Returns false when it has no live
    /// connection or its queue rejected the event.
    pub fn send_to(&self, identity: &IdentityId, event: ServerEvent) -> bool {
        let state = self.lock();
        deliver(&state, identity, event)
    }

    /// Deliver to every identity subscribed to the session. Returns the
    /// number of connections that accepted the event.
    pub fn broadcast(&self, session_id: SessionId, event: ServerEvent) -> usize {
        let state = self.lock();
        let Some(room) = state.rooms.get(&session_id) else {
            return 0;
        };
        room.iter()
            .filter(|identity| deliver(&state, identity, event.clone()))
            .count()
    }
}

fn deliver(state: &State, identity: &IdentityId, event: ServerEvent) -> bool {
    let Some(conn) = state
        .by_identity
        .get(identity)
        .and_then(|id| state.connections.get(id))
    else {
        return false;
    };
    match conn.tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!(identity = %identity, method = event.method(), "connection queue full, event dropped");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
