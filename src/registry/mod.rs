//! Live WebSocket connection registry.
//!
//! Process-wide map of `session id → { client sockets, sandbox bridge }`.
//! Sockets are represented by the unbounded sender half of each connection's
//! outbound channel; the connection task drains the channel into the real
//! socket, so a slow client can never stall persistence or the bridge — its
//! channel simply errors once the connection task is gone and the socket is
//! dropped from the map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// One frame queued toward a socket. `Close` tells the connection's writer
/// task to finish the WebSocket close handshake and stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutFrame {
    Text(String),
    Close { reason: String },
}

/// Outbound half of one WebSocket connection.
pub type Outbound = mpsc::UnboundedSender<OutFrame>;

/// Unique handle for one registered socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

#[derive(Default)]
struct SessionConns {
    clients: HashMap<ConnId, Outbound>,
    sandbox: Option<(ConnId, Outbound)>,
}

impl SessionConns {
    fn is_empty(&self) -> bool {
        self.clients.is_empty() && self.sandbox.is_none()
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<String, SessionConns>>,
    next_id: AtomicU64,
}

pub type SharedRegistry = Arc<ConnectionRegistry>;

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn register_client(&self, session_id: &str, tx: Outbound) -> ConnId {
        let id = self.next_conn_id();
        let mut map = self.sessions.write().await;
        map.entry(session_id.to_string())
            .or_default()
            .clients
            .insert(id, tx);
        debug!(session = %session_id, conn = id.0, "client registered");
        id
    }

    pub async fn unregister_client(&self, session_id: &str, id: ConnId) {
        let mut map = self.sessions.write().await;
        if let Some(conns) = map.get_mut(session_id) {
            conns.clients.remove(&id);
            if conns.is_empty() {
                map.remove(session_id);
            }
        }
    }

    /// Register the sandbox bridge. Idempotent: a previous bridge is
    /// displaced and the new one wins.
    pub async fn register_sandbox(&self, session_id: &str, tx: Outbound) -> ConnId {
        let id = self.next_conn_id();
        let mut map = self.sessions.write().await;
        let conns = map.entry(session_id.to_string()).or_default();
        if conns.sandbox.is_some() {
            debug!(session = %session_id, "previous sandbox bridge displaced");
        }
        conns.sandbox = Some((id, tx));
        id
    }

    /// Unregister the bridge only if `id` still names the current one — a
    /// displaced bridge's close handler must not tear down its replacement.
    pub async fn unregister_sandbox(&self, session_id: &str, id: ConnId) -> bool {
        let mut map = self.sessions.write().await;
        if let Some(conns) = map.get_mut(session_id) {
            if matches!(conns.sandbox, Some((current, _)) if current == id) {
                conns.sandbox = None;
                if conns.is_empty() {
                    map.remove(session_id);
                }
                return true;
            }
        }
        false
    }

    pub async fn has_sandbox(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .is_some_and(|c| c.sandbox.is_some())
    }

    pub async fn client_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map_or(0, |c| c.clients.len())
    }

    /// Fan a frame out to every client of the session. Best-effort: a send
    /// failure means that connection task is gone; the socket is dropped.
    pub async fn broadcast(&self, session_id: &str, frame: &str) {
        let mut dead = Vec::new();
        {
            let map = self.sessions.read().await;
            let Some(conns) = map.get(session_id) else {
                return;
            };
            for (id, tx) in &conns.clients {
                if tx.send(OutFrame::Text(frame.to_string())).is_err() {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.unregister_client(session_id, id).await;
        }
    }

    /// Send a frame to the sandbox bridge. Returns false when no bridge is
    /// registered or its connection task has gone away.
    pub async fn send_to_sandbox(&self, session_id: &str, frame: &str) -> bool {
        let map = self.sessions.read().await;
        match map.get(session_id).and_then(|c| c.sandbox.as_ref()) {
            Some((_, tx)) => tx.send(OutFrame::Text(frame.to_string())).is_ok(),
            None => false,
        }
    }

    /// Outbound handles for every socket of a session (used at teardown to
    /// push a final close frame).
    pub async fn drain_session(&self, session_id: &str) -> Vec<Outbound> {
        let mut map = self.sessions.write().await;
        match map.remove(session_id) {
            Some(conns) => {
                let mut all: Vec<Outbound> = conns.clients.into_values().collect();
                if let Some((_, tx)) = conns.sandbox {
                    all.push(tx);
                }
                all
            }
            None => Vec::new(),
        }
    }

    /// Session ids with at least one live socket.
    pub async fn active_sessions(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
