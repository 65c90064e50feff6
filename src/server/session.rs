//! Per-connection sessions and the server's session registry.
//!
//! The registry holds weak handles keyed by connection id so it never keeps
//! a session alive; a session unregisters itself when the last task
//! referencing it drops. Closing a session wakes every task parked on
//! [`Session::closed`], and the close is idempotent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;

/// Unique connection identifier, monotonically increasing.
pub type SessionId = u64;

/// State shared between the tasks serving one accepted connection.
pub struct Session {
    id: SessionId,
    peer_addr: SocketAddr,
    close_tx: watch::Sender<bool>,
    close_rx: watch::Receiver<bool>,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    registry: Arc<Registry>,
}

impl Session {
    /// Connection id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Peer address of the inbound connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Flag the session aborted and wake parked tasks.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    /// Whether the session was aborted.
    pub fn is_aborted(&self) -> bool {
        *self.close_rx.borrow()
    }

    /// Resolve when the session is closed.
    pub async fn closed(&self) {
        let mut rx = self.close_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Record relayed bytes (client→remote, remote→client).
    pub fn add_transfer(&self, up: u64, down: u64) {
        self.bytes_up.fetch_add(up, Ordering::Relaxed);
        self.bytes_down.fetch_add(down, Ordering::Relaxed);
    }

    /// Relayed byte totals.
    pub fn transfer(&self) -> (u64, u64) {
        (
            self.bytes_up.load(Ordering::Relaxed),
            self.bytes_down.load(Ordering::Relaxed),
        )
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        tracing::debug!(
            "connection id: {}, destroyed, remainder: {}",
            self.id,
            self.registry.len()
        );
    }
}

/// Id-keyed map of live sessions, held weakly.
pub struct Registry {
    sessions: Mutex<HashMap<SessionId, Weak<Session>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Allocate an id and register a new session.
    pub fn create(self: &Arc<Self>, peer_addr: SocketAddr) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (close_tx, close_rx) = watch::channel(false);

        let session = Arc::new(Session {
            id,
            peer_addr,
            close_tx,
            close_rx,
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            registry: Arc::clone(self),
        });

        self.sessions.lock().insert(id, Arc::downgrade(&session));
        session
    }

    fn remove(&self, id: SessionId) {
        self.sessions.lock().remove(&id);
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Close every live session.
    pub fn close_all(&self) {
        let sessions: Vec<Weak<Session>> = self.sessions.lock().values().cloned().collect();
        for weak in sessions {
            if let Some(session) = weak.upgrade() {
                session.close();
            }
        }
    }
}
