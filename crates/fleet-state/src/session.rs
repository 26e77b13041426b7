//! Store sessions and connection-state notifications.
//!
//! A `Session` is one client's connection lifetime with the coordination
//! store. Ephemeral locks and launcher registrations belong to a session and
//! disappear when the store expires it. Interested parties register
//! listeners that receive every connection-state transition.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

/// Numeric identity of a store session.
pub type SessionId = u64;

/// Handle returned by `Session::add_listener`.
pub type ListenerId = u64;

/// Connection state reported to session listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Suspended,
    Lost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Lost => "lost",
        };
        f.write_str(s)
    }
}

/// Listener callback. Returning `true` de-registers the listener.
pub type SessionListener = Arc<dyn Fn(ConnectionState) -> bool + Send + Sync>;

struct SessionInner {
    id: SessionId,
    state: Mutex<ConnectionState>,
    listeners: Mutex<Vec<(ListenerId, SessionListener)>>,
    next_listener: AtomicU64,
}

/// A client session with the coordination store. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(id: SessionId) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                state: Mutex::new(ConnectionState::Connected),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Register a connection-state listener.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ConnectionState) -> bool + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Report a temporary loss of connectivity.
    pub fn suspend(&self) {
        self.transition(ConnectionState::Suspended);
    }

    /// Report that connectivity is back.
    ///
    /// After a LOST transition this starts a fresh session lifetime; anything
    /// the session owned before is already gone.
    pub fn reconnect(&self) {
        self.transition(ConnectionState::Connected);
    }

    /// Set the state and deliver it to every listener.
    ///
    /// Listeners run outside the registry lock so they may themselves
    /// register or remove listeners.
    pub(crate) fn transition(&self, state: ConnectionState) {
        {
            let mut current = lock(&self.inner.state);
            if *current == state {
                return;
            }
            *current = state;
        }
        match state {
            ConnectionState::Lost => warn!(session = self.id(), "store session lost"),
            _ => info!(session = self.id(), %state, "store session state changed"),
        }

        let snapshot: Vec<(ListenerId, SessionListener)> = lock(&self.inner.listeners).clone();
        let finished: Vec<ListenerId> = snapshot
            .into_iter()
            .filter_map(|(id, listener)| listener(state).then_some(id))
            .collect();

        if !finished.is_empty() {
            debug!(session = self.id(), count = finished.len(), "de-registering session listeners");
            lock(&self.inner.listeners).retain(|(id, _)| !finished.contains(id));
        }
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
