//! Session-aware lock over a coordination store path.
//!
//! `SessionLock` wraps a raw `PathLock` and tracks the owning store session.
//! When an ephemeral lock's session is reported LOST, the lock marks itself
//! expired so holders can detect, without blocking, that their claim has
//! evaporated. It can also watch for other parties queued on the same path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fleet_state::{ConnectionState, ListenerId, PathLock, Session};
use tracing::{debug, warn};

use crate::error::{LauncherError, LauncherResult};

#[derive(Default)]
struct ContenderSet {
    active: bool,
    /// Child name → identity payload, recorded on first sight.
    seen: HashMap<String, Option<String>>,
}

/// Clonable view of a lock's session validity.
#[derive(Debug, Clone)]
pub struct LockValidity {
    ephemeral: bool,
    expired: Arc<AtomicBool>,
}

impl LockValidity {
    /// Validity that never expires, for work that holds no lock.
    pub fn always() -> Self {
        Self {
            ephemeral: false,
            expired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.ephemeral || !self.expired.load(Ordering::SeqCst)
    }
}

pub struct SessionLock {
    lock: PathLock,
    ephemeral: bool,
    expired: Arc<AtomicBool>,
    listener: Option<ListenerId>,
    contenders: Option<Arc<Mutex<ContenderSet>>>,
}

impl SessionLock {
    pub fn new(lock: PathLock) -> Self {
        Self {
            lock,
            ephemeral: true,
            expired: Arc::new(AtomicBool::new(false)),
            listener: None,
            contenders: None,
        }
    }

    pub fn path(&self) -> &str {
        self.lock.path()
    }

    pub fn session(&self) -> &Session {
        self.lock.session()
    }

    pub fn is_acquired(&self) -> bool {
        self.lock.is_acquired()
    }

    /// Acquire the lock.
    ///
    /// With `ephemeral`, the lock is tied to the session: a later LOST
    /// notification makes `is_still_valid` return false. A `blocking`
    /// acquire parks the calling thread; use `acquire_async` from a runtime
    /// worker.
    pub fn acquire(
        &mut self,
        blocking: bool,
        timeout: Option<Duration>,
        ephemeral: bool,
    ) -> LauncherResult<bool> {
        if !self.lock.acquire(blocking, timeout, ephemeral)? {
            return Ok(false);
        }

        self.ephemeral = ephemeral;
        self.expired.store(false, Ordering::SeqCst);
        if let Some(old) = self.listener.take() {
            self.session().remove_listener(old);
        }
        if ephemeral {
            let expired = Arc::clone(&self.expired);
            let path = self.path().to_string();
            self.listener = Some(self.session().add_listener(move |state| {
                if state == ConnectionState::Lost {
                    warn!(%path, "lock session lost");
                    expired.store(true, Ordering::SeqCst);
                    return true;
                }
                false
            }));
            // The session may have been lost before the listener went in.
            if self.session().state() == ConnectionState::Lost {
                self.expired.store(true, Ordering::SeqCst);
            }
        }
        Ok(true)
    }

    /// Blocking acquire run on tokio's blocking pool, so runtime workers
    /// keep running while it waits. Hands the lock back with the outcome.
    pub async fn acquire_async(
        mut self,
        timeout: Option<Duration>,
        ephemeral: bool,
    ) -> LauncherResult<(Self, bool)> {
        let path = self.path().to_string();
        tokio::task::spawn_blocking(move || {
            let acquired = self.acquire(true, timeout, ephemeral)?;
            Ok((self, acquired))
        })
        .await
        .map_err(|e| {
            warn!(%path, error = %e, "blocking lock acquire did not complete");
            LauncherError::TaskAborted(format!("acquire {path}"))
        })?
    }

    /// Stop session monitoring and release the lock. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(id) = self.listener.take() {
            self.session().remove_listener(id);
        }
        if let Some(set) = self.contenders.take() {
            set.lock().unwrap_or_else(PoisonError::into_inner).active = false;
        }
        if self.lock.release() {
            debug!(path = %self.path(), "lock released");
        }
    }

    /// False once the session behind an ephemeral lock has been lost.
    pub fn is_still_valid(&self) -> bool {
        !self.ephemeral || !self.expired.load(Ordering::SeqCst)
    }

    pub fn validity(&self) -> LockValidity {
        LockValidity {
            ephemeral: self.ephemeral,
            expired: Arc::clone(&self.expired),
        }
    }

    /// Start recording other parties queued on this lock's path.
    pub fn watch_for_contenders(&mut self) -> LauncherResult<()> {
        if !self.lock.is_acquired() {
            return Err(LauncherError::InvalidState(format!(
                "cannot watch for contenders on {}: lock not held",
                self.path()
            )));
        }
        if self.contenders.is_some() {
            return Ok(());
        }

        let set = Arc::new(Mutex::new(ContenderSet {
            active: true,
            seen: HashMap::new(),
        }));
        let own = self.lock.child_name();
        let watched = Arc::clone(&set);
        self.lock.watch_children(move |children| {
            let mut set = watched.lock().unwrap_or_else(PoisonError::into_inner);
            if !set.active {
                return false;
            }
            for child in children {
                if own.as_deref() == Some(child.name.as_str()) {
                    continue;
                }
                set.seen
                    .entry(child.name.clone())
                    .or_insert_with(|| child.data.clone());
            }
            true
        });
        self.contenders = Some(set);
        Ok(())
    }

    /// Whether a contender with identity `name` has been observed.
    pub fn contender_present(&self, name: &str) -> LauncherResult<bool> {
        let set = self.contenders.as_ref().ok_or_else(|| {
            LauncherError::InvalidState(format!(
                "no contender watch started on {}",
                self.path()
            ))
        })?;
        let set = set.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(set.seen.values().any(|data| data.as_deref() == Some(name)))
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLock")
            .field("path", &self.path())
            .field("ephemeral", &self.ephemeral)
            .field("valid", &self.is_still_valid())
            .finish()
    }
}
