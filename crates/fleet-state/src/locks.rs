//! Exclusive per-path locks with sequential contender children.
//!
//! Every acquisition attempt enqueues a child under the lock path, tagged
//! with a store-wide sequence number and the contender's identity payload.
//! The child with the lowest sequence number holds the lock. A non-blocking
//! or timed-out attempt withdraws its child again; a blocking attempt stays
//! queued (and visible to watchers) until it becomes the holder.
//!
//! Ephemeral children belong to a session and are dropped when the store
//! expires that session. Non-ephemeral children survive session loss.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::session::{lock, ConnectionState, Session, SessionId};

/// A contender as seen by a children watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockChild {
    /// Store-assigned child name, unique per lock path.
    pub name: String,
    /// Identity payload written by the contender, if any.
    pub data: Option<String>,
}

/// Children watcher. Returning `false` stops the watch.
pub type ChildWatcher = Arc<dyn Fn(&[LockChild]) -> bool + Send + Sync>;

struct Child {
    name: String,
    session: SessionId,
    data: Option<String>,
    ephemeral: bool,
}

#[derive(Default)]
struct LockPath {
    children: BTreeMap<u64, Child>,
    watchers: Vec<(u64, ChildWatcher)>,
}

impl LockPath {
    fn snapshot(&self) -> Vec<LockChild> {
        self.children
            .values()
            .map(|c| LockChild {
                name: c.name.clone(),
                data: c.data.clone(),
            })
            .collect()
    }

    fn holder_seq(&self) -> Option<u64> {
        self.children.keys().next().copied()
    }

    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.watchers.is_empty()
    }
}

#[derive(Default)]
struct TableState {
    next_seq: u64,
    next_watch: u64,
    paths: HashMap<String, LockPath>,
}

impl TableState {
    fn remove_child(&mut self, path: &str, seq: u64) -> bool {
        let Some(entry) = self.paths.get_mut(path) else {
            return false;
        };
        let removed = entry.children.remove(&seq).is_some();
        if entry.is_empty() {
            self.paths.remove(path);
        }
        removed
    }
}

/// All lock paths of one coordination store.
#[derive(Default)]
pub struct LockTable {
    state: Mutex<TableState>,
    changed: Condvar,
}

fn child_name(seq: u64) -> String {
    format!("__lock__{seq:010}")
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock at `path` for `session`.
    ///
    /// Returns the held child's sequence number, or `None` if the lock was
    /// not obtained. A blocking acquisition parks the calling thread.
    pub(crate) fn acquire(
        &self,
        path: &str,
        session: &Session,
        data: Option<&str>,
        blocking: bool,
        timeout: Option<Duration>,
        ephemeral: bool,
    ) -> StateResult<Option<u64>> {
        if session.state() == ConnectionState::Lost {
            return Err(StateError::SessionLost(session.id()));
        }

        let seq = {
            let mut st = lock(&self.state);
            let seq = st.next_seq;
            st.next_seq += 1;
            st.paths.entry(path.to_string()).or_default().children.insert(
                seq,
                Child {
                    name: child_name(seq),
                    session: session.id(),
                    data: data.map(str::to_string),
                    ephemeral,
                },
            );
            seq
        };
        self.fire(path);

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = lock(&self.state);
        loop {
            let Some(entry) = st.paths.get(path) else {
                return Err(StateError::SessionLost(session.id()));
            };
            if !entry.children.contains_key(&seq) {
                // Our child was reaped while we waited.
                return Err(StateError::SessionLost(session.id()));
            }
            if entry.holder_seq() == Some(seq) {
                debug!(%path, child = %child_name(seq), "lock acquired");
                return Ok(Some(seq));
            }

            let remaining = match deadline {
                _ if !blocking => None,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d { None } else { Some(Some(d - now)) }
                }
                None => Some(None),
            };

            match remaining {
                None => {
                    st.remove_child(path, seq);
                    drop(st);
                    self.changed.notify_all();
                    self.fire(path);
                    return Ok(None);
                }
                Some(Some(wait)) => {
                    st = self
                        .changed
                        .wait_timeout(st, wait)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                Some(None) => {
                    st = self.changed.wait(st).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Remove the child `seq` from `path`. Returns false if it was gone.
    pub(crate) fn release(&self, path: &str, seq: u64) -> bool {
        let removed = lock(&self.state).remove_child(path, seq);
        if removed {
            self.changed.notify_all();
            self.fire(path);
            debug!(%path, child = %child_name(seq), "lock released");
        }
        removed
    }

    /// Whether `seq` is currently the holder of `path`.
    pub(crate) fn holds(&self, path: &str, seq: u64) -> bool {
        lock(&self.state)
            .paths
            .get(path)
            .and_then(LockPath::holder_seq)
            == Some(seq)
    }

    /// Current children of `path`, holder first.
    pub fn children(&self, path: &str) -> Vec<LockChild> {
        lock(&self.state)
            .paths
            .get(path)
            .map(LockPath::snapshot)
            .unwrap_or_default()
    }

    pub fn is_locked(&self, path: &str) -> bool {
        lock(&self.state)
            .paths
            .get(path)
            .is_some_and(|p| !p.children.is_empty())
    }

    /// Number of paths with at least one child.
    pub fn held_count(&self) -> usize {
        lock(&self.state)
            .paths
            .values()
            .filter(|p| !p.children.is_empty())
            .count()
    }

    /// Watch the children of `path`.
    ///
    /// The watcher runs once immediately and again after every change until
    /// it returns false.
    pub(crate) fn watch(&self, path: &str, watcher: ChildWatcher) {
        let (id, children) = {
            let mut st = lock(&self.state);
            let id = st.next_watch;
            st.next_watch += 1;
            let entry = st.paths.entry(path.to_string()).or_default();
            entry.watchers.push((id, Arc::clone(&watcher)));
            (id, entry.snapshot())
        };
        if !watcher(&children) {
            self.remove_watchers(path, &[id]);
        }
    }

    /// Drop every ephemeral child owned by `session`. Returns how many went.
    pub(crate) fn expire_session(&self, session: SessionId) -> usize {
        let touched: Vec<String> = {
            let mut st = lock(&self.state);
            let mut touched = Vec::new();
            for (path, entry) in st.paths.iter_mut() {
                let before = entry.children.len();
                entry
                    .children
                    .retain(|_, c| !(c.ephemeral && c.session == session));
                if entry.children.len() != before {
                    touched.push(path.clone());
                }
            }
            st.paths.retain(|_, p| !p.is_empty());
            touched
        };
        if !touched.is_empty() {
            self.changed.notify_all();
            for path in &touched {
                self.fire(path);
            }
            debug!(session, paths = touched.len(), "ephemeral lock children expired");
        }
        touched.len()
    }

    /// Deliver the current children of `path` to its watchers.
    fn fire(&self, path: &str) {
        let (children, watchers) = {
            let st = lock(&self.state);
            match st.paths.get(path) {
                Some(entry) if !entry.watchers.is_empty() => {
                    (entry.snapshot(), entry.watchers.clone())
                }
                _ => return,
            }
        };
        let finished: Vec<u64> = watchers
            .into_iter()
            .filter_map(|(id, w)| (!w(&children)).then_some(id))
            .collect();
        if !finished.is_empty() {
            self.remove_watchers(path, &finished);
        }
    }

    fn remove_watchers(&self, path: &str, ids: &[u64]) {
        let mut st = lock(&self.state);
        if let Some(entry) = st.paths.get_mut(path) {
            entry.watchers.retain(|(id, _)| !ids.contains(id));
            if entry.is_empty() {
                st.paths.remove(path);
            }
        }
    }
}

/// One party's handle on a lock path.
///
/// This is the raw store primitive: it knows nothing about session loss
/// beyond refusing to acquire on a LOST session.
pub struct PathLock {
    table: Arc<LockTable>,
    path: String,
    identifier: Option<String>,
    session: Session,
    held: Option<u64>,
}

impl PathLock {
    pub fn new(
        table: Arc<LockTable>,
        path: &str,
        session: &Session,
        identifier: Option<&str>,
    ) -> Self {
        Self {
            table,
            path: path.to_string(),
            identifier: identifier.map(str::to_string),
            session: session.clone(),
            held: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Acquire the lock. Already holding it counts as success.
    ///
    /// With `blocking`, waits on a condition variable until the lock is
    /// held or `timeout` passes, parking the calling OS thread. Async
    /// callers must run a blocking acquire on a blocking-capable thread.
    pub fn acquire(
        &mut self,
        blocking: bool,
        timeout: Option<Duration>,
        ephemeral: bool,
    ) -> StateResult<bool> {
        if self.is_acquired() {
            return Ok(true);
        }
        self.held = self.table.acquire(
            &self.path,
            &self.session,
            self.identifier.as_deref(),
            blocking,
            timeout,
            ephemeral,
        )?;
        Ok(self.held.is_some())
    }

    /// Release the lock. Safe to call when not held.
    pub fn release(&mut self) -> bool {
        match self.held.take() {
            Some(seq) => self.table.release(&self.path, seq),
            None => false,
        }
    }

    /// Whether this handle is the current holder in the store.
    pub fn is_acquired(&self) -> bool {
        self.held
            .is_some_and(|seq| self.table.holds(&self.path, seq))
    }

    /// Name of this handle's child while it is held.
    pub fn child_name(&self) -> Option<String> {
        self.held.map(child_name)
    }

    /// Watch the contender children of this lock path.
    pub fn watch_children<F>(&self, watcher: F)
    where
        F: Fn(&[LockChild]) -> bool + Send + Sync + 'static,
    {
        self.table.watch(&self.path, Arc::new(watcher));
    }
}

impl std::fmt::Debug for PathLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathLock")
            .field("path", &self.path)
            .field("identifier", &self.identifier)
            .field("session", &self.session.id())
            .field("held", &self.held)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn table() -> Arc<LockTable> {
        Arc::new(LockTable::new())
    }

    #[test]
    fn first_acquirer_holds_second_is_refused() {
        let table = table();
        let s1 = Session::new(1);
        let s2 = Session::new(2);
        let mut a = PathLock::new(Arc::clone(&table), "/nodes/1/lock", &s1, Some("a"));
        let mut b = PathLock::new(Arc::clone(&table), "/nodes/1/lock", &s2, Some("b"));

        assert!(a.acquire(false, None, true).unwrap());
        assert!(!b.acquire(false, None, true).unwrap());
        // The refused attempt left no child behind.
        assert_eq!(table.children("/nodes/1/lock").len(), 1);

        assert!(a.release());
        assert!(b.acquire(false, None, true).unwrap());
    }

    #[test]
    fn release_is_idempotent() {
        let table = table();
        let s = Session::new(1);
        let mut a = PathLock::new(Arc::clone(&table), "/p", &s, None);
        assert!(a.acquire(false, None, true).unwrap());
        assert!(a.release());
        assert!(!a.release());
        assert!(!table.is_locked("/p"));
    }

    #[test]
    fn timed_acquire_gives_up() {
        let table = table();
        let s = Session::new(1);
        let mut a = PathLock::new(Arc::clone(&table), "/p", &s, None);
        let mut b = PathLock::new(Arc::clone(&table), "/p", &s, None);
        assert!(a.acquire(false, None, true).unwrap());
        assert!(!b.acquire(true, Some(Duration::from_millis(20)), true).unwrap());
        assert_eq!(table.children("/p").len(), 1);
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let table = table();
        let s = Session::new(1);
        let mut a = PathLock::new(Arc::clone(&table), "/p", &s, Some("a"));
        assert!(a.acquire(false, None, true).unwrap());

        let waiter_table = Arc::clone(&table);
        let waiter_session = s.clone();
        let waiter = thread::spawn(move || {
            let mut b = PathLock::new(waiter_table, "/p", &waiter_session, Some("b"));
            let got = b.acquire(true, Some(Duration::from_secs(5)), true).unwrap();
            (got, b.is_acquired())
        });

        // Wait until the contender is queued behind us.
        while table.children("/p").len() < 2 {
            thread::yield_now();
        }
        a.release();
        assert_eq!(waiter.join().unwrap(), (true, true));
    }

    #[test]
    fn lost_session_cannot_acquire() {
        let table = table();
        let s = Session::new(9);
        s.transition(ConnectionState::Lost);
        let mut a = PathLock::new(table, "/p", &s, None);
        assert!(matches!(
            a.acquire(false, None, true),
            Err(StateError::SessionLost(9))
        ));
    }

    #[test]
    fn expire_drops_only_ephemeral_children_of_session() {
        let table = table();
        let s1 = Session::new(1);
        let s2 = Session::new(2);
        let mut eph = PathLock::new(Arc::clone(&table), "/a", &s1, None);
        let mut persistent = PathLock::new(Arc::clone(&table), "/b", &s1, None);
        let mut other = PathLock::new(Arc::clone(&table), "/c", &s2, None);
        eph.acquire(false, None, true).unwrap();
        persistent.acquire(false, None, false).unwrap();
        other.acquire(false, None, true).unwrap();

        assert_eq!(table.expire_session(1), 1);
        assert!(!eph.is_acquired());
        assert!(persistent.is_acquired());
        assert!(other.is_acquired());
    }

    #[test]
    fn watchers_see_contenders_until_they_stop() {
        let table = table();
        let s = Session::new(1);
        let mut holder = PathLock::new(Arc::clone(&table), "/p", &s, Some("holder"));
        holder.acquire(false, None, true).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (calls_w, seen_w) = (Arc::clone(&calls), Arc::clone(&seen));
        holder.watch_children(move |children| {
            let n = calls_w.fetch_add(1, Ordering::SeqCst);
            seen_w
                .lock()
                .unwrap()
                .extend(children.iter().filter_map(|c| c.data.clone()));
            n < 2
        });

        let mut contender = PathLock::new(Arc::clone(&table), "/p", &s, Some("other"));
        assert!(!contender.acquire(false, None, true).unwrap());

        // Initial call, enqueue, withdraw: the third call stops the watch.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(seen.lock().unwrap().contains(&"other".to_string()));

        holder.release();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
