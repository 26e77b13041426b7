//! redb-backed coordination store for fleet launchers.
//!
//! Node records and node requests are JSON-serialized into redb's `&[u8]`
//! value columns and survive restarts. Sessions, ephemeral locks and the
//! launcher registry live in memory and vanish with the process, which is
//! the lifetime their owners expect.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::locks::{LockTable, PathLock};
use crate::session::{lock, ConnectionState, Session, SessionId};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe coordination store. Clones share the same database.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    locks: Arc<LockTable>,
    launchers: Arc<Mutex<BTreeMap<LauncherId, SessionId>>>,
    next_session: Arc<AtomicU64>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_db(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_db(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_db(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            locks: Arc::new(LockTable::new()),
            launchers: Arc::new(Mutex::new(BTreeMap::new())),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(REQUESTS).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Records (generic) ──────────────────────────────────────────

    /// Overwrite an existing record. A missing key is `NotFound` and the
    /// transaction is dropped without writing.
    fn update_record<T: Serialize>(
        &self,
        def: RecordTable,
        key: &str,
        record: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            if table.get(key).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(key.to_string()));
            }
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_record<T: DeserializeOwned>(&self, def: RecordTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_records<T: DeserializeOwned>(&self, def: RecordTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    fn delete_record(&self, def: RecordTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Bump the `kind` sequence inside `txn` and return the new value.
    fn next_id(txn: &WriteTransaction, kind: &str) -> StateResult<u64> {
        let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        let current = table
            .get(kind)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let next = current + 1;
        table.insert(kind, next).map_err(map_err!(Write))?;
        Ok(next)
    }

    /// Assign an id from the `kind` sequence and insert the record, atomically.
    fn create_record<T: Serialize>(
        &self,
        def: RecordTable,
        kind: &str,
        format_id: impl FnOnce(u64) -> String,
        assign: impl FnOnce(&mut T, String),
        record: &mut T,
    ) -> StateResult<String> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = format_id(Self::next_id(&txn, kind)?);
        assign(record, id.clone());
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(id)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Store a new node record, assigning its id.
    pub fn create_node(&self, node: &mut Node) -> StateResult<NodeId> {
        let id = self.create_record(
            NODES,
            "node",
            |n| format!("{n:010}"),
            |node: &mut Node, id| node.id = id,
            node,
        )?;
        debug!(node = %id, label = %node.label, "node created");
        Ok(id)
    }

    /// Update an existing node record. Fails with `NotFound` if the record
    /// was deleted; use `create_node` to insert.
    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        if node.id.is_empty() {
            return Err(StateError::InvalidRecord("node without id".into()));
        }
        self.update_record(NODES, &node.id, node)?;
        debug!(node = %node.id, state = %node.state, "node stored");
        Ok(())
    }

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<Node>> {
        self.get_record(NODES, node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.list_records(NODES)
    }

    /// Delete a node record. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let existed = self.delete_record(NODES, node_id)?;
        debug!(node = %node_id, existed, "node deleted");
        Ok(existed)
    }

    /// Number of node records (any state) belonging to `provider`/`pool`.
    pub fn count_pool_nodes(&self, provider: &str, pool: &str) -> StateResult<usize> {
        Ok(self
            .list_nodes()?
            .iter()
            .filter(|n| n.provider == provider && n.pool == pool)
            .count())
    }

    // ── Requests ───────────────────────────────────────────────────

    /// Store a new request, assigning its id.
    pub fn create_request(&self, request: &mut NodeRequest) -> StateResult<RequestId> {
        let id = self.create_record(
            REQUESTS,
            "request",
            |n| format!("req-{n:010}"),
            |req: &mut NodeRequest, id| req.id = id,
            request,
        )?;
        info!(request = %id, labels = ?request.label_set, "node request submitted");
        Ok(id)
    }

    /// Update an existing request. Fails with `NotFound` if the request was
    /// deleted; use `create_request` to insert.
    pub fn put_request(&self, request: &NodeRequest) -> StateResult<()> {
        if request.id.is_empty() {
            return Err(StateError::InvalidRecord("request without id".into()));
        }
        self.update_record(REQUESTS, &request.id, request)?;
        debug!(request = %request.id, state = %request.state, "request stored");
        Ok(())
    }

    pub fn get_request(&self, request_id: &str) -> StateResult<Option<NodeRequest>> {
        self.get_record(REQUESTS, request_id)
    }

    /// All requests, oldest first.
    pub fn list_requests(&self) -> StateResult<Vec<NodeRequest>> {
        self.list_records(REQUESTS)
    }

    /// Delete a request. Returns true if it existed.
    pub fn delete_request(&self, request_id: &str) -> StateResult<bool> {
        let existed = self.delete_record(REQUESTS, request_id)?;
        debug!(request = %request_id, existed, "request deleted");
        Ok(existed)
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Start a new client session.
    pub fn open_session(&self) -> Session {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "store session opened");
        Session::new(id)
    }

    /// Expire `session`: notify its listeners of LOST, then drop its
    /// ephemeral lock children and launcher registrations.
    pub fn expire_session(&self, session: &Session) {
        session.transition(ConnectionState::Lost);
        let children = self.locks.expire_session(session.id());
        let launchers = {
            let mut registry = lock(&self.launchers);
            let before = registry.len();
            registry.retain(|_, owner| *owner != session.id());
            before - registry.len()
        };
        info!(session = session.id(), children, launchers, "store session expired");
    }

    // ── Launcher registry ──────────────────────────────────────────

    /// Register `launcher` as alive for the lifetime of `session`.
    pub fn register_launcher(&self, launcher: &str, session: &Session) {
        let previous = lock(&self.launchers).insert(launcher.to_string(), session.id());
        if previous != Some(session.id()) {
            info!(%launcher, session = session.id(), "launcher registered");
        }
    }

    pub fn unregister_launcher(&self, launcher: &str) -> bool {
        let removed = lock(&self.launchers).remove(launcher).is_some();
        if removed {
            info!(%launcher, "launcher unregistered");
        }
        removed
    }

    /// Currently registered launcher ids, sorted.
    pub fn registered_launchers(&self) -> Vec<LauncherId> {
        lock(&self.launchers).keys().cloned().collect()
    }

    // ── Locks ──────────────────────────────────────────────────────

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    /// A lock handle on an arbitrary path.
    pub fn lock(&self, path: &str, session: &Session, identifier: Option<&str>) -> PathLock {
        PathLock::new(Arc::clone(&self.locks), path, session, identifier)
    }

    pub fn node_lock(&self, node_id: &str, session: &Session, identifier: Option<&str>) -> PathLock {
        self.lock(&node_lock_path(node_id), session, identifier)
    }

    pub fn request_lock(
        &self,
        request_id: &str,
        session: &Session,
        identifier: Option<&str>,
    ) -> PathLock {
        self.lock(&request_lock_path(request_id), session, identifier)
    }

    pub fn is_node_locked(&self, node_id: &str) -> bool {
        self.locks.is_locked(&node_lock_path(node_id))
    }

    pub fn is_request_locked(&self, request_id: &str) -> bool {
        self.locks.is_locked(&request_lock_path(request_id))
    }
}

fn node_lock_path(node_id: &str) -> String {
    format!("/nodes/{node_id}/lock")
}

fn request_lock_path(request_id: &str) -> String {
    format!("/requests/{request_id}/lock")
}
