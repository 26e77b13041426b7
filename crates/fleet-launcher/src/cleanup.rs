//! Background cleanup: lost requests, orphaned allocations, dead or aged
//! nodes and servers the store no longer knows about.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use fleet_state::{Node, NodeState, RequestState, Session, StateStore, epoch_secs};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::LauncherResult;
use crate::lock::SessionLock;
use crate::provider::ProviderManager;

/// Node states whose unlocked records are deleted.
const CLEANUP_STATES: [NodeState; 3] = [NodeState::Used, NodeState::Failed, NodeState::Delete];

/// Whether an unlocked `node` is dead.
///
/// BUILDING counts only once the launcher that created it is gone: a live
/// launcher holds the node lock for the whole launch.
fn is_dead(node: &Node, launchers: &HashSet<String>) -> bool {
    CLEANUP_STATES.contains(&node.state)
        || (node.state == NodeState::Building
            && node.launcher.as_ref().is_none_or(|l| !launchers.contains(l)))
}

/// What one cleanup pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub requests_reset: usize,
    pub nodes_deallocated: usize,
    pub nodes_deleted: usize,
    /// Unallocated READY nodes past their label's max ready age.
    pub nodes_retired: usize,
    /// Provider servers without a node record.
    pub leaked_instances: usize,
}

/// Tears down a node's server and removes its record.
pub struct NodeDeleter;

impl NodeDeleter {
    /// Delete `node`, which must be locked by `lock`.
    ///
    /// On a provider error the record stays in DELETE state and is only
    /// unlocked, so a later pass retries. Returns whether it was removed.
    pub async fn delete(
        store: &StateStore,
        manager: &dyn ProviderManager,
        mut node: Node,
        mut lock: SessionLock,
    ) -> LauncherResult<bool> {
        node.set_state(NodeState::Delete);
        store.put_node(&node)?;

        if let Some(external_id) = node.external_id.clone() {
            let torn_down = async {
                manager.cleanup_node(&external_id).await?;
                manager.wait_for_node_cleanup(&external_id).await
            }
            .await;
            if let Err(e) = torn_down {
                error!(node = %node.id, %external_id, error = %e, "failed to delete server");
                lock.release();
                return Ok(false);
            }
        }

        if !lock.is_still_valid() {
            warn!(node = %node.id, "node lock lost; not removing record");
            return Ok(false);
        }
        store.delete_node(&node.id)?;
        lock.release();
        info!(node = %node.id, provider = %node.provider, "node deleted");
        Ok(true)
    }
}

pub struct CleanupWorker {
    store: StateStore,
    session: Session,
    identifier: String,
    managers: HashMap<String, Arc<dyn ProviderManager>>,
    max_ready_age: HashMap<String, Duration>,
}

impl CleanupWorker {
    pub fn new(
        store: StateStore,
        session: Session,
        identifier: &str,
        managers: HashMap<String, Arc<dyn ProviderManager>>,
    ) -> Self {
        Self {
            store,
            session,
            identifier: identifier.to_string(),
            managers,
            max_ready_age: HashMap::new(),
        }
    }

    /// Retire unallocated READY nodes of each label once they have been
    /// READY for longer than the given age.
    pub fn with_max_ready_age(mut self, ages: HashMap<String, Duration>) -> Self {
        self.max_ready_age = ages;
        self
    }

    /// One cleanup pass. Does nothing while the session is not connected.
    pub async fn run_once(&self) -> LauncherResult<CleanupReport> {
        if !self.session.is_connected() {
            return Ok(CleanupReport::default());
        }
        let report = CleanupReport {
            requests_reset: self.reset_lost_requests()?,
            nodes_deallocated: self.deallocate_orphaned_nodes()?,
            nodes_deleted: self.delete_dead_nodes().await?,
            nodes_retired: self.retire_aged_nodes().await?,
            leaked_instances: self.delete_leaked_instances().await?,
        };
        if report != CleanupReport::default() {
            info!(
                requests_reset = report.requests_reset,
                nodes_deallocated = report.nodes_deallocated,
                nodes_deleted = report.nodes_deleted,
                nodes_retired = report.nodes_retired,
                leaked_instances = report.leaked_instances,
                "cleanup pass finished"
            );
        }
        Ok(report)
    }

    fn lock_node(&self, node: &Node) -> LauncherResult<Option<SessionLock>> {
        let mut lock = SessionLock::new(self.store.node_lock(
            &node.id,
            &self.session,
            Some(&self.identifier),
        ));
        Ok(lock.acquire(false, None, true)?.then_some(lock))
    }

    /// PENDING requests nobody holds a lock on lost their launcher: free
    /// their nodes and hand them back to the pool.
    fn reset_lost_requests(&self) -> LauncherResult<usize> {
        let mut reset = 0;
        for request in self.store.list_requests()? {
            if request.state != RequestState::Pending || self.store.is_request_locked(&request.id) {
                continue;
            }
            let mut lock = SessionLock::new(self.store.request_lock(
                &request.id,
                &self.session,
                Some(&self.identifier),
            ));
            if !lock.acquire(false, None, true)? {
                continue;
            }
            let Some(mut request) = self.store.get_request(&request.id)? else {
                continue;
            };
            if request.state != RequestState::Pending {
                continue;
            }

            for node in self.store.list_nodes()? {
                if node.allocated_to.as_deref() != Some(request.id.as_str()) {
                    continue;
                }
                let Some(node_lock) = self.lock_node(&node)? else {
                    debug!(node = %node.id, "allocated node locked; leaving allocation");
                    continue;
                };
                if let Some(mut current) = self.store.get_node(&node.id)? {
                    current.allocated_to = None;
                    self.store.put_node(&current)?;
                }
                drop(node_lock);
            }

            request.reset();
            self.store.put_request(&request)?;
            info!(request = %request.id, "reset lost node request");
            reset += 1;
        }
        Ok(reset)
    }

    /// READY nodes allocated to a request that no longer exists.
    fn deallocate_orphaned_nodes(&self) -> LauncherResult<usize> {
        let requests: HashSet<String> = self
            .store
            .list_requests()?
            .into_iter()
            .map(|r| r.id)
            .collect();
        let mut deallocated = 0;
        for node in self.store.list_nodes()? {
            let orphaned = |n: &Node| {
                n.state == NodeState::Ready
                    && n.allocated_to.as_ref().is_some_and(|r| !requests.contains(r))
            };
            if !orphaned(&node) {
                continue;
            }
            let Some(lock) = self.lock_node(&node)? else {
                continue;
            };
            if let Some(mut current) = self.store.get_node(&node.id)? {
                if orphaned(&current) {
                    debug!(node = %current.id, request = ?current.allocated_to, "deallocating node of missing request");
                    current.allocated_to = None;
                    self.store.put_node(&current)?;
                    deallocated += 1;
                }
            }
            drop(lock);
        }
        Ok(deallocated)
    }

    /// Unlocked dead nodes are torn down and removed.
    async fn delete_dead_nodes(&self) -> LauncherResult<usize> {
        let launchers: HashSet<String> = self.store.registered_launchers().into_iter().collect();
        let mut deleted = 0;
        for node in self.store.list_nodes()? {
            if !is_dead(&node, &launchers) {
                continue;
            }
            let Some(manager) = self.managers.get(&node.provider) else {
                continue;
            };
            let Some(lock) = self.lock_node(&node)? else {
                continue;
            };
            // Double check under the lock.
            let Some(current) = self.store.get_node(&node.id)? else {
                continue;
            };
            if !is_dead(&current, &launchers) {
                continue;
            }
            debug!(node = %current.id, state = %current.state, launcher = ?current.launcher, "deleting unlocked node");
            if NodeDeleter::delete(&self.store, manager.as_ref(), current, lock).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Unallocated READY nodes older than their label's max ready age.
    async fn retire_aged_nodes(&self) -> LauncherResult<usize> {
        if self.max_ready_age.is_empty() {
            return Ok(0);
        }
        let aged = |n: &Node| {
            n.state == NodeState::Ready
                && n.allocated_to.is_none()
                && self
                    .max_ready_age
                    .get(&n.label)
                    .is_some_and(|age| epoch_secs().saturating_sub(n.state_time) >= age.as_secs())
        };
        let mut retired = 0;
        for node in self.store.list_nodes()? {
            if !aged(&node) {
                continue;
            }
            let Some(manager) = self.managers.get(&node.provider) else {
                continue;
            };
            let Some(lock) = self.lock_node(&node)? else {
                continue;
            };
            let Some(current) = self.store.get_node(&node.id)? else {
                continue;
            };
            if !aged(&current) {
                continue;
            }
            info!(node = %current.id, label = %current.label, ready_since = current.state_time, "retiring aged ready node");
            if NodeDeleter::delete(&self.store, manager.as_ref(), current, lock).await? {
                retired += 1;
            }
        }
        Ok(retired)
    }

    /// Servers created for a node whose record is gone.
    ///
    /// A listing error skips that provider for this pass.
    async fn delete_leaked_instances(&self) -> LauncherResult<usize> {
        let mut leaked = 0;
        for (provider, manager) in &self.managers {
            let servers = match manager.list_nodes().await {
                Ok(servers) => servers,
                Err(e) => {
                    warn!(%provider, error = %e, "failed to list provider servers");
                    continue;
                }
            };
            for server in servers {
                let Some(node_id) = server.node_id.as_deref() else {
                    continue;
                };
                if self.store.get_node(node_id)?.is_some() {
                    continue;
                }
                warn!(%provider, node = %node_id, external_id = %server.external_id, "deleting leaked instance");
                let torn_down = async {
                    manager.cleanup_node(&server.external_id).await?;
                    manager.wait_for_node_cleanup(&server.external_id).await
                }
                .await;
                match torn_down {
                    Ok(()) => leaked += 1,
                    Err(e) => {
                        error!(%provider, external_id = %server.external_id, error = %e, "failed to delete leaked instance")
                    }
                }
            }
        }
        Ok(leaked)
    }

    /// Run cleanup passes every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs_f64(), "cleanup worker started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "cleanup pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("cleanup worker shutting down");
                    break;
                }
            }
        }
    }
}
