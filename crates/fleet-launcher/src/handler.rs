//! The re-entrant state machine that satisfies one
//! node request.
//!
//! ```text
//! Initial ──run()──► Launching ──poll()──► Done
//!                        ▲   │
//!              run() ────┘   └──► Paused   (driver reported no capacity)
//! ```
//!
//! `run()` hands the request to a `RequestDriver`, which picks nodes through
//! the `RequestContext` (reusing READY nodes or launching new ones).
//! `poll()` never blocks: it returns false until every launch has finished,
//! then commits the outcome (FULFILLED, declined, or abandoned) and returns
//! true.

use std::sync::Arc;

use fleet_state::{LauncherId, Node, NodeId, NodeRequest, NodeState, RequestState, Session, StateStore};
use tracing::{debug, error, info, warn};

use crate::config::{PoolConfig, ProviderConfig};
use crate::error::{LauncherError, LauncherResult};
use crate::launch_manager::{LaunchCounter, NodeLaunchManager};
use crate::lock::SessionLock;
use crate::provider::{NodeLauncher, ProviderManager};

/// Everything a handler needs to know about the pool it serves.
#[derive(Clone)]
pub struct PoolContext {
    pub launcher_id: LauncherId,
    pub store: StateStore,
    pub session: Session,
    pub provider: Arc<ProviderConfig>,
    pub pool: Arc<PoolConfig>,
    pub manager: Arc<dyn ProviderManager>,
    pub launcher: Arc<dyn NodeLauncher>,
    /// Launches in flight across every pool of the provider.
    pub launches: LaunchCounter,
}

/// Provider-specific request logic.
pub trait RequestDriver: Send {
    /// Choose nodes for `ctx`'s request.
    ///
    /// Called once per handler, and again each time the worker re-runs a
    /// paused handler. An error fails the request.
    fn run_handler(&mut self, ctx: &mut RequestContext) -> anyhow::Result<()>;
}

struct HeldNode {
    node: Node,
    lock: SessionLock,
}

/// The working state a driver manipulates.
pub struct RequestContext {
    pool: PoolContext,
    request: NodeRequest,
    request_lock: SessionLock,
    launch_manager: NodeLaunchManager,
    nodeset: Vec<HeldNode>,
    paused: bool,
    done: bool,
}

impl RequestContext {
    fn new(pool: PoolContext, request: NodeRequest, request_lock: SessionLock) -> Self {
        let launch_manager = NodeLaunchManager::new(
            pool.store.clone(),
            Arc::clone(&pool.manager),
            Arc::clone(&pool.launcher),
            pool.provider.launch_retries,
        )
        .with_counter(pool.launches.clone());
        Self {
            pool,
            request,
            request_lock,
            launch_manager,
            nodeset: Vec::new(),
            paused: false,
            done: false,
        }
    }

    pub fn pool(&self) -> &PoolContext {
        &self.pool
    }

    pub fn request(&self) -> &NodeRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut NodeRequest {
        &mut self.request
    }

    pub fn launch_manager(&self) -> &NodeLaunchManager {
        &self.launch_manager
    }

    /// Nodes locked for this request so far.
    pub fn nodeset(&self) -> impl Iterator<Item = &Node> {
        self.nodeset.iter().map(|h| &h.node)
    }

    /// Labels of the request not yet covered by the node set.
    pub fn missing_labels(&self) -> Vec<String> {
        let mut covered: Vec<&str> = self.nodeset().map(|n| n.label.as_str()).collect();
        let mut missing = Vec::new();
        for label in &self.request.label_set {
            match covered.iter().position(|l| *l == label.as_str()) {
                Some(i) => {
                    covered.swap_remove(i);
                }
                None => missing.push(label.clone()),
            }
        }
        missing
    }

    /// Mark the request as being worked on by this launcher.
    pub fn accept(&mut self) -> LauncherResult<()> {
        if self.request.state != RequestState::Pending {
            self.request.set_state(RequestState::Pending);
            self.pool.store.put_request(&self.request)?;
            debug!(request = %self.request.id, launcher = %self.pool.launcher_id, "request accepted");
        }
        Ok(())
    }

    /// READY nodes of this pool with `label` that this request may take.
    pub fn reusable_nodes(&self, label: &str) -> LauncherResult<Vec<Node>> {
        Ok(self
            .pool
            .store
            .list_nodes()?
            .into_iter()
            .filter(|n| {
                n.label == label
                    && n.provider == self.pool.provider.name
                    && n.pool == self.pool.pool.name
                    && self.may_take(n)
                    && !self.nodeset.iter().any(|h| h.node.id == n.id)
            })
            .collect())
    }

    fn may_take(&self, node: &Node) -> bool {
        node.state == NodeState::Ready
            && node
                .allocated_to
                .as_deref()
                .is_none_or(|owner| owner == self.request.id)
    }

    /// Lock an existing READY node and allocate it to this request.
    ///
    /// Returns false if the node is locked elsewhere or no longer available.
    pub fn lock_ready_node(&mut self, node: &Node) -> LauncherResult<bool> {
        let mut lock = self.node_lock(&node.id);
        if !lock.acquire(false, None, true)? {
            return Ok(false);
        }
        // Re-check under the lock.
        let Some(mut current) = self.pool.store.get_node(&node.id)? else {
            return Ok(false);
        };
        if !self.may_take(&current) {
            return Ok(false);
        }
        current.allocated_to = Some(self.request.id.clone());
        self.pool.store.put_node(&current)?;
        info!(node = %current.id, request = %self.request.id, "locked existing node");
        self.nodeset.push(HeldNode {
            node: current,
            lock,
        });
        Ok(true)
    }

    /// Create, lock and start launching a new node for `label`.
    pub fn launch_node(&mut self, label: &str) -> LauncherResult<NodeId> {
        let mut node = Node::new(&self.pool.provider.name, &self.pool.pool.name, label);
        node.allocated_to = Some(self.request.id.clone());
        node.launcher = Some(self.pool.launcher_id.clone());
        let id = self.pool.store.create_node(&mut node)?;

        let mut lock = self.node_lock(&id);
        if !lock.acquire(false, None, true)? {
            return Err(LauncherError::LockUnavailable(format!("new node {id}")));
        }
        info!(node = %id, %label, request = %self.request.id, "launching node");
        self.launch_manager.launch(node.clone(), lock.validity());
        self.nodeset.push(HeldNode { node, lock });
        Ok(id)
    }

    /// Nodes (any state) currently held by this pool.
    pub fn count_pool_nodes(&self) -> LauncherResult<usize> {
        Ok(self
            .pool
            .store
            .count_pool_nodes(&self.pool.provider.name, &self.pool.pool.name)?)
    }

    /// Signal that the pool has no capacity right now.
    pub fn pause(&mut self) {
        if !self.paused {
            debug!(request = %self.request.id, "pausing request handling");
        }
        self.paused = true;
    }

    pub fn unpause(&mut self) {
        if self.paused {
            debug!(request = %self.request.id, "unpaused request handling");
        }
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Give the request up: record the decline, hand it back (or fail it if
    /// every registered launcher has declined) and finish.
    pub fn decline(&mut self, reason: &str) -> LauncherResult<()> {
        info!(
            request = %self.request.id,
            launcher = %self.pool.launcher_id,
            %reason,
            "declining node request"
        );
        self.record_decline();
        self.unlock_node_set(true);
        self.paused = false;
        self.commit_request()?;
        self.finish();
        Ok(())
    }

    /// Add our decline and move the request to FAILED or back to REQUESTED.
    fn record_decline(&mut self) {
        self.request.decline(&self.pool.launcher_id);
        let launchers = self.pool.store.registered_launchers();
        if self.request.declined_by_all(&launchers) {
            warn!(
                request = %self.request.id,
                declined_by = ?self.request.declined_by,
                "node request declined by all launchers"
            );
            self.request.fail();
        } else {
            self.request.reset();
        }
    }

    /// Release every node lock, optionally clearing the allocation first.
    ///
    /// Best effort: a failure on one node is logged and the rest are still
    /// released.
    pub fn unlock_node_set(&mut self, clear_allocation: bool) {
        for HeldNode { node, mut lock } in self.nodeset.drain(..) {
            if clear_allocation && lock.is_still_valid() {
                if let Err(e) = clear_allocation_of(&self.pool.store, &node.id) {
                    error!(node = %node.id, error = %e, "failed to clear node allocation");
                }
            }
            lock.release();
        }
    }

    fn locks_valid(&self) -> bool {
        self.request_lock.is_still_valid() && self.nodeset.iter().all(|h| h.lock.is_still_valid())
    }

    /// Persist the request unless our claim on it is gone.
    fn commit_request(&mut self) -> LauncherResult<()> {
        if !self.request_lock.is_still_valid() {
            warn!(request = %self.request.id, "request lock lost; not storing request");
            return Ok(());
        }
        self.pool.store.put_request(&self.request)?;
        Ok(())
    }

    fn finish(&mut self) {
        self.request_lock.release();
        self.done = true;
    }

    /// Refresh node-set entries from the finished launches.
    fn sync_launched_nodes(&mut self) {
        let launched = self
            .launch_manager
            .ready_nodes()
            .iter()
            .chain(self.launch_manager.failed_nodes());
        for node in launched {
            if let Some(held) = self.nodeset.iter_mut().find(|h| h.node.id == node.id) {
                held.node = node.clone();
            }
        }
    }

    /// Node ids in `label_set` order.
    fn ordered_node_ids(&self) -> Vec<NodeId> {
        let mut remaining: Vec<&Node> = self.nodeset().collect();
        let mut ids = Vec::with_capacity(remaining.len());
        for label in &self.request.label_set {
            if let Some(i) = remaining.iter().position(|n| &n.label == label) {
                ids.push(remaining.remove(i).id.clone());
            }
        }
        ids.extend(remaining.into_iter().map(|n| n.id.clone()));
        ids
    }

    fn node_lock(&self, node_id: &str) -> SessionLock {
        SessionLock::new(self.pool.store.node_lock(
            node_id,
            &self.pool.session,
            Some(&self.pool.launcher_id),
        ))
    }
}

fn clear_allocation_of(store: &StateStore, node_id: &str) -> LauncherResult<()> {
    if let Some(mut node) = store.get_node(node_id)? {
        if node.allocated_to.take().is_some() {
            store.put_node(&node)?;
        }
    }
    Ok(())
}

/// Handler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Initial,
    Launching,
    Paused,
    Done,
}

pub struct NodeRequestHandler {
    driver: Box<dyn RequestDriver>,
    ctx: RequestContext,
    state: HandlerState,
}

impl NodeRequestHandler {
    /// `request_lock` must already be held.
    pub fn new(
        pool: PoolContext,
        request: NodeRequest,
        request_lock: SessionLock,
        driver: Box<dyn RequestDriver>,
    ) -> Self {
        Self {
            driver,
            ctx: RequestContext::new(pool, request, request_lock),
            state: HandlerState::Initial,
        }
    }

    /// Run the driver. Valid on a new handler and on a paused one.
    ///
    /// A driver error fails the request: every held node is released with
    /// its allocation cleared and the request lock is dropped.
    pub fn run(&mut self) -> LauncherResult<()> {
        if !matches!(self.state, HandlerState::Initial | HandlerState::Paused) {
            return Err(LauncherError::InvalidState(format!(
                "run() on {:?} handler for request {}",
                self.state, self.ctx.request.id
            )));
        }

        let outcome = match self.driver.run_handler(&mut self.ctx) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(request = %self.ctx.request.id, error = %e, "request handler failed");
                self.ctx.unlock_node_set(true);
                self.ctx.request.fail();
                let stored = self.ctx.commit_request();
                self.ctx.finish();
                stored
            }
        };

        self.state = if self.ctx.done {
            HandlerState::Done
        } else if self.ctx.paused {
            HandlerState::Paused
        } else {
            HandlerState::Launching
        };
        outcome
    }

    /// Advance the handler. Returns true once it is finished.
    pub fn poll(&mut self) -> LauncherResult<bool> {
        match self.state {
            HandlerState::Initial => {
                return Err(LauncherError::InvalidState(format!(
                    "poll() before run() for request {}",
                    self.ctx.request.id
                )));
            }
            HandlerState::Paused => return Ok(false),
            HandlerState::Done => return Ok(true),
            HandlerState::Launching => {}
        }

        if !self.ctx.launch_manager.poll()? {
            return Ok(false);
        }
        self.ctx.sync_launched_nodes();

        if !self.ctx.locks_valid() {
            warn!(request = %self.ctx.request.id, "store session lost; abandoning request");
            self.ctx.unlock_node_set(false);
            self.finish();
            return Ok(true);
        }

        let request_id = self.ctx.request.id.clone();
        if self.ctx.pool.store.get_request(&request_id)?.is_none() {
            info!(request = %request_id, "node request disappeared; releasing nodes");
            self.ctx.unlock_node_set(true);
            self.finish();
            return Ok(true);
        }

        if self.ctx.launch_manager.failed_nodes().is_empty() {
            let nodes = self.ctx.ordered_node_ids();
            info!(request = %request_id, ?nodes, "node request fulfilled");
            self.ctx.request.fulfill(nodes);
        } else {
            info!(
                request = %request_id,
                failed = self.ctx.launch_manager.failed_nodes().len(),
                "declining node request because nodes failed"
            );
            self.ctx.record_decline();
        }

        self.ctx.unlock_node_set(false);
        let stored = self.ctx.commit_request();
        self.finish();
        stored?;
        Ok(true)
    }

    /// Drop everything this handler holds without touching the request.
    ///
    /// Used by the worker when a handler errors out or the worker shuts down.
    pub fn abort(&mut self) {
        self.ctx.unlock_node_set(true);
        self.finish();
    }

    fn finish(&mut self) {
        self.ctx.finish();
        self.state = HandlerState::Done;
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn request(&self) -> &NodeRequest {
        &self.ctx.request
    }

    pub fn is_paused(&self) -> bool {
        self.state == HandlerState::Paused
    }

    pub fn is_done(&self) -> bool {
        self.state == HandlerState::Done
    }

    pub fn alive_task_count(&self) -> usize {
        self.ctx.launch_manager.alive_task_count()
    }

    pub fn ready_nodes(&self) -> &[Node] {
        self.ctx.launch_manager.ready_nodes()
    }

    pub fn failed_nodes(&self) -> &[Node] {
        self.ctx.launch_manager.failed_nodes()
    }

    pub fn unlock_node_set(&mut self, clear_allocation: bool) {
        self.ctx.unlock_node_set(clear_allocation);
    }
}

impl std::fmt::Debug for NodeRequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRequestHandler")
            .field("request", &self.ctx.request.id)
            .field("state", &self.state)
            .field("nodes", &self.ctx.nodeset.len())
            .finish()
    }
}
