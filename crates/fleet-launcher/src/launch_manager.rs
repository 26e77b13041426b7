//! Runs one LaunchTask per node in parallel and reports
//! completion through a non-blocking `poll`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fleet_state::{Node, NodeId, NodeState, StateStore};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{LauncherError, LauncherResult};
use crate::launch::LaunchTask;
use crate::lock::LockValidity;
use crate::provider::{NodeLauncher, ProviderManager};

/// Launch tasks in flight, shared by every pool of one provider.
#[derive(Debug, Clone, Default)]
pub struct LaunchCounter(Arc<AtomicUsize>);

impl LaunchCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn start(&self) -> LaunchGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        LaunchGuard(Arc::clone(&self.0))
    }
}

/// Counts one launch until dropped, including when its task panics.
struct LaunchGuard(Arc<AtomicUsize>);

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Tracked {
    node_id: NodeId,
    rx: oneshot::Receiver<Node>,
    handle: JoinHandle<()>,
    result: Option<Node>,
}

#[derive(Default)]
struct Outcome {
    ready: Vec<Node>,
    failed: Vec<Node>,
}

pub struct NodeLaunchManager {
    store: StateStore,
    manager: Arc<dyn ProviderManager>,
    launcher: Arc<dyn NodeLauncher>,
    retries: u32,
    counter: LaunchCounter,
    tasks: Vec<Tracked>,
    /// Set once every task has reported.
    outcome: Option<Outcome>,
}

impl NodeLaunchManager {
    pub fn new(
        store: StateStore,
        manager: Arc<dyn ProviderManager>,
        launcher: Arc<dyn NodeLauncher>,
        retries: u32,
    ) -> Self {
        Self {
            store,
            manager,
            launcher,
            retries,
            counter: LaunchCounter::new(),
            tasks: Vec::new(),
            outcome: None,
        }
    }

    /// Count launches against `counter` instead of a private one.
    pub fn with_counter(mut self, counter: LaunchCounter) -> Self {
        self.counter = counter;
        self
    }

    /// Start launching `node` in the background.
    pub fn launch(&mut self, node: Node, validity: LockValidity) {
        let node_id = node.id.clone();
        let task = LaunchTask::new(
            self.store.clone(),
            Arc::clone(&self.manager),
            Arc::clone(&self.launcher),
            node,
            self.retries,
            validity,
        );
        let (tx, rx) = oneshot::channel();
        let guard = self.counter.start();
        let handle = tokio::spawn(async move {
            let node = task.run().await;
            drop(guard);
            let _ = tx.send(node);
        });
        debug!(node = %node_id, "launch task started");
        self.track(node_id, rx, handle);
    }

    fn track(&mut self, node_id: NodeId, rx: oneshot::Receiver<Node>, handle: JoinHandle<()>) {
        self.tasks.push(Tracked {
            node_id,
            rx,
            handle,
            result: None,
        });
        self.outcome = None;
    }

    /// True once every tracked node is READY or FAILED. Never blocks.
    ///
    /// A task that reports a non-terminal node, or ends without reporting,
    /// is an invariant violation.
    pub fn poll(&mut self) -> LauncherResult<bool> {
        if self.outcome.is_some() {
            return Ok(true);
        }

        let mut pending = 0;
        for task in self.tasks.iter_mut().filter(|t| t.result.is_none()) {
            match task.rx.try_recv() {
                Ok(node) if node.state.is_launch_terminal() => task.result = Some(node),
                Ok(node) => {
                    return Err(LauncherError::InvariantViolation(format!(
                        "launch of node {} ended in state {}",
                        task.node_id, node.state
                    )));
                }
                Err(TryRecvError::Empty) => pending += 1,
                Err(TryRecvError::Closed) => {
                    return Err(LauncherError::InvariantViolation(format!(
                        "launch task for node {} exited without a result",
                        task.node_id
                    )));
                }
            }
        }
        if pending > 0 {
            return Ok(false);
        }

        let mut outcome = Outcome::default();
        for node in self.tasks.iter().filter_map(|t| t.result.clone()) {
            match node.state {
                NodeState::Ready => outcome.ready.push(node),
                _ => outcome.failed.push(node),
            }
        }
        debug!(
            ready = outcome.ready.len(),
            failed = outcome.failed.len(),
            "all launch tasks finished"
        );
        self.outcome = Some(outcome);
        Ok(true)
    }

    /// Nodes that launched. Empty until `poll` has returned true.
    pub fn ready_nodes(&self) -> &[Node] {
        self.outcome
            .as_ref()
            .map(|o| o.ready.as_slice())
            .unwrap_or_default()
    }

    /// Nodes that failed to launch. Empty until `poll` has returned true.
    pub fn failed_nodes(&self) -> &[Node] {
        self.outcome
            .as_ref()
            .map(|o| o.failed.as_slice())
            .unwrap_or_default()
    }

    /// Launch tasks still running.
    pub fn alive_task_count(&self) -> usize {
        self.tasks.iter().filter(|t| !t.handle.is_finished()).count()
    }

    pub fn node_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeProvider;
    use std::time::Duration;

    fn manager_with(provider: &Arc<FakeProvider>, store: &StateStore) -> NodeLaunchManager {
        NodeLaunchManager::new(store.clone(), provider.clone(), provider.clone(), 1)
    }

    fn new_node(store: &StateStore, label: &str) -> Node {
        let mut node = Node::new("fake", "main", label);
        store.create_node(&mut node).unwrap();
        node
    }

    async fn wait_done(mgr: &mut NodeLaunchManager) {
        for _ in 0..500 {
            if mgr.poll().unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("launches did not finish");
    }

    #[tokio::test]
    async fn no_tasks_is_complete() {
        let store = StateStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::new("fake", Duration::ZERO));
        let mut mgr = manager_with(&provider, &store);
        assert!(mgr.poll().unwrap());
        assert!(mgr.ready_nodes().is_empty());
    }

    #[tokio::test]
    async fn partitions_once_all_tasks_finish() {
        let store = StateStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::new("fake", Duration::ZERO));
        provider.start().unwrap();
        provider.set_label_failing("broken", true);
        provider.hold_launches();

        let mut mgr = manager_with(&provider, &store);
        for label in ["small", "small", "broken"] {
            mgr.launch(new_node(&store, label), LockValidity::always());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!mgr.poll().unwrap());
        assert_eq!(mgr.alive_task_count(), 3);
        assert!(mgr.ready_nodes().is_empty());

        provider.release_launches();
        wait_done(&mut mgr).await;
        assert_eq!(mgr.ready_nodes().len(), 2);
        assert_eq!(mgr.failed_nodes().len(), 1);
        assert_eq!(mgr.failed_nodes()[0].label, "broken");
        assert_eq!(mgr.alive_task_count(), 0);
        assert_eq!(mgr.node_count(), 3);

        // Cached: repeated polls keep the same partition.
        assert!(mgr.poll().unwrap());
        assert_eq!(mgr.ready_nodes().len() + mgr.failed_nodes().len(), 3);
    }

    #[tokio::test]
    async fn shared_counter_tracks_launches_in_flight() {
        let store = StateStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::new("fake", Duration::ZERO));
        provider.start().unwrap();
        provider.hold_launches();

        let counter = LaunchCounter::new();
        let mut east = manager_with(&provider, &store).with_counter(counter.clone());
        let mut west = manager_with(&provider, &store).with_counter(counter.clone());
        east.launch(new_node(&store, "small"), LockValidity::always());
        west.launch(new_node(&store, "small"), LockValidity::always());
        west.launch(new_node(&store, "small"), LockValidity::always());
        assert_eq!(counter.active(), 3);

        provider.release_launches();
        wait_done(&mut east).await;
        wait_done(&mut west).await;
        assert_eq!(counter.active(), 0);
    }

    #[tokio::test]
    async fn non_terminal_result_is_an_invariant_violation() {
        let store = StateStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::new("fake", Duration::ZERO));
        let mut mgr = manager_with(&provider, &store);

        let (tx, rx) = oneshot::channel();
        tx.send(Node::new("fake", "main", "small")).unwrap();
        mgr.track("1".into(), rx, tokio::spawn(async {}));
        assert!(matches!(mgr.poll(), Err(LauncherError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn silent_task_exit_is_an_invariant_violation() {
        let store = StateStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::new("fake", Duration::ZERO));
        let mut mgr = manager_with(&provider, &store);

        let (tx, rx) = oneshot::channel::<Node>();
        drop(tx);
        mgr.track("1".into(), rx, tokio::spawn(async {}));
        assert!(matches!(mgr.poll(), Err(LauncherError::InvariantViolation(_))));
    }
}
