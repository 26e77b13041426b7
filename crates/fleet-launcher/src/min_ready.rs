//! Keeps a floor of READY, unallocated nodes for labels with `min_ready`.
//!
//! Missing nodes are requested one node per request, so several providers
//! can share the work. Once such a request completes it is deleted and its
//! nodes are released back into the ready pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_state::{NodeRequest, NodeState, RequestId, RequestState, StateError, StateStore};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::LauncherConfig;
use crate::error::LauncherResult;
use crate::provider::ProviderManager;

/// Requestor recorded on every request this worker submits.
pub const MIN_READY_REQUESTOR: &str = "fleet:min-ready";

struct Target {
    label: String,
    min_ready: usize,
    /// Providers with a pool serving the label.
    providers: Vec<Arc<dyn ProviderManager>>,
}

pub struct MinReadyWorker {
    store: StateStore,
    targets: Vec<Target>,
    submitted: HashMap<String, Vec<RequestId>>,
}

impl MinReadyWorker {
    /// Worker for every label of `config` with a non-zero `min_ready` that
    /// at least one pool serves.
    pub fn new(
        store: StateStore,
        config: &LauncherConfig,
        managers: &HashMap<String, Arc<dyn ProviderManager>>,
    ) -> Self {
        let mut targets = Vec::new();
        for label in config.labels.iter().filter(|l| l.min_ready > 0) {
            let providers: Vec<_> = config
                .providers
                .iter()
                .filter(|p| p.pools.iter().any(|pool| pool.serves(&label.name)))
                .filter_map(|p| managers.get(&p.name).cloned())
                .collect();
            if providers.is_empty() {
                warn!(label = %label.name, min_ready = label.min_ready, "no pool serves label; ignoring min_ready");
                continue;
            }
            targets.push(Target {
                label: label.name.clone(),
                min_ready: label.min_ready as usize,
                providers,
            });
        }
        Self {
            store,
            targets,
            submitted: HashMap::new(),
        }
    }

    /// Requests submitted by this worker that have not completed yet.
    pub fn outstanding(&self) -> usize {
        self.submitted.values().map(Vec::len).sum()
    }

    /// Drop completed requests, then request whatever each label is short
    /// of. Returns the number of requests submitted.
    pub fn run_once(&mut self) -> LauncherResult<usize> {
        self.remove_completed_requests()?;

        let nodes = self.store.list_nodes()?;
        let mut created = 0;
        for target in &self.targets {
            if self.submitted.contains_key(&target.label) {
                continue;
            }
            let ready = nodes
                .iter()
                .filter(|n| {
                    n.label == target.label
                        && n.state == NodeState::Ready
                        && n.allocated_to.is_none()
                })
                .count();
            let need = target.min_ready.saturating_sub(ready);
            if need == 0 {
                continue;
            }
            if !target.providers.iter().any(|p| p.label_ready(&target.label)) {
                debug!(label = %target.label, "label not bootable yet; not requesting");
                continue;
            }

            info!(label = %target.label, need, ready, "requesting min-ready nodes");
            let ids = self.submitted.entry(target.label.clone()).or_default();
            for _ in 0..need {
                let mut request = NodeRequest::new(MIN_READY_REQUESTOR, vec![target.label.clone()]);
                ids.push(self.store.create_request(&mut request)?);
                created += 1;
            }
        }
        Ok(created)
    }

    /// Delete fulfilled and failed requests, releasing fulfilled nodes.
    fn remove_completed_requests(&mut self) -> LauncherResult<()> {
        for ids in self.submitted.values_mut() {
            let mut active = Vec::with_capacity(ids.len());
            for id in ids.drain(..) {
                let Some(request) = self.store.get_request(&id)? else {
                    continue;
                };
                match request.state {
                    RequestState::Fulfilled => {
                        for node_id in &request.nodes {
                            let Some(mut node) = self.store.get_node(node_id)? else {
                                continue;
                            };
                            node.allocated_to = None;
                            match self.store.put_node(&node) {
                                Ok(()) | Err(StateError::NotFound(_)) => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                        self.store.delete_request(&id)?;
                        debug!(request = %id, nodes = request.nodes.len(), "min-ready request fulfilled");
                    }
                    RequestState::Failed => {
                        debug!(request = %id, "min-ready request failed");
                        self.store.delete_request(&id)?;
                    }
                    RequestState::Requested | RequestState::Pending => active.push(id),
                }
            }
            *ids = active;
        }
        self.submitted.retain(|_, ids| !ids.is_empty());
        Ok(())
    }

    /// Run every `interval` until `shutdown` fires.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        if self.targets.is_empty() {
            return;
        }
        info!(labels = self.targets.len(), "min-ready worker started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_once() {
                        error!(error = %e, "min-ready pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("min-ready worker shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LabelConfig, PoolConfig, ProviderConfig};
    use crate::fake::FakeProvider;
    use fleet_state::Node;

    fn config(min_ready: u32) -> LauncherConfig {
        LauncherConfig {
            launcher: Default::default(),
            labels: vec![
                LabelConfig {
                    name: "small".into(),
                    min_ready,
                    max_ready_age_secs: None,
                },
                LabelConfig {
                    name: "unserved".into(),
                    min_ready: 3,
                    max_ready_age_secs: None,
                },
            ],
            providers: vec![ProviderConfig {
                name: "fake".into(),
                driver: "fake".into(),
                rate: 10.0,
                max_concurrency: None,
                launch_retries: 1,
                pools: vec![PoolConfig {
                    name: "main".into(),
                    max_servers: 10,
                    labels: vec!["small".into()],
                }],
            }],
        }
    }

    fn setup(min_ready: u32) -> (StateStore, Arc<FakeProvider>, MinReadyWorker) {
        let store = StateStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::new("fake", Duration::ZERO));
        let managers: HashMap<String, Arc<dyn ProviderManager>> =
            HashMap::from([("fake".to_string(), provider.clone() as Arc<dyn ProviderManager>)]);
        let worker = MinReadyWorker::new(store.clone(), &config(min_ready), &managers);
        (store, provider, worker)
    }

    fn ready_node(store: &StateStore) -> Node {
        let mut node = Node::new("fake", "main", "small");
        node.set_state(NodeState::Ready);
        store.create_node(&mut node).unwrap();
        node
    }

    #[test]
    fn requests_one_node_per_missing_ready_node() {
        let (store, _provider, mut worker) = setup(3);
        ready_node(&store);

        assert_eq!(worker.run_once().unwrap(), 2);
        let requests = store.list_requests().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| {
            r.requestor == MIN_READY_REQUESTOR && r.label_set == vec!["small".to_string()]
        }));

        // Nothing more while those are outstanding.
        assert_eq!(worker.run_once().unwrap(), 0);
        assert_eq!(worker.outstanding(), 2);
    }

    #[test]
    fn allocated_nodes_do_not_count() {
        let (store, _provider, mut worker) = setup(1);
        let mut node = ready_node(&store);
        node.allocated_to = Some("req-x".into());
        store.put_node(&node).unwrap();

        assert_eq!(worker.run_once().unwrap(), 1);
    }

    #[test]
    fn fulfilled_request_is_removed_and_nodes_released() {
        let (store, _provider, mut worker) = setup(1);
        assert_eq!(worker.run_once().unwrap(), 1);
        let mut request = store.list_requests().unwrap().remove(0);

        let mut node = ready_node(&store);
        node.allocated_to = Some(request.id.clone());
        store.put_node(&node).unwrap();
        request.fulfill(vec![node.id.clone()]);
        store.put_request(&request).unwrap();

        // The released node satisfies the label.
        assert_eq!(worker.run_once().unwrap(), 0);
        assert!(store.get_request(&request.id).unwrap().is_none());
        assert_eq!(store.get_node(&node.id).unwrap().unwrap().allocated_to, None);
        assert_eq!(worker.outstanding(), 0);
    }

    #[test]
    fn failed_request_is_removed_and_retried() {
        let (store, _provider, mut worker) = setup(1);
        worker.run_once().unwrap();
        let mut request = store.list_requests().unwrap().remove(0);
        request.fail();
        store.put_request(&request).unwrap();

        assert_eq!(worker.run_once().unwrap(), 1);
        assert!(store.get_request(&request.id).unwrap().is_none());
        assert_eq!(store.list_requests().unwrap().len(), 1);
    }

    #[test]
    fn unbootable_label_is_not_requested() {
        let (store, provider, mut worker) = setup(1);
        provider.set_label_ready("small", false);
        assert_eq!(worker.run_once().unwrap(), 0);
        assert!(store.list_requests().unwrap().is_empty());
    }
}
