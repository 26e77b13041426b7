//! In-process provider used by tests and the standalone daemon.
//!
//! Servers are entries in a map. Every call runs through the provider's own
//! `ProviderTaskQueue`, so rate limiting behaves as it would against a real
//! cloud API.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use fleet_state::Node;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::LauncherResult;
use crate::provider::{BoxFuture, NodeLauncher, NodeRecord, ProviderManager};
use crate::task_queue::ProviderTaskQueue;

type Servers = Arc<Mutex<BTreeMap<String, NodeRecord>>>;

pub struct FakeProvider {
    name: String,
    queue: ProviderTaskQueue,
    servers: Servers,
    next_server: Arc<AtomicU64>,
    failing: Mutex<HashSet<String>>,
    unready: Mutex<HashSet<String>>,
    /// `true` while launches are held back.
    hold: watch::Sender<bool>,
}

impl FakeProvider {
    pub fn new(name: &str, interval: Duration) -> Self {
        Self::with_queue(name, ProviderTaskQueue::new(name, interval))
    }

    /// Provider whose API accepts `rate` calls per second.
    pub fn from_rate(name: &str, rate: f64) -> Self {
        Self::with_queue(name, ProviderTaskQueue::from_rate(name, rate))
    }

    fn with_queue(name: &str, queue: ProviderTaskQueue) -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            queue,
            servers: Arc::new(Mutex::new(BTreeMap::new())),
            next_server: Arc::new(AtomicU64::new(1)),
            failing: Mutex::new(HashSet::new()),
            unready: Mutex::new(HashSet::new()),
            hold,
        }
    }

    /// Make every boot of `label` fail (after the server was created).
    pub fn set_label_failing(&self, label: &str, failing: bool) {
        toggle(&self.failing, label, failing);
    }

    /// Report `label` as not bootable yet.
    pub fn set_label_ready(&self, label: &str, ready: bool) {
        toggle(&self.unready, label, !ready);
    }

    /// Park new launches until `release_launches`.
    pub fn hold_launches(&self) {
        self.hold.send_replace(true);
    }

    pub fn release_launches(&self) {
        self.hold.send_replace(false);
    }

    /// Servers currently existing at the provider.
    pub fn server_count(&self) -> usize {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn queue(&self) -> &ProviderTaskQueue {
        &self.queue
    }

    fn is_failing(&self, label: &str) -> bool {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(label)
    }
}

fn toggle(set: &Mutex<HashSet<String>>, label: &str, on: bool) {
    let mut set = set.lock().unwrap_or_else(PoisonError::into_inner);
    if on {
        set.insert(label.to_string());
    } else {
        set.remove(label);
    }
}

impl ProviderManager for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> LauncherResult<()> {
        self.queue.start();
        info!(provider = %self.name, "fake provider started");
        Ok(())
    }

    fn stop(&self) {
        self.queue.stop();
    }

    fn join(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.queue.join())
    }

    fn list_nodes(&self) -> BoxFuture<'_, anyhow::Result<Vec<NodeRecord>>> {
        let servers = Arc::clone(&self.servers);
        Box::pin(async move {
            let listed = self
                .queue
                .submit("list_servers", move || async move {
                    let servers = servers.lock().unwrap_or_else(PoisonError::into_inner);
                    Ok(servers.values().cloned().collect())
                })
                .await?;
            Ok(listed)
        })
    }

    fn label_ready(&self, label: &str) -> bool {
        !self
            .unready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(label)
    }

    fn cleanup_node<'a>(&'a self, external_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        let servers = Arc::clone(&self.servers);
        let id = external_id.to_string();
        Box::pin(async move {
            self.queue
                .submit("delete_server", move || async move {
                    let removed = servers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&id);
                    debug!(external_id = %id, existed = removed.is_some(), "fake server deleted");
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn wait_for_node_cleanup<'a>(
        &'a self,
        external_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        let servers = Arc::clone(&self.servers);
        let id = external_id.to_string();
        Box::pin(async move {
            self.queue
                .submit("get_server", move || async move {
                    let servers = servers.lock().unwrap_or_else(PoisonError::into_inner);
                    match servers.contains_key(&id) {
                        true => Err(anyhow!("server {id} still exists")),
                        false => Ok(()),
                    }
                })
                .await?;
            Ok(())
        })
    }
}

impl NodeLauncher for FakeProvider {
    fn launch<'a>(&'a self, node: &'a mut Node) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let mut hold = self.hold.subscribe();
            hold.wait_for(|held| !*held)
                .await
                .map(|_| ())
                .map_err(|_| anyhow!("provider {} shut down", self.name))?;

            let servers = Arc::clone(&self.servers);
            let next = Arc::clone(&self.next_server);
            let record_label = node.label.clone();
            let record_node = node.id.clone();
            let external_id = self
                .queue
                .submit("create_server", move || async move {
                    let external_id = format!("fake-{}", next.fetch_add(1, Ordering::SeqCst));
                    servers.lock().unwrap_or_else(PoisonError::into_inner).insert(
                        external_id.clone(),
                        NodeRecord {
                            external_id: external_id.clone(),
                            label: record_label,
                            node_id: Some(record_node),
                        },
                    );
                    Ok(external_id)
                })
                .await?;
            node.external_id = Some(external_id.clone());

            if self.is_failing(&node.label) {
                anyhow::bail!("server {external_id} for label {} failed to boot", node.label);
            }
            debug!(node = %node.id, %external_id, "fake server booted");
            Ok(())
        })
    }
}
