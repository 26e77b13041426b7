//! Provisions one node and always ends READY or FAILED.

use std::sync::Arc;

use anyhow::anyhow;
use fleet_state::{Node, NodeState, StateStore};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::lock::LockValidity;
use crate::provider::{NodeLauncher, ProviderManager};

pub struct LaunchTask {
    store: StateStore,
    manager: Arc<dyn ProviderManager>,
    launcher: Arc<dyn NodeLauncher>,
    node: Node,
    retries: u32,
    validity: LockValidity,
}

impl LaunchTask {
    /// `validity` tracks the node's lock; state is only written while it
    /// holds.
    pub fn new(
        store: StateStore,
        manager: Arc<dyn ProviderManager>,
        launcher: Arc<dyn NodeLauncher>,
        node: Node,
        retries: u32,
        validity: LockValidity,
    ) -> Self {
        Self {
            store,
            manager,
            launcher,
            node,
            retries: retries.max(1),
            validity,
        }
    }

    /// Launch the node. The returned node's state is READY or FAILED.
    pub async fn run(mut self) -> Node {
        let started = Instant::now();
        let outcome = match self.launch_with_retries().await {
            Ok(()) => self.commit_ready(),
            Err(e) => Err(e),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => info!(
                node = %self.node.id,
                label = %self.node.label,
                external_id = ?self.node.external_id,
                elapsed_ms,
                "node launched"
            ),
            Err(e) => {
                self.node.set_state(NodeState::Failed);
                if self.validity.is_valid() {
                    if let Err(store_err) = self.store_node() {
                        error!(node = %self.node.id, error = %store_err, "failed to store failed node");
                    }
                } else {
                    warn!(node = %self.node.id, "node lock lost; leaving record untouched");
                }
                error!(
                    node = %self.node.id,
                    label = %self.node.label,
                    elapsed_ms,
                    error = %e,
                    "node launch failed"
                );
            }
        }
        self.node
    }

    fn commit_ready(&mut self) -> anyhow::Result<()> {
        if !self.validity.is_valid() {
            return Err(anyhow!("node lock lost during launch"));
        }
        self.node.set_state(NodeState::Ready);
        self.store_node()?;
        Ok(())
    }

    /// Write the node, keeping the stored allocation. The handler owns
    /// `allocated_to` and may have cleared it while the launch ran.
    fn store_node(&mut self) -> anyhow::Result<()> {
        if let Some(current) = self.store.get_node(&self.node.id)? {
            self.node.allocated_to = current.allocated_to;
        }
        self.store.put_node(&self.node)?;
        Ok(())
    }

    async fn launch_with_retries(&mut self) -> anyhow::Result<()> {
        let mut attempt = 1;
        loop {
            match self.attempt().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retries => {
                    warn!(
                        node = %self.node.id,
                        attempt,
                        retries = self.retries,
                        error = %e,
                        "launch attempt failed"
                    );
                    self.cleanup_attempt().await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One launch attempt, isolated so a panicking driver fails the attempt
    /// instead of the task.
    async fn attempt(&mut self) -> anyhow::Result<()> {
        let launcher = Arc::clone(&self.launcher);
        let mut node = self.node.clone();
        let handle = tokio::spawn(async move {
            let result = launcher.launch(&mut node).await;
            (node, result)
        });
        match handle.await {
            Ok((node, result)) => {
                self.node = node;
                result
            }
            Err(e) => Err(anyhow!("launch of node {} panicked: {e}", self.node.id)),
        }
    }

    /// Tear down whatever a failed attempt left at the provider.
    async fn cleanup_attempt(&mut self) -> anyhow::Result<()> {
        let Some(external_id) = self.node.external_id.clone() else {
            return Ok(());
        };
        self.manager.cleanup_node(&external_id).await?;
        self.manager.wait_for_node_cleanup(&external_id).await?;
        self.node.external_id = None;
        if self.validity.is_valid() {
            self.store_node()?;
        }
        info!(node = %self.node.id, %external_id, "cleaned up failed launch attempt");
        Ok(())
    }
}
