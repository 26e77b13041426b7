//! Provider capability traits.
//!
//! A provider driver implements `ProviderManager` (lifecycle, capacity
//! discovery, teardown) and `NodeLauncher` (creating one server for a node).
//! The engine only ever talks to providers through these traits.

use std::future::Future;
use std::pin::Pin;

use fleet_state::Node;
use serde::{Deserialize, Serialize};

use crate::error::LauncherResult;

/// Boxed future returned by provider trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A server as listed by the provider's own API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub external_id: String,
    pub label: String,
    /// Store node id the server was created for, if the provider tracks it.
    pub node_id: Option<String>,
}

pub trait ProviderManager: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self) -> LauncherResult<()>;

    fn stop(&self);

    /// Wait for background work started by `start` to finish.
    fn join(&self) -> BoxFuture<'_, ()>;

    fn list_nodes(&self) -> BoxFuture<'_, anyhow::Result<Vec<NodeRecord>>>;

    /// Whether the provider can currently boot nodes with `label`.
    fn label_ready(&self, label: &str) -> bool;

    /// Begin tearing down the server `external_id`.
    fn cleanup_node<'a>(&'a self, external_id: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    fn wait_for_node_cleanup<'a>(
        &'a self,
        external_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

pub trait NodeLauncher: Send + Sync {
    /// Create a server for `node`.
    ///
    /// Sets `node.external_id` as soon as the provider has assigned one so a
    /// failed attempt can be cleaned up. Does not change `node.state`.
    fn launch<'a>(&'a self, node: &'a mut Node) -> BoxFuture<'a, anyhow::Result<()>>;
}
