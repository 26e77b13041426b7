//! Submitting node requests and dumping store state.

use fleet_state::{Node, NodeRequest, StateStore};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Snapshot of every request and node in the store.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub launchers: Vec<String>,
    pub requests: Vec<NodeRequest>,
    pub nodes: Vec<Node>,
}

impl StatusReport {
    pub fn collect(store: &StateStore) -> anyhow::Result<Self> {
        Ok(Self {
            launchers: store.registered_launchers(),
            requests: store.list_requests()?,
            nodes: store.list_nodes()?,
        })
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Write a new REQUESTED node request for `labels`.
pub fn submit_request(
    store: &StateStore,
    requestor: &str,
    labels: Vec<String>,
) -> anyhow::Result<NodeRequest> {
    if labels.is_empty() {
        anyhow::bail!("a node request needs at least one label");
    }
    let mut request = NodeRequest::new(requestor, labels);
    store.create_request(&mut request)?;
    info!(request = %request.id, %requestor, labels = ?request.label_set, "node request submitted");
    Ok(request)
}
