//! Domain types for the fleet coordination store.
//!
//! `Node` and `NodeRequest` are the two records launchers race over. Both are
//! JSON-serialized into redb tables.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Store-assigned identifier of a node record.
pub type NodeId = String;

/// Store-assigned identifier of a node request.
pub type RequestId = String;

/// Identity of a launcher daemon (one per provider pool worker).
pub type LauncherId = String;

// ── Node ──────────────────────────────────────────────────────────

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Building,
    Ready,
    Used,
    Delete,
    Hold,
    Test,
    Failed,
}

impl NodeState {
    /// Whether a launch has finished with this state (READY or FAILED).
    pub fn is_launch_terminal(self) -> bool {
        matches!(self, NodeState::Ready | NodeState::Failed)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Building => "building",
            NodeState::Ready => "ready",
            NodeState::Used => "used",
            NodeState::Delete => "delete",
            NodeState::Hold => "hold",
            NodeState::Test => "test",
            NodeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A compute node leased from a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// Empty until the store assigns one in `create_node`.
    pub id: NodeId,
    pub provider: String,
    pub pool: String,
    pub label: String,
    pub state: NodeState,
    /// Provider-side handle, set once the provider has created the server.
    pub external_id: Option<String>,
    /// Request this node is allocated to.
    pub allocated_to: Option<RequestId>,
    /// Launcher that created this node.
    pub launcher: Option<LauncherId>,
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last state change.
    pub state_time: u64,
}

impl Node {
    /// A fresh BUILDING node for `label` in `provider`/`pool`, without an id.
    pub fn new(provider: &str, pool: &str, label: &str) -> Self {
        let now = epoch_secs();
        Self {
            id: String::new(),
            provider: provider.to_string(),
            pool: pool.to_string(),
            label: label.to_string(),
            state: NodeState::Building,
            external_id: None,
            allocated_to: None,
            launcher: None,
            created_at: now,
            state_time: now,
        }
    }

    /// Change state and refresh `state_time`.
    pub fn set_state(&mut self, state: NodeState) {
        self.state = state;
        self.state_time = epoch_secs();
    }
}

// ── NodeRequest ───────────────────────────────────────────────────

/// State of a node request as seen by every launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Requested,
    /// Accepted by a launcher that is working on it.
    Pending,
    Fulfilled,
    Failed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestState::Requested => "requested",
            RequestState::Pending => "pending",
            RequestState::Fulfilled => "fulfilled",
            RequestState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A request for a set of labelled nodes, submitted by a CI scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRequest {
    pub id: RequestId,
    /// Opaque identifier of the submitting system.
    pub requestor: String,
    /// Required labels, in order.
    pub label_set: Vec<String>,
    pub state: RequestState,
    /// Launchers that could not satisfy this request. Holds no duplicates.
    pub declined_by: Vec<LauncherId>,
    /// Assigned node ids in `label_set` order. Non-empty only when fulfilled.
    pub nodes: Vec<NodeId>,
    pub created_at: u64,
    pub state_time: u64,
}

impl NodeRequest {
    /// A new REQUESTED request without an id.
    pub fn new(requestor: &str, label_set: Vec<String>) -> Self {
        let now = epoch_secs();
        Self {
            id: String::new(),
            requestor: requestor.to_string(),
            label_set,
            state: RequestState::Requested,
            declined_by: Vec::new(),
            nodes: Vec::new(),
            created_at: now,
            state_time: now,
        }
    }

    /// Change state and refresh `state_time`.
    pub fn set_state(&mut self, state: RequestState) {
        self.state = state;
        self.state_time = epoch_secs();
    }

    /// Record a decline. Returns false if `launcher` had already declined.
    pub fn decline(&mut self, launcher: &str) -> bool {
        if self.is_declined_by(launcher) {
            return false;
        }
        self.declined_by.push(launcher.to_string());
        true
    }

    pub fn is_declined_by(&self, launcher: &str) -> bool {
        self.declined_by.iter().any(|l| l == launcher)
    }

    /// True when every launcher in `launchers` has declined.
    ///
    /// An empty launcher set is trivially covered.
    pub fn declined_by_all<S: AsRef<str>>(&self, launchers: &[S]) -> bool {
        launchers.iter().all(|l| self.is_declined_by(l.as_ref()))
    }

    /// Mark fulfilled with the given nodes.
    pub fn fulfill(&mut self, nodes: Vec<NodeId>) {
        self.nodes = nodes;
        self.set_state(RequestState::Fulfilled);
    }

    /// Hand the request back to the launcher pool.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.set_state(RequestState::Requested);
    }

    /// Mark failed. A failed request carries no nodes.
    pub fn fail(&mut self) {
        self.nodes.clear();
        self.set_state(RequestState::Failed);
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
