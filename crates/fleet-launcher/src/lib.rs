//! fleet-launcher — the node request fulfillment engine.
//!
//! Launchers cooperate (and race) over a shared `fleet-state` store to turn
//! node requests into sets of READY nodes leased from providers:
//!
//! - Assigns REQUESTED node requests to per-request handlers
//! - Launches the nodes of a request in parallel, one task per node
//! - Serializes and rate-limits every provider API call per provider
//! - Declines requests it cannot satisfy until every launcher has declined
//! - Detects lost store sessions and abandons work instead of committing it
//!
//! # Architecture
//!
//! ```text
//! PoolWorker (one per provider pool)
//!   ├── NodeRequestHandler (one per request)
//!   │   ├── RequestDriver (StandardDriver: reuse READY / launch / pause)
//!   │   ├── SessionLock on the request and on every held node
//!   │   └── NodeLaunchManager
//!   │       └── LaunchTask per node ──► NodeLauncher
//!   └── ProviderManager ──► ProviderTaskQueue (rate-limited, FIFO)
//!
//! CleanupWorker
//!   ├── resets PENDING requests whose launcher went away
//!   ├── deallocates READY nodes of deleted requests
//!   ├── NodeDeleter for dead and aged nodes
//!   └── deletes provider servers without a node record
//!
//! MinReadyWorker ──► one-node requests for labels below `min_ready`
//! ```

pub mod cleanup;
pub mod config;
pub mod driver;
pub mod error;
pub mod fake;
pub mod handler;
pub mod launch;
pub mod launch_manager;
pub mod lock;
pub mod min_ready;
pub mod provider;
pub mod rate_limit;
pub mod task_queue;
pub mod worker;

pub use cleanup::{CleanupReport, CleanupWorker, NodeDeleter};
pub use config::{LabelConfig, LauncherConfig, LauncherSettings, PoolConfig, ProviderConfig};
pub use driver::StandardDriver;
pub use error::{LauncherError, LauncherResult};
pub use fake::FakeProvider;
pub use handler::{HandlerState, NodeRequestHandler, PoolContext, RequestContext, RequestDriver};
pub use launch::LaunchTask;
pub use launch_manager::{LaunchCounter, NodeLaunchManager};
pub use lock::{LockValidity, SessionLock};
pub use min_ready::{MIN_READY_REQUESTOR, MinReadyWorker};
pub use provider::{BoxFuture, NodeLauncher, NodeRecord, ProviderManager};
pub use rate_limit::RateLimiter;
pub use task_queue::ProviderTaskQueue;
pub use worker::{DriverFactory, PoolWorker};
