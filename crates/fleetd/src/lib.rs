//! fleetd — the fleet launcher daemon.
//!
//! Assembles a launcher from a TOML config:
//! - State store (redb) and one store session
//! - One provider per configured provider (in-process `fake` driver)
//! - One pool worker per provider pool, sharing a launch counter per provider
//! - Cleanup worker for lost requests, dead or aged nodes and leaked servers
//! - Min-ready worker keeping spare READY nodes per label
//! - REST API (axum) for submitting requests while the daemon runs
//!
//! # Usage
//!
//! ```text
//! fleetd run --config launcher.toml --data-dir /var/lib/fleet --listen 127.0.0.1:7780
//! fleetd submit --server 127.0.0.1:7780 --label small --label large
//! fleetd status --server 127.0.0.1:7780
//! fleetd status --data-dir /var/lib/fleet      # daemon stopped
//! ```

pub mod api;
pub mod client;
pub mod daemon;
pub mod report;

pub use api::build_router;
pub use client::ApiClient;
pub use daemon::Daemon;
pub use report::{StatusReport, submit_request};

/// File name of the store inside the data directory.
pub const STORE_FILE: &str = "fleet.redb";
