//! fleet-state — the coordination store shared by cooperating launchers.
//!
//! Backed by [redb](https://docs.rs/redb) for node and request records, with
//! in-memory ephemeral state (sessions, launcher registrations, path locks)
//! that lives exactly as long as the store handle.
//!
//! # Architecture
//!
//! ```text
//! StateStore (Clone, Arc-backed)
//!   ├── redb Database   nodes / requests / counters tables (JSON values)
//!   ├── LockTable       per-path sequential children, lowest child holds
//!   └── launchers       launcher id → owning session (ephemeral)
//!
//! Session                connection lifetime of one store client
//!   └── listeners        notified on CONNECTED / SUSPENDED / LOST
//! ```
//!
//! Expiring a session (`StateStore::expire_session`) reports LOST to its
//! listeners and then drops every ephemeral lock child and launcher
//! registration the session owned.

pub mod error;
pub mod locks;
pub mod session;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use locks::{LockChild, LockTable, PathLock};
pub use session::{ConnectionState, ListenerId, Session, SessionId};
pub use store::StateStore;
pub use types::*;
