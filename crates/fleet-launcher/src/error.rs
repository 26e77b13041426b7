//! Launcher error types.

use thiserror::Error;

/// Errors raised by the launcher engine.
#[derive(Debug, Error)]
pub enum LauncherError {
    /// An operation was called in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("task queue {0} is stopped")]
    QueueStopped(String),

    /// The task never reported a result, e.g. it was still queued when its
    /// queue stopped.
    #[error("task {0} aborted")]
    TaskAborted(String),

    /// A programming error, e.g. a launch that ended in a non-terminal state.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("provider error: {0}")]
    Provider(#[from] anyhow::Error),

    #[error("state store error: {0}")]
    State(#[from] fleet_state::StateError),
}

pub type LauncherResult<T> = Result<T, LauncherError>;
