//! Error types used across the Snaplite daemon core.

use std::time::Duration;

use thiserror::Error;

/// Result type for Snaplite operations.
pub type SnapResult<T> = Result<T, SnapError>;

#[derive(Debug, Error)]
pub enum SnapError {
    /// Another change already mutates the snap; the caller must not retry
    /// blindly (a new attempt is only valid once the other change is ready).
    #[error("snap \"{snap}\" has \"{kind}\" change in progress")]
    Conflict { snap: String, kind: String },

    /// The operation overlaps an in-flight change and should be re-attempted
    /// after the given backoff.
    #[error("change conflicts with in-flight activity, retry in {after:?}")]
    RetryLater { after: Duration },

    /// Processes of the snap are still running; carries the classified
    /// offenders so callers can report or wait on them.
    #[error("snap \"{snap}\" has running apps ({apps:?}), hooks ({hooks:?}), pids {pids:?}")]
    SnapBusy {
        snap: String,
        apps: Vec<String>,
        hooks: Vec<String>,
        pids: Vec<u32>,
    },

    /// The per-snap advisory lock could not be taken within the bound.
    #[error("timeout waiting for snap \"{snap}\" lock")]
    LockTimeout { snap: String },

    /// A hard busy check outlived the inhibition grace window; indicates a
    /// bookkeeping inconsistency, not a normal outcome.
    #[error("snap \"{snap}\" inhibited beyond the grace window")]
    InhibitedBeyondGrace { snap: String },

    /// Distinct sentinel for a missing state entry, so callers can tell
    /// "absent" apart from "present but malformed".
    #[error("no state entry for key \"{key}\"")]
    NoEntry { key: String },

    #[error("state entry \"{key}\" is malformed: {reason}")]
    BadEntry { key: String, reason: String },

    #[error("task dependency cycle through task {task_id}")]
    DependencyCycle { task_id: String },

    #[error("checkpoint failed: {0}")]
    Checkpoint(String),

    #[error("bootloader error: {0}")]
    Boot(String),

    #[error("cannot parse schedule: {0}")]
    Schedule(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SnapError {
    /// True for the conflict-checker outcomes that ask the caller to retry
    /// rather than give up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SnapError::RetryLater { .. } | SnapError::SnapBusy { .. }
        )
    }
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for SnapError {
    fn from(err: std::io::Error) -> Self {
        SnapError::Storage(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for SnapError {
    fn from(err: serde_json::Error) -> Self {
        SnapError::Internal(format!("JSON error: {}", err))
    }
}

impl From<String> for SnapError {
    fn from(err: String) -> Self {
        SnapError::Internal(err)
    }
}

impl From<&str> for SnapError {
    fn from(err: &str) -> Self {
        SnapError::Internal(err.to_string())
    }
}
