//! Error types for window synchronization.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses the event bus.**
//!
//! - `anyhow` is what action handlers return (ergonomic inside the primary)
//! - [`ActionResponse`](crate::ActionResponse) carries only a message string
//! - [`SyncError`] is what callers in a secondary window see

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the synchronization layer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No correlated response arrived in time.
    ///
    /// The action may still be running on the primary; a response arriving
    /// later is ignored.
    #[error("action {action} timed out after {}ms", .timeout.as_millis())]
    ActionTimeout {
        action: String,
        timeout: Duration,
    },

    /// The primary reported that the action failed.
    #[error("action {action} failed: {message}")]
    ActionFailed { action: String, message: String },

    /// A payload could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Every sender of the event bus is gone.
    #[error("event bus closed")]
    BusClosed,

    /// A store field or action name was declared twice.
    #[error("field {name} is declared more than once")]
    DuplicateField { name: String },

    /// Bridge stream failure.
    #[error("bridge i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// Process configuration is missing or invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// True for [`SyncError::ActionTimeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, SyncError::ActionTimeout { .. })
    }
}

/// Why the primary could not run a requested action.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action {0} not found in store")]
    NotFound(String),

    /// The name refers to a data field.
    #[error("{0} is a data field, not an action")]
    NotCallable(String),

    /// The handler ran and returned an error.
    #[error("{0:#}")]
    Failed(#[from] anyhow::Error),
}
