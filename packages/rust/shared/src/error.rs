//! Error types for Wise.
//!
//! Library crates use [`WiseError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Wise operations.
#[derive(Debug, thiserror::Error)]
pub enum WiseError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Requested start state (or a chained state) has no registered transition.
    #[error("unknown state: {0}")]
    UnknownState(String),

    /// The task has no persisted step chain.
    #[error("empty plan for task {tid}")]
    EmptyPlan { tid: String },

    /// A state is registered but absent from the task's persisted chain.
    #[error("state '{state}' is missing from the plan of task {tid}")]
    MissingStep { tid: String, state: String },

    /// No executor is registered for the task's type.
    #[error("no executor registered for task type '{0}'")]
    ExecutorNotFound(String),

    /// A transition function returned an error.
    #[error("step '{state}' failed: {message}")]
    StepExecution { state: String, message: String },

    /// The task was cancelled while running.
    #[error("task cancelled")]
    Cancelled,

    /// The task's execution deadline passed.
    #[error("task deadline exceeded")]
    DeadlineExceeded,

    /// No task with the given id exists.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// An administrative operation was requested on a task in the wrong status.
    #[error("cannot {action} task {tid} in status '{status}'")]
    InvalidTransition {
        tid: String,
        action: String,
        status: String,
    },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Persisted params/results could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Network/HTTP error while fetching content.
    #[error("network error: {0}")]
    Network(String),

    /// HTML parsing or content extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad input, unsupported URL, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, WiseError>;

impl WiseError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a transition function failure for `state`.
    pub fn step(state: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepExecution {
            state: state.into(),
            message: message.into(),
        }
    }

    /// Errors that must not be retried: the task moves straight to `failed`.
    ///
    /// `Cancelled` is not fatal: whoever cancelled the task owns its final status.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownState(_)
                | Self::EmptyPlan { .. }
                | Self::MissingStep { .. }
                | Self::ExecutorNotFound(_)
                | Self::Serialization(_)
                | Self::Validation { .. }
                | Self::Config { .. }
        )
    }

    /// Whether this error reports a cancelled context.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for WiseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
