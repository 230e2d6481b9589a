//! Error types for kbflow.
//!
//! Library crates use [`KbflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::{Action, DatasetId, RunId};

/// Error raised by a step implementation. Propagated unchanged inside
/// [`KbflowError::TaskExecution`].
pub type StepError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for all kbflow operations.
#[derive(Debug, thiserror::Error)]
pub enum KbflowError {
    /// The principal may not perform `action` on the dataset. No ledger entry
    /// is created when this is raised.
    #[error("permission denied: cannot {action} dataset {dataset_id}: {reason}")]
    PermissionDenied {
        dataset_id: DatasetId,
        action: Action,
        reason: String,
    },

    /// A step failed while a task was driving it.
    #[error("task '{task}' failed: {source}")]
    TaskExecution {
        task: String,
        #[source]
        source: StepError,
    },

    /// Pipeline built from incompatible tasks.
    #[error("composition error: {message}")]
    Composition { message: String },

    /// A dataset reference that cannot be resolved (unknown UUID).
    #[error("cannot resolve dataset {reference}")]
    DatasetResolution { reference: String },

    #[error("run {0} not found")]
    RunNotFound(RunId),

    /// The run was cancelled before it finished.
    #[error("run cancelled")]
    Cancelled,

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad reference, malformed record, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, KbflowError>;

impl KbflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a composition error from any displayable message.
    pub fn composition(msg: impl Into<String>) -> Self {
        Self::Composition {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a step failure with the name of the task that drove it.
    pub fn task(task: impl Into<String>, source: StepError) -> Self {
        Self::TaskExecution {
            task: task.into(),
            source,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable snake_case tag, recorded in ledger errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "permission_denied",
            Self::TaskExecution { .. } => "task_execution",
            Self::Composition { .. } => "composition",
            Self::DatasetResolution { .. } => "dataset_resolution",
            Self::RunNotFound(_) => "run_not_found",
            Self::Cancelled => "cancelled",
            Self::Config { .. } => "config",
            Self::Storage(_) => "storage",
            Self::Io { .. } => "io",
            Self::Validation { .. } => "validation",
        }
    }
}
