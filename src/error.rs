//! Error handling for the module runtime.
//!
//! All public APIs return [`Result<T>`], an alias over [`RuntimeError`].
//! Module code returns [`ModuleError`], which separates an ordinary failure
//! (logged, isolated to the module) from a deliberate request to roll the
//! foreground transaction back.

use std::io;

use thiserror::Error;

use crate::types::EntityRef;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors raised by the runtime and its collaborators.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The raw mutation log handed to the diff engine violates an invariant.
    ///
    /// This is fatal for the commit hook: by the time hooks run the host
    /// transaction can usually only be rolled back, never repaired.
    #[error("internal consistency violated: {0}")]
    InternalConsistency(String),

    /// A write was attempted through the snapshot of a deleted entity.
    #[error("{entity} was deleted in this transaction and cannot be mutated")]
    IllegalMutation {
        /// The deleted entity.
        entity: EntityRef,
    },

    /// A composite policy was built from zero policies.
    #[error("composite policy needs at least one policy")]
    EmptyComposite,

    /// The writer queue rejected a task because it was at capacity.
    #[error("writer queue full, task {task_id} rejected")]
    QueueFull {
        /// Identifier of the rejected task.
        task_id: String,
    },

    /// A module failed while handling a transaction or timer invocation.
    #[error("module {module} failed: {message}")]
    ModuleExecution {
        /// Module identifier.
        module: String,
        /// Failure description.
        message: String,
    },

    /// A transaction-driven module asked for the transaction to be rolled back.
    #[error("module {module} requested rollback: {reason}")]
    DeliberateRollback {
        /// Module identifier.
        module: String,
        /// Reason given by the module.
        reason: String,
    },

    /// A writer task failed; only reported by `WriterQueue::try_write`.
    #[error("writer task {task_id} failed: {message}")]
    TaskFailed {
        /// Identifier of the failed task.
        task_id: String,
        /// Failure description.
        message: String,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not permitted in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(EntityRef),

    /// The component is stopping and no longer accepts work.
    #[error("shutting down")]
    ShuttingDown,

    /// I/O error, e.g. from a file-backed metadata repository.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error for persisted metadata.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration parse error.
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Outcome of a failed module callback.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Ordinary failure. Logged and isolated to the failing module.
    #[error("{0}")]
    Failed(String),

    /// Deliberate request to roll back the foreground transaction.
    #[error("rollback requested: {0}")]
    Rollback(String),

    /// Runtime error surfaced through module code.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl ModuleError {
    /// Builds a [`ModuleError::Failed`] from any displayable message.
    pub fn failed(message: impl Into<String>) -> Self {
        ModuleError::Failed(message.into())
    }

    /// Builds a [`ModuleError::Rollback`] from any displayable reason.
    pub fn rollback(reason: impl Into<String>) -> Self {
        ModuleError::Rollback(reason.into())
    }
}
