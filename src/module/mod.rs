//! Module contracts.
//!
//! A module is either *transaction-driven*, invoked synchronously inside the
//! commit hook with a filtered view of the transaction, or *timer-driven*,
//! invoked periodically by the scheduler with a resumable context.

use std::any::Any;
use std::fmt;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModuleError, RuntimeError};
use crate::host::GraphAccess;
use crate::policy::InclusionPolicies;
use crate::tx::FilteredTransactionDiff;

pub mod metadata;

pub use metadata::{
    InMemoryMetadataRepository, JsonFileMetadataRepository, MetadataRepository, ModuleMetadata,
};

/// Opaque state a transaction-driven module carries from `before_commit`
/// to `after_commit` or `after_rollback`.
pub type ModuleState = Box<dyn Any + Send>;

/// Module invoked synchronously for every commit it has visibility into.
///
/// Callbacks run on the committing thread and block the foreground
/// transaction until they return, so they must be fast.
pub trait TxDrivenModule: Send + Sync {
    /// Unique, stable identifier.
    fn id(&self) -> &str;

    /// What the module wants to see. Internal entities are always hidden.
    fn policies(&self) -> InclusionPolicies {
        InclusionPolicies::all()
    }

    /// One-off setup over existing data, run when the module is new or its
    /// policies changed since the last run.
    fn initialize(&self, _graph: &dyn GraphAccess) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Inspects (and may mutate) the committing transaction.
    ///
    /// Only called when the filtered view is non-empty. Returning
    /// [`ModuleError::Rollback`] aborts the foreground transaction; any other
    /// error is logged and isolated to this module.
    fn before_commit(
        &self,
        diff: &FilteredTransactionDiff<'_>,
    ) -> Result<Option<ModuleState>, ModuleError>;

    /// Called after a commit this module saw, with its `before_commit` state.
    fn after_commit(&self, _state: Option<ModuleState>) {}

    /// Called when a transaction this module saw rolls back.
    fn after_rollback(&self, _state: Option<ModuleState>) {}

    /// Called once when the runtime shuts down.
    fn shutdown(&self) {}
}

/// Module invoked periodically by the scheduler.
///
/// Work is split into small steps; the context returned from one step is
/// handed to the next and persisted in between, so a walk resumes where it
/// stopped after a restart.
pub trait TimerDrivenModule: Send + Sync + 'static {
    /// Resumable state, persisted as JSON.
    type Context: Serialize + DeserializeOwned + Send + fmt::Debug;

    /// Unique, stable identifier.
    fn id(&self) -> &str;

    /// Builds the first context. May scan the whole graph.
    fn create_initial_context(&self, graph: &dyn GraphAccess) -> Result<Self::Context, ModuleError>;

    /// Performs one step of work inside a scheduler-owned transaction.
    ///
    /// On error the transaction is rolled back and the same context is
    /// retried on the next invocation.
    fn do_some_work(
        &self,
        context: Self::Context,
        graph: &dyn GraphAccess,
    ) -> Result<Self::Context, ModuleError>;

    /// Earliest time the next step may run, if the module wants to wait.
    fn not_before(&self, _context: &Self::Context) -> Option<SystemTime> {
        None
    }

    /// Called once when the runtime shuts down.
    fn shutdown(&self) {}
}

/// Lifecycle of a timer-driven module.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleStatus {
    /// Registered, runtime not started yet.
    Uninitialized,
    /// Building the initial context.
    Initializing,
    /// Waiting for its next due time.
    Scheduled,
    /// A step is in flight.
    Running,
    /// Exceeded the consecutive-failure budget; no longer scheduled.
    Failed,
    /// Runtime stopped.
    Shutdown,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleStatus::Uninitialized => "uninitialized",
            ModuleStatus::Initializing => "initializing",
            ModuleStatus::Scheduled => "scheduled",
            ModuleStatus::Running => "running",
            ModuleStatus::Failed => "failed",
            ModuleStatus::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Object-safe form of [`TimerDrivenModule`] with JSON contexts.
pub(crate) trait ErasedTimerModule: Send + Sync {
    fn id(&self) -> &str;
    fn create_initial_context(&self, graph: &dyn GraphAccess) -> Result<Value, ModuleError>;
    fn do_some_work(&self, context: &Value, graph: &dyn GraphAccess) -> Result<Value, ModuleError>;
    fn not_before(&self, context: &Value) -> Option<SystemTime>;
    fn shutdown(&self);
}

pub(crate) struct TimerAdapter<M>(pub(crate) M);

impl<M: TimerDrivenModule> ErasedTimerModule for TimerAdapter<M> {
    fn id(&self) -> &str {
        self.0.id()
    }

    fn create_initial_context(&self, graph: &dyn GraphAccess) -> Result<Value, ModuleError> {
        let context = self.0.create_initial_context(graph)?;
        to_value(&context)
    }

    fn do_some_work(&self, context: &Value, graph: &dyn GraphAccess) -> Result<Value, ModuleError> {
        let context: M::Context = from_value(context)?;
        let next = self.0.do_some_work(context, graph)?;
        to_value(&next)
    }

    fn not_before(&self, context: &Value) -> Option<SystemTime> {
        let context: M::Context = from_value(context).ok()?;
        self.0.not_before(&context)
    }

    fn shutdown(&self) {
        self.0.shutdown()
    }
}

fn to_value<T: Serialize>(context: &T) -> Result<Value, ModuleError> {
    serde_json::to_value(context).map_err(|e| ModuleError::Runtime(RuntimeError::Json(e)))
}

fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T, ModuleError> {
    T::deserialize(value).map_err(|e| ModuleError::Runtime(RuntimeError::Json(e)))
}
