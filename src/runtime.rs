//! The runtime handle.
//!
//! A [`Runtime`] owns the registered modules, the commit hook that feeds
//! transaction-driven modules, the scheduler thread that drives
//! timer-driven modules and the serialized writer queue. There is no global
//! registry: embedders keep the handle and drive its lifecycle explicitly.
//!
//! ```text
//! Created --initialize--> Initialized --start--> Started --stop--> Stopped --shutdown--> ShutDown
//! ```

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{ModuleError, Result, RuntimeError};
use crate::host::{CommitHook, GraphAccess, HookState, TransactionalGraph};
use crate::module::{
    ErasedTimerModule, InMemoryMetadataRepository, MetadataRepository, ModuleMetadata,
    ModuleState, ModuleStatus, TimerAdapter, TimerDrivenModule, TxDrivenModule,
};
use crate::policy::InclusionPolicies;
use crate::schedule::monitor::CommitRateMonitor;
use crate::schedule::scheduler::{Scheduler, SchedulerContext, StatusBoard};
use crate::tx::{FilteredTransactionDiff, RawMutationLog, TransactionDiff};
use crate::worker::panic_message;
use crate::writer::WriterQueue;

/// Lifecycle state of a [`Runtime`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeState {
    /// Accepting module registrations.
    Created,
    /// Commit hook installed and transaction-driven modules initialized.
    Initialized,
    /// Writer and scheduler threads running.
    Started,
    /// `stop` in progress: draining the writer, joining threads.
    Stopping,
    /// Threads joined; modules not yet shut down.
    Stopped,
    /// Every module shut down. Terminal.
    ShutDown,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeState::Created => "created",
            RuntimeState::Initialized => "initialized",
            RuntimeState::Started => "started",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Stopped => "stopped",
            RuntimeState::ShutDown => "shut down",
        };
        f.write_str(name)
    }
}

struct TxEntry {
    module: Arc<dyn TxDrivenModule>,
    /// Declared policies behind the internal-prefix exclusion.
    policies: InclusionPolicies,
}

enum Registered {
    Tx(Arc<dyn TxDrivenModule>),
    Timer(Arc<dyn ErasedTimerModule>),
}

impl Registered {
    fn id(&self) -> &str {
        match self {
            Registered::Tx(module) => module.id(),
            Registered::Timer(module) => module.id(),
        }
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    graph: Arc<dyn TransactionalGraph>,
    metadata: Arc<dyn MetadataRepository>,
    state: RwLock<RuntimeState>,
    /// Serializes lifecycle transitions; never held by the commit hook.
    lifecycle: Mutex<()>,
    registered: Mutex<Vec<Registered>>,
    tx_modules: RwLock<Vec<TxEntry>>,
    statuses: StatusBoard,
    load: Arc<CommitRateMonitor>,
    writer: WriterQueue,
    scheduler: Mutex<Option<Scheduler>>,
}

/// Explicit handle to one module runtime.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("modules", &self.inner.registered.lock().len())
            .finish()
    }
}

impl Runtime {
    /// Creates a runtime over `graph` with process-local module metadata.
    pub fn new(graph: Arc<dyn TransactionalGraph>, config: RuntimeConfig) -> Result<Self> {
        Self::with_metadata(graph, config, Arc::new(InMemoryMetadataRepository::new()))
    }

    /// Creates a runtime persisting module metadata to `metadata`.
    pub fn with_metadata(
        graph: Arc<dyn TransactionalGraph>,
        config: RuntimeConfig,
        metadata: Arc<dyn MetadataRepository>,
    ) -> Result<Self> {
        config.validate()?;
        let load = Arc::new(CommitRateMonitor::new(
            config.scheduler.max_samples,
            Duration::from_millis(config.scheduler.max_window_ms),
        ));
        let writer = WriterQueue::new(Arc::clone(&graph), config.writer.clone())?;
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                graph,
                metadata,
                state: RwLock::new(RuntimeState::Created),
                lifecycle: Mutex::new(()),
                registered: Mutex::new(Vec::new()),
                tx_modules: RwLock::new(Vec::new()),
                statuses: StatusBoard::default(),
                load,
                writer,
                scheduler: Mutex::new(None),
            }),
        })
    }

    /// Registers a transaction-driven module.
    ///
    /// Modules are invoked in registration order. Only allowed before
    /// [`initialize`](Self::initialize); ids must be unique.
    pub fn register_tx_module(&self, module: impl TxDrivenModule + 'static) -> Result<()> {
        let module: Arc<dyn TxDrivenModule> = Arc::new(module);
        let policies = module.policies().business(&self.inner.config.internal_prefix);
        let _lifecycle = self.inner.lifecycle.lock();
        self.register(Registered::Tx(Arc::clone(&module)))?;
        self.inner.tx_modules.write().push(TxEntry { module, policies });
        Ok(())
    }

    /// Registers a timer-driven module. Same rules as
    /// [`register_tx_module`](Self::register_tx_module).
    pub fn register_timer_module<M: TimerDrivenModule>(&self, module: M) -> Result<()> {
        let module: Arc<dyn ErasedTimerModule> = Arc::new(TimerAdapter(module));
        let id = module.id().to_owned();
        let _lifecycle = self.inner.lifecycle.lock();
        self.register(Registered::Timer(module))?;
        self.inner
            .statuses
            .write()
            .insert(id, ModuleStatus::Uninitialized);
        Ok(())
    }

    /// Caller holds the lifecycle lock.
    fn register(&self, module: Registered) -> Result<()> {
        self.expect_state(RuntimeState::Created, "register modules")?;
        let mut registered = self.inner.registered.lock();
        if registered.iter().any(|m| m.id() == module.id()) {
            return Err(RuntimeError::InvalidState(format!(
                "module {} is already registered",
                module.id()
            )));
        }
        info!(module = %module.id(), "runtime.module.registered");
        registered.push(module);
        Ok(())
    }

    /// Installs the commit hook and initializes transaction-driven modules
    /// whose policies changed since their last initialization.
    pub fn initialize(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        self.expect_state(RuntimeState::Created, "initialize")?;
        let hook = RuntimeHook {
            inner: Arc::downgrade(&self.inner),
        };
        self.inner.graph.register_commit_hook(Arc::new(hook));

        let modules: Vec<(Arc<dyn TxDrivenModule>, u64)> = self
            .inner
            .tx_modules
            .read()
            .iter()
            .map(|entry| (Arc::clone(&entry.module), fingerprint(&entry.policies)))
            .collect();
        for (module, fingerprint) in modules {
            self.inner.initialize_tx_module(module.as_ref(), fingerprint);
        }
        *self.inner.state.write() = RuntimeState::Initialized;
        info!("runtime.initialized");
        Ok(())
    }

    /// Starts the writer thread, then the scheduler.
    ///
    /// Timer-driven modules without persisted context build their initial
    /// context synchronously on the calling thread.
    pub fn start(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        self.expect_state(RuntimeState::Initialized, "start")?;
        self.inner.writer.start()?;
        *self.inner.state.write() = RuntimeState::Started;

        let timers: Vec<Arc<dyn ErasedTimerModule>> = self
            .inner
            .registered
            .lock()
            .iter()
            .filter_map(|m| match m {
                Registered::Timer(module) => Some(Arc::clone(module)),
                Registered::Tx(_) => None,
            })
            .collect();
        let ctx = SchedulerContext {
            graph: Arc::clone(&self.inner.graph),
            metadata: Arc::clone(&self.inner.metadata),
            load: self.inner.load.clone(),
            config: self.inner.config.scheduler.clone(),
            statuses: Arc::clone(&self.inner.statuses),
        };
        match Scheduler::start(ctx, timers) {
            Ok(scheduler) => {
                *self.inner.scheduler.lock() = Some(scheduler);
                info!("runtime.started");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "runtime.start_failed");
                self.inner.writer.stop();
                *self.inner.state.write() = RuntimeState::Stopped;
                Err(err)
            }
        }
    }

    /// Stops the scheduler, then the writer (draining or discarding its
    /// backlog per configuration), joining both with bounded timeouts.
    ///
    /// Transaction-driven modules keep observing commits until the writer
    /// backlog is drained.
    pub fn stop(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        self.expect_state(RuntimeState::Started, "stop")?;
        *self.inner.state.write() = RuntimeState::Stopping;
        let scheduler_joined = match self.inner.scheduler.lock().take() {
            Some(scheduler) => scheduler.stop(),
            None => true,
        };
        let writer_joined = self.inner.writer.stop();
        *self.inner.state.write() = RuntimeState::Stopped;
        info!(scheduler_joined, writer_joined, "runtime.stopped");
        Ok(())
    }

    /// Calls every module's `shutdown` in registration order. Stops first
    /// when still started.
    pub fn shutdown(&self) -> Result<()> {
        if self.state() == RuntimeState::Started {
            self.stop()?;
        }
        let _lifecycle = self.inner.lifecycle.lock();
        if self.state() == RuntimeState::ShutDown {
            return Ok(());
        }
        self.inner.writer.stop();
        for module in self.inner.registered.lock().iter() {
            let id = module.id().to_owned();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| match module {
                Registered::Tx(module) => module.shutdown(),
                Registered::Timer(module) => module.shutdown(),
            }));
            if let Err(payload) = outcome {
                error!(module = %id, error = %panic_message(payload.as_ref()), "runtime.module.shutdown_panicked");
            }
        }
        let mut statuses = self.inner.statuses.write();
        for status in statuses.values_mut() {
            if *status != ModuleStatus::Failed {
                *status = ModuleStatus::Shutdown;
            }
        }
        *self.inner.state.write() = RuntimeState::ShutDown;
        info!("runtime.shut_down");
        Ok(())
    }

    fn expect_state(&self, expected: RuntimeState, action: &str) -> Result<()> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(RuntimeError::InvalidState(format!(
                "cannot {action} while {state}"
            )))
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RuntimeState {
        *self.inner.state.read()
    }

    /// Queue through which modules serialize their writes.
    pub fn writer(&self) -> &WriterQueue {
        &self.inner.writer
    }

    /// Status of a registered timer-driven module.
    pub fn timer_module_status(&self, module_id: &str) -> Option<ModuleStatus> {
        self.inner.statuses.read().get(module_id).copied()
    }

    /// Foreground commit counter feeding the adaptive scheduler.
    pub fn load_monitor(&self) -> &CommitRateMonitor {
        &self.inner.load
    }

    /// Configuration the runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Module metadata store.
    pub fn metadata(&self) -> &dyn MetadataRepository {
        self.inner.metadata.as_ref()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.state() == RuntimeState::Started {
            if let Err(err) = self.stop() {
                warn!(error = %err, "runtime.drop.stop_failed");
            }
        }
    }
}

/// Stable-within-a-build hash of a module's effective policies.
fn fingerprint(policies: &InclusionPolicies) -> u64 {
    let mut hasher = DefaultHasher::new();
    policies.hash(&mut hasher);
    hasher.finish()
}

impl RuntimeInner {
    fn initialize_tx_module(&self, module: &dyn TxDrivenModule, fingerprint: u64) {
        let id = module.id();
        let mut record = match self.metadata.load(id) {
            Ok(record) => record.unwrap_or_default(),
            Err(err) => {
                warn!(module = %id, error = %err, "runtime.module.metadata_load_failed");
                ModuleMetadata::default()
            }
        };
        if record.policies_fingerprint == Some(fingerprint) {
            debug!(module = %id, "runtime.module.initialize_skipped");
            return;
        }

        let outcome = self.graph.begin().map_err(ModuleError::from).and_then(|tx| {
            let result = panic::catch_unwind(AssertUnwindSafe(|| module.initialize(tx.as_access())))
                .unwrap_or_else(|payload| Err(ModuleError::failed(panic_message(payload.as_ref()))));
            match result {
                Ok(()) => tx.commit().map_err(ModuleError::from),
                Err(err) => {
                    tx.rollback();
                    Err(err)
                }
            }
        });
        match outcome {
            Ok(()) => {
                info!(module = %id, "runtime.module.initialized");
                record.policies_fingerprint = Some(fingerprint);
                if let Err(err) = self.metadata.store(id, &record) {
                    warn!(module = %id, error = %err, "runtime.module.metadata_store_failed");
                }
            }
            Err(err) => {
                error!(module = %id, error = %err, "runtime.module.initialize_failed");
            }
        }
    }

    fn observing(&self) -> bool {
        matches!(
            *self.state.read(),
            RuntimeState::Started | RuntimeState::Stopping
        )
    }

    fn before_commit(&self, log: &RawMutationLog, graph: &dyn GraphAccess) -> Result<CommitStates> {
        if !self.observing() || log.is_empty() {
            return Ok(CommitStates::default());
        }
        let diff = TransactionDiff::build(log, graph).map_err(|err| {
            error!(error = %err, "runtime.diff.inconsistent");
            err
        })?;
        if !diff.mutations_occurred() {
            return Ok(CommitStates::default());
        }

        let modules = self.tx_modules.read();
        let mut invoked: Vec<(usize, Option<ModuleState>)> = Vec::new();
        for (idx, entry) in modules.iter().enumerate() {
            let view = FilteredTransactionDiff::new(&diff, &entry.policies);
            if !view.mutations_occurred() {
                continue;
            }
            let id = entry.module.id();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.module.before_commit(&view)));
            match outcome {
                Ok(Ok(state)) => invoked.push((idx, state)),
                Ok(Err(ModuleError::Rollback(reason))) => {
                    warn!(module = %id, reason = %reason, "runtime.tx_module.rollback_requested");
                    for (idx, state) in invoked {
                        if let Some(entry) = modules.get(idx) {
                            notify(entry, |m| m.after_rollback(state));
                        }
                    }
                    return Err(RuntimeError::DeliberateRollback {
                        module: id.to_owned(),
                        reason,
                    });
                }
                Ok(Err(err)) => {
                    let err = RuntimeError::ModuleExecution {
                        module: id.to_owned(),
                        message: err.to_string(),
                    };
                    warn!(error = %err, "runtime.tx_module.failed");
                }
                Err(payload) => {
                    error!(
                        module = %id,
                        error = %panic_message(payload.as_ref()),
                        "runtime.tx_module.panicked"
                    );
                }
            }
        }
        Ok(CommitStates(invoked))
    }

    fn after_commit(&self, states: CommitStates) {
        self.load.record_commit();
        let modules = self.tx_modules.read();
        for (idx, state) in states.0 {
            if let Some(entry) = modules.get(idx) {
                notify(entry, |m| m.after_commit(state));
            }
        }
    }

    fn after_rollback(&self, states: CommitStates) {
        let modules = self.tx_modules.read();
        for (idx, state) in states.0 {
            if let Some(entry) = modules.get(idx) {
                notify(entry, |m| m.after_rollback(state));
            }
        }
    }
}

/// Runs an after-callback, isolating a panicking module.
fn notify(entry: &TxEntry, callback: impl FnOnce(&dyn TxDrivenModule)) {
    let module = entry.module.as_ref();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(module))) {
        error!(
            module = %module.id(),
            error = %panic_message(payload.as_ref()),
            "runtime.tx_module.callback_panicked"
        );
    }
}

/// States of the modules invoked for one commit, by registration index.
#[derive(Default)]
struct CommitStates(Vec<(usize, Option<ModuleState>)>);

/// Commit hook installed on the host. Holds the runtime weakly so the host
/// never keeps a dropped runtime alive.
struct RuntimeHook {
    inner: Weak<RuntimeInner>,
}

impl CommitHook for RuntimeHook {
    fn before_commit(&self, log: &RawMutationLog, tx: &dyn GraphAccess) -> Result<HookState> {
        let states = match self.inner.upgrade() {
            Some(inner) => inner.before_commit(log, tx)?,
            None => CommitStates::default(),
        };
        Ok(Box::new(states))
    }

    fn after_commit(&self, state: HookState) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match state.downcast::<CommitStates>() {
            Ok(states) => inner.after_commit(*states),
            Err(_) => inner.load.record_commit(),
        }
    }

    fn after_rollback(&self, state: HookState) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if let Ok(states) = state.downcast::<CommitStates>() {
            inner.after_rollback(*states);
        }
    }
}
