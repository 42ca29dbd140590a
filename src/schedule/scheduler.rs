use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{ModuleError, Result};
use crate::host::{GraphAccess, TransactionalGraph};
use crate::module::{ErasedTimerModule, MetadataRepository, ModuleMetadata, ModuleStatus};
use crate::schedule::monitor::LoadMonitor;
use crate::schedule::timing::{AdaptiveTimingStrategy, InvocationOutcome};
use crate::worker::{panic_message, BackgroundWorker};

/// Published status of every timer-driven module, keyed by id.
pub(crate) type StatusBoard = Arc<RwLock<BTreeMap<String, ModuleStatus>>>;

/// Collaborators the scheduler thread works against.
pub(crate) struct SchedulerContext {
    pub(crate) graph: Arc<dyn TransactionalGraph>,
    pub(crate) metadata: Arc<dyn MetadataRepository>,
    pub(crate) load: Arc<dyn LoadMonitor>,
    pub(crate) config: SchedulerConfig,
    pub(crate) statuses: StatusBoard,
}

struct Signal {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Handle to the single thread that drives every timer-driven module.
///
/// Modules run one at a time, earliest due first. The per-module state
/// (context, timing, failure count) lives on the scheduler thread only.
pub(crate) struct Scheduler {
    signal: Arc<Signal>,
    worker: Option<BackgroundWorker>,
    statuses: StatusBoard,
    shutdown_timeout: Duration,
}

struct ScheduledModule {
    module: Arc<dyn ErasedTimerModule>,
    context: Value,
    timing: AdaptiveTimingStrategy,
    next_due: Instant,
    failures: u32,
    failed: bool,
}

impl Scheduler {
    /// Initializes every module on the calling thread, then spawns the loop.
    ///
    /// A module whose initial context cannot be built is marked
    /// [`ModuleStatus::Failed`] and never scheduled; the others still start.
    pub(crate) fn start(
        ctx: SchedulerContext,
        modules: Vec<Arc<dyn ErasedTimerModule>>,
    ) -> Result<Self> {
        let signal = Arc::new(Signal {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let statuses = Arc::clone(&ctx.statuses);
        let shutdown_timeout = ctx.config.shutdown_timeout();

        if !ctx.config.enabled {
            info!(modules = modules.len(), "runtime.scheduler.disabled");
            return Ok(Self {
                signal,
                worker: None,
                statuses,
                shutdown_timeout,
            });
        }

        let scheduled: Vec<ScheduledModule> = modules
            .into_iter()
            .filter_map(|module| ctx.prepare(module))
            .collect();
        if scheduled.is_empty() {
            debug!("runtime.scheduler.idle");
            return Ok(Self {
                signal,
                worker: None,
                statuses,
                shutdown_timeout,
            });
        }

        let loop_signal = Arc::clone(&signal);
        let worker = BackgroundWorker::spawn("sombra-runtime-scheduler", move || {
            run_loop(&ctx, scheduled, &loop_signal);
        })?;
        Ok(Self {
            signal,
            worker: Some(worker),
            statuses,
            shutdown_timeout,
        })
    }

    /// Cancels the loop and waits for the in-flight invocation to finish,
    /// bounded by the shutdown timeout.
    pub(crate) fn stop(mut self) -> bool {
        *self.signal.stop.lock() = true;
        self.signal.wake.notify_all();
        let joined = match self.worker.take() {
            Some(worker) => worker.join_timeout(self.shutdown_timeout),
            None => true,
        };
        let mut statuses = self.statuses.write();
        for status in statuses.values_mut() {
            if *status != ModuleStatus::Failed {
                *status = ModuleStatus::Shutdown;
            }
        }
        joined
    }
}

impl SchedulerContext {
    fn set_status(&self, module: &str, status: ModuleStatus) {
        self.statuses.write().insert(module.to_owned(), status);
    }

    /// Resumes a persisted context or builds the initial one.
    fn prepare(&self, module: Arc<dyn ErasedTimerModule>) -> Option<ScheduledModule> {
        let id = module.id().to_owned();
        let mut timing = AdaptiveTimingStrategy::new(&self.config);
        let stored = match self.metadata.load(&id) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(module = %id, error = %err, "runtime.scheduler.metadata_load_failed");
                None
            }
        };

        if let Some(ModuleMetadata {
            context: Some(context),
            last_run_unix_ms,
            last_delay_ms,
            ..
        }) = stored
        {
            let mut next_due = Instant::now();
            if let Some(delay) = last_delay_ms.map(Duration::from_millis) {
                timing.resume(delay);
                if let Some(last_run) = last_run_unix_ms {
                    let due = UNIX_EPOCH + Duration::from_millis(last_run) + timing.current();
                    next_due = instant_at(due);
                }
            }
            info!(module = %id, "runtime.scheduler.resumed");
            self.set_status(&id, ModuleStatus::Scheduled);
            return Some(ScheduledModule {
                module,
                context,
                timing,
                next_due,
                failures: 0,
                failed: false,
            });
        }

        self.set_status(&id, ModuleStatus::Initializing);
        let started = Instant::now();
        match self.initial_context(module.as_ref()) {
            Ok(context) => {
                info!(
                    module = %id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "runtime.scheduler.initialized"
                );
                self.persist(&id, &context, &timing, 0);
                self.set_status(&id, ModuleStatus::Scheduled);
                Some(ScheduledModule {
                    module,
                    context,
                    timing,
                    next_due: Instant::now(),
                    failures: 0,
                    failed: false,
                })
            }
            Err(message) => {
                error!(module = %id, error = %message, "runtime.scheduler.init_failed");
                self.set_status(&id, ModuleStatus::Failed);
                None
            }
        }
    }

    fn initial_context(&self, module: &dyn ErasedTimerModule) -> std::result::Result<Value, String> {
        self.in_transaction(|graph| module.create_initial_context(graph))
    }

    /// Runs one step inside its own transaction; commits only on success.
    fn invoke(&self, module: &dyn ErasedTimerModule, context: &Value) -> std::result::Result<Value, String> {
        self.in_transaction(|graph| module.do_some_work(context, graph))
    }

    fn in_transaction(
        &self,
        work: impl FnOnce(&dyn GraphAccess) -> std::result::Result<Value, ModuleError>,
    ) -> std::result::Result<Value, String> {
        let tx = self.graph.begin().map_err(|e| e.to_string())?;
        match panic::catch_unwind(AssertUnwindSafe(|| work(tx.as_access()))) {
            Ok(Ok(value)) => tx.commit().map(|_| value).map_err(|e| e.to_string()),
            Ok(Err(err)) => {
                tx.rollback();
                Err(err.to_string())
            }
            Err(payload) => {
                tx.rollback();
                Err(panic_message(payload.as_ref()))
            }
        }
    }

    fn persist(&self, id: &str, context: &Value, timing: &AdaptiveTimingStrategy, failures: u32) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let record = ModuleMetadata {
            context: Some(context.clone()),
            policies_fingerprint: None,
            last_run_unix_ms: Some(now_ms),
            last_delay_ms: Some(timing.current().as_millis() as u64),
            consecutive_failures: failures,
        };
        if let Err(err) = self.metadata.store(id, &record) {
            warn!(module = %id, error = %err, "runtime.scheduler.metadata_store_failed");
        }
    }

    fn run_once(&self, entry: &mut ScheduledModule) {
        let id = entry.module.id().to_owned();
        self.set_status(&id, ModuleStatus::Running);
        let started = Instant::now();
        let result = self.invoke(entry.module.as_ref(), &entry.context);
        let duration = started.elapsed();

        if duration.as_millis() as u64 > self.config.slow_invocation_warn_ms {
            warn!(
                module = %id,
                elapsed_ms = duration.as_millis() as u64,
                "runtime.scheduler.slow_invocation"
            );
        }

        let succeeded = result.is_ok();
        match result {
            Ok(next) => {
                entry.context = next;
                entry.failures = 0;
            }
            Err(message) => {
                entry.failures += 1;
                warn!(
                    module = %id,
                    failures = entry.failures,
                    error = %message,
                    "runtime.scheduler.invocation_failed"
                );
            }
        }

        let delay = entry
            .timing
            .next_delay(Some(InvocationOutcome { duration, succeeded }), self.load.current_load());
        entry.next_due = Instant::now() + delay;
        self.persist(&id, &entry.context, &entry.timing, entry.failures);

        if entry.failures >= self.config.max_consecutive_failures {
            entry.failed = true;
            error!(module = %id, failures = entry.failures, "runtime.scheduler.module_failed");
            self.set_status(&id, ModuleStatus::Failed);
        } else {
            debug!(
                module = %id,
                elapsed_ms = duration.as_millis() as u64,
                delay_ms = delay.as_millis() as u64,
                "runtime.scheduler.invoked"
            );
            self.set_status(&id, ModuleStatus::Scheduled);
        }
    }
}

/// Earliest moment `entry` may run, honouring its own deferral.
fn due_at(entry: &ScheduledModule) -> Instant {
    match entry.module.not_before(&entry.context) {
        Some(not_before) => entry.next_due.max(instant_at(not_before)),
        None => entry.next_due,
    }
}

fn instant_at(at: SystemTime) -> Instant {
    let now = Instant::now();
    match at.duration_since(SystemTime::now()) {
        Ok(ahead) => now + ahead,
        Err(_) => now,
    }
}

fn run_loop(ctx: &SchedulerContext, mut modules: Vec<ScheduledModule>, signal: &Signal) {
    info!(modules = modules.len(), "runtime.scheduler.started");
    loop {
        let next = modules
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.failed)
            .map(|(idx, entry)| (idx, due_at(entry)))
            .min_by_key(|&(_, due)| due);

        {
            let mut stop = signal.stop.lock();
            match next {
                Some((_, due)) => {
                    while !*stop && Instant::now() < due {
                        if signal.wake.wait_until(&mut stop, due).timed_out() {
                            break;
                        }
                    }
                }
                None => {
                    while !*stop {
                        signal.wake.wait(&mut stop);
                    }
                }
            }
            if *stop {
                break;
            }
        }

        if let Some((idx, _)) = next {
            if let Some(entry) = modules.get_mut(idx) {
                ctx.run_once(entry);
            }
        }
    }
    info!("runtime.scheduler.stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryGraph;
    use crate::module::{InMemoryMetadataRepository, TimerAdapter, TimerDrivenModule};
    use crate::schedule::monitor::CommitRateMonitor;
    use crate::types::{PropValue, Properties};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter {
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    impl TimerDrivenModule for Counter {
        type Context = u64;

        fn id(&self) -> &str {
            "counter"
        }

        fn create_initial_context(
            &self,
            _graph: &dyn GraphAccess,
        ) -> std::result::Result<u64, ModuleError> {
            Ok(0)
        }

        fn do_some_work(
            &self,
            step: u64,
            graph: &dyn GraphAccess,
        ) -> std::result::Result<u64, ModuleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ModuleError::failed("always"));
            }
            let mut props = Properties::new();
            props.insert("step".into(), PropValue::Int(step as i64));
            graph.create_node(&["Tick"], props)?;
            Ok(step + 1)
        }
    }

    fn context(
        graph: &Arc<MemoryGraph>,
        metadata: &Arc<InMemoryMetadataRepository>,
    ) -> SchedulerContext {
        let config = SchedulerConfig {
            default_delay_ms: 1,
            min_delay_ms: 1,
            max_delay_ms: 5,
            delta_ms: 1,
            max_consecutive_failures: 3,
            shutdown_timeout_ms: 2_000,
            ..SchedulerConfig::default()
        };
        SchedulerContext {
            graph: Arc::clone(graph) as Arc<dyn TransactionalGraph>,
            metadata: Arc::clone(metadata) as Arc<dyn MetadataRepository>,
            load: Arc::new(CommitRateMonitor::new(10, Duration::from_secs(1))),
            config,
            statuses: StatusBoard::default(),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn advances_and_persists_context() -> Result<()> {
        let graph = Arc::new(MemoryGraph::new());
        let metadata = Arc::new(InMemoryMetadataRepository::new());
        let calls = Arc::new(AtomicU32::new(0));
        let module = Counter {
            calls: Arc::clone(&calls),
            fail: false,
        };
        let scheduler = Scheduler::start(
            context(&graph, &metadata),
            vec![Arc::new(TimerAdapter(module)) as Arc<dyn ErasedTimerModule>],
        )?;
        assert!(wait_for(|| graph.node_count() >= 3));
        assert!(scheduler.stop());

        let stored = metadata.load("counter")?.and_then(|m| m.context);
        let step = stored.and_then(|v| v.as_u64()).unwrap_or_default();
        assert_eq!(step as usize, graph.node_count());
        Ok(())
    }

    #[test]
    fn repeated_failures_disable_module() -> Result<()> {
        let graph = Arc::new(MemoryGraph::new());
        let metadata = Arc::new(InMemoryMetadataRepository::new());
        let calls = Arc::new(AtomicU32::new(0));
        let module = Counter {
            calls: Arc::clone(&calls),
            fail: true,
        };
        let ctx = context(&graph, &metadata);
        let statuses = Arc::clone(&ctx.statuses);
        let scheduler = Scheduler::start(
            ctx,
            vec![Arc::new(TimerAdapter(module)) as Arc<dyn ErasedTimerModule>],
        )?;
        assert!(wait_for(|| {
            statuses.read().get("counter") == Some(&ModuleStatus::Failed)
        }));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(graph.node_count(), 0);
        let stored = metadata.load("counter")?.and_then(|m| m.context);
        assert_eq!(stored, Some(Value::from(0u64)));
        assert!(scheduler.stop());
        Ok(())
    }

    #[test]
    fn resumes_persisted_context() -> Result<()> {
        let graph = Arc::new(MemoryGraph::new());
        let metadata = Arc::new(InMemoryMetadataRepository::new());
        metadata.store(
            "counter",
            &ModuleMetadata {
                context: Some(Value::from(40u64)),
                ..ModuleMetadata::default()
            },
        )?;
        let module = Counter {
            calls: Arc::new(AtomicU32::new(0)),
            fail: false,
        };
        let scheduler = Scheduler::start(
            context(&graph, &metadata),
            vec![Arc::new(TimerAdapter(module)) as Arc<dyn ErasedTimerModule>],
        )?;
        assert!(wait_for(|| graph.node_count() >= 1));
        assert!(scheduler.stop());
        let first = graph
            .nodes()
            .into_iter()
            .filter_map(|n| n.properties.get("step").cloned())
            .min_by_key(|v| match v {
                PropValue::Int(i) => *i,
                _ => i64::MAX,
            });
        assert_eq!(first, Some(PropValue::Int(40)));
        Ok(())
    }
}
