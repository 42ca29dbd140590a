//! Serialized writer queue.
//!
//! Module-initiated writes are funnelled through one bounded FIFO consumed
//! by a single dedicated thread. Serializing them removes the deadlocks
//! that concurrent writers touching overlapping entities in different
//! orders can hit inside the host's lock manager, at the cost of write
//! throughput.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sombra_runtime::host::{GraphAccess, MemoryGraph, TransactionalGraph};
//! use sombra_runtime::config::WriterConfig;
//! use sombra_runtime::writer::WriterQueue;
//! use sombra_runtime::types::Properties;
//!
//! # fn main() -> sombra_runtime::Result<()> {
//! let graph: Arc<dyn TransactionalGraph> = Arc::new(MemoryGraph::new());
//! let writer = WriterQueue::new(graph, WriterConfig::default())?;
//! writer.start()?;
//! let id = writer.write("create-one", Duration::from_secs(1), |graph: &dyn GraphAccess| {
//!     Ok(graph.create_node(&["Tag"], Properties::new())?)
//! })?;
//! assert!(id.is_some());
//! writer.stop();
//! # Ok(())
//! # }
//! ```

mod queue;
mod task;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{DrainPolicy, QueueFullPolicy, WriterConfig, WriterStrategy};
use crate::error::{ModuleError, Result, RuntimeError};
use crate::host::{GraphAccess, GraphTransaction, TransactionalGraph};
use crate::logging::RateLimitedLog;
use crate::worker::{panic_message, BackgroundWorker};

use queue::{BoundedQueue, PushError};
use task::{Outcome, ResultSlot, Task, WriteTask};

/// How long the writer thread waits for work before checking its
/// housekeeping duties.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Largest number of tasks taken off the queue at once under
/// [`WriterStrategy::TxPerTask`].
const TX_PER_TASK_BATCH: usize = 64;

/// Point-in-time copy of the writer counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    /// Tasks placed on the queue.
    pub accepted: u64,
    /// Tasks rejected because the queue was full.
    pub dropped: u64,
    /// Tasks whose work committed.
    pub executed: u64,
    /// Tasks whose work or commit failed.
    pub failed: u64,
    /// Tasks thrown away unexecuted at shutdown.
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WriterStats {
        WriterStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct Shared {
    queue: BoundedQueue<Box<dyn WriteTask>>,
    counters: Counters,
    full_warning: RateLimitedLog,
}

/// Bounded single-consumer queue of graph writes.
///
/// Strategy, queue-full policy and drain policy are fixed at construction.
pub struct WriterQueue {
    graph: Arc<dyn TransactionalGraph>,
    config: WriterConfig,
    shared: Arc<Shared>,
    phase: Mutex<Phase>,
    worker: Mutex<Option<BackgroundWorker>>,
}

impl WriterQueue {
    /// Creates a queue. Tasks may be enqueued before [`start`](Self::start);
    /// they run once the writer thread is up.
    ///
    /// Fails with [`RuntimeError::InvalidConfig`] for a zero capacity or
    /// batch size.
    pub fn new(graph: Arc<dyn TransactionalGraph>, config: WriterConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            queue: BoundedQueue::new(config.capacity),
            counters: Counters::default(),
            full_warning: RateLimitedLog::new(Duration::from_millis(config.full_warn_interval_ms)),
        });
        Ok(Self {
            graph,
            config,
            shared,
            phase: Mutex::new(Phase::Idle),
            worker: Mutex::new(None),
        })
    }

    /// Spawns the writer thread.
    pub fn start(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        if *phase != Phase::Idle {
            return Err(RuntimeError::InvalidState(format!(
                "writer queue cannot start from {phase:?}"
            )));
        }
        let consumer = Consumer {
            graph: Arc::clone(&self.graph),
            shared: Arc::clone(&self.shared),
            strategy: self.config.strategy,
            queue_log_interval: Duration::from_millis(self.config.queue_log_interval_ms),
        };
        let worker = BackgroundWorker::spawn("sombra-runtime-writer", move || consumer.run())?;
        *self.worker.lock() = Some(worker);
        *phase = Phase::Running;
        info!(
            capacity = self.config.capacity,
            strategy = ?self.config.strategy,
            "runtime.writer.started"
        );
        Ok(())
    }

    /// Enqueues `task` and optionally waits for its result.
    ///
    /// With a zero `wait` the call returns `Ok(None)` immediately
    /// (fire-and-forget). Otherwise it blocks up to `wait` and returns the
    /// task's output, or `Ok(None)` on timeout, when the task failed, or when
    /// it was dropped because the queue was full. Failures are logged by the
    /// writer thread; use [`try_write`](Self::try_write) to receive them.
    pub fn write<T, F>(&self, id: impl Into<String>, wait: Duration, task: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(&dyn GraphAccess) -> std::result::Result<T, ModuleError> + Send + 'static,
    {
        match self.try_write(id, wait, task) {
            Err(RuntimeError::TaskFailed { task_id, .. }) => {
                debug!(task_id = %task_id, "runtime.writer.wait_failed");
                Ok(None)
            }
            Err(RuntimeError::QueueFull { .. }) => Ok(None),
            other => other,
        }
    }

    /// Like [`write`](Self::write), but reports a failed task as
    /// [`RuntimeError::TaskFailed`] and a rejected one as
    /// [`RuntimeError::QueueFull`].
    pub fn try_write<T, F>(
        &self,
        id: impl Into<String>,
        wait: Duration,
        task: F,
    ) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(&dyn GraphAccess) -> std::result::Result<T, ModuleError> + Send + 'static,
    {
        let id = id.into();
        let slot = (!wait.is_zero()).then(|| Arc::new(ResultSlot::<T>::new()));
        let task = Box::new(Task::new(id.clone(), task, slot.clone()));
        self.enqueue(task)?;
        let Some(slot) = slot else {
            return Ok(None);
        };
        match slot.wait(wait) {
            Outcome::Done(value) => Ok(Some(value)),
            Outcome::Failed(message) => Err(RuntimeError::TaskFailed {
                task_id: id,
                message,
            }),
            Outcome::Pending => {
                debug!(task_id = %id, wait_ms = wait.as_millis() as u64, "runtime.writer.wait_timeout");
                Ok(None)
            }
            Outcome::Abandoned => Ok(None),
        }
    }

    /// Enqueues a fire-and-forget task, reporting a full queue as
    /// [`RuntimeError::QueueFull`] instead of swallowing it.
    pub fn submit<F>(&self, id: impl Into<String>, task: F) -> Result<()>
    where
        F: FnOnce(&dyn GraphAccess) -> std::result::Result<(), ModuleError> + Send + 'static,
    {
        self.enqueue(Box::new(Task::<(), F>::new(id.into(), task, None)))
    }

    fn enqueue(&self, task: Box<dyn WriteTask>) -> Result<()> {
        if *self.phase.lock() == Phase::Stopped {
            return Err(RuntimeError::ShuttingDown);
        }
        let push_wait = match self.config.queue_full {
            QueueFullPolicy::Drop => Duration::ZERO,
            QueueFullPolicy::Block { timeout_ms } => Duration::from_millis(timeout_ms),
        };
        match self.shared.queue.push(task, push_wait) {
            Ok(()) => {
                self.shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(PushError::Full(task)) => {
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                let task_id = task.id().to_owned();
                if let Some(suppressed) = self.shared.full_warning.permit() {
                    warn!(
                        task_id = %task_id,
                        capacity = self.config.capacity,
                        suppressed,
                        "runtime.writer.queue_full"
                    );
                }
                task.abandon();
                Err(RuntimeError::QueueFull { task_id })
            }
            Err(PushError::Closed(task)) => {
                task.abandon();
                Err(RuntimeError::ShuttingDown)
            }
        }
    }

    /// Stops accepting work, drains or discards the backlog per policy and
    /// joins the writer thread within the configured bound.
    ///
    /// Returns `false` when the thread had to be detached.
    pub fn stop(&self) -> bool {
        {
            let mut phase = self.phase.lock();
            if *phase == Phase::Stopped {
                return true;
            }
            *phase = Phase::Stopped;
        }
        self.shared.queue.close();
        let worker = self.worker.lock().take();
        if worker.is_none() || self.config.on_shutdown == DrainPolicy::Discard {
            let backlog = self.shared.queue.drain_all();
            if !backlog.is_empty() {
                warn!(discarded = backlog.len(), "runtime.writer.discarded");
            }
            for task in backlog {
                self.shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
                task.abandon();
            }
        }
        let joined = match worker {
            Some(worker) => worker.join_timeout(self.config.shutdown_timeout()),
            None => true,
        };
        info!(stats = ?self.stats(), joined, "runtime.writer.stopped");
        joined
    }

    /// Counters so far.
    pub fn stats(&self) -> WriterStats {
        self.shared.counters.snapshot()
    }

    /// Tasks waiting in the queue.
    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Whether no task is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the writer thread is running.
    pub fn is_running(&self) -> bool {
        *self.phase.lock() == Phase::Running
    }

    /// Configuration the queue was built with.
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }
}

impl Drop for WriterQueue {
    fn drop(&mut self) {
        if *self.phase.lock() == Phase::Running {
            self.stop();
        }
    }
}

/// State owned by the writer thread.
struct Consumer {
    graph: Arc<dyn TransactionalGraph>,
    shared: Arc<Shared>,
    strategy: WriterStrategy,
    queue_log_interval: Duration,
}

impl Consumer {
    fn run(self) {
        let max = match self.strategy {
            WriterStrategy::TxPerTask => TX_PER_TASK_BATCH,
            WriterStrategy::Batched { batch_size } => batch_size,
        };
        let mut last_report = Instant::now();
        while let Some(batch) = self.shared.queue.pop_batch(max, POLL_INTERVAL) {
            if !self.queue_log_interval.is_zero() && last_report.elapsed() >= self.queue_log_interval {
                let size = self.shared.queue.len();
                if size > 0 {
                    info!(size, capacity = self.shared.queue.capacity(), "runtime.writer.queue_size");
                }
                last_report = Instant::now();
            }
            if batch.is_empty() {
                continue;
            }
            match self.strategy {
                WriterStrategy::TxPerTask => {
                    for task in batch {
                        self.run_alone(task);
                    }
                }
                WriterStrategy::Batched { .. } => self.run_batch(batch),
            }
        }
        debug!("runtime.writer.exited");
    }

    fn begin(&self) -> std::result::Result<Box<dyn GraphTransaction + '_>, String> {
        self.graph.begin().map_err(|e| e.to_string())
    }

    /// One task, one transaction.
    fn run_alone(&self, mut task: Box<dyn WriteTask>) {
        let tx = match self.begin() {
            Ok(tx) => tx,
            Err(message) => return self.failed(task, message),
        };
        match guarded(task.as_mut(), tx.as_access()) {
            Ok(()) => match tx.commit() {
                Ok(()) => self.executed(task),
                Err(err) => self.failed(task, err.to_string()),
            },
            Err(message) => {
                tx.rollback();
                self.failed(task, message);
            }
        }
    }

    /// Many tasks, one transaction. Each task runs behind a savepoint so a
    /// failing task is undone without touching its neighbours.
    fn run_batch(&self, batch: Vec<Box<dyn WriteTask>>) {
        let tx = match self.begin() {
            Ok(tx) => tx,
            Err(message) => {
                for task in batch {
                    self.failed(task, message.clone());
                }
                return;
            }
        };
        let mut done = Vec::with_capacity(batch.len());
        let mut pending = batch.into_iter();
        while let Some(mut task) = pending.next() {
            let savepoint = tx.savepoint();
            let Err(message) = guarded(task.as_mut(), tx.as_access()) else {
                done.push(task);
                continue;
            };
            if let Err(err) = tx.rollback_to(savepoint) {
                error!(task_id = %task.id(), error = %err, "runtime.writer.savepoint_failed");
                tx.rollback();
                let reason = format!("batch aborted: {err}");
                self.failed(task, message);
                for task in done.into_iter().chain(pending) {
                    self.failed(task, reason.clone());
                }
                return;
            }
            self.failed(task, message);
        }

        if done.is_empty() {
            tx.rollback();
            return;
        }
        match tx.commit() {
            Ok(()) => {
                debug!(tasks = done.len(), "runtime.writer.batch_committed");
                for task in done {
                    self.executed(task);
                }
            }
            Err(err) => {
                error!(tasks = done.len(), error = %err, "runtime.writer.batch_commit_failed");
                let message = err.to_string();
                for task in done {
                    self.failed(task, message.clone());
                }
            }
        }
    }

    fn executed(&self, task: Box<dyn WriteTask>) {
        self.shared.counters.executed.fetch_add(1, Ordering::Relaxed);
        task.complete(Ok(()));
    }

    fn failed(&self, task: Box<dyn WriteTask>, message: String) {
        self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!(task_id = %task.id(), error = %message, "runtime.writer.task_failed");
        task.complete(Err(message));
    }
}

fn guarded(task: &mut dyn WriteTask, graph: &dyn GraphAccess) -> std::result::Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(|| task.run(graph))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}
