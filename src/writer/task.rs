use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::ModuleError;
use crate::host::GraphAccess;

/// Type-erased unit of work queued on the writer.
pub(crate) trait WriteTask: Send {
    fn id(&self) -> &str;

    /// Runs the work against the writer's open transaction.
    fn run(&mut self, graph: &dyn GraphAccess) -> Result<(), ModuleError>;

    /// Reports the final outcome once the enclosing transaction is settled.
    fn complete(self: Box<Self>, outcome: Result<(), String>);

    /// Drops the task unexecuted.
    fn abandon(self: Box<Self>);
}

/// What a blocked caller finds in its slot.
#[derive(Debug)]
pub(crate) enum Outcome<T> {
    Pending,
    Done(T),
    Failed(String),
    Abandoned,
}

/// One-shot rendezvous between the writer thread and a blocked caller.
pub(crate) struct ResultSlot<T> {
    state: Mutex<Outcome<T>>,
    ready: Condvar,
}

impl<T> ResultSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(Outcome::Pending),
            ready: Condvar::new(),
        }
    }

    fn fill(&self, outcome: Outcome<T>) {
        *self.state.lock() = outcome;
        self.ready.notify_all();
    }

    /// Waits up to `timeout`; returns [`Outcome::Pending`] on timeout.
    pub(crate) fn wait(&self, timeout: Duration) -> Outcome<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while matches!(*state, Outcome::Pending) {
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *state, Outcome::Pending)
    }
}

/// Closure task with an optional slot for a blocked caller.
pub(crate) struct Task<T, F> {
    id: String,
    work: Option<F>,
    output: Option<T>,
    slot: Option<Arc<ResultSlot<T>>>,
}

impl<T, F> Task<T, F> {
    pub(crate) fn new(id: String, work: F, slot: Option<Arc<ResultSlot<T>>>) -> Self {
        Self {
            id,
            work: Some(work),
            output: None,
            slot,
        }
    }
}

impl<T, F> WriteTask for Task<T, F>
where
    T: Send,
    F: FnOnce(&dyn GraphAccess) -> Result<T, ModuleError> + Send,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, graph: &dyn GraphAccess) -> Result<(), ModuleError> {
        let work = self
            .work
            .take()
            .ok_or_else(|| ModuleError::failed("task already executed"))?;
        self.output = Some(work(graph)?);
        Ok(())
    }

    fn complete(self: Box<Self>, outcome: Result<(), String>) {
        let Task { slot, output, .. } = *self;
        let Some(slot) = slot else {
            return;
        };
        match (outcome, output) {
            (Ok(()), Some(value)) => slot.fill(Outcome::Done(value)),
            (Ok(()), None) => slot.fill(Outcome::Failed("task produced no output".into())),
            (Err(message), _) => slot.fill(Outcome::Failed(message)),
        }
    }

    fn abandon(self: Box<Self>) {
        if let Some(slot) = &self.slot {
            slot.fill(Outcome::Abandoned);
        }
    }
}
