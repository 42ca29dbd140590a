//! Dedicated background threads with a bounded join.

use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::error::{Result, RuntimeError};

/// A named background thread that signals when its body returns.
///
/// `std` cannot join with a timeout, so the body flips a flag under a
/// condvar on exit and [`join_timeout`](Self::join_timeout) waits on that
/// instead. A thread that misses the deadline is detached, never killed.
pub(crate) struct BackgroundWorker {
    name: String,
    handle: Option<JoinHandle<()>>,
    done: Arc<(Mutex<bool>, Condvar)>,
}

impl BackgroundWorker {
    pub(crate) fn spawn(name: &str, body: impl FnOnce() + Send + 'static) -> Result<Self> {
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&done);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let _guard = DoneGuard(signal);
                body();
            })
            .map_err(RuntimeError::Io)?;
        Ok(Self {
            name: name.to_owned(),
            handle: Some(handle),
            done,
        })
    }

    /// Waits up to `timeout` for the thread to finish.
    ///
    /// Returns `false` and detaches the thread when it does not.
    pub(crate) fn join_timeout(mut self, timeout: Duration) -> bool {
        let finished = {
            let (lock, cv) = &*self.done;
            let deadline = Instant::now() + timeout;
            let mut done = lock.lock();
            while !*done {
                if cv.wait_until(&mut done, deadline).timed_out() {
                    break;
                }
            }
            *done
        };
        let Some(handle) = self.handle.take() else {
            return finished;
        };
        if finished {
            if handle.join().is_err() {
                error!(thread = %self.name, "runtime.worker.panicked");
            }
        } else {
            error!(
                thread = %self.name,
                timeout_ms = timeout.as_millis() as u64,
                "runtime.worker.join_timeout"
            );
        }
        finished
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic".to_owned()
    }
}

/// Flags completion even when the body unwinds.
struct DoneGuard(Arc<(Mutex<bool>, Condvar)>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let (lock, cv) = &*self.0;
        *lock.lock() = true;
        cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn joins_finished_thread() -> Result<()> {
        let worker = BackgroundWorker::spawn("test-quick", || {})?;
        assert!(worker.join_timeout(Duration::from_secs(5)));
        Ok(())
    }

    #[test]
    fn detaches_thread_that_misses_deadline() -> Result<()> {
        let (release, gate) = mpsc::channel::<()>();
        let worker = BackgroundWorker::spawn("test-slow", move || {
            let _ = gate.recv();
        })?;
        assert!(!worker.join_timeout(Duration::from_millis(20)));
        let _ = release.send(());
        Ok(())
    }

    #[test]
    fn panic_payload_text() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 7");
    }
}
