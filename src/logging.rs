//! Logging setup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, RuntimeError};

/// Installs a global `tracing` subscriber filtered by `level`.
///
/// `level` accepts any `EnvFilter` directive, e.g. `"info"` or
/// `"sombra_runtime=debug"`.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| RuntimeError::InvalidConfig(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| RuntimeError::InvalidConfig("logging already initialized".into()))
}

/// Gate that lets an event through at most once per interval.
///
/// Events arriving inside the interval are counted; the count is handed to
/// the next permitted emission so overload is still visible in the log.
#[derive(Debug)]
pub struct RateLimitedLog {
    interval: Duration,
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl RateLimitedLog {
    /// Creates a gate with the given minimum spacing between emissions.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns `Some(suppressed)` when the caller may emit now.
    pub fn permit(&self) -> Option<u64> {
        self.permit_at(Instant::now())
    }

    pub(crate) fn permit_at(&self, now: Instant) -> Option<u64> {
        let mut last = self.last.lock();
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < self.interval => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => {
                *last = Some(now);
                Some(self.suppressed.swap(0, Ordering::Relaxed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_inside_interval_and_reports_count() {
        let gate = RateLimitedLog::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert_eq!(gate.permit_at(t0), Some(0));
        assert_eq!(gate.permit_at(t0 + Duration::from_millis(10)), None);
        assert_eq!(gate.permit_at(t0 + Duration::from_millis(20)), None);
        assert_eq!(gate.permit_at(t0 + Duration::from_secs(6)), Some(2));
    }
}
