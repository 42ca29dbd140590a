use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Source of foreground load for the adaptive scheduler.
pub trait LoadMonitor: Send + Sync {
    /// Foreground commits per second, `None` until enough data is known.
    fn current_load(&self) -> Option<f64>;
}

/// Rate of a monotonically increasing counter over a bounded window.
///
/// The window keeps at most `max_samples` samples and drops samples older
/// than `max_window` relative to the newest one.
#[derive(Debug)]
pub struct RunningWindowAverage {
    samples: VecDeque<(Instant, u64)>,
    max_samples: usize,
    max_window: Duration,
}

impl RunningWindowAverage {
    /// Creates an empty window. `max_samples` is raised to at least 2.
    pub fn new(max_samples: usize, max_window: Duration) -> Self {
        let max_samples = max_samples.max(2);
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
            max_window,
        }
    }

    /// Adds a sample of the counter taken at `at`.
    pub fn sample(&mut self, at: Instant, value: u64) {
        self.samples.push_back((at, value));
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        while let Some(&(oldest, _)) = self.samples.front() {
            if at.saturating_duration_since(oldest) > self.max_window && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Increase per second across the window, `None` with fewer than two
    /// samples or no elapsed time.
    pub fn rate_per_second(&self) -> Option<f64> {
        let (first_at, first) = *self.samples.front()?;
        let (last_at, last) = *self.samples.back()?;
        let elapsed = last_at.saturating_duration_since(first_at).as_secs_f64();
        if self.samples.len() < 2 || elapsed <= 0.0 {
            return None;
        }
        Some(last.saturating_sub(first) as f64 / elapsed)
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample is held.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Counts foreground commits and reports their rate.
///
/// The commit hook bumps the counter; each [`current_load`](LoadMonitor::current_load)
/// call samples it into a [`RunningWindowAverage`].
#[derive(Debug)]
pub struct CommitRateMonitor {
    commits: AtomicU64,
    window: Mutex<RunningWindowAverage>,
}

impl CommitRateMonitor {
    /// Creates a monitor with the given window bounds.
    pub fn new(max_samples: usize, max_window: Duration) -> Self {
        Self {
            commits: AtomicU64::new(0),
            window: Mutex::new(RunningWindowAverage::new(max_samples, max_window)),
        }
    }

    /// Records one foreground commit.
    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Total commits recorded.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

impl LoadMonitor for CommitRateMonitor {
    fn current_load(&self) -> Option<f64> {
        let mut window = self.window.lock();
        window.sample(Instant::now(), self.commits());
        window.rate_per_second()
    }
}
