use std::time::Duration;

use crate::config::SchedulerConfig;

/// What happened during the last invocation of a module.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InvocationOutcome {
    /// Wall-clock duration of the step.
    pub duration: Duration,
    /// Whether the step and its commit succeeded.
    pub succeeded: bool,
}

/// Adaptive delay between invocations of one timer-driven module.
///
/// The delay moves by a constant delta per invocation: it grows when
/// foreground commits per second exceed the busy threshold, when the last
/// step failed, or when the step took longer than the delay it followed,
/// and shrinks otherwise. It is always clamped to `[min, max]`; with no
/// history or an unknown load it falls back to the default delay.
#[derive(Clone, Debug)]
pub struct AdaptiveTimingStrategy {
    default_delay: Duration,
    min_delay: Duration,
    max_delay: Duration,
    delta: Duration,
    busy_threshold: f64,
    current: Duration,
}

impl AdaptiveTimingStrategy {
    /// Builds a strategy from scheduler settings.
    pub fn new(config: &SchedulerConfig) -> Self {
        let default_delay = config.default_delay().clamp(config.min_delay(), config.max_delay());
        Self {
            default_delay,
            min_delay: config.min_delay(),
            max_delay: config.max_delay(),
            delta: config.delta(),
            busy_threshold: config.busy_threshold as f64,
            current: default_delay,
        }
    }

    /// Delay chosen by the last call, or the default before any.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Resumes from a previously persisted delay.
    pub fn resume(&mut self, delay: Duration) {
        self.current = delay.clamp(self.min_delay, self.max_delay);
    }

    /// Picks the delay before the next invocation.
    ///
    /// `load` is foreground commits per second, `None` when not yet known.
    pub fn next_delay(&mut self, last: Option<InvocationOutcome>, load: Option<f64>) -> Duration {
        let next = match (last, load) {
            (Some(outcome), Some(load)) => {
                let busy = load > self.busy_threshold;
                let slow = outcome.duration > self.current;
                if busy || slow || !outcome.succeeded {
                    self.current.saturating_add(self.delta)
                } else {
                    self.current.saturating_sub(self.delta)
                }
            }
            _ => self.default_delay,
        };
        self.current = next.clamp(self.min_delay, self.max_delay);
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> AdaptiveTimingStrategy {
        AdaptiveTimingStrategy::new(&SchedulerConfig::default())
    }

    fn fast() -> Option<InvocationOutcome> {
        Some(InvocationOutcome {
            duration: Duration::from_millis(1),
            succeeded: true,
        })
    }

    #[test]
    fn no_history_yields_default() {
        let mut s = strategy();
        assert_eq!(s.next_delay(None, Some(0.0)), Duration::from_millis(2000));
        assert_eq!(s.next_delay(fast(), None), Duration::from_millis(2000));
    }

    #[test]
    fn quiet_database_shortens_delay() {
        let mut s = strategy();
        assert_eq!(s.next_delay(fast(), Some(10.0)), Duration::from_millis(1900));
        assert_eq!(s.next_delay(fast(), Some(10.0)), Duration::from_millis(1800));
    }

    #[test]
    fn busy_database_lengthens_delay() {
        let mut s = strategy();
        assert_eq!(s.next_delay(fast(), Some(500.0)), Duration::from_millis(2100));
    }

    #[test]
    fn failures_and_slow_steps_back_off() {
        let mut s = strategy();
        let failed = InvocationOutcome {
            duration: Duration::from_millis(1),
            succeeded: false,
        };
        assert_eq!(s.next_delay(Some(failed), Some(0.0)), Duration::from_millis(2100));
        let slow = InvocationOutcome {
            duration: Duration::from_secs(10),
            succeeded: true,
        };
        assert_eq!(s.next_delay(Some(slow), Some(0.0)), Duration::from_millis(2200));
    }

    #[test]
    fn delay_stays_within_bounds() {
        let mut s = strategy();
        for _ in 0..100 {
            s.next_delay(fast(), Some(0.0));
        }
        assert_eq!(s.current(), Duration::from_millis(5));
        for _ in 0..100 {
            s.next_delay(fast(), Some(1000.0));
        }
        assert_eq!(s.current(), Duration::from_millis(5000));
    }
}
