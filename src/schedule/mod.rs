//! Timer-driven module scheduling.
//!
//! One dedicated thread runs every timer-driven module in turn. The delay
//! before each module's next step adapts to foreground commit throughput
//! and to how the previous step went, within configured bounds.

pub mod monitor;
pub(crate) mod scheduler;
pub mod timing;

pub use monitor::{CommitRateMonitor, LoadMonitor, RunningWindowAverage};
pub use timing::{AdaptiveTimingStrategy, InvocationOutcome};
