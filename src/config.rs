//! Runtime configuration options.
//!
//! This module provides the configuration structures controlling the
//! scheduler's adaptive timing, the writer queue and the runtime's own
//! bookkeeping namespace.
//!
//! # Configuration Presets
//!
//! - [`RuntimeConfig::default()`] - General purpose defaults
//! - [`RuntimeConfig::production()`] - Conservative back-off, backpressure on the writer
//! - [`RuntimeConfig::testing()`] - Short delays and timeouts for fast test turnaround
//!
//! # Example
//!
//! ```rust
//! use sombra_runtime::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_toml_str(r#"
//!     internal_prefix = "_rt_"
//!
//!     [scheduler]
//!     min_delay_ms = 10
//!
//!     [writer]
//!     capacity = 500
//!     strategy = { kind = "batched", batch_size = 100 }
//! "#).unwrap();
//! assert_eq!(config.writer.capacity, 500);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Prefix marking labels, relationship types and property keys that belong
/// to the runtime rather than to business data.
pub const DEFAULT_INTERNAL_PREFIX: &str = "_SRT_";

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Prefix hidden from business-level inclusion policies.
    pub internal_prefix: String,

    /// `EnvFilter` directive installed by [`RuntimeConfig::init_logging`].
    pub log_level: String,

    /// Timer-driven module scheduling.
    pub scheduler: SchedulerConfig,

    /// Serialized writer queue.
    pub writer: WriterConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            internal_prefix: DEFAULT_INTERNAL_PREFIX.to_owned(),
            log_level: "info".to_owned(),
            scheduler: SchedulerConfig::default(),
            writer: WriterConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Creates a configuration suited to production workloads.
    ///
    /// The scheduler backs off sooner and further, and the writer applies
    /// bounded backpressure instead of dropping tasks.
    pub fn production() -> Self {
        Self {
            scheduler: SchedulerConfig {
                busy_threshold: 50,
                max_delay_ms: 10_000,
                ..SchedulerConfig::default()
            },
            writer: WriterConfig {
                queue_full: QueueFullPolicy::Block { timeout_ms: 100 },
                ..WriterConfig::default()
            },
            ..Self::default()
        }
    }

    /// Creates a configuration with short delays for tests.
    pub fn testing() -> Self {
        Self {
            log_level: "debug".to_owned(),
            scheduler: SchedulerConfig {
                default_delay_ms: 5,
                min_delay_ms: 1,
                max_delay_ms: 50,
                delta_ms: 2,
                max_window_ms: 500,
                shutdown_timeout_ms: 2_000,
                ..SchedulerConfig::default()
            },
            writer: WriterConfig {
                capacity: 1_000,
                shutdown_timeout_ms: 5_000,
                ..WriterConfig::default()
            },
            ..Self::default()
        }
    }

    /// Parses and validates a TOML document. Missing keys take defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Installs the global `tracing` subscriber at [`log_level`](Self::log_level).
    pub fn init_logging(&self) -> Result<()> {
        crate::logging::init_logging(&self.log_level)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.internal_prefix.is_empty() {
            return Err(RuntimeError::InvalidConfig(
                "internal_prefix must not be empty".into(),
            ));
        }
        self.scheduler.validate()?;
        self.writer.validate()
    }
}

/// Adaptive timing and failure handling for timer-driven modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether the scheduler thread is started at all.
    pub enabled: bool,
    /// Delay used when there is no history to adapt from.
    pub default_delay_ms: u64,
    /// Lower bound of the adaptive delay. Must be positive.
    pub min_delay_ms: u64,
    /// Upper bound of the adaptive delay.
    pub max_delay_ms: u64,
    /// Step by which the delay grows or shrinks per decision.
    pub delta_ms: u64,
    /// Foreground commits per second above which the database counts as busy.
    pub busy_threshold: u64,
    /// Maximum samples kept by the commit-rate running window.
    pub max_samples: usize,
    /// Maximum time span covered by the commit-rate running window.
    pub max_window_ms: u64,
    /// Consecutive failures after which a module is disabled.
    pub max_consecutive_failures: u32,
    /// Invocations slower than this are logged as warnings.
    pub slow_invocation_warn_ms: u64,
    /// Bound on waiting for the scheduler thread during shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_delay_ms: 2_000,
            min_delay_ms: 5,
            max_delay_ms: 5_000,
            delta_ms: 100,
            busy_threshold: 100,
            max_samples: 200,
            max_window_ms: 2_000,
            max_consecutive_failures: 5,
            slow_invocation_warn_ms: 10_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl SchedulerConfig {
    /// Lower delay bound.
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    /// Upper delay bound.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay used without history.
    pub fn default_delay(&self) -> Duration {
        Duration::from_millis(self.default_delay_ms)
    }

    /// Adjustment step.
    pub fn delta(&self) -> Duration {
        Duration::from_millis(self.delta_ms)
    }

    /// Shutdown join bound.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.min_delay_ms == 0 {
            return Err(RuntimeError::InvalidConfig(
                "scheduler.min_delay_ms must be positive".into(),
            ));
        }
        if self.min_delay_ms > self.default_delay_ms || self.default_delay_ms > self.max_delay_ms
        {
            return Err(RuntimeError::InvalidConfig(format!(
                "scheduler delays must satisfy min <= default <= max, got {} / {} / {}",
                self.min_delay_ms, self.default_delay_ms, self.max_delay_ms
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(RuntimeError::InvalidConfig(
                "scheduler.max_consecutive_failures must be positive".into(),
            ));
        }
        if self.max_samples < 2 {
            return Err(RuntimeError::InvalidConfig(
                "scheduler.max_samples must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

/// How queued writer tasks map onto host transactions.
///
/// Both strategies leave the same graph state for a given task sequence,
/// failing tasks included: batched tasks each run behind a savepoint and a
/// failing task is rolled back to it, logged and skipped. They differ when
/// the batch commit itself fails (every task of that batch then fails) and in
/// when writes become visible. A task must never assume atomicity with its
/// queue neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriterStrategy {
    /// Every task runs in its own transaction, committed before the next is dequeued.
    TxPerTask,
    /// Up to `batch_size` queued tasks share one transaction.
    Batched {
        /// Maximum tasks per transaction.
        batch_size: usize,
    },
}

/// What happens when a producer offers a task to a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueFullPolicy {
    /// Drop the task and log a rate-limited warning.
    Drop,
    /// Wait up to `timeout_ms` for space, then drop.
    Block {
        /// Bound on producer blocking.
        timeout_ms: u64,
    },
}

/// What the writer does with queued tasks when it is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Execute everything still queued before exiting.
    Drain,
    /// Discard queued tasks; blocked callers see `None`.
    Discard,
}

/// Serialized writer queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Bounded queue capacity.
    pub capacity: usize,
    /// Transaction grouping strategy.
    pub strategy: WriterStrategy,
    /// Producer behaviour on a full queue.
    pub queue_full: QueueFullPolicy,
    /// Queue handling on stop.
    pub on_shutdown: DrainPolicy,
    /// Bound on waiting for the writer thread during shutdown.
    pub shutdown_timeout_ms: u64,
    /// Interval between queue size reports; 0 disables them.
    pub queue_log_interval_ms: u64,
    /// Minimum spacing between queue-full warnings.
    pub full_warn_interval_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            strategy: WriterStrategy::TxPerTask,
            queue_full: QueueFullPolicy::Drop,
            on_shutdown: DrainPolicy::Drain,
            shutdown_timeout_ms: 5_000,
            queue_log_interval_ms: 5_000,
            full_warn_interval_ms: 5_000,
        }
    }
}

impl WriterConfig {
    /// Shutdown join bound.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Rejects a zero capacity or batch size.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "writer.capacity must be positive".into(),
            ));
        }
        if let WriterStrategy::Batched { batch_size: 0 } = self.strategy {
            return Err(RuntimeError::InvalidConfig(
                "writer.strategy.batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}
