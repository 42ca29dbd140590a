//! Module runtime for Sombra-style graph databases.
//!
//! Background *modules* extend a transactional graph engine without touching
//! its storage code. Transaction-driven modules run inside the commit hook
//! and see a [`TransactionDiff`](tx::TransactionDiff) of the committing
//! transaction filtered through their [`InclusionPolicies`](policy::InclusionPolicies).
//! Timer-driven modules run on a single scheduler thread whose delay adapts
//! to foreground load. Writes that modules initiate go through one
//! serialized [`WriterQueue`](writer::WriterQueue).
//!
//! ```no_run
//! use std::sync::Arc;
//! use sombra_runtime::host::{MemoryGraph, TransactionalGraph};
//! use sombra_runtime::{Runtime, RuntimeConfig};
//!
//! # fn main() -> sombra_runtime::Result<()> {
//! let graph: Arc<dyn TransactionalGraph> = Arc::new(MemoryGraph::new());
//! let runtime = Runtime::new(graph, RuntimeConfig::default())?;
//! runtime.initialize()?;
//! runtime.start()?;
//! runtime.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod module;
pub mod policy;
pub mod runtime;
pub mod schedule;
pub mod types;
pub mod tx;
pub mod walk;
mod worker;
pub mod writer;

pub use config::RuntimeConfig;
pub use error::{ModuleError, Result, RuntimeError};
pub use module::{ModuleStatus, TimerDrivenModule, TxDrivenModule};
pub use runtime::{Runtime, RuntimeState};
pub use tx::{FilteredTransactionDiff, TransactionDiff};
pub use writer::{WriterQueue, WriterStats};
