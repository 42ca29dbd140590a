//! Transaction diff engine.
//!
//! Turns the host's literal commit-time [`RawMutationLog`] into a
//! [`TransactionDiff`] with disjoint created, deleted and changed sets,
//! lazy before/after [snapshots](NodeSnapshot), and per-module
//! [`FilteredTransactionDiff`] views.

mod change;
mod diff;
mod filtered;
mod log;
mod snapshot;

pub use change::{Change, PropertyDelta};
pub use diff::{EntityChanges, TransactionDiff};
pub use filtered::FilteredTransactionDiff;
pub use log::{AssignedProperty, LabelEvent, RawMutationLog, RemovedProperty};
pub use snapshot::{NodeSnapshot, RelationshipSnapshot, Side};
