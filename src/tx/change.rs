use std::fmt;

use crate::types::PropValue;

/// An entity before and after mutation within one transaction.
///
/// Both sides always refer to the same entity id.
#[derive(Clone, Debug)]
pub struct Change<T> {
    previous: T,
    current: T,
}

impl<T> Change<T> {
    pub(crate) fn new(previous: T, current: T) -> Self {
        Self { previous, current }
    }

    /// State before the transaction.
    pub fn previous(&self) -> &T {
        &self.previous
    }

    /// State after the transaction.
    pub fn current(&self) -> &T {
        &self.current
    }

    /// Splits into `(previous, current)`.
    pub fn into_parts(self) -> (T, T) {
        (self.previous, self.current)
    }
}

/// What happened to a single property key in one transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PropertyDelta {
    /// The key did not exist before.
    Created(PropValue),
    /// The key existed before and is gone now.
    Deleted(PropValue),
    /// The key existed before and now holds a different value.
    Changed {
        /// Value before the transaction.
        previous: PropValue,
        /// Value after the transaction.
        current: PropValue,
    },
}

impl PropertyDelta {
    /// Value before the transaction, if the key existed.
    pub fn previous(&self) -> Option<&PropValue> {
        match self {
            PropertyDelta::Created(_) => None,
            PropertyDelta::Deleted(v) => Some(v),
            PropertyDelta::Changed { previous, .. } => Some(previous),
        }
    }

    /// Value after the transaction, if the key still exists.
    pub fn current(&self) -> Option<&PropValue> {
        match self {
            PropertyDelta::Created(v) => Some(v),
            PropertyDelta::Deleted(_) => None,
            PropertyDelta::Changed { current, .. } => Some(current),
        }
    }
}

impl fmt::Display for PropertyDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyDelta::Created(v) => write!(f, "created {v}"),
            PropertyDelta::Deleted(v) => write!(f, "deleted {v}"),
            PropertyDelta::Changed { previous, current } => write!(f, "{previous} -> {current}"),
        }
    }
}
