use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{Result, RuntimeError};

/// Logical AND over an ordered, non-empty list of policies of one kind.
///
/// Evaluation is left to right and stops at the first policy that excludes,
/// so cheap policies belong at the front. Equality and hashing are
/// structural and order-sensitive.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CompositePolicy<P> {
    policies: Vec<P>,
}

impl<P> CompositePolicy<P> {
    /// Builds a composite, failing with `EmptyComposite` for zero policies.
    pub fn of(policies: impl IntoIterator<Item = P>) -> Result<Self> {
        let policies: Vec<P> = policies.into_iter().collect();
        if policies.is_empty() {
            return Err(RuntimeError::EmptyComposite);
        }
        Ok(Self { policies })
    }

    pub(crate) fn pair(first: P, second: P) -> Self {
        Self {
            policies: vec![first, second],
        }
    }

    /// Sub-policies in evaluation order.
    pub fn policies(&self) -> &[P] {
        &self.policies
    }

    /// Number of sub-policies; never zero.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Always `false`; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// A caller-supplied predicate with a stable name.
///
/// Closures cannot be compared, so two custom policies are equal exactly
/// when their names are.
pub struct Custom<F: ?Sized> {
    name: String,
    predicate: Arc<F>,
}

impl<F: ?Sized> Custom<F> {
    pub(crate) fn new(name: impl Into<String>, predicate: Arc<F>) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }

    /// Name used for equality, hashing and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn predicate(&self) -> &F {
        &self.predicate
    }
}

impl<F: ?Sized> Clone for Custom<F> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<F: ?Sized> PartialEq for Custom<F> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<F: ?Sized> Eq for Custom<F> {}

impl<F: ?Sized> Hash for Custom<F> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl<F: ?Sized> fmt::Debug for Custom<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Custom").field(&self.name).finish()
    }
}
