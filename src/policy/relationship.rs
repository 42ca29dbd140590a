use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::Result;
use crate::policy::composite::{CompositePolicy, Custom};
use crate::policy::predicate::Predicate;
use crate::types::{Direction, NodeId, RelationshipView};

/// Closure type behind [`RelationshipPolicy::Custom`].
pub type RelationshipPredicate = dyn Fn(&dyn RelationshipView) -> bool + Send + Sync;

/// Decides which relationships a module sees.
///
/// [`include_from`](Self::include_from) additionally checks direction
/// relative to a viewpoint node; only [`IncludeRelationships`] constrains
/// direction, every other variant ignores the viewpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RelationshipPolicy {
    /// Every relationship.
    All,
    /// No relationship.
    None,
    /// Relationships whose type does not start with `prefix`.
    ExcludeInternal {
        /// Reserved type prefix.
        prefix: String,
    },
    /// Type, direction and property match.
    Include(IncludeRelationships),
    /// Named closure.
    Custom(Custom<RelationshipPredicate>),
    /// Short-circuit AND.
    Composite(CompositePolicy<RelationshipPolicy>),
}

impl RelationshipPolicy {
    /// Wraps a closure under a stable name.
    pub fn custom<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&dyn RelationshipView) -> bool + Send + Sync + 'static,
    {
        let predicate: Arc<RelationshipPredicate> = Arc::new(predicate);
        RelationshipPolicy::Custom(Custom::new(name, predicate))
    }

    /// AND of `policies`; fails with `EmptyComposite` when there are none.
    pub fn all_of(policies: impl IntoIterator<Item = RelationshipPolicy>) -> Result<Self> {
        Ok(RelationshipPolicy::Composite(CompositePolicy::of(policies)?))
    }

    /// Whether `rel` is visible, regardless of direction.
    pub fn include(&self, rel: &dyn RelationshipView) -> bool {
        match self {
            RelationshipPolicy::All => true,
            RelationshipPolicy::None => false,
            RelationshipPolicy::ExcludeInternal { prefix } => !rel.rel_type().starts_with(prefix.as_str()),
            RelationshipPolicy::Include(fluent) => fluent.include(rel),
            RelationshipPolicy::Custom(custom) => (custom.predicate())(rel),
            RelationshipPolicy::Composite(composite) => composite.include(rel),
        }
    }

    /// Whether `rel` is visible when seen from `viewpoint`.
    pub fn include_from(&self, rel: &dyn RelationshipView, viewpoint: NodeId) -> bool {
        match self {
            RelationshipPolicy::Include(fluent) => fluent.include_from(rel, viewpoint),
            RelationshipPolicy::Composite(composite) => composite.include_from(rel, viewpoint),
            other => other.include(rel),
        }
    }
}

impl CompositePolicy<RelationshipPolicy> {
    /// Whether every sub-policy includes `rel`, stopping at the first that does not.
    pub fn include(&self, rel: &dyn RelationshipView) -> bool {
        self.policies().iter().all(|p| p.include(rel))
    }

    /// Viewpoint-aware variant of [`include`](Self::include).
    pub fn include_from(&self, rel: &dyn RelationshipView, viewpoint: NodeId) -> bool {
        self.policies().iter().all(|p| p.include_from(rel, viewpoint))
    }
}

impl From<IncludeRelationships> for RelationshipPolicy {
    fn from(fluent: IncludeRelationships) -> Self {
        RelationshipPolicy::Include(fluent)
    }
}

/// Fluent relationship policy: any of a set of types, a direction relative
/// to the viewpoint, AND a map of property predicates.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IncludeRelationships {
    types: BTreeSet<String>,
    direction: Direction,
    properties: BTreeMap<String, Predicate>,
}

impl Default for IncludeRelationships {
    fn default() -> Self {
        Self {
            types: BTreeSet::new(),
            direction: Direction::Both,
            properties: BTreeMap::new(),
        }
    }
}

impl IncludeRelationships {
    /// Matches every relationship until narrowed.
    pub fn all() -> Self {
        Self::default()
    }

    /// Adds an accepted type. No types means any type.
    pub fn with_type(mut self, rel_type: impl Into<String>) -> Self {
        self.types.insert(rel_type.into());
        self
    }

    /// Restricts the direction seen from a viewpoint.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Requires `predicate` to hold for property `key`.
    pub fn with_property(mut self, key: impl Into<String>, predicate: Predicate) -> Self {
        self.properties.insert(key.into(), predicate);
        self
    }

    /// Whether `rel` matches type and properties.
    pub fn include(&self, rel: &dyn RelationshipView) -> bool {
        if !self.types.is_empty() && !self.types.contains(rel.rel_type()) {
            return false;
        }
        self.properties
            .iter()
            .all(|(key, predicate)| predicate.evaluate(rel.property(key).as_ref()))
    }

    /// Whether `rel` matches and points the configured way from `viewpoint`.
    ///
    /// False when `viewpoint` is on neither end.
    pub fn include_from(&self, rel: &dyn RelationshipView, viewpoint: NodeId) -> bool {
        match rel.direction_from(viewpoint) {
            Some(direction) => self.direction.matches(direction) && self.include(rel),
            None => false,
        }
    }
}
