use crate::host::GraphAccess;
use crate::policy::InclusionPolicies;
use crate::tx::change::{Change, PropertyDelta};
use crate::tx::diff::{EntityChanges, TransactionDiff};
use crate::tx::snapshot::{NodeSnapshot, RelationshipSnapshot, Side};
use crate::types::{Direction, EntityRef, EntityView, NodeId, NodeView, Properties};

/// A [`TransactionDiff`] seen through one module's [`InclusionPolicies`].
///
/// Nothing is copied: every iterator re-applies the policies to the shared
/// diff on each traversal, so any number of modules can filter one diff.
/// A changed entity is visible when the entity policy accepts either side
/// and at least one of its deltas survives the property policy (label
/// changes always count).
#[derive(Clone, Copy)]
pub struct FilteredTransactionDiff<'d> {
    diff: &'d TransactionDiff<'d>,
    policies: &'d InclusionPolicies,
}

impl<'d> FilteredTransactionDiff<'d> {
    /// Filters `diff` through `policies`.
    pub fn new(diff: &'d TransactionDiff<'d>, policies: &'d InclusionPolicies) -> Self {
        Self { diff, policies }
    }

    /// The unfiltered diff.
    pub fn unfiltered(&self) -> &'d TransactionDiff<'d> {
        self.diff
    }

    /// Policies applied by this view.
    pub fn policies(&self) -> &'d InclusionPolicies {
        self.policies
    }

    /// Live view of the transaction.
    pub fn graph(&self) -> &'d dyn GraphAccess {
        self.diff.graph()
    }

    /// Whether this module has anything to look at.
    pub fn mutations_occurred(&self) -> bool {
        self.created_nodes().next().is_some()
            || self.deleted_nodes().next().is_some()
            || self.changed_nodes().next().is_some()
            || self.created_relationships().next().is_some()
            || self.deleted_relationships().next().is_some()
            || self.changed_relationships().next().is_some()
    }

    /// Visible created nodes.
    pub fn created_nodes(&self) -> impl Iterator<Item = NodeSnapshot<'d>> + 'd {
        let policies = self.policies;
        self.diff
            .created_nodes()
            .filter(move |n| policies.nodes.include(n))
    }

    /// Visible deleted nodes, as they were before.
    pub fn deleted_nodes(&self) -> impl Iterator<Item = NodeSnapshot<'d>> + 'd {
        let policies = self.policies;
        self.diff
            .deleted_nodes()
            .filter(move |n| policies.nodes.include(n))
    }

    /// Visible changed nodes.
    pub fn changed_nodes(&self) -> impl Iterator<Item = Change<NodeSnapshot<'d>>> + 'd {
        let this = *self;
        self.diff.changed_nodes().filter(move |change| {
            let nodes = &this.policies.nodes;
            (nodes.include(change.previous()) || nodes.include(change.current()))
                && this.has_visible_delta(EntityRef::Node(change.current().id()), change.current())
        })
    }

    /// Visible created relationships.
    pub fn created_relationships(&self) -> impl Iterator<Item = RelationshipSnapshot<'d>> + 'd {
        let policies = self.policies;
        self.diff
            .created_relationships()
            .filter(move |r| policies.relationships.include(r))
    }

    /// Visible deleted relationships, as they were before.
    pub fn deleted_relationships(&self) -> impl Iterator<Item = RelationshipSnapshot<'d>> + 'd {
        let policies = self.policies;
        self.diff
            .deleted_relationships()
            .filter(move |r| policies.relationships.include(r))
    }

    /// Visible changed relationships.
    pub fn changed_relationships(
        &self,
    ) -> impl Iterator<Item = Change<RelationshipSnapshot<'d>>> + 'd {
        let this = *self;
        self.diff.changed_relationships().filter(move |change| {
            let rels = &this.policies.relationships;
            (rels.include(change.previous()) || rels.include(change.current()))
                && this.has_visible_delta(change.current().entity(), change.current())
        })
    }

    /// Visible deleted relationships attached to `node` in `direction`.
    ///
    /// The relationship policy is evaluated from `node`'s point of view.
    pub fn deleted_relationships_of<'s>(
        &'s self,
        node: NodeId,
        direction: Direction,
        types: &'s [&'s str],
    ) -> impl Iterator<Item = RelationshipSnapshot<'s>> + 's {
        let policies = self.policies;
        self.diff
            .deleted_relationships_of(node, direction, types)
            .filter(move |r| policies.relationships.include_from(r, node))
    }

    /// Visible property deltas of a changed or deleted entity, by key.
    pub fn property_deltas(&self, entity: EntityRef) -> Vec<(&'d str, &'d PropertyDelta)> {
        let Some(changes) = self.diff.changes(entity) else {
            return Vec::new();
        };
        let side = if self.diff.is_deleted(entity) {
            Side::Previous
        } else {
            Side::Current
        };
        match entity {
            EntityRef::Node(id) => {
                let owner = NodeSnapshot::new(self.diff, id, side);
                visible(changes, |key| self.policies.node_properties.include(key, &owner))
            }
            EntityRef::Relationship(id) => match self.diff.relationship_snapshot(id, side) {
                Some(owner) => visible(changes, |key| {
                    self.policies.relationship_properties.include(key, &owner)
                }),
                None => Vec::new(),
            },
        }
    }

    /// Visible delta of one property.
    pub fn property_delta(&self, entity: EntityRef, key: &str) -> Option<&'d PropertyDelta> {
        self.property_deltas(entity)
            .into_iter()
            .find(|(k, _)| *k == key)
            .map(|(_, delta)| delta)
    }

    /// Visible properties of a node, e.g. either side of a change.
    pub fn node_properties(&self, node: &dyn EntityView) -> Properties {
        filter_properties(node, |key| self.policies.node_properties.include(key, node))
    }

    /// Visible properties of a relationship.
    pub fn relationship_properties(&self, rel: &dyn EntityView) -> Properties {
        filter_properties(rel, |key| {
            self.policies.relationship_properties.include(key, rel)
        })
    }

    fn has_visible_delta(&self, entity: EntityRef, owner: &dyn EntityView) -> bool {
        let Some(changes) = self.diff.changes(entity) else {
            return false;
        };
        if !changes.assigned_labels().is_empty() || !changes.removed_labels().is_empty() {
            return true;
        }
        let policy = match entity {
            EntityRef::Node(_) => &self.policies.node_properties,
            EntityRef::Relationship(_) => &self.policies.relationship_properties,
        };
        changes
            .properties()
            .keys()
            .any(|key| policy.include(key, owner))
    }
}

fn visible<'d>(
    changes: &'d EntityChanges,
    include: impl Fn(&str) -> bool,
) -> Vec<(&'d str, &'d PropertyDelta)> {
    changes
        .properties()
        .iter()
        .filter(|(key, _)| include(key))
        .map(|(key, delta)| (key.as_str(), delta))
        .collect()
}

fn filter_properties(view: &dyn EntityView, include: impl Fn(&str) -> bool) -> Properties {
    view.property_keys()
        .into_iter()
        .filter(|key| include(key))
        .filter_map(|key| {
            let value = view.property(&key)?;
            Some((key, value))
        })
        .collect()
}
