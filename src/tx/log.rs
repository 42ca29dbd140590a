//! Raw mutation log reported by the host at commit time.
//!
//! The log is literal: an entity created and deleted inside one transaction
//! shows up in both the created and the deleted lists, and a property that
//! was touched several times shows up once per touch. Property events carry
//! their position in the transaction so the assignment and removal lists can
//! be replayed in order. Collapsing those cases is the job of
//! [`TransactionDiff`](super::TransactionDiff).

use crate::host::{NodeRecord, RelationshipRecord};
use crate::types::{NodeId, PropValue, RelId};

/// A property assignment on entity `I`.
#[derive(Clone, Debug, PartialEq)]
pub struct AssignedProperty<I> {
    /// Entity the property belongs to.
    pub entity: I,
    /// Property key.
    pub key: String,
    /// Value held just before this assignment, if any.
    pub previous: Option<PropValue>,
    /// Value assigned in the transaction.
    pub value: PropValue,
    /// Position among the property events of the transaction.
    pub seq: u64,
}

/// A property removal on entity `I`.
#[derive(Clone, Debug, PartialEq)]
pub struct RemovedProperty<I> {
    /// Entity the property belonged to.
    pub entity: I,
    /// Property key.
    pub key: String,
    /// Value held just before this removal.
    pub previous: PropValue,
    /// Position among the property events of the transaction. Events with
    /// equal positions replay removals first.
    pub seq: u64,
}

/// A label added to or removed from a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelEvent {
    /// Node the label belongs to.
    pub node: NodeId,
    /// Label name.
    pub label: String,
}

/// Everything a transaction did, as reported by the host.
///
/// Deleted entities carry their final committed record so that the previous
/// side of a deleted entity can be read after it is gone.
#[derive(Clone, Debug, Default)]
pub struct RawMutationLog {
    /// Nodes created in the transaction.
    pub created_nodes: Vec<NodeId>,
    /// Nodes deleted in the transaction, with their last state.
    pub deleted_nodes: Vec<NodeRecord>,
    /// Relationships created in the transaction.
    pub created_relationships: Vec<RelId>,
    /// Relationships deleted in the transaction, with their last state.
    pub deleted_relationships: Vec<RelationshipRecord>,
    /// Node property assignments.
    pub assigned_node_properties: Vec<AssignedProperty<NodeId>>,
    /// Node property removals.
    pub removed_node_properties: Vec<RemovedProperty<NodeId>>,
    /// Relationship property assignments.
    pub assigned_relationship_properties: Vec<AssignedProperty<RelId>>,
    /// Relationship property removals.
    pub removed_relationship_properties: Vec<RemovedProperty<RelId>>,
    /// Labels added to nodes.
    pub assigned_labels: Vec<LabelEvent>,
    /// Labels removed from nodes.
    pub removed_labels: Vec<LabelEvent>,
}

impl RawMutationLog {
    /// Whether the host reported nothing at all.
    pub fn is_empty(&self) -> bool {
        self.created_nodes.is_empty()
            && self.deleted_nodes.is_empty()
            && self.created_relationships.is_empty()
            && self.deleted_relationships.is_empty()
            && self.assigned_node_properties.is_empty()
            && self.removed_node_properties.is_empty()
            && self.assigned_relationship_properties.is_empty()
            && self.removed_relationship_properties.is_empty()
            && self.assigned_labels.is_empty()
            && self.removed_labels.is_empty()
    }

    fn next_seq(&self) -> u64 {
        (self.assigned_node_properties.len()
            + self.removed_node_properties.len()
            + self.assigned_relationship_properties.len()
            + self.removed_relationship_properties.len()) as u64
    }

    /// Total number of raw events.
    pub fn len(&self) -> usize {
        self.created_nodes.len()
            + self.deleted_nodes.len()
            + self.created_relationships.len()
            + self.deleted_relationships.len()
            + self.assigned_node_properties.len()
            + self.removed_node_properties.len()
            + self.assigned_relationship_properties.len()
            + self.removed_relationship_properties.len()
            + self.assigned_labels.len()
            + self.removed_labels.len()
    }

    /// Records a node property assignment.
    pub fn assign_node_property(
        &mut self,
        node: NodeId,
        key: impl Into<String>,
        previous: Option<PropValue>,
        value: impl Into<PropValue>,
    ) -> &mut Self {
        let seq = self.next_seq();
        self.assigned_node_properties.push(AssignedProperty {
            entity: node,
            key: key.into(),
            previous,
            value: value.into(),
            seq,
        });
        self
    }

    /// Records a node property removal.
    pub fn remove_node_property(
        &mut self,
        node: NodeId,
        key: impl Into<String>,
        previous: impl Into<PropValue>,
    ) -> &mut Self {
        let seq = self.next_seq();
        self.removed_node_properties.push(RemovedProperty {
            entity: node,
            key: key.into(),
            previous: previous.into(),
            seq,
        });
        self
    }

    /// Records a relationship property assignment.
    pub fn assign_relationship_property(
        &mut self,
        rel: RelId,
        key: impl Into<String>,
        previous: Option<PropValue>,
        value: impl Into<PropValue>,
    ) -> &mut Self {
        let seq = self.next_seq();
        self.assigned_relationship_properties.push(AssignedProperty {
            entity: rel,
            key: key.into(),
            previous,
            value: value.into(),
            seq,
        });
        self
    }

    /// Records a relationship property removal.
    pub fn remove_relationship_property(
        &mut self,
        rel: RelId,
        key: impl Into<String>,
        previous: impl Into<PropValue>,
    ) -> &mut Self {
        let seq = self.next_seq();
        self.removed_relationship_properties.push(RemovedProperty {
            entity: rel,
            key: key.into(),
            previous: previous.into(),
            seq,
        });
        self
    }
}
