use std::collections::BTreeSet;

use super::{resolve_direction, Direction, EntityRef, NodeId, PropValue, RelId};

/// Read-only view of an entity's properties.
///
/// Implemented by host records and by transaction snapshots, so policies
/// and modules evaluate "before" and "after" states through one interface.
pub trait EntityView {
    /// Reference to the viewed entity.
    fn entity(&self) -> EntityRef;

    /// Value of a property in this view.
    fn property(&self, key: &str) -> Option<PropValue>;

    /// Property keys present in this view.
    fn property_keys(&self) -> BTreeSet<String>;

    /// Whether the property is present in this view.
    fn has_property(&self, key: &str) -> bool {
        self.property(key).is_some()
    }
}

/// Read-only view of a node.
pub trait NodeView: EntityView {
    /// Node identifier.
    fn id(&self) -> NodeId;

    /// Labels present in this view.
    fn labels(&self) -> BTreeSet<String>;

    /// Whether the label is present in this view.
    fn has_label(&self, label: &str) -> bool {
        self.labels().contains(label)
    }
}

/// Read-only view of a relationship.
pub trait RelationshipView: EntityView {
    /// Relationship identifier.
    fn id(&self) -> RelId;

    /// Relationship type.
    fn rel_type(&self) -> &str;

    /// Start node.
    fn start(&self) -> NodeId;

    /// End node.
    fn end(&self) -> NodeId;

    /// Direction relative to `viewpoint`, `None` if it is on neither end.
    fn direction_from(&self, viewpoint: NodeId) -> Option<Direction> {
        resolve_direction(self.start(), self.end(), viewpoint)
    }

    /// The node on the other end from `viewpoint`.
    ///
    /// For a self-relationship this is the viewpoint itself.
    fn other_node(&self, viewpoint: NodeId) -> Option<NodeId> {
        if self.start() == viewpoint {
            Some(self.end())
        } else if self.end() == viewpoint {
            Some(self.start())
        } else {
            None
        }
    }
}
