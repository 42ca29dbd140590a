use std::collections::BTreeSet;
use std::fmt;

use crate::error::Result;
use crate::host::RelationshipHeader;
use crate::tx::diff::TransactionDiff;
use crate::types::{EntityRef, EntityView, NodeId, NodeView, PropValue, RelId, RelationshipView};

/// Which side of a transaction a snapshot reads.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// State before the transaction, reconstructed from deltas.
    Previous,
    /// Live state inside the transaction.
    Current,
}

/// A node as seen from one side of a transaction.
///
/// Previous-side reads resolve in order: the captured record of a deleted
/// node, then the property's delta (absent if created, old value if deleted
/// or changed), then the live value.
#[derive(Clone)]
pub struct NodeSnapshot<'d> {
    diff: &'d TransactionDiff<'d>,
    id: NodeId,
    side: Side,
}

impl<'d> NodeSnapshot<'d> {
    pub(crate) fn new(diff: &'d TransactionDiff<'d>, id: NodeId, side: Side) -> Self {
        Self { diff, id, side }
    }

    /// Side this snapshot reads.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Whether the node was deleted in the transaction.
    pub fn is_deleted(&self) -> bool {
        self.diff.is_deleted(self.id.into())
    }

    /// Sets a property on the live node.
    ///
    /// Fails with `IllegalMutation` if the node was deleted in this transaction.
    pub fn set_property(&self, key: &str, value: PropValue) -> Result<Option<PropValue>> {
        self.diff.guard_mutation(self.entity())?;
        self.diff.graph().set_property(self.entity(), key, value)
    }

    /// Removes a property from the live node.
    ///
    /// Fails with `IllegalMutation` if the node was deleted in this transaction.
    pub fn remove_property(&self, key: &str) -> Result<Option<PropValue>> {
        self.diff.guard_mutation(self.entity())?;
        self.diff.graph().remove_property(self.entity(), key)
    }
}

impl EntityView for NodeSnapshot<'_> {
    fn entity(&self) -> EntityRef {
        EntityRef::Node(self.id)
    }

    fn property(&self, key: &str) -> Option<PropValue> {
        match self.side {
            Side::Previous => self.diff.previous_property(self.entity(), key),
            Side::Current => self.diff.graph().property(self.entity(), key),
        }
    }

    fn property_keys(&self) -> BTreeSet<String> {
        match self.side {
            Side::Previous => self.diff.previous_property_keys(self.entity()),
            Side::Current => self.diff.graph().property_keys(self.entity()),
        }
    }
}

impl NodeView for NodeSnapshot<'_> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn labels(&self) -> BTreeSet<String> {
        match self.side {
            Side::Previous => self.diff.previous_labels(self.id),
            Side::Current => self.diff.graph().labels(self.id),
        }
    }
}

impl fmt::Debug for NodeSnapshot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSnapshot")
            .field("id", &self.id)
            .field("side", &self.side)
            .finish()
    }
}

/// A relationship as seen from one side of a transaction.
///
/// Type and endpoints never change, so they are captured once; properties
/// resolve the same way as for [`NodeSnapshot`].
#[derive(Clone)]
pub struct RelationshipSnapshot<'d> {
    diff: &'d TransactionDiff<'d>,
    header: RelationshipHeader,
    side: Side,
}

impl<'d> RelationshipSnapshot<'d> {
    pub(crate) fn new(diff: &'d TransactionDiff<'d>, header: RelationshipHeader, side: Side) -> Self {
        Self { diff, header, side }
    }

    pub(crate) fn with_side(&self, side: Side) -> Self {
        Self {
            diff: self.diff,
            header: self.header.clone(),
            side,
        }
    }

    /// Side this snapshot reads.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Whether the relationship was deleted in the transaction.
    pub fn is_deleted(&self) -> bool {
        self.diff.is_deleted(self.entity())
    }

    /// Sets a property on the live relationship.
    ///
    /// Fails with `IllegalMutation` if it was deleted in this transaction.
    pub fn set_property(&self, key: &str, value: PropValue) -> Result<Option<PropValue>> {
        self.diff.guard_mutation(self.entity())?;
        self.diff.graph().set_property(self.entity(), key, value)
    }

    /// Removes a property from the live relationship.
    ///
    /// Fails with `IllegalMutation` if it was deleted in this transaction.
    pub fn remove_property(&self, key: &str) -> Result<Option<PropValue>> {
        self.diff.guard_mutation(self.entity())?;
        self.diff.graph().remove_property(self.entity(), key)
    }
}

impl EntityView for RelationshipSnapshot<'_> {
    fn entity(&self) -> EntityRef {
        EntityRef::Relationship(self.header.id)
    }

    fn property(&self, key: &str) -> Option<PropValue> {
        match self.side {
            Side::Previous => self.diff.previous_property(self.entity(), key),
            Side::Current => self.diff.graph().property(self.entity(), key),
        }
    }

    fn property_keys(&self) -> BTreeSet<String> {
        match self.side {
            Side::Previous => self.diff.previous_property_keys(self.entity()),
            Side::Current => self.diff.graph().property_keys(self.entity()),
        }
    }
}

impl RelationshipView for RelationshipSnapshot<'_> {
    fn id(&self) -> RelId {
        self.header.id
    }

    fn rel_type(&self) -> &str {
        &self.header.rel_type
    }

    fn start(&self) -> NodeId {
        self.header.start
    }

    fn end(&self) -> NodeId {
        self.header.end
    }
}

impl fmt::Debug for RelationshipSnapshot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationshipSnapshot")
            .field("header", &self.header)
            .field("side", &self.side)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::host::{GraphAccess, MemoryGraph};
    use crate::tx::RawMutationLog;
    use crate::types::{Direction, Properties};

    #[test]
    fn previous_side_reads_deltas_then_live() -> Result<()> {
        let graph = MemoryGraph::new();
        let id = graph.write(|tx| {
            let mut props = Properties::new();
            props.insert("kept".into(), PropValue::Int(1));
            props.insert("changed".into(), PropValue::Int(2));
            props.insert("removed".into(), PropValue::Int(3));
            tx.create_node(&[], props)
        })?;
        let tx = graph.transaction();
        tx.set_property(id.into(), "changed", PropValue::Int(20))?;
        tx.remove_property(id.into(), "removed")?;
        tx.set_property(id.into(), "added", PropValue::Int(4))?;
        let mut log = RawMutationLog::default();
        log.assign_node_property(id, "changed", Some(PropValue::Int(2)), 20)
            .remove_node_property(id, "removed", 3)
            .assign_node_property(id, "added", None, 4);

        let diff = TransactionDiff::build(&log, &tx)?;
        let change = diff.changed_node(id).ok_or(RuntimeError::NotFound(id.into()))?;
        let before = change.previous();
        assert_eq!(before.property("kept"), Some(PropValue::Int(1)));
        assert_eq!(before.property("changed"), Some(PropValue::Int(2)));
        assert_eq!(before.property("removed"), Some(PropValue::Int(3)));
        assert_eq!(before.property("added"), None);
        let keys: Vec<String> = before.property_keys().into_iter().collect();
        assert_eq!(keys, vec!["changed", "kept", "removed"]);
        assert_eq!(change.current().property("added"), Some(PropValue::Int(4)));
        Ok(())
    }

    #[test]
    fn deleted_snapshot_rejects_mutation() -> Result<()> {
        let graph = MemoryGraph::new();
        let id = graph.write(|tx| tx.create_node(&["Gone"], Properties::new()))?;
        let tx = graph.transaction();
        let record = tx.node(id).ok_or(RuntimeError::NotFound(id.into()))?;
        tx.delete_node(id)?;
        let log = RawMutationLog {
            deleted_nodes: vec![record],
            ..RawMutationLog::default()
        };
        let diff = TransactionDiff::build(&log, &tx)?;
        let deleted: Vec<_> = diff.deleted_nodes().collect();
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].has_label("Gone"));
        assert!(matches!(
            deleted[0].set_property("x", PropValue::Int(1)),
            Err(RuntimeError::IllegalMutation { .. })
        ));
        Ok(())
    }

    #[test]
    fn self_relationship_direction_is_both() -> Result<()> {
        let graph = MemoryGraph::new();
        let tx = graph.transaction();
        let n = tx.create_node(&[], Properties::new())?;
        let r = tx.create_relationship(n, n, "LOOPS", Properties::new())?;
        let log = RawMutationLog {
            created_nodes: vec![n],
            created_relationships: vec![r],
            ..RawMutationLog::default()
        };
        let diff = TransactionDiff::build(&log, &tx)?;
        let rel = diff
            .created_relationships()
            .next()
            .ok_or(RuntimeError::NotFound(r.into()))?;
        assert_eq!(rel.direction_from(n), Some(Direction::Both));
        assert_eq!(rel.other_node(n), Some(n));
        Ok(())
    }
}
