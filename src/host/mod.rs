//! Interface to the host graph engine.
//!
//! The runtime never owns storage. It consumes entity CRUD, transaction
//! boundaries and a commit-hook callback through the traits below, and
//! ships [`MemoryGraph`] as an in-memory reference host for embedders that
//! have no engine of their own and for tests.

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;
use crate::tx::RawMutationLog;
use crate::types::{
    EntityRef, EntityView, NodeId, NodeView, PropValue, Properties, RelId, RelationshipView,
};

mod memory;

pub use memory::{MemoryGraph, MemoryTransaction};

/// Owned copy of a node as stored by the host.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRecord {
    /// Node identifier.
    pub id: NodeId,
    /// Node labels.
    pub labels: BTreeSet<String>,
    /// Node properties.
    pub properties: Properties,
}

/// Owned copy of a relationship as stored by the host.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationshipRecord {
    /// Relationship identifier.
    pub id: RelId,
    /// Relationship type.
    pub rel_type: String,
    /// Start node.
    pub start: NodeId,
    /// End node.
    pub end: NodeId,
    /// Relationship properties.
    pub properties: Properties,
}

/// Type and endpoints of a relationship, without its properties.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationshipHeader {
    /// Relationship identifier.
    pub id: RelId,
    /// Relationship type.
    pub rel_type: String,
    /// Start node.
    pub start: NodeId,
    /// End node.
    pub end: NodeId,
}

impl RelationshipRecord {
    /// Type and endpoints of this relationship.
    pub fn header(&self) -> RelationshipHeader {
        RelationshipHeader {
            id: self.id,
            rel_type: self.rel_type.clone(),
            start: self.start,
            end: self.end,
        }
    }
}

impl EntityView for NodeRecord {
    fn entity(&self) -> EntityRef {
        EntityRef::Node(self.id)
    }

    fn property(&self, key: &str) -> Option<PropValue> {
        self.properties.get(key).cloned()
    }

    fn property_keys(&self) -> BTreeSet<String> {
        self.properties.keys().cloned().collect()
    }
}

impl NodeView for NodeRecord {
    fn id(&self) -> NodeId {
        self.id
    }

    fn labels(&self) -> BTreeSet<String> {
        self.labels.clone()
    }

    fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

impl EntityView for RelationshipRecord {
    fn entity(&self) -> EntityRef {
        EntityRef::Relationship(self.id)
    }

    fn property(&self, key: &str) -> Option<PropValue> {
        self.properties.get(key).cloned()
    }

    fn property_keys(&self) -> BTreeSet<String> {
        self.properties.keys().cloned().collect()
    }
}

impl RelationshipView for RelationshipRecord {
    fn id(&self) -> RelId {
        self.id
    }

    fn rel_type(&self) -> &str {
        &self.rel_type
    }

    fn start(&self) -> NodeId {
        self.start
    }

    fn end(&self) -> NodeId {
        self.end
    }
}

/// Read and write access to the graph inside one open transaction.
///
/// All methods take `&self`; hosts use interior mutability so that commit
/// hooks, snapshots and modules can share one handle.
pub trait GraphAccess: Send + Sync {
    /// Current state of a node, if it exists.
    fn node(&self, id: NodeId) -> Option<NodeRecord>;

    /// Current state of a relationship, if it exists.
    fn relationship(&self, id: RelId) -> Option<RelationshipRecord>;

    /// Ids of every live node, ascending.
    fn node_ids(&self) -> Vec<NodeId>;

    /// Ids of every live relationship touching `node`, ascending.
    fn relationships_of(&self, node: NodeId) -> Vec<RelId>;

    /// Creates a node.
    fn create_node(&self, labels: &[&str], properties: Properties) -> Result<NodeId>;

    /// Creates a relationship between two existing nodes.
    fn create_relationship(
        &self,
        start: NodeId,
        end: NodeId,
        rel_type: &str,
        properties: Properties,
    ) -> Result<RelId>;

    /// Deletes a node. Hosts reject nodes that still have relationships.
    fn delete_node(&self, id: NodeId) -> Result<()>;

    /// Deletes a relationship.
    fn delete_relationship(&self, id: RelId) -> Result<()>;

    /// Sets a property, returning the previous value.
    fn set_property(&self, entity: EntityRef, key: &str, value: PropValue)
        -> Result<Option<PropValue>>;

    /// Removes a property, returning the removed value.
    fn remove_property(&self, entity: EntityRef, key: &str) -> Result<Option<PropValue>>;

    /// Adds a label to a node. Returns `false` when it was already present.
    fn add_label(&self, id: NodeId, label: &str) -> Result<bool>;

    /// Removes a label from a node. Returns `false` when it was absent.
    fn remove_label(&self, id: NodeId, label: &str) -> Result<bool>;

    /// Current value of a single property.
    fn property(&self, entity: EntityRef, key: &str) -> Option<PropValue> {
        match entity {
            EntityRef::Node(id) => self.node(id)?.properties.remove(key),
            EntityRef::Relationship(id) => self.relationship(id)?.properties.remove(key),
        }
    }

    /// Current property keys of an entity; empty if it does not exist.
    fn property_keys(&self, entity: EntityRef) -> BTreeSet<String> {
        let props = match entity {
            EntityRef::Node(id) => self.node(id).map(|n| n.properties),
            EntityRef::Relationship(id) => self.relationship(id).map(|r| r.properties),
        };
        props.map(|p| p.into_keys().collect()).unwrap_or_default()
    }

    /// Type and endpoints of a relationship, if it exists.
    fn relationship_header(&self, id: RelId) -> Option<RelationshipHeader> {
        self.relationship(id).map(|r| r.header())
    }

    /// Current labels of a node; empty if it does not exist.
    fn labels(&self, id: NodeId) -> BTreeSet<String> {
        self.node(id).map(|n| n.labels).unwrap_or_default()
    }

    /// Whether the entity currently exists.
    fn exists(&self, entity: EntityRef) -> bool {
        match entity {
            EntityRef::Node(id) => self.node(id).is_some(),
            EntityRef::Relationship(id) => self.relationship(id).is_some(),
        }
    }
}

/// Marker returned by [`GraphTransaction::savepoint`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Savepoint(pub u64);

/// An open host transaction.
pub trait GraphTransaction: GraphAccess {
    /// Marks the current state so later writes can be undone.
    fn savepoint(&self) -> Savepoint;

    /// Undoes every write made after `savepoint`.
    fn rollback_to(&self, savepoint: Savepoint) -> Result<()>;

    /// Runs commit hooks and makes the writes durable.
    ///
    /// Fails, leaving the graph unchanged, when a hook vetoes the commit.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discards every write.
    fn rollback(self: Box<Self>);

    /// Upcast used where only [`GraphAccess`] is needed.
    fn as_access(&self) -> &dyn GraphAccess;
}

/// Opaque per-hook state carried from `before_commit` to the after-callbacks.
pub type HookState = Box<dyn Any + Send>;

/// Callback invoked synchronously on the committing thread.
pub trait CommitHook: Send + Sync {
    /// Inspects the raw mutation log; may mutate through `tx`.
    ///
    /// An error vetoes the commit; the host then rolls back.
    fn before_commit(&self, log: &RawMutationLog, tx: &dyn GraphAccess) -> Result<HookState>;

    /// Called after a successful commit with the state from `before_commit`.
    fn after_commit(&self, state: HookState);

    /// Called when the transaction rolls back after `before_commit` succeeded.
    fn after_rollback(&self, state: HookState);
}

/// A graph engine able to open transactions and run commit hooks.
pub trait TransactionalGraph: Send + Sync {
    /// Opens a transaction.
    fn begin(&self) -> Result<Box<dyn GraphTransaction + '_>>;

    /// Registers a hook; hooks run in registration order.
    fn register_commit_hook(&self, hook: Arc<dyn CommitHook>);
}
