use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Result, RuntimeError};
use crate::host::{
    CommitHook, GraphAccess, GraphTransaction, HookState, NodeRecord, RelationshipHeader,
    RelationshipRecord, Savepoint, TransactionalGraph,
};
use crate::tx::{AssignedProperty, LabelEvent, RawMutationLog, RemovedProperty};
use crate::types::{EntityRef, NodeId, PropValue, Properties, RelId};

#[derive(Default)]
struct Store {
    nodes: BTreeMap<NodeId, NodeRecord>,
    rels: BTreeMap<RelId, RelationshipRecord>,
}

/// In-memory graph host.
///
/// Committed state sits behind one `RwLock`; each transaction writes into a
/// private overlay that is applied atomically on commit. Commits are
/// serialized, and commit hooks run on the committing thread before the
/// overlay is applied, so a hook that blocks on another commit deadlocks
/// until its own timeout.
pub struct MemoryGraph {
    store: RwLock<Store>,
    hooks: RwLock<Vec<Arc<dyn CommitHook>>>,
    commit_lock: Mutex<()>,
    next_node: AtomicU64,
    next_rel: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self {
            store: RwLock::new(Store::default()),
            hooks: RwLock::new(Vec::new()),
            commit_lock: Mutex::new(()),
            next_node: AtomicU64::new(0),
            next_rel: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    /// Opens a transaction with the concrete type.
    pub fn transaction(&self) -> MemoryTransaction<'_> {
        MemoryTransaction {
            graph: self,
            overlay: Mutex::new(Overlay::default()),
        }
    }

    /// Runs `f` in a fresh transaction and commits it when `f` succeeds.
    pub fn write<T>(&self, f: impl FnOnce(&MemoryTransaction<'_>) -> Result<T>) -> Result<T> {
        let tx = self.transaction();
        match f(&tx) {
            Ok(value) => {
                tx.commit_inner()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback_inner();
                Err(err)
            }
        }
    }

    /// Committed state of a node.
    pub fn node(&self, id: NodeId) -> Option<NodeRecord> {
        self.store.read().nodes.get(&id).cloned()
    }

    /// Committed state of a relationship.
    pub fn relationship(&self, id: RelId) -> Option<RelationshipRecord> {
        self.store.read().rels.get(&id).cloned()
    }

    /// Number of committed nodes.
    pub fn node_count(&self) -> usize {
        self.store.read().nodes.len()
    }

    /// Number of committed relationships.
    pub fn relationship_count(&self) -> usize {
        self.store.read().rels.len()
    }

    /// Committed nodes, ascending by id.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.store.read().nodes.values().cloned().collect()
    }

    /// Number of successful commits so far.
    pub fn committed_transactions(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Number of rollbacks, including hook vetoes.
    pub fn rolled_back_transactions(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    fn hooks(&self) -> Vec<Arc<dyn CommitHook>> {
        self.hooks.read().clone()
    }
}

impl TransactionalGraph for MemoryGraph {
    fn begin(&self) -> Result<Box<dyn GraphTransaction + '_>> {
        Ok(Box::new(self.transaction()))
    }

    fn register_commit_hook(&self, hook: Arc<dyn CommitHook>) {
        self.hooks.write().push(hook);
    }
}

#[derive(Clone)]
enum Slot<R> {
    Live(R),
    Deleted(R),
}

enum Undo {
    Node(NodeId, Option<Slot<NodeRecord>>),
    Rel(RelId, Option<Slot<RelationshipRecord>>),
    CreatedNode(NodeId),
    CreatedRel(RelId),
}

#[derive(Default)]
struct Overlay {
    nodes: BTreeMap<NodeId, Slot<NodeRecord>>,
    rels: BTreeMap<RelId, Slot<RelationshipRecord>>,
    created_nodes: BTreeSet<NodeId>,
    created_rels: BTreeSet<RelId>,
    undo: Vec<Undo>,
}

impl Overlay {
    fn node(&self, store: &Store, id: NodeId) -> Option<NodeRecord> {
        match self.nodes.get(&id) {
            Some(Slot::Live(rec)) => Some(rec.clone()),
            Some(Slot::Deleted(_)) => None,
            None => store.nodes.get(&id).cloned(),
        }
    }

    fn rel(&self, store: &Store, id: RelId) -> Option<RelationshipRecord> {
        match self.rels.get(&id) {
            Some(Slot::Live(rec)) => Some(rec.clone()),
            Some(Slot::Deleted(_)) => None,
            None => store.rels.get(&id).cloned(),
        }
    }

    fn put_node(&mut self, id: NodeId, slot: Slot<NodeRecord>) {
        let old = self.nodes.insert(id, slot);
        self.undo.push(Undo::Node(id, old));
    }

    fn put_rel(&mut self, id: RelId, slot: Slot<RelationshipRecord>) {
        let old = self.rels.insert(id, slot);
        self.undo.push(Undo::Rel(id, old));
    }

    fn rels_of(&self, store: &Store, node: NodeId) -> Vec<RelId> {
        let touches = |r: &RelationshipRecord| r.start == node || r.end == node;
        let mut ids: BTreeSet<RelId> = store
            .rels
            .values()
            .filter(|r| touches(r) && !self.rels.contains_key(&r.id))
            .map(|r| r.id)
            .collect();
        for (id, slot) in &self.rels {
            if let Slot::Live(rec) = slot {
                if touches(rec) {
                    ids.insert(*id);
                }
            }
        }
        ids.into_iter().collect()
    }

    fn undo_to(&mut self, mark: usize) {
        while self.undo.len() > mark {
            let Some(step) = self.undo.pop() else { break };
            match step {
                Undo::Node(id, Some(slot)) => {
                    self.nodes.insert(id, slot);
                }
                Undo::Node(id, None) => {
                    self.nodes.remove(&id);
                }
                Undo::Rel(id, Some(slot)) => {
                    self.rels.insert(id, slot);
                }
                Undo::Rel(id, None) => {
                    self.rels.remove(&id);
                }
                Undo::CreatedNode(id) => {
                    self.created_nodes.remove(&id);
                }
                Undo::CreatedRel(id) => {
                    self.created_rels.remove(&id);
                }
            }
        }
    }

    /// Builds the literal commit-time log by comparing against committed state.
    fn mutation_log(&self, store: &Store) -> RawMutationLog {
        let mut log = RawMutationLog {
            created_nodes: self.created_nodes.iter().copied().collect(),
            created_relationships: self.created_rels.iter().copied().collect(),
            ..RawMutationLog::default()
        };
        let empty = Properties::new();
        let no_labels = BTreeSet::new();
        let mut seq = 0;
        for (id, slot) in &self.nodes {
            let committed = store.nodes.get(id);
            match slot {
                Slot::Deleted(last) => {
                    log.deleted_nodes.push(committed.unwrap_or(last).clone());
                }
                Slot::Live(current) => {
                    let before = committed.map_or(&empty, |c| &c.properties);
                    let (assigned, removed) =
                        property_events(*id, before, &current.properties, &mut seq);
                    log.assigned_node_properties.extend(assigned);
                    log.removed_node_properties.extend(removed);
                    let labels_before = committed.map_or(&no_labels, |c| &c.labels);
                    for label in current.labels.difference(labels_before) {
                        log.assigned_labels.push(LabelEvent {
                            node: *id,
                            label: label.clone(),
                        });
                    }
                    for label in labels_before.difference(&current.labels) {
                        log.removed_labels.push(LabelEvent {
                            node: *id,
                            label: label.clone(),
                        });
                    }
                }
            }
        }
        for (id, slot) in &self.rels {
            let committed = store.rels.get(id);
            match slot {
                Slot::Deleted(last) => {
                    log.deleted_relationships
                        .push(committed.unwrap_or(last).clone());
                }
                Slot::Live(current) => {
                    let before = committed.map_or(&empty, |c| &c.properties);
                    let (assigned, removed) =
                        property_events(*id, before, &current.properties, &mut seq);
                    log.assigned_relationship_properties.extend(assigned);
                    log.removed_relationship_properties.extend(removed);
                }
            }
        }
        log
    }

    fn apply(self, store: &mut Store) {
        for (id, slot) in self.nodes {
            match slot {
                Slot::Live(rec) => {
                    store.nodes.insert(id, rec);
                }
                Slot::Deleted(_) => {
                    store.nodes.remove(&id);
                }
            }
        }
        for (id, slot) in self.rels {
            match slot {
                Slot::Live(rec) => {
                    store.rels.insert(id, rec);
                }
                Slot::Deleted(_) => {
                    store.rels.remove(&id);
                }
            }
        }
    }
}

fn property_events<I: Copy>(
    entity: I,
    before: &Properties,
    after: &Properties,
    seq: &mut u64,
) -> (Vec<AssignedProperty<I>>, Vec<RemovedProperty<I>>) {
    let mut assigned = Vec::new();
    let mut removed = Vec::new();
    for (key, value) in after {
        let previous = before.get(key);
        if previous != Some(value) {
            assigned.push(AssignedProperty {
                entity,
                key: key.clone(),
                previous: previous.cloned(),
                value: value.clone(),
                seq: *seq,
            });
            *seq += 1;
        }
    }
    for (key, previous) in before {
        if !after.contains_key(key) {
            removed.push(RemovedProperty {
                entity,
                key: key.clone(),
                previous: previous.clone(),
                seq: *seq,
            });
            *seq += 1;
        }
    }
    (assigned, removed)
}

/// Open transaction on a [`MemoryGraph`].
pub struct MemoryTransaction<'g> {
    graph: &'g MemoryGraph,
    overlay: Mutex<Overlay>,
}

impl MemoryTransaction<'_> {
    fn read_node<R>(&self, id: NodeId, f: impl FnOnce(&NodeRecord) -> R) -> Option<R> {
        let overlay = self.overlay.lock();
        match overlay.nodes.get(&id) {
            Some(Slot::Live(rec)) => Some(f(rec)),
            Some(Slot::Deleted(_)) => None,
            None => self.graph.store.read().nodes.get(&id).map(f),
        }
    }

    fn read_rel<R>(&self, id: RelId, f: impl FnOnce(&RelationshipRecord) -> R) -> Option<R> {
        let overlay = self.overlay.lock();
        match overlay.rels.get(&id) {
            Some(Slot::Live(rec)) => Some(f(rec)),
            Some(Slot::Deleted(_)) => None,
            None => self.graph.store.read().rels.get(&id).map(f),
        }
    }

    fn modify_node<R>(&self, id: NodeId, f: impl FnOnce(&mut NodeRecord) -> R) -> Result<R> {
        let mut overlay = self.overlay.lock();
        let store = self.graph.store.read();
        let mut rec = overlay
            .node(&store, id)
            .ok_or(RuntimeError::NotFound(EntityRef::Node(id)))?;
        drop(store);
        let out = f(&mut rec);
        overlay.put_node(id, Slot::Live(rec));
        Ok(out)
    }

    fn modify_rel<R>(
        &self,
        id: RelId,
        f: impl FnOnce(&mut RelationshipRecord) -> R,
    ) -> Result<R> {
        let mut overlay = self.overlay.lock();
        let store = self.graph.store.read();
        let mut rec = overlay
            .rel(&store, id)
            .ok_or(RuntimeError::NotFound(EntityRef::Relationship(id)))?;
        drop(store);
        let out = f(&mut rec);
        overlay.put_rel(id, Slot::Live(rec));
        Ok(out)
    }

    fn modify_properties<R>(
        &self,
        entity: EntityRef,
        f: impl FnOnce(&mut Properties) -> R,
    ) -> Result<R> {
        match entity {
            EntityRef::Node(id) => self.modify_node(id, |n| f(&mut n.properties)),
            EntityRef::Relationship(id) => self.modify_rel(id, |r| f(&mut r.properties)),
        }
    }

    fn commit_inner(self) -> Result<()> {
        let graph = self.graph;
        let _serial = graph.commit_lock.lock();
        let log = {
            let overlay = self.overlay.lock();
            let store = graph.store.read();
            overlay.mutation_log(&store)
        };

        let hooks = graph.hooks();
        let mut states: Vec<(Arc<dyn CommitHook>, HookState)> = Vec::with_capacity(hooks.len());
        for hook in hooks {
            match hook.before_commit(&log, &self) {
                Ok(state) => states.push((hook, state)),
                Err(err) => {
                    warn!(error = %err, "memory_graph.commit.vetoed");
                    for (hook, state) in states {
                        hook.after_rollback(state);
                    }
                    graph.rollbacks.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
            }
        }

        let overlay = std::mem::take(&mut *self.overlay.lock());
        overlay.apply(&mut graph.store.write());
        let seq = graph.commits.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(seq, events = log.len(), "memory_graph.commit");
        for (hook, state) in states {
            hook.after_commit(state);
        }
        Ok(())
    }

    fn rollback_inner(self) {
        self.graph.rollbacks.fetch_add(1, Ordering::Relaxed);
    }
}

impl GraphAccess for MemoryTransaction<'_> {
    fn node(&self, id: NodeId) -> Option<NodeRecord> {
        self.read_node(id, NodeRecord::clone)
    }

    fn relationship(&self, id: RelId) -> Option<RelationshipRecord> {
        self.read_rel(id, RelationshipRecord::clone)
    }

    fn node_ids(&self) -> Vec<NodeId> {
        let overlay = self.overlay.lock();
        let store = self.graph.store.read();
        let mut ids: BTreeSet<NodeId> = store
            .nodes
            .keys()
            .filter(|id| !overlay.nodes.contains_key(id))
            .copied()
            .collect();
        for (id, slot) in &overlay.nodes {
            if matches!(slot, Slot::Live(_)) {
                ids.insert(*id);
            }
        }
        ids.into_iter().collect()
    }

    fn relationships_of(&self, node: NodeId) -> Vec<RelId> {
        let overlay = self.overlay.lock();
        let store = self.graph.store.read();
        overlay.rels_of(&store, node)
    }

    fn create_node(&self, labels: &[&str], properties: Properties) -> Result<NodeId> {
        let id = NodeId(self.graph.next_node.fetch_add(1, Ordering::Relaxed));
        let rec = NodeRecord {
            id,
            labels: labels.iter().map(|l| (*l).to_owned()).collect(),
            properties,
        };
        let mut overlay = self.overlay.lock();
        overlay.put_node(id, Slot::Live(rec));
        overlay.created_nodes.insert(id);
        overlay.undo.push(Undo::CreatedNode(id));
        Ok(id)
    }

    fn create_relationship(
        &self,
        start: NodeId,
        end: NodeId,
        rel_type: &str,
        properties: Properties,
    ) -> Result<RelId> {
        let mut overlay = self.overlay.lock();
        {
            let store = self.graph.store.read();
            for endpoint in [start, end] {
                if overlay.node(&store, endpoint).is_none() {
                    return Err(RuntimeError::NotFound(EntityRef::Node(endpoint)));
                }
            }
        }
        let id = RelId(self.graph.next_rel.fetch_add(1, Ordering::Relaxed));
        let rec = RelationshipRecord {
            id,
            rel_type: rel_type.to_owned(),
            start,
            end,
            properties,
        };
        overlay.put_rel(id, Slot::Live(rec));
        overlay.created_rels.insert(id);
        overlay.undo.push(Undo::CreatedRel(id));
        Ok(id)
    }

    fn delete_node(&self, id: NodeId) -> Result<()> {
        let mut overlay = self.overlay.lock();
        let store = self.graph.store.read();
        let rec = overlay
            .node(&store, id)
            .ok_or(RuntimeError::NotFound(EntityRef::Node(id)))?;
        let attached = overlay.rels_of(&store, id);
        drop(store);
        if !attached.is_empty() {
            return Err(RuntimeError::InvalidState(format!(
                "{id} still has {} relationship(s)",
                attached.len()
            )));
        }
        overlay.put_node(id, Slot::Deleted(rec));
        Ok(())
    }

    fn delete_relationship(&self, id: RelId) -> Result<()> {
        let mut overlay = self.overlay.lock();
        let store = self.graph.store.read();
        let rec = overlay
            .rel(&store, id)
            .ok_or(RuntimeError::NotFound(EntityRef::Relationship(id)))?;
        drop(store);
        overlay.put_rel(id, Slot::Deleted(rec));
        Ok(())
    }

    fn set_property(
        &self,
        entity: EntityRef,
        key: &str,
        value: PropValue,
    ) -> Result<Option<PropValue>> {
        self.modify_properties(entity, |props| props.insert(key.to_owned(), value))
    }

    fn remove_property(&self, entity: EntityRef, key: &str) -> Result<Option<PropValue>> {
        self.modify_properties(entity, |props| props.remove(key))
    }

    fn add_label(&self, id: NodeId, label: &str) -> Result<bool> {
        self.modify_node(id, |n| n.labels.insert(label.to_owned()))
    }

    fn remove_label(&self, id: NodeId, label: &str) -> Result<bool> {
        self.modify_node(id, |n| n.labels.remove(label))
    }

    fn property(&self, entity: EntityRef, key: &str) -> Option<PropValue> {
        match entity {
            EntityRef::Node(id) => self.read_node(id, |n| n.properties.get(key).cloned())?,
            EntityRef::Relationship(id) => self.read_rel(id, |r| r.properties.get(key).cloned())?,
        }
    }

    fn property_keys(&self, entity: EntityRef) -> BTreeSet<String> {
        let keys = |p: &Properties| p.keys().cloned().collect();
        match entity {
            EntityRef::Node(id) => self.read_node(id, |n| keys(&n.properties)),
            EntityRef::Relationship(id) => self.read_rel(id, |r| keys(&r.properties)),
        }
        .unwrap_or_default()
    }

    fn relationship_header(&self, id: RelId) -> Option<RelationshipHeader> {
        self.read_rel(id, RelationshipRecord::header)
    }

    fn labels(&self, id: NodeId) -> BTreeSet<String> {
        self.read_node(id, |n| n.labels.clone()).unwrap_or_default()
    }

    fn exists(&self, entity: EntityRef) -> bool {
        match entity {
            EntityRef::Node(id) => self.read_node(id, |_| ()).is_some(),
            EntityRef::Relationship(id) => self.read_rel(id, |_| ()).is_some(),
        }
    }
}

impl GraphTransaction for MemoryTransaction<'_> {
    fn savepoint(&self) -> Savepoint {
        Savepoint(self.overlay.lock().undo.len() as u64)
    }

    fn rollback_to(&self, savepoint: Savepoint) -> Result<()> {
        let mut overlay = self.overlay.lock();
        let mark = usize::try_from(savepoint.0)
            .map_err(|_| RuntimeError::InvalidState("savepoint out of range".into()))?;
        if mark > overlay.undo.len() {
            return Err(RuntimeError::InvalidState(format!(
                "savepoint {} is newer than the transaction",
                savepoint.0
            )));
        }
        overlay.undo_to(mark);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        (*self).commit_inner()
    }

    fn rollback(self: Box<Self>) {
        (*self).rollback_inner()
    }

    fn as_access(&self) -> &dyn GraphAccess {
        self
    }
}
