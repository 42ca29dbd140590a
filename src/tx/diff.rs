use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::error::{Result, RuntimeError};
use crate::host::{GraphAccess, NodeRecord, RelationshipRecord};
use crate::tx::change::{Change, PropertyDelta};
use crate::tx::log::{AssignedProperty, LabelEvent, RawMutationLog, RemovedProperty};
use crate::tx::snapshot::{NodeSnapshot, RelationshipSnapshot, Side};
use crate::types::{Direction, EntityRef, NodeId, PropValue, Properties, RelId, RelationshipView};

/// Property and label deltas of one changed or deleted entity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntityChanges {
    properties: BTreeMap<String, PropertyDelta>,
    assigned_labels: BTreeSet<String>,
    removed_labels: BTreeSet<String>,
}

impl EntityChanges {
    /// Property deltas keyed by property name.
    pub fn properties(&self) -> &BTreeMap<String, PropertyDelta> {
        &self.properties
    }

    /// Delta of a single key.
    pub fn property(&self, key: &str) -> Option<&PropertyDelta> {
        self.properties.get(key)
    }

    /// Labels added to a node.
    pub fn assigned_labels(&self) -> &BTreeSet<String> {
        &self.assigned_labels
    }

    /// Labels removed from a node.
    pub fn removed_labels(&self) -> &BTreeSet<String> {
        &self.removed_labels
    }

    /// Whether there is nothing left to report.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.assigned_labels.is_empty() && self.removed_labels.is_empty()
    }

    fn of_deleted(properties: &Properties, labels: Option<&BTreeSet<String>>) -> Self {
        Self {
            properties: properties
                .iter()
                .map(|(k, v)| (k.clone(), PropertyDelta::Deleted(v.clone())))
                .collect(),
            assigned_labels: BTreeSet::new(),
            removed_labels: labels.cloned().unwrap_or_default(),
        }
    }
}

struct Deleted<'a, R> {
    record: &'a R,
    changes: EntityChanges,
}

/// Everything one transaction did, reconstructed from the host's raw log.
///
/// Built once per commit inside the commit hook and dropped when the hook
/// returns. Created, deleted and changed sets are pairwise disjoint; an
/// entity created and deleted in the same transaction appears in none of
/// them. "Before" state of changed entities is never copied up front: a
/// [`Side::Previous`] snapshot resolves each read against the recorded
/// deltas and falls back to the live graph for untouched properties.
pub struct TransactionDiff<'a> {
    graph: &'a dyn GraphAccess,
    created_nodes: BTreeSet<NodeId>,
    deleted_nodes: BTreeMap<NodeId, Deleted<'a, NodeRecord>>,
    changed_nodes: BTreeMap<NodeId, EntityChanges>,
    created_rels: BTreeSet<RelId>,
    deleted_rels: BTreeMap<RelId, Deleted<'a, RelationshipRecord>>,
    changed_rels: BTreeMap<RelId, EntityChanges>,
}

impl<'a> TransactionDiff<'a> {
    /// Builds the diff of `log` against the transaction's live view `graph`.
    ///
    /// Fails with [`RuntimeError::InternalConsistency`] when the log does not
    /// describe a state the graph can be in: a delta for an entity that is
    /// neither created, deleted nor live, a deleted entity that still exists,
    /// a created entity that does not, or a deletion reported twice.
    pub fn build(log: &'a RawMutationLog, graph: &'a dyn GraphAccess) -> Result<Self> {
        let (created_nodes, deleted_nodes, transient_nodes) =
            split_lifecycle(&log.created_nodes, &log.deleted_nodes, |n| n.id)?;
        let (created_rels, deleted_rels, transient_rels) =
            split_lifecycle(&log.created_relationships, &log.deleted_relationships, |r| r.id)?;

        for id in &created_nodes {
            if !graph.exists((*id).into()) {
                return Err(inconsistent(format!("created {id} does not exist")));
            }
        }
        for id in deleted_nodes.keys() {
            if graph.exists((*id).into()) {
                return Err(inconsistent(format!("deleted {id} still exists")));
            }
        }
        for id in &created_rels {
            if !graph.exists((*id).into()) {
                return Err(inconsistent(format!("created {id} does not exist")));
            }
        }
        for id in deleted_rels.keys() {
            if graph.exists((*id).into()) {
                return Err(inconsistent(format!("deleted {id} still exists")));
            }
        }

        let skip_node = |id: NodeId| {
            created_nodes.contains(&id) || deleted_nodes.contains_key(&id) || transient_nodes.contains(&id)
        };
        let mut changed_nodes = property_changes(
            &log.assigned_node_properties,
            &log.removed_node_properties,
            skip_node,
        );
        label_changes(&mut changed_nodes, &log.assigned_labels, &log.removed_labels, skip_node);
        let skip_rel = |id: RelId| {
            created_rels.contains(&id) || deleted_rels.contains_key(&id) || transient_rels.contains(&id)
        };
        let mut changed_rels = property_changes(
            &log.assigned_relationship_properties,
            &log.removed_relationship_properties,
            skip_rel,
        );

        changed_nodes.retain(|_, c| !c.is_empty());
        changed_rels.retain(|_, c| !c.is_empty());
        for id in changed_nodes.keys() {
            if !graph.exists((*id).into()) {
                return Err(inconsistent(format!(
                    "delta references {id}, which was neither created, deleted nor live"
                )));
            }
        }
        for id in changed_rels.keys() {
            if !graph.exists((*id).into()) {
                return Err(inconsistent(format!(
                    "delta references {id}, which was neither created, deleted nor live"
                )));
            }
        }

        Ok(Self {
            graph,
            created_nodes,
            deleted_nodes: deleted_nodes
                .into_iter()
                .map(|(id, record)| {
                    let changes = EntityChanges::of_deleted(&record.properties, Some(&record.labels));
                    (id, Deleted { record, changes })
                })
                .collect(),
            changed_nodes,
            created_rels,
            deleted_rels: deleted_rels
                .into_iter()
                .map(|(id, record)| {
                    let changes = EntityChanges::of_deleted(&record.properties, None);
                    (id, Deleted { record, changes })
                })
                .collect(),
            changed_rels,
        })
    }

    /// Live view of the transaction the diff was built from.
    pub fn graph(&self) -> &'a dyn GraphAccess {
        self.graph
    }

    /// Whether anything at all changed.
    pub fn mutations_occurred(&self) -> bool {
        !(self.created_nodes.is_empty()
            && self.deleted_nodes.is_empty()
            && self.changed_nodes.is_empty()
            && self.created_rels.is_empty()
            && self.deleted_rels.is_empty()
            && self.changed_rels.is_empty())
    }

    /// Whether the entity is in the created set.
    pub fn is_created(&self, entity: EntityRef) -> bool {
        match entity {
            EntityRef::Node(id) => self.created_nodes.contains(&id),
            EntityRef::Relationship(id) => self.created_rels.contains(&id),
        }
    }

    /// Whether the entity is in the deleted set.
    pub fn is_deleted(&self, entity: EntityRef) -> bool {
        match entity {
            EntityRef::Node(id) => self.deleted_nodes.contains_key(&id),
            EntityRef::Relationship(id) => self.deleted_rels.contains_key(&id),
        }
    }

    /// Whether the entity is in the changed set.
    pub fn is_changed(&self, entity: EntityRef) -> bool {
        match entity {
            EntityRef::Node(id) => self.changed_nodes.contains_key(&id),
            EntityRef::Relationship(id) => self.changed_rels.contains_key(&id),
        }
    }

    /// Deltas of a changed or deleted entity.
    pub fn changes(&self, entity: EntityRef) -> Option<&EntityChanges> {
        match entity {
            EntityRef::Node(id) => self
                .changed_nodes
                .get(&id)
                .or_else(|| self.deleted_nodes.get(&id).map(|d| &d.changes)),
            EntityRef::Relationship(id) => self
                .changed_rels
                .get(&id)
                .or_else(|| self.deleted_rels.get(&id).map(|d| &d.changes)),
        }
    }

    /// Delta of a single property of a changed or deleted entity.
    pub fn property_delta(&self, entity: EntityRef, key: &str) -> Option<&PropertyDelta> {
        self.changes(entity)?.property(key)
    }

    /// Nodes created in the transaction.
    pub fn created_nodes(&self) -> impl Iterator<Item = NodeSnapshot<'_>> + '_ {
        self.created_nodes
            .iter()
            .map(move |id| NodeSnapshot::new(self, *id, Side::Current))
    }

    /// Nodes deleted in the transaction, as they were before.
    pub fn deleted_nodes(&self) -> impl Iterator<Item = NodeSnapshot<'_>> + '_ {
        self.deleted_nodes
            .keys()
            .map(move |id| NodeSnapshot::new(self, *id, Side::Previous))
    }

    /// Nodes changed in the transaction.
    pub fn changed_nodes(&self) -> impl Iterator<Item = Change<NodeSnapshot<'_>>> + '_ {
        self.changed_nodes.keys().map(move |id| self.node_change(*id))
    }

    /// Change of one node, if it is in the changed set.
    pub fn changed_node(&self, id: NodeId) -> Option<Change<NodeSnapshot<'_>>> {
        self.changed_nodes
            .contains_key(&id)
            .then(|| self.node_change(id))
    }

    /// Relationships created in the transaction.
    pub fn created_relationships(&self) -> impl Iterator<Item = RelationshipSnapshot<'_>> + '_ {
        self.created_rels
            .iter()
            .filter_map(move |id| self.relationship_snapshot(*id, Side::Current))
    }

    /// Relationships deleted in the transaction, as they were before.
    pub fn deleted_relationships(&self) -> impl Iterator<Item = RelationshipSnapshot<'_>> + '_ {
        self.deleted_rels
            .keys()
            .filter_map(move |id| self.relationship_snapshot(*id, Side::Previous))
    }

    /// Relationships changed in the transaction.
    pub fn changed_relationships(
        &self,
    ) -> impl Iterator<Item = Change<RelationshipSnapshot<'_>>> + '_ {
        self.changed_rels
            .keys()
            .filter_map(move |id| self.relationship_change(*id))
    }

    /// Change of one relationship, if it is in the changed set.
    pub fn changed_relationship(&self, id: RelId) -> Option<Change<RelationshipSnapshot<'_>>> {
        if !self.changed_rels.contains_key(&id) {
            return None;
        }
        self.relationship_change(id)
    }

    /// Deleted relationships attached to `node` in `direction`.
    ///
    /// `Both` matches either end; an empty `types` slice matches every type.
    pub fn deleted_relationships_of<'s>(
        &'s self,
        node: NodeId,
        direction: Direction,
        types: &'s [&'s str],
    ) -> impl Iterator<Item = RelationshipSnapshot<'s>> + 's {
        self.deleted_relationships().filter(move |rel| {
            let Some(resolved) = rel.direction_from(node) else {
                return false;
            };
            direction.matches(resolved)
                && (types.is_empty() || types.iter().any(|t| *t == rel.rel_type()))
        })
    }

    /// One human-readable line per created, deleted or changed entity.
    pub fn mutation_summaries(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for id in &self.created_nodes {
            let labels = self.graph.labels(*id);
            let props = self.graph.node(*id).map(|n| n.properties).unwrap_or_default();
            lines.push(format!("created {id}{} {}", fmt_labels(&labels), fmt_props(&props)));
        }
        for (id, deleted) in &self.deleted_nodes {
            lines.push(format!(
                "deleted {id}{} {}",
                fmt_labels(&deleted.record.labels),
                fmt_props(&deleted.record.properties)
            ));
        }
        for (id, changes) in &self.changed_nodes {
            lines.push(format!("changed {id}: {}", fmt_changes(changes)));
        }
        for id in &self.created_rels {
            if let Some(rel) = self.graph.relationship(*id) {
                lines.push(format!(
                    "created {id} ({})-[:{}]->({}) {}",
                    rel.start.0,
                    rel.rel_type,
                    rel.end.0,
                    fmt_props(&rel.properties)
                ));
            }
        }
        for (id, deleted) in &self.deleted_rels {
            let rel = deleted.record;
            lines.push(format!(
                "deleted {id} ({})-[:{}]->({}) {}",
                rel.start.0,
                rel.rel_type,
                rel.end.0,
                fmt_props(&rel.properties)
            ));
        }
        for (id, changes) in &self.changed_rels {
            lines.push(format!("changed {id}: {}", fmt_changes(changes)));
        }
        lines
    }

    fn node_change(&self, id: NodeId) -> Change<NodeSnapshot<'_>> {
        Change::new(
            NodeSnapshot::new(self, id, Side::Previous),
            NodeSnapshot::new(self, id, Side::Current),
        )
    }

    fn relationship_change(&self, id: RelId) -> Option<Change<RelationshipSnapshot<'_>>> {
        let current = self.relationship_snapshot(id, Side::Current)?;
        let previous = current.with_side(Side::Previous);
        Some(Change::new(previous, current))
    }

    pub(crate) fn relationship_snapshot(&self, id: RelId, side: Side) -> Option<RelationshipSnapshot<'_>> {
        let header = match self.deleted_rels.get(&id) {
            Some(deleted) => deleted.record.header(),
            None => self.graph.relationship_header(id)?,
        };
        Some(RelationshipSnapshot::new(self, header, side))
    }

    /// Value of `key` before the transaction.
    pub(crate) fn previous_property(&self, entity: EntityRef, key: &str) -> Option<PropValue> {
        if let Some(props) = self.deleted_properties(entity) {
            return props.get(key).cloned();
        }
        match self.property_delta(entity, key) {
            Some(delta) => delta.previous().cloned(),
            None => self.graph.property(entity, key),
        }
    }

    /// Property keys before the transaction.
    pub(crate) fn previous_property_keys(&self, entity: EntityRef) -> BTreeSet<String> {
        if let Some(props) = self.deleted_properties(entity) {
            return props.keys().cloned().collect();
        }
        let mut keys = self.graph.property_keys(entity);
        if let Some(changes) = self.changes(entity) {
            for (key, delta) in &changes.properties {
                match delta {
                    PropertyDelta::Created(_) => {
                        keys.remove(key);
                    }
                    PropertyDelta::Deleted(_) => {
                        keys.insert(key.clone());
                    }
                    PropertyDelta::Changed { .. } => {}
                }
            }
        }
        keys
    }

    /// Node labels before the transaction.
    pub(crate) fn previous_labels(&self, id: NodeId) -> BTreeSet<String> {
        if let Some(deleted) = self.deleted_nodes.get(&id) {
            return deleted.record.labels.clone();
        }
        let mut labels = self.graph.labels(id);
        if let Some(changes) = self.changed_nodes.get(&id) {
            for label in &changes.assigned_labels {
                labels.remove(label);
            }
            labels.extend(changes.removed_labels.iter().cloned());
        }
        labels
    }

    /// Rejects writes to entities deleted in this transaction.
    pub(crate) fn guard_mutation(&self, entity: EntityRef) -> Result<()> {
        if self.is_deleted(entity) {
            return Err(RuntimeError::IllegalMutation { entity });
        }
        Ok(())
    }

    fn deleted_properties(&self, entity: EntityRef) -> Option<&Properties> {
        match entity {
            EntityRef::Node(id) => self.deleted_nodes.get(&id).map(|d| &d.record.properties),
            EntityRef::Relationship(id) => self.deleted_rels.get(&id).map(|d| &d.record.properties),
        }
    }
}

fn inconsistent(message: String) -> RuntimeError {
    RuntimeError::InternalConsistency(message)
}

type Lifecycle<'a, I, R> = (BTreeSet<I>, BTreeMap<I, &'a R>, BTreeSet<I>);

/// Splits raw created/deleted lists into net created, net deleted and
/// transient (created and deleted in the same transaction) ids.
fn split_lifecycle<'a, I, R>(
    created: &[I],
    deleted: &'a [R],
    id_of: impl Fn(&R) -> I,
) -> Result<Lifecycle<'a, I, R>>
where
    I: Copy + Ord + std::fmt::Display,
{
    let mut created: BTreeSet<I> = created.iter().copied().collect();
    let mut deleted_map = BTreeMap::new();
    let mut transient = BTreeSet::new();
    for record in deleted {
        let id = id_of(record);
        if deleted_map.contains_key(&id) || transient.contains(&id) {
            return Err(inconsistent(format!("{id} reported deleted twice")));
        }
        if created.remove(&id) {
            transient.insert(id);
        } else {
            deleted_map.insert(id, record);
        }
    }
    Ok((created, deleted_map, transient))
}

/// One property touch, normalised so both event lists can be replayed together.
struct PropertyTouch<'a, I> {
    seq: u64,
    entity: I,
    key: &'a str,
    before: Option<&'a PropValue>,
    after: Option<&'a PropValue>,
}

fn property_changes<I>(
    assigned: &[AssignedProperty<I>],
    removed: &[RemovedProperty<I>],
    skip: impl Fn(I) -> bool,
) -> BTreeMap<I, EntityChanges>
where
    I: Copy + Ord,
{
    // removals are chained first so that ties on `seq` replay them first
    let mut touches: Vec<PropertyTouch<'_, I>> = removed
        .iter()
        .map(|e| PropertyTouch {
            seq: e.seq,
            entity: e.entity,
            key: e.key.as_str(),
            before: Some(&e.previous),
            after: None,
        })
        .chain(assigned.iter().map(|e| PropertyTouch {
            seq: e.seq,
            entity: e.entity,
            key: e.key.as_str(),
            before: e.previous.as_ref(),
            after: Some(&e.value),
        }))
        .filter(|t| !skip(t.entity))
        .collect();
    touches.sort_by_key(|t| t.seq);

    // committed value comes from the first touch, the outcome from the last
    let mut folded: BTreeMap<(I, &str), (Option<&PropValue>, Option<&PropValue>)> =
        BTreeMap::new();
    for touch in &touches {
        folded
            .entry((touch.entity, touch.key))
            .or_insert((touch.before, None))
            .1 = touch.after;
    }

    let mut changes: BTreeMap<I, EntityChanges> = BTreeMap::new();
    for ((entity, key), (committed, outcome)) in folded {
        let entry = changes.entry(entity).or_default();
        let delta = match (committed, outcome) {
            (None, None) => None,
            (None, Some(current)) => Some(PropertyDelta::Created(current.clone())),
            (Some(previous), None) => Some(PropertyDelta::Deleted(previous.clone())),
            (Some(previous), Some(current)) if previous == current => None,
            (Some(previous), Some(current)) => Some(PropertyDelta::Changed {
                previous: previous.clone(),
                current: current.clone(),
            }),
        };
        if let Some(delta) = delta {
            entry.properties.insert(key.to_owned(), delta);
        }
    }
    changes
}

fn label_changes(
    changes: &mut BTreeMap<NodeId, EntityChanges>,
    assigned: &[LabelEvent],
    removed: &[LabelEvent],
    skip: impl Fn(NodeId) -> bool,
) {
    for event in assigned {
        if skip(event.node) {
            continue;
        }
        let entry = changes.entry(event.node).or_default();
        if !entry.removed_labels.remove(&event.label) {
            entry.assigned_labels.insert(event.label.clone());
        }
    }
    for event in removed {
        if skip(event.node) {
            continue;
        }
        let entry = changes.entry(event.node).or_default();
        if !entry.assigned_labels.remove(&event.label) {
            entry.removed_labels.insert(event.label.clone());
        }
    }
}

fn fmt_labels(labels: &BTreeSet<String>) -> String {
    labels.iter().fold(String::new(), |mut out, l| {
        let _ = write!(out, ":{l}");
        out
    })
}

fn fmt_props(props: &Properties) -> String {
    let body: Vec<String> = props.iter().map(|(k, v)| format!("{k}: {v}")).collect();
    format!("{{{}}}", body.join(", "))
}

fn fmt_changes(changes: &EntityChanges) -> String {
    let mut parts: Vec<String> = changes
        .properties
        .iter()
        .map(|(k, d)| format!("{k} {d}"))
        .collect();
    parts.extend(changes.assigned_labels.iter().map(|l| format!("+:{l}")));
    parts.extend(changes.removed_labels.iter().map(|l| format!("-:{l}")));
    parts.join(", ")
}
