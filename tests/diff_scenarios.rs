use std::sync::Arc;

use parking_lot::Mutex;
use sombra_runtime::host::{
    CommitHook, GraphAccess, HookState, MemoryGraph, TransactionalGraph,
};
use sombra_runtime::tx::{PropertyDelta, RawMutationLog, TransactionDiff};
use sombra_runtime::types::{
    Direction, EntityRef, EntityView, NodeId, NodeView, PropValue, Properties, RelId,
    RelationshipView,
};
use sombra_runtime::{Result, RuntimeError};

type Inspect = dyn Fn(&TransactionDiff<'_>) -> Result<()> + Send + Sync;

/// Builds the diff of every commit and hands it to `inspect`.
struct DiffHook {
    inspect: Box<Inspect>,
}

impl CommitHook for DiffHook {
    fn before_commit(&self, log: &RawMutationLog, tx: &dyn GraphAccess) -> Result<HookState> {
        let diff = TransactionDiff::build(log, tx)?;
        (self.inspect)(&diff)?;
        Ok(Box::new(()))
    }

    fn after_commit(&self, _state: HookState) {}

    fn after_rollback(&self, _state: HookState) {}
}

fn inspect_with(
    graph: &MemoryGraph,
    inspect: impl Fn(&TransactionDiff<'_>) -> Result<()> + Send + Sync + 'static,
) {
    graph.register_commit_hook(Arc::new(DiffHook {
        inspect: Box::new(inspect),
    }));
}

fn props(pairs: &[(&str, PropValue)]) -> Properties {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

#[test]
fn changed_property_reports_previous_and_current() -> Result<()> {
    let graph = MemoryGraph::new();
    let a = graph.write(|tx| tx.create_node(&["Item"], props(&[("k", 1_i64.into())])))?;

    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&seen);
    inspect_with(&graph, move |diff| {
        let change = diff
            .changed_node(a)
            .ok_or_else(|| RuntimeError::InternalConsistency("A not changed".into()))?;
        assert_eq!(change.previous().property("k"), Some(PropValue::Int(1)));
        assert_eq!(change.current().property("k"), Some(PropValue::Int(2)));
        assert_eq!(
            diff.property_delta(a.into(), "k"),
            Some(&PropertyDelta::Changed {
                previous: PropValue::Int(1),
                current: PropValue::Int(2),
            })
        );
        let created: Vec<NodeId> = diff.created_nodes().map(|n| n.id()).collect();
        sink.lock().push(format!("created={}", created.len()));
        Ok(())
    });

    let b = graph.write(|tx| {
        tx.set_property(a.into(), "k", 2_i64.into())?;
        tx.create_node(&["Item"], Properties::new())
    })?;
    assert_eq!(seen.lock().as_slice(), ["created=1"]);
    assert!(graph.node(b).is_some());
    Ok(())
}

#[test]
fn entity_created_and_deleted_in_one_transaction_is_net_zero() -> Result<()> {
    let graph = MemoryGraph::new();
    let counts: Arc<Mutex<Vec<(usize, usize, usize)>>> = Arc::default();
    let sink = Arc::clone(&counts);
    inspect_with(&graph, move |diff| {
        sink.lock().push((
            diff.created_nodes().count(),
            diff.deleted_nodes().count(),
            diff.changed_nodes().count(),
        ));
        Ok(())
    });

    let kept = graph.write(|tx| {
        let transient = tx.create_node(&["Temp"], props(&[("x", 1_i64.into())]))?;
        tx.delete_node(transient)?;
        tx.create_node(&["Kept"], Properties::new())
    })?;
    assert_eq!(counts.lock().as_slice(), [(1, 0, 0)]);
    assert_eq!(graph.node_count(), 1);
    assert!(graph.node(kept).is_some());
    Ok(())
}

#[test]
fn delete_then_recreate_property_is_one_change() -> Result<()> {
    let graph = MemoryGraph::new();
    let a = graph.write(|tx| tx.create_node(&[], props(&[("k", 1_i64.into())])))?;

    let deltas: Arc<Mutex<Vec<PropertyDelta>>> = Arc::default();
    let sink = Arc::clone(&deltas);
    inspect_with(&graph, move |diff| {
        if let Some(changes) = diff.changes(a.into()) {
            sink.lock().extend(changes.properties().values().cloned());
        }
        Ok(())
    });

    graph.write(|tx| {
        tx.remove_property(a.into(), "k")?;
        tx.set_property(a.into(), "k", 5_i64.into())?;
        Ok(())
    })?;
    assert_eq!(
        deltas.lock().as_slice(),
        [PropertyDelta::Changed {
            previous: PropValue::Int(1),
            current: PropValue::Int(5),
        }]
    );
    Ok(())
}

#[test]
fn deleted_node_keeps_final_properties_and_rejects_writes() -> Result<()> {
    let graph = MemoryGraph::new();
    let a = graph.write(|tx| {
        tx.create_node(&["Person"], props(&[("name", "ada".into()), ("age", 36_i64.into())]))
    })?;

    let checked: Arc<Mutex<bool>> = Arc::default();
    let sink = Arc::clone(&checked);
    inspect_with(&graph, move |diff| {
        for node in diff.deleted_nodes() {
            assert!(node.is_deleted());
            assert_eq!(node.property("name"), Some(PropValue::from("ada")));
            assert!(node.has_label("Person"));
            assert!(matches!(
                node.set_property("name", "bob".into()),
                Err(RuntimeError::IllegalMutation { entity }) if entity == EntityRef::Node(a)
            ));
            *sink.lock() = true;
        }
        Ok(())
    });

    graph.write(|tx| tx.delete_node(a))?;
    assert!(*checked.lock());
    assert!(graph.node(a).is_none());
    Ok(())
}

#[test]
fn untouched_properties_read_live_values() -> Result<()> {
    let graph = MemoryGraph::new();
    let a = graph.write(|tx| {
        tx.create_node(&[], props(&[("k", 1_i64.into()), ("other", "x".into())]))
    })?;

    let checked: Arc<Mutex<bool>> = Arc::default();
    let sink = Arc::clone(&checked);
    inspect_with(&graph, move |diff| {
        if let Some(change) = diff.changed_node(a) {
            let previous = change.previous();
            assert_eq!(previous.property("other"), Some(PropValue::from("x")));
            assert_eq!(previous.property("added"), None);
            let keys: Vec<String> = previous.property_keys().into_iter().collect();
            assert_eq!(keys, ["k", "other"]);
            let current: Vec<String> = change.current().property_keys().into_iter().collect();
            assert_eq!(current, ["added", "k", "other"]);
            *sink.lock() = true;
        }
        Ok(())
    });

    graph.write(|tx| {
        tx.set_property(a.into(), "k", 2_i64.into())?;
        tx.set_property(a.into(), "added", true.into())?;
        Ok(())
    })?;
    assert!(*checked.lock());
    Ok(())
}

#[test]
fn label_changes_are_reversed_on_previous_side() -> Result<()> {
    let graph = MemoryGraph::new();
    let a = graph.write(|tx| tx.create_node(&["Draft"], Properties::new()))?;

    let checked: Arc<Mutex<bool>> = Arc::default();
    let sink = Arc::clone(&checked);
    inspect_with(&graph, move |diff| {
        if let Some(change) = diff.changed_node(a) {
            assert!(change.previous().has_label("Draft"));
            assert!(!change.previous().has_label("Published"));
            assert!(change.current().has_label("Published"));
            let summaries = diff.mutation_summaries();
            assert_eq!(summaries.len(), 1);
            assert!(summaries[0].contains("+:Published"), "{summaries:?}");
            *sink.lock() = true;
        }
        Ok(())
    });

    graph.write(|tx| {
        tx.remove_label(a, "Draft")?;
        tx.add_label(a, "Published")?;
        Ok(())
    })?;
    assert!(*checked.lock());
    Ok(())
}

#[test]
fn deleted_relationships_resolve_direction_from_viewpoint() -> Result<()> {
    let graph = MemoryGraph::new();
    let (a, b) = graph.write(|tx| {
        let a = tx.create_node(&[], Properties::new())?;
        let b = tx.create_node(&[], Properties::new())?;
        tx.create_relationship(a, a, "LIKES", Properties::new())?;
        tx.create_relationship(a, b, "KNOWS", Properties::new())?;
        Ok((a, b))
    })?;
    let rels = graph.write(|tx| Ok(tx.relationships_of(a)))?;

    let checked: Arc<Mutex<bool>> = Arc::default();
    let sink = Arc::clone(&checked);
    inspect_with(&graph, move |diff| {
        assert_eq!(diff.deleted_relationships_of(a, Direction::Outgoing, &[]).count(), 2);
        assert_eq!(diff.deleted_relationships_of(a, Direction::Incoming, &[]).count(), 1);
        assert_eq!(diff.deleted_relationships_of(b, Direction::Outgoing, &[]).count(), 0);
        assert_eq!(
            diff.deleted_relationships_of(b, Direction::Incoming, &["KNOWS"]).count(),
            1
        );
        for rel in diff.deleted_relationships() {
            if rel.start() == rel.end() {
                assert_eq!(rel.direction_from(a), Some(Direction::Both));
                assert_eq!(rel.direction_from(b), None);
            }
        }
        *sink.lock() = true;
        Ok(())
    });

    graph.write(|tx| {
        for rel in &rels {
            tx.delete_relationship(*rel)?;
        }
        Ok(())
    })?;
    assert!(*checked.lock());
    assert_eq!(graph.relationship_count(), 0);
    Ok(())
}

#[test]
fn hook_corrections_through_snapshots_are_committed() -> Result<()> {
    let graph = MemoryGraph::new();
    inspect_with(&graph, |diff| {
        for node in diff.created_nodes() {
            if node.property("score").and_then(|v| v.as_int()).unwrap_or(0) < 0 {
                node.set_property("score", 0_i64.into())?;
            }
        }
        Ok(())
    });

    let a = graph.write(|tx| tx.create_node(&[], props(&[("score", (-4_i64).into())])))?;
    let stored = graph.node(a).and_then(|n| n.properties.get("score").cloned());
    assert_eq!(stored, Some(PropValue::Int(0)));
    Ok(())
}

#[test]
fn inconsistent_log_vetoes_commit() -> Result<()> {
    let graph = MemoryGraph::new();
    let tx = graph.transaction();
    let mut log = RawMutationLog::default();
    log.assign_node_property(NodeId(99), "k", None, 1_i64);
    let err = TransactionDiff::build(&log, &tx).err();
    assert!(matches!(err, Some(RuntimeError::InternalConsistency(_))));
    Ok(())
}

fn weighted_relationship(graph: &MemoryGraph) -> Result<RelId> {
    graph.write(|tx| {
        let a = tx.create_node(&["Stop"], Properties::new())?;
        let b = tx.create_node(&["Stop"], Properties::new())?;
        tx.create_relationship(a, b, "ROUTE", props(&[("w", 1_i64.into())]))
    })
}

#[test]
fn literal_log_assign_then_remove_on_relationship_reports_deletion() -> Result<()> {
    let graph = MemoryGraph::new();
    let rel = weighted_relationship(&graph)?;
    let tx = graph.transaction();
    tx.set_property(rel.into(), "w", 2_i64.into())?;
    tx.remove_property(rel.into(), "w")?;

    let mut log = RawMutationLog::default();
    log.assign_relationship_property(rel, "w", Some(PropValue::Int(1)), 2_i64)
        .remove_relationship_property(rel, "w", 2_i64);
    let diff = TransactionDiff::build(&log, &tx)?;

    assert_eq!(
        diff.property_delta(rel.into(), "w"),
        Some(&PropertyDelta::Deleted(PropValue::Int(1)))
    );
    let change = diff
        .changed_relationship(rel)
        .ok_or_else(|| RuntimeError::InternalConsistency("route not changed".into()))?;
    assert_eq!(change.previous().property("w"), Some(PropValue::Int(1)));
    assert!(!change.current().has_property("w"));
    Ok(())
}

#[test]
fn literal_log_reassigning_committed_value_is_no_change() -> Result<()> {
    let graph = MemoryGraph::new();
    let rel = weighted_relationship(&graph)?;
    let tx = graph.transaction();
    tx.set_property(rel.into(), "w", 2_i64.into())?;
    tx.set_property(rel.into(), "w", 1_i64.into())?;

    let mut log = RawMutationLog::default();
    log.assign_relationship_property(rel, "w", Some(PropValue::Int(1)), 2_i64)
        .assign_relationship_property(rel, "w", Some(PropValue::Int(2)), 1_i64);
    let diff = TransactionDiff::build(&log, &tx)?;

    assert!(!diff.is_changed(EntityRef::Relationship(rel)));
    assert!(!diff.mutations_occurred());
    Ok(())
}
