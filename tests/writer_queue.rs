use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sombra_runtime::config::{DrainPolicy, QueueFullPolicy, WriterConfig, WriterStrategy};
use sombra_runtime::host::{GraphAccess, MemoryGraph, TransactionalGraph};
use sombra_runtime::types::{PropValue, Properties};
use sombra_runtime::writer::WriterQueue;
use sombra_runtime::{ModuleError, Result, RuntimeError};

fn tagged(producer: i64, seq: i64) -> Properties {
    let mut props = Properties::new();
    props.insert("producer".into(), PropValue::Int(producer));
    props.insert("seq".into(), PropValue::Int(seq));
    props
}

fn queue(graph: &Arc<MemoryGraph>, config: WriterConfig) -> Result<WriterQueue> {
    WriterQueue::new(Arc::clone(graph) as Arc<dyn TransactionalGraph>, config)
}

#[test]
fn two_producers_against_small_batched_queue_lose_only_dropped_tasks() -> Result<()> {
    let graph = Arc::new(MemoryGraph::new());
    let writer = Arc::new(queue(
        &graph,
        WriterConfig {
            capacity: 1_000,
            strategy: WriterStrategy::Batched { batch_size: 100 },
            queue_full: QueueFullPolicy::Drop,
            ..WriterConfig::default()
        },
    )?);
    writer.start()?;

    // hold the writer until the producers have overflowed the queue once
    let overflowed = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&overflowed);
    writer.submit("gate", move |_: &dyn GraphAccess| {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !gate.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    })?;

    let producers: Vec<_> = [(1_i64, 10_000_i64), (2, 5_000)]
        .into_iter()
        .map(|(producer, count)| {
            let writer = Arc::clone(&writer);
            let overflowed = Arc::clone(&overflowed);
            thread::spawn(move || -> Result<(Vec<(i64, i64)>, Vec<(i64, i64)>)> {
                let (mut accepted, mut rejected) = (Vec::new(), Vec::new());
                for seq in 0..count {
                    let id = format!("p{producer}-{seq}");
                    let submitted = writer.submit(id, move |g: &dyn GraphAccess| {
                        g.create_node(&["Task"], tagged(producer, seq))?;
                        Ok(())
                    });
                    match submitted {
                        Ok(()) => accepted.push((producer, seq)),
                        Err(RuntimeError::QueueFull { .. }) => {
                            overflowed.store(true, Ordering::SeqCst);
                            rejected.push((producer, seq));
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok((accepted, rejected))
            })
        })
        .collect();
    let (mut accepted, mut rejected) = (BTreeSet::new(), BTreeSet::new());
    for producer in producers {
        let (ok, full) = producer
            .join()
            .map_err(|_| RuntimeError::InvalidState("producer panicked".into()))??;
        accepted.extend(ok);
        rejected.extend(full);
    }
    assert!(writer.stop());

    let stats = writer.stats();
    assert_eq!(stats.accepted + stats.dropped, 15_001);
    assert_eq!(stats.accepted, accepted.len() as u64 + 1);
    assert_eq!(stats.dropped, rejected.len() as u64);
    assert!(stats.dropped > 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.executed, stats.accepted);

    let mut present = BTreeSet::new();
    for node in graph.nodes() {
        let key = (
            node.properties.get("producer").and_then(PropValue::as_int),
            node.properties.get("seq").and_then(PropValue::as_int),
        );
        let (Some(producer), Some(seq)) = key else {
            panic!("untagged node {node:?}");
        };
        assert!(present.insert((producer, seq)), "task executed twice: {key:?}");
    }
    assert_eq!(present, accepted);
    assert!(present.is_disjoint(&rejected));
    Ok(())
}

#[test]
fn fire_and_forget_returns_without_waiting() -> Result<()> {
    let graph = Arc::new(MemoryGraph::new());
    let writer = queue(&graph, WriterConfig::default())?;
    writer.start()?;

    let started = Instant::now();
    let result = writer.write("slow", Duration::ZERO, |_: &dyn GraphAccess| {
        thread::sleep(Duration::from_millis(200));
        Ok(())
    })?;
    assert_eq!(result, None);
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(writer.stop());
    assert_eq!(writer.stats().executed, 1);
    Ok(())
}

#[test]
fn blocking_write_returns_shortly_after_task_completes() -> Result<()> {
    let graph = Arc::new(MemoryGraph::new());
    let writer = queue(&graph, WriterConfig::default())?;
    writer.start()?;

    let started = Instant::now();
    let id = writer.write("create", Duration::from_secs(10), |g: &dyn GraphAccess| {
        thread::sleep(Duration::from_millis(20));
        Ok(g.create_node(&["Blocking"], Properties::new())?)
    })?;
    let elapsed = started.elapsed();
    let id = id.ok_or_else(|| RuntimeError::InvalidState("no result".into()))?;
    assert!(graph.node(id).is_some());
    assert!(elapsed >= Duration::from_millis(20));
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    assert!(writer.stop());
    Ok(())
}

#[test]
fn blocking_write_times_out_with_none() -> Result<()> {
    let graph = Arc::new(MemoryGraph::new());
    let writer = queue(&graph, WriterConfig::default())?;
    writer.start()?;
    let result = writer.write("sleepy", Duration::from_millis(20), |_: &dyn GraphAccess| {
        thread::sleep(Duration::from_millis(300));
        Ok(7)
    })?;
    assert_eq!(result, None);
    assert!(writer.stop());
    assert_eq!(writer.stats().executed, 1);
    Ok(())
}

#[test]
fn failed_task_yields_none_unless_caller_asks_for_error() -> Result<()> {
    let graph = Arc::new(MemoryGraph::new());
    let writer = queue(&graph, WriterConfig::default())?;
    writer.start()?;

    let quiet = writer.write("forget", Duration::ZERO, |_: &dyn GraphAccess| {
        Err::<(), _>(ModuleError::failed("ignored"))
    })?;
    assert_eq!(quiet, None);

    let waited = writer.write("wait", Duration::from_secs(5), |_: &dyn GraphAccess| {
        Err::<(), _>(ModuleError::failed("broken"))
    })?;
    assert_eq!(waited, None);

    let typed = writer.try_write("typed", Duration::from_secs(5), |_: &dyn GraphAccess| {
        Err::<(), _>(ModuleError::failed("broken"))
    });
    match typed {
        Err(RuntimeError::TaskFailed { task_id, message }) => {
            assert_eq!(task_id, "typed");
            assert_eq!(message, "broken");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(writer.stop());
    assert_eq!(writer.stats().failed, 3);
    Ok(())
}

#[test]
fn panicking_task_does_not_kill_writer() -> Result<()> {
    let graph = Arc::new(MemoryGraph::new());
    let writer = queue(&graph, WriterConfig::default())?;
    writer.start()?;
    let boom = writer.try_write("boom", Duration::from_secs(5), |_: &dyn GraphAccess| -> std::result::Result<(), ModuleError> {
        panic!("task exploded")
    });
    assert!(matches!(boom, Err(RuntimeError::TaskFailed { .. })));
    let after = writer.write("after", Duration::from_secs(5), |_: &dyn GraphAccess| Ok(1))?;
    assert_eq!(after, Some(1));
    assert!(writer.stop());
    Ok(())
}

/// Runs the same sequence, with every third task failing after a write,
/// under both strategies.
fn run_sequence(strategy: WriterStrategy) -> Result<Vec<i64>> {
    let graph = Arc::new(MemoryGraph::new());
    let writer = queue(
        &graph,
        WriterConfig {
            strategy,
            ..WriterConfig::default()
        },
    )?;
    for seq in 0..30_i64 {
        writer.write(format!("t{seq}"), Duration::ZERO, move |g: &dyn GraphAccess| {
            g.create_node(&["Seq"], tagged(0, seq))?;
            if seq % 3 == 0 {
                return Err(ModuleError::failed("every third fails"));
            }
            Ok(())
        })?;
    }
    writer.start()?;
    assert!(writer.stop());
    let mut seqs: Vec<i64> = graph
        .nodes()
        .iter()
        .filter_map(|n| n.properties.get("seq").and_then(PropValue::as_int))
        .collect();
    seqs.sort_unstable();
    Ok(seqs)
}

#[test]
fn strategies_leave_identical_graphs_under_task_failure() -> Result<()> {
    let alone = run_sequence(WriterStrategy::TxPerTask)?;
    let batched = run_sequence(WriterStrategy::Batched { batch_size: 8 })?;
    assert_eq!(alone.len(), 20);
    assert_eq!(alone, batched);
    assert!(alone.iter().all(|seq| seq % 3 != 0));
    Ok(())
}

#[test]
fn blocking_policy_waits_for_room() -> Result<()> {
    let graph = Arc::new(MemoryGraph::new());
    let writer = queue(
        &graph,
        WriterConfig {
            capacity: 2,
            queue_full: QueueFullPolicy::Block { timeout_ms: 5_000 },
            ..WriterConfig::default()
        },
    )?;
    writer.start()?;
    for seq in 0..20_i64 {
        writer.write(format!("t{seq}"), Duration::ZERO, move |g: &dyn GraphAccess| {
            thread::sleep(Duration::from_millis(1));
            g.create_node(&[], tagged(0, seq))?;
            Ok(())
        })?;
    }
    assert!(writer.stop());
    assert_eq!(writer.stats().dropped, 0);
    assert_eq!(graph.node_count(), 20);
    Ok(())
}

#[test]
fn discard_policy_drops_backlog_on_stop() -> Result<()> {
    let graph = Arc::new(MemoryGraph::new());
    let writer = queue(
        &graph,
        WriterConfig {
            on_shutdown: DrainPolicy::Discard,
            ..WriterConfig::default()
        },
    )?;
    for seq in 0..10_i64 {
        writer.write(format!("t{seq}"), Duration::ZERO, move |g: &dyn GraphAccess| {
            g.create_node(&[], tagged(0, seq))?;
            Ok(())
        })?;
    }
    assert!(writer.stop());
    assert_eq!(writer.stats().discarded, 10);
    assert_eq!(graph.node_count(), 0);
    Ok(())
}
