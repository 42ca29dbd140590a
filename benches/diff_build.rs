#![forbid(unsafe_code)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sombra_runtime::host::{GraphAccess, MemoryGraph, TransactionalGraph};
use sombra_runtime::policy::{IncludeNodes, InclusionPolicies};
use sombra_runtime::tx::{FilteredTransactionDiff, RawMutationLog, TransactionDiff};
use sombra_runtime::types::{NodeId, PropValue, Properties};
use sombra_runtime::{Runtime, RuntimeConfig};

const NODE_COUNT: usize = 4_096;
const TOUCHED: usize = 256;

struct DiffHarness {
    graph: MemoryGraph,
    log: RawMutationLog,
    policies: InclusionPolicies,
}

impl DiffHarness {
    fn new(nodes: usize, touched: usize) -> Self {
        let graph = MemoryGraph::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let ids: Vec<NodeId> = graph
            .write(|tx| {
                (0..nodes)
                    .map(|n| {
                        let label = if n % 2 == 0 { "Person" } else { "Company" };
                        let mut props = Properties::new();
                        props.insert("score".into(), PropValue::Int(rng.gen_range(0..1_000)));
                        tx.create_node(&[label], props)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut log = RawMutationLog::default();
        for id in ids.iter().take(touched) {
            let previous = graph.node(*id).and_then(|n| n.properties.get("score").cloned());
            log.assign_node_property(*id, "score", previous, rng.gen_range(0..1_000_i64));
        }
        let policies = InclusionPolicies::none()
            .with_nodes(IncludeNodes::all().with_label("Person"))
            .business("_SRT_");
        Self {
            graph,
            log,
            policies,
        }
    }

    fn build(&self) -> usize {
        let tx = self.graph.transaction();
        match TransactionDiff::build(&self.log, &tx) {
            Ok(diff) => diff.changed_nodes().count(),
            Err(_) => 0,
        }
    }

    fn filtered(&self) -> usize {
        let tx = self.graph.transaction();
        let Ok(diff) = TransactionDiff::build(&self.log, &tx) else {
            return 0;
        };
        let view = FilteredTransactionDiff::new(&diff, &self.policies);
        view.changed_nodes().count()
    }
}

fn diff_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff");
    group.sample_size(40);
    let harness = DiffHarness::new(NODE_COUNT, TOUCHED);

    group.throughput(Throughput::Elements(TOUCHED as u64));
    group.bench_function("build", |b| b.iter(|| black_box(harness.build())));
    group.bench_function("build_filtered", |b| b.iter(|| black_box(harness.filtered())));
    group.finish();
}

fn commit_with_runtime(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");
    group.sample_size(40);
    group.throughput(Throughput::Elements(1));

    let bare = MemoryGraph::new();
    group.bench_function("bare", |b| {
        b.iter(|| black_box(bare.write(|tx| tx.create_node(&["Person"], Properties::new()))))
    });

    let observed = Arc::new(MemoryGraph::new());
    let runtime = Runtime::new(
        Arc::clone(&observed) as Arc<dyn TransactionalGraph>,
        RuntimeConfig::testing(),
    )
    .and_then(|runtime| {
        runtime.initialize()?;
        runtime.start()?;
        Ok(runtime)
    });
    group.bench_function("with_hook", |b| {
        b.iter(|| black_box(observed.write(|tx| tx.create_node(&["Person"], Properties::new()))))
    });
    if let Ok(runtime) = runtime {
        let _ = runtime.shutdown();
    }
    group.finish();
}

criterion_group!(benches, diff_build, commit_with_runtime);
criterion_main!(benches);
