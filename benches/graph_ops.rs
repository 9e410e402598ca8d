//! Benchmarks for link resolution and scalar index lookups.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rand::{Rng, SeedableRng};

use neurograph::{Graph, GraphConfig, Neuron, NeuronId};

/// A hub with `fan_out` links to integer scalars.
fn star(fan_out: usize) -> (Graph, NeuronId, Vec<NeuronId>) {
    let graph = Graph::new(GraphConfig::default()).unwrap();
    let meaning = graph.create(Neuron::plain()).unwrap();
    let hub = graph.create(Neuron::plain()).unwrap();
    let leaves: Vec<NeuronId> = (0..fan_out)
        .map(|i| {
            let leaf = graph.create(Neuron::scalar(i as i64)).unwrap();
            graph.link(hub, leaf, meaning).unwrap();
            leaf
        })
        .collect();
    (graph, hub, leaves)
}

fn bench_links_out(c: &mut Criterion) {
    let (graph, hub, _) = star(1_000);
    c.bench_function("links_out_1k", |bench| {
        bench.iter(|| black_box(graph.links_out(hub).unwrap().len()))
    });
}

fn bench_links_in(c: &mut Criterion) {
    let (graph, _, leaves) = star(1_000);
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    c.bench_function("links_in_memoized", |bench| {
        bench.iter(|| {
            let leaf = leaves[rng.gen_range(0..leaves.len())];
            black_box(graph.links_in(leaf).unwrap().len())
        })
    });
}

fn bench_find_first(c: &mut Criterion) {
    let (graph, hub, _) = star(1_000);
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    graph.index_source(hub).unwrap();
    c.bench_function("find_first_indexed", |bench| {
        bench.iter(|| black_box(graph.find_first(hub, rng.gen_range(0..1_000i64)).unwrap()))
    });
}

fn bench_index_rebuild(c: &mut Criterion) {
    let (graph, hub, _) = star(1_000);
    c.bench_function("index_source_1k", |bench| {
        bench.iter(|| black_box(graph.index_source(hub).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_links_out,
    bench_links_in,
    bench_find_first,
    bench_index_rebuild
);
criterion_main!(benches);
