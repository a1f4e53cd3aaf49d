//! Field engine throughput on ring lattices with a few random chords.
//!
//! ```bash
//! cargo bench -p morpho-core
//! ```

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use morpho_core::config::FieldConfig;
use morpho_core::topology::{LinkSpec, TopologySpec};
use morpho_core::{DiffusionOperator, FieldEngine, Signal, SignalFrame, Topology};

fn lattice(n: usize, rng: &mut SmallRng) -> Topology {
    let nodes = (0..n).map(|i| format!("n{i}").into()).collect();
    let mut links: Vec<LinkSpec> = (0..n)
        .map(|i| LinkSpec {
            id: format!("r{i}").into(),
            from: format!("n{i}").into(),
            to: format!("n{}", (i + 1) % n).into(),
            capacity: 1.0,
        })
        .collect();
    for k in 0..n / 10 {
        let a = rng.random_range(0..n);
        let b = (a + 2 + rng.random_range(0..n - 3)) % n;
        links.push(LinkSpec {
            id: format!("c{k}").into(),
            from: format!("n{a}").into(),
            to: format!("n{b}").into(),
            capacity: 1.0,
        });
    }
    Topology::from_spec(&TopologySpec { nodes, links }).expect("valid lattice")
}

fn frame(n: usize, rng: &mut SmallRng) -> SignalFrame {
    SignalFrame {
        values: (0..n)
            .map(|_| [rng.random::<f64>() * 0.05, rng.random::<f64>(), rng.random::<f64>()])
            .collect(),
        stale: vec![false; n],
    }
}

fn bench_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("field/step");
    for &n in &[100usize, 1_000, 10_000] {
        let mut rng = SmallRng::seed_from_u64(42);
        let topo = Arc::new(lattice(n, &mut rng));
        let input = frame(n, &mut rng);
        group.bench_with_input(BenchmarkId::new("nodes", n), &n, |b, _| {
            let mut engine = FieldEngine::new(FieldConfig::default(), 1.0, Arc::clone(&topo))
                .expect("stable config");
            let mut tick = 0;
            b.iter(|| {
                tick += 1;
                engine.step(tick, &input)
            });
        });
    }
    group.finish();
}

fn bench_laplacian(c: &mut Criterion) {
    let mut group = c.benchmark_group("field/laplacian");
    for &n in &[1_000usize, 10_000] {
        let mut rng = SmallRng::seed_from_u64(7);
        let topo = lattice(n, &mut rng);
        let op = DiffusionOperator::build(&topo, &FieldConfig::default(), 1.0).expect("stable config");
        let x: Vec<f64> = (0..n).map(|_| rng.random::<f64>()).collect();
        group.bench_with_input(BenchmarkId::new("nodes", n), &n, |b, _| {
            b.iter(|| op.diffuse(&x, Signal::Latency));
        });
    }
    group.finish();
}

fn bench_rebuild(c: &mut Criterion) {
    let mut rng = SmallRng::seed_from_u64(3);
    let topo = lattice(5_000, &mut rng);
    c.bench_function("field/operator_rebuild_5000", |b| {
        b.iter(|| DiffusionOperator::build(&topo, &FieldConfig::default(), 1.0))
    });
}

criterion_group!(benches, bench_step, bench_laplacian, bench_rebuild);
criterion_main!(benches);
