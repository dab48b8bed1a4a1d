//! Criterion benchmarks for layout ticks and selections
//!
//! Measures on the host reference backend:
//! - one tick of each layout algorithm
//! - rectangle selection over committed positions
//! - CSR construction for the adjacency upload

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use trueno_layout::device::DeviceContext;
use trueno_layout::layout::{LayoutKind, ParamSet};
use trueno_layout::selection::SelectionShape;
use trueno_layout::storage::{CsrGraph, GraphFrame};
use trueno_layout::Simulation;

/// Generate scale-free-ish edges (simple LCG for reproducibility)
fn generate_edges(num_points: usize, edges_per_point: usize) -> Vec<(u32, u32)> {
    let mut edges = Vec::new();
    let mut rng_state = 12345_u64;

    for point in 0..num_points {
        for _ in 0..edges_per_point {
            rng_state = rng_state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            #[allow(clippy::cast_possible_truncation)]
            let target = (rng_state % num_points as u64) as u32;

            #[allow(clippy::cast_possible_truncation)]
            let point = point as u32;
            if target != point {
                edges.push((point, target));
            }
        }
    }

    edges
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn simulation(rt: &tokio::runtime::Runtime, size: usize, kind: LayoutKind) -> Simulation {
    rt.block_on(async {
        let graph = CsrGraph::from_edges(size, &generate_edges(size, 3)).unwrap();
        let sim = Simulation::build(
            &DeviceContext::host(),
            format!("bench-{size}"),
            GraphFrame::from_graph(graph).unwrap(),
            &[kind],
            &ParamSet::new(),
        )
        .await
        .unwrap();
        sim.finalize(4).await.unwrap();
        sim
    })
}

/// Benchmark: one tick per algorithm
fn bench_tick(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("tick");

    for kind in [LayoutKind::EdgeSpring, LayoutKind::ForceDirected] {
        for size in [100, 1000, 5000] {
            // All-pairs repulsion is quadratic
            if kind == LayoutKind::ForceDirected && size > 1000 {
                continue;
            }
            let sim = simulation(&rt, size, kind);
            group.bench_with_input(BenchmarkId::new(kind.name(), size), &sim, |b, sim| {
                b.iter(|| rt.block_on(sim.tick()).unwrap());
            });
        }
    }

    group.finish();
}

/// Benchmark: rectangle selection
fn bench_select(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("select_rectangle");
    let shape = SelectionShape::rectangle(-10.0, -10.0, 10.0, 10.0);

    for size in [1000, 10_000, 100_000] {
        let sim = simulation(&rt, size, LayoutKind::EdgeSpring);
        group.bench_with_input(BenchmarkId::new("mask", size), &sim, |b, sim| {
            b.iter(|| black_box(rt.block_on(sim.select(black_box(&shape))).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark: CSR construction from an edge list
fn bench_csr_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("csr_construction");

    for size in [1000, 10_000, 100_000] {
        let edges = generate_edges(size, 3);
        group.bench_with_input(BenchmarkId::new("from_edges", size), &edges, |b, edges| {
            b.iter(|| black_box(CsrGraph::from_edges(size, black_box(edges)).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_tick, bench_select, bench_csr_construction);
criterion_main!(benches);
