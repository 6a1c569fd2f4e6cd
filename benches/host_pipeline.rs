//! Host-device throughput of the normal-equations Cholesky pipeline
//!
//! Three stages are timed separately on grid-shaped graphs (each variable
//! linked to its right and lower neighbour), so fill-in grows with the grid
//! width the way it does for real 2D problems:
//! - `assemble`: `[A | b]` from the graph
//! - `reduce`: `AᵀA` and `Aᵀb`
//! - `solve`: full `CuSparseSolver::solve` on the host device

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use cusparse_solver::core::{GaussianFactorGraph, JacobianFactor, Ordering};
use cusparse_solver::linalg::{
    CuSparseSolver, FactorizationType, HostDevice, NormalEquations, sparse_jacobian,
};
use nalgebra::{DMatrix, DVector};

const DIM: usize = 3;

fn grid_graph(width: usize) -> GaussianFactorGraph {
    let key = |r: usize, c: usize| (r * width + c) as u64;
    let identity = DMatrix::<f64>::identity(DIM, DIM);
    let mut graph = GaussianFactorGraph::new();

    graph.push(JacobianFactor::unary(0, identity.clone(), DVector::zeros(DIM)).unwrap());
    for r in 0..width {
        for c in 0..width {
            let rhs = DVector::from_fn(DIM, |i, _| ((r * 7 + c * 3 + i) as f64).cos());
            if c + 1 < width {
                graph.push(
                    JacobianFactor::binary(
                        key(r, c),
                        -identity.clone(),
                        key(r, c + 1),
                        identity.clone(),
                        rhs.clone(),
                    )
                    .unwrap(),
                );
            }
            if r + 1 < width {
                graph.push(
                    JacobianFactor::binary(
                        key(r, c),
                        -identity.clone(),
                        key(r + 1, c),
                        identity.clone(),
                        rhs,
                    )
                    .unwrap(),
                );
            }
        }
    }
    graph
}

fn host_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_pipeline");
    for width in [8, 16, 32] {
        let graph = grid_graph(width);
        let ordering = Ordering::natural(&graph);

        group.bench_with_input(BenchmarkId::new("assemble", width), &graph, |b, graph| {
            b.iter(|| sparse_jacobian(black_box(graph), &ordering).unwrap())
        });

        let ab = sparse_jacobian(&graph, &ordering).unwrap();
        group.bench_with_input(BenchmarkId::new("reduce", width), &ab, |b, ab| {
            b.iter(|| NormalEquations::from_augmented(black_box(ab)).unwrap())
        });

        let solver = CuSparseSolver::with_device(
            HostDevice::new(),
            FactorizationType::Cholesky,
            ordering.clone(),
        );
        group.bench_with_input(BenchmarkId::new("solve", width), &graph, |b, graph| {
            b.iter(|| solver.solve(black_box(graph)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, host_pipeline);
criterion_main!(benches);
