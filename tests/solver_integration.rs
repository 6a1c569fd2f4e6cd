//! End-to-end tests of `CuSparseSolver` on the host device
//!
//! Covers the full pipeline from factor graph to per-variable solution:
//! column layout, segment sizes, re-substitution, ordering round trips,
//! mode rejection, singular systems and ordering mismatches.

use graph_test_utils::*;

use approx::assert_relative_eq;
use cusparse_solver::SolverError;
use cusparse_solver::core::{GaussianFactorGraph, GraphError, JacobianFactor, Ordering};
use cusparse_solver::linalg::{
    ColumnOffsets, CuSparseSolver, CuSparseSolverConfig, DimensionMap, FactorizationType,
    HostDevice, LinAlgError, LinearSolver, remap,
};
use cusparse_solver::manifold::{Manifold, Sphere2};
use nalgebra::{DMatrix, DVector};

fn host_solver(keys: Vec<u64>) -> CuSparseSolver<HostDevice> {
    CuSparseSolver::with_device(
        HostDevice::new(),
        FactorizationType::Cholesky,
        Ordering::new(keys).unwrap(),
    )
}

#[test]
fn test_two_variable_example() {
    let graph = two_variable_graph();
    let ordering = Ordering::new(vec![0, 1]).unwrap();

    let offsets = ColumnOffsets::from_graph(&graph, &ordering).unwrap();
    assert_eq!(offsets.offset(0), Some(0));
    assert_eq!(offsets.offset(1), Some(2));
    assert_eq!(offsets.total(), 5);

    let solver = host_solver(vec![0, 1]);
    let values = solver.solve(&graph).unwrap();

    assert_eq!(values.len(), 2);
    assert_eq!(values.get(0).unwrap().len(), 2);
    assert_eq!(values.get(1).unwrap().len(), 3);
    assert!(residual_norm(&graph, &values) < 1e-6);

    assert_relative_eq!(
        values.get(1).unwrap().clone(),
        DVector::from_vec(vec![2.0, 1.0, 3.0]),
        epsilon = 1e-9
    );
    assert_eq!(solver.device().ledger().live(), 0);
}

#[test]
fn test_round_trip_for_every_ordering() {
    let graph = mixed_dimension_graph();
    let orderings = [
        vec![3, 7, 11],
        vec![11, 7, 3],
        vec![7, 3, 11],
        vec![11, 99, 3, 42, 7],
    ];
    let dims = DimensionMap::from_graph(&graph).unwrap();

    for keys in orderings {
        let ordering = Ordering::new(keys).unwrap();
        let solver = CuSparseSolver::with_device(
            HostDevice::new(),
            FactorizationType::Cholesky,
            ordering.clone(),
        );
        let values = solver.solve(&graph).unwrap();

        // One segment per referenced variable, of its declared size
        assert_eq!(values.len(), 3);
        for (key, dim) in dims.iter() {
            assert_eq!(values.get(key).unwrap().len(), dim, "key {key}");
        }
        assert!(!values.contains(99));
        assert!(!values.contains(42));

        // Concatenating in ordering order reproduces the flat solution
        let flat = flat_solution(&graph, &ordering);
        let concatenated = values.to_flat(&ordering);
        assert_eq!(concatenated.len(), flat.len());
        for (a, b) in concatenated.iter().zip(&flat) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }

        // And matches a dense least-squares solve
        let dense = dense_solution(&graph, &ordering);
        assert_relative_eq!(concatenated, dense, epsilon = 1e-9);
    }
}

#[test]
fn test_solution_does_not_depend_on_ordering() {
    let graph = mixed_dimension_graph();
    let forward = host_solver(vec![3, 7, 11]).solve(&graph).unwrap();
    let backward = host_solver(vec![11, 7, 3]).solve(&graph).unwrap();
    for (key, segment) in &forward {
        assert_relative_eq!(segment.clone(), backward.get(*key).unwrap().clone(), epsilon = 1e-9);
    }
}

#[test]
fn test_qr_mode_is_rejected_without_allocation() {
    for graph in [GaussianFactorGraph::new(), two_variable_graph()] {
        let solver = CuSparseSolver::with_device(
            HostDevice::new(),
            FactorizationType::Qr,
            Ordering::natural(&graph),
        );
        let err = solver.solve(&graph).unwrap_err();
        assert!(matches!(
            err,
            SolverError::LinearAlgebra(LinAlgError::UnsupportedMode(FactorizationType::Qr))
        ));
        assert_eq!(solver.device().ledger().allocations(), 0);
    }
}

#[test]
fn test_unconstrained_variable_is_singular() {
    // x1 is referenced, but with an all-zero block
    let mut graph = GaussianFactorGraph::new();
    graph.push(
        JacobianFactor::binary(
            0,
            DMatrix::identity(2, 2),
            1,
            DMatrix::zeros(2, 2),
            DVector::from_vec(vec![1.0, 1.0]),
        )
        .unwrap(),
    );

    let solver = host_solver(vec![0, 1]);
    match solver.solve(&graph) {
        Err(SolverError::LinearAlgebra(LinAlgError::NumericalSingularity { pivot })) => {
            assert_eq!(pivot, 2)
        }
        other => panic!("expected singularity, got {other:?}"),
    }
    let ledger = solver.device().ledger();
    assert_eq!(ledger.allocations(), 5);
    assert_eq!(ledger.live(), 0);
}

#[test]
fn test_rank_deficient_pair_is_singular() {
    // Only the difference x1 - x0 is observed
    let mut graph = GaussianFactorGraph::new();
    graph.push(
        JacobianFactor::binary(
            0,
            -DMatrix::identity(1, 1),
            1,
            DMatrix::identity(1, 1),
            DVector::from_vec(vec![1.0]),
        )
        .unwrap(),
    );
    let err = host_solver(vec![0, 1]).solve(&graph).unwrap_err();
    assert!(matches!(
        err.as_linalg(),
        Some(LinAlgError::NumericalSingularity { pivot: 1 })
    ));
}

#[test]
fn test_mismatched_remap_ordering_breaks_resubstitution() {
    let graph = two_variable_graph();
    let assembly = Ordering::new(vec![0, 1]).unwrap();
    let flat = flat_solution(&graph, &assembly);
    let dims = DimensionMap::from_graph(&graph).unwrap();

    let consistent = remap(&flat, &assembly, &dims).unwrap();
    assert!(residual_norm(&graph, &consistent) < 1e-6);

    // Same total width, so the length check cannot catch it
    let swapped = Ordering::new(vec![1, 0]).unwrap();
    let inconsistent = remap(&flat, &swapped, &dims).unwrap();
    assert_eq!(inconsistent.get(0).unwrap().len(), 2);
    assert_eq!(inconsistent.get(1).unwrap().len(), 3);
    assert!(residual_norm(&graph, &inconsistent) > 1e-3);
}

#[test]
fn test_key_missing_from_ordering() {
    let err = host_solver(vec![0]).solve(&two_variable_graph()).unwrap_err();
    assert!(matches!(
        err,
        SolverError::LinearAlgebra(LinAlgError::InvalidInput(_))
    ));
}

#[test]
fn test_dimension_conflict_is_reported() {
    let mut graph = two_variable_graph();
    graph.push(JacobianFactor::unary(0, DMatrix::identity(3, 3), DVector::zeros(3)).unwrap());
    let err = host_solver(vec![0, 1]).solve(&graph).unwrap_err();
    assert!(matches!(
        err,
        SolverError::Graph(GraphError::DimensionConflict {
            key: 0,
            first: 2,
            second: 3
        })
    ));
}

#[test]
fn test_removed_factor_is_ignored() {
    let mut graph = two_variable_graph();
    let slot = graph.push(
        JacobianFactor::unary(1, DMatrix::identity(3, 3), DVector::from_element(3, 100.0))
            .unwrap(),
    );
    graph.remove(slot);

    let values = host_solver(vec![0, 1]).solve(&graph).unwrap();
    assert!(residual_norm(&graph, &values) < 1e-6);
}

#[test]
fn test_empty_graph_solves_to_nothing() {
    let values = host_solver(vec![]).solve(&GaussianFactorGraph::new()).unwrap();
    assert!(values.is_empty());
}

#[test]
fn test_tight_tolerance_rejects_weak_pivot() {
    let mut graph = GaussianFactorGraph::new();
    graph.push(
        JacobianFactor::unary(0, DMatrix::from_element(1, 1, 1e-3), DVector::from_element(1, 1.0))
            .unwrap(),
    );
    let ordering = Ordering::new(vec![0]).unwrap();

    let loose = CuSparseSolver::with_config(
        HostDevice::new(),
        ordering.clone(),
        CuSparseSolverConfig::default(),
    );
    let values = loose.solve(&graph).unwrap();
    assert_relative_eq!(values.get(0).unwrap()[0], 1000.0, epsilon = 1e-6);

    let strict = CuSparseSolver::with_config(
        HostDevice::new(),
        ordering,
        CuSparseSolverConfig::default().with_tolerance(1e-2),
    );
    assert!(matches!(
        strict.solve(&graph).unwrap_err().as_linalg(),
        Some(LinAlgError::NumericalSingularity { pivot: 0 })
    ));
}

#[test]
fn test_concurrent_solves_share_a_device() {
    let graph = mixed_dimension_graph();
    let solver = host_solver(vec![3, 7, 11]);
    let expected = solver.solve(&graph).unwrap();

    let (solver_ref, graph_ref) = (&solver, &graph);
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(move || solver_ref.solve(graph_ref).unwrap()))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    });
    assert_eq!(solver.device().ledger().live(), 0);
    assert_eq!(solver.device().ledger().allocations(), 25);
}

#[test]
fn test_solver_through_trait_object_interface() {
    fn solve_with(solver: &impl LinearSolver, graph: &GaussianFactorGraph) -> usize {
        assert!(!solver.is_iterative());
        assert!(!solver.is_sequential());
        solver.solve(graph).unwrap().len()
    }
    assert_eq!(solve_with(&host_solver(vec![0, 1]), &two_variable_graph()), 2);
}

#[test]
fn test_sphere_increment_from_linear_solve() {
    // Solve for the tangent step that moves `start` onto `target`
    let start = Sphere2::from_xyz(1.0, 0.2, -0.1).unwrap();
    let target = Sphere2::from_xyz(0.4, 0.8, 0.3).unwrap();
    let step = start.local_coordinates(&target).unwrap();

    let mut graph = GaussianFactorGraph::new();
    graph.push(JacobianFactor::unary(5, DMatrix::identity(2, 2) * 3.0, step * 3.0).unwrap());
    let values = host_solver(vec![5]).solve(&graph).unwrap();

    let moved = start.retract(values.get(5).unwrap()).unwrap();
    assert!(moved.equals(&target, 1e-9));
}

#[cfg(not(feature = "cuda"))]
#[test]
fn test_cuda_backend_unavailable_without_feature() {
    let solver = CuSparseSolver::new(FactorizationType::Cholesky, Ordering::new(vec![0, 1]).unwrap());
    let err = solver.solve(&two_variable_graph()).unwrap_err();
    assert!(matches!(
        err,
        SolverError::LinearAlgebra(LinAlgError::BackendUnavailable(_))
    ));
}
