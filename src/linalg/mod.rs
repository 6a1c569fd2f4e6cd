//! Sparse linear algebra for linear factor graphs.
//!
//! The pipeline runs strictly forward:
//! - [`jacobian`]: assemble the augmented sparse system `[A | b]`
//! - [`normal_equations`]: reduce it to `AᵀA` (upper storage) and `Aᵀb`
//! - [`device`]: move the system to a compute device and run the Cholesky primitive
//! - [`remap`]: slice the flat solution back into per-variable segments
//!
//! [`CuSparseSolver`] drives all four steps.

use std::panic::Location;

use thiserror::Error;

use crate::core::{GaussianFactorGraph, VectorValues};
use crate::error::SolverResult;

pub mod cusparse;
pub mod device;
pub mod jacobian;
pub mod normal_equations;
pub mod remap;

pub use cusparse::{CuSparseSolver, CuSparseSolverConfig, DEFAULT_TOLERANCE};
pub use device::{
    AllocationLedger, ComputeDevice, CudaDevice, DeviceBuffer, DeviceCsrMatrix, DeviceScalar,
    HostDevice, LedgerEvent,
};
pub use jacobian::{sparse_jacobian, sparse_jacobian_with_offsets};
pub use normal_equations::NormalEquations;
pub use remap::{ColumnOffsets, DimensionMap, remap, remap_with_offsets};

/// Type alias for sparse matrices using faer
pub type SparseMatrix = faer::sparse::SparseColMat<usize, f64>;

/// Type alias for faer matrices (used for vectors)
pub type FaerMatrix = faer::Mat<f64>;

/// Factorization strategy requested from a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FactorizationType {
    /// Cholesky on the normal equations
    #[default]
    Cholesky,
    /// QR on the Jacobian
    Qr,
}

/// Solver of the linear least-squares problem defined by a factor graph
pub trait LinearSolver {
    /// Whether the solver iterates towards the solution
    fn is_iterative(&self) -> bool;

    /// Whether the solver eliminates variables one at a time
    fn is_sequential(&self) -> bool;

    /// Solve `min ‖A x − b‖²` and return one segment per variable.
    fn solve(&self, graph: &GaussianFactorGraph) -> SolverResult<VectorValues>;
}

/// Linear algebra and device errors
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// The backend does not implement the requested factorization
    #[error("Factorization {0:?} is not supported by this backend")]
    UnsupportedMode(FactorizationType),

    /// Device memory allocation failed
    #[error("Failed to allocate {bytes} bytes on device for {what}: {reason}")]
    ResourceExhausted {
        what: &'static str,
        bytes: usize,
        reason: String,
    },

    /// The external numerical library returned a non-success status
    #[error("{call} returned status {status} (at {location})")]
    SolverBackend {
        call: &'static str,
        status: i32,
        location: &'static Location<'static>,
    },

    /// The system matrix has no Cholesky factorization within tolerance
    #[error("Matrix is singular: Cholesky failed at pivot {pivot}")]
    NumericalSingularity { pivot: usize },

    /// Acceleration support is absent from this build or host
    #[error("GPU backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Sparse matrix construction failed
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Sparse format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),
}

impl LinAlgError {
    /// Wrap a non-success status code, recording the caller's location.
    #[track_caller]
    pub fn backend(call: &'static str, status: i32) -> Self {
        LinAlgError::SolverBackend {
            call,
            status,
            location: Location::caller(),
        }
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_records_call_site() {
        let error = LinAlgError::backend("cusolverSpDcsrlsvchol", 3);
        match &error {
            LinAlgError::SolverBackend {
                call,
                status,
                location,
            } => {
                assert_eq!(*call, "cusolverSpDcsrlsvchol");
                assert_eq!(*status, 3);
                assert!(location.file().ends_with("mod.rs"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(error.to_string().contains("status 3"));
    }

    #[test]
    fn test_default_factorization_is_cholesky() {
        assert_eq!(FactorizationType::default(), FactorizationType::Cholesky);
    }
}
