//! Error types for the cusparse-solver library
//!
//! Each module reports its own `thiserror` enum; [`SolverError`] wraps them
//! without flattening, so callers can still match on the exact kind
//! (for example [`LinAlgError::NumericalSingularity`]).

use crate::{core::GraphError, linalg::LinAlgError, manifold::ManifoldError};
use thiserror::Error;

/// Main result type used throughout the library
pub type SolverResult<T> = Result<T, SolverError>;

/// Main error type for the library
#[derive(Debug, Clone, Error)]
pub enum SolverError {
    /// Assembly, reduction or device errors
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(#[from] LinAlgError),

    /// Malformed factor graph or ordering
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Manifold operations errors
    #[error("Manifold error: {0}")]
    Manifold(#[from] ManifoldError),
}

impl SolverError {
    /// The wrapped linear algebra error, if any
    pub fn as_linalg(&self) -> Option<&LinAlgError> {
        match self {
            SolverError::LinearAlgebra(err) => Some(err),
            _ => None,
        }
    }
}
