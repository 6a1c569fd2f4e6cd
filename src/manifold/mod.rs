//! Manifold value types for variables that do not live in a vector space.
//!
//! A manifold variable is updated by solving for a tangent-space increment
//! with the linear solver and mapping it back onto the manifold:
//!
//! ```text
//! x_new = x.retract(δ)        δ = x.local_coordinates(x_new)
//! ```
//!
//! Manifold    | size | dim | X ∈ M        | Constraint | retract(v)
//! ----------- | ---- | --- | ------------ | ---------- | ---------------------------
//! 2-sphere    | 3    | 2   | p ∈ R³       | ‖p‖ = 1    | cos‖Bv‖ p + sin‖Bv‖ Bv/‖Bv‖
//!
//! Tangent increments are plain `DVector<f64>` so that a segment taken from a
//! solved [`VectorValues`](crate::core::VectorValues) can be applied directly.

use nalgebra::DVector;
use std::fmt::Debug;
use thiserror::Error;

pub mod sphere2;

pub use sphere2::Sphere2;

/// Errors that can occur during manifold operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManifoldError {
    /// Invalid tangent vector dimension
    #[error("Invalid tangent dimension: expected {expected}, got {actual}")]
    InvalidTangentDimension { expected: usize, actual: usize },

    /// Numerical instability in computation
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    /// Invalid manifold element
    #[error("Invalid manifold element: {0}")]
    InvalidElement(String),
}

/// Result type for manifold operations.
pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// Retraction and local coordinates of a manifold.
///
/// Implementations must satisfy, for tangent vectors `v` inside the
/// injectivity radius:
/// - `x.retract(0) == x`
/// - `x.local_coordinates(&x.retract(v)) ≈ v`
pub trait Manifold: Clone + Debug + PartialEq {
    /// Dimension of the tangent space
    const DIM: usize;

    /// Move along the tangent vector `v` (length [`Self::DIM`]).
    fn retract(&self, v: &DVector<f64>) -> ManifoldResult<Self>;

    /// Tangent vector at `self` that retracts onto `other`.
    fn local_coordinates(&self, other: &Self) -> ManifoldResult<DVector<f64>>;

    /// Tangent-space dimension of this element
    fn dim(&self) -> usize {
        Self::DIM
    }
}
