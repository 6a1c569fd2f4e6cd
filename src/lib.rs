//! Sparse Cholesky backend for linear factor-graph least squares.
//!
//! A [`GaussianFactorGraph`](core::GaussianFactorGraph) of linear factors is
//! assembled into normal equations on the host and factored on a compute
//! device ([`CudaDevice`](linalg::CudaDevice) or
//! [`HostDevice`](linalg::HostDevice)). See [`linalg::CuSparseSolver`].

pub mod core;
pub mod error;
pub mod linalg;
pub mod logger;
pub mod manifold;

pub use error::{SolverError, SolverResult};
pub use logger::{init_logger, init_logger_with_level};
