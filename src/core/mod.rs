//! Core data types for linear factor-graph solving
//!
//! This module contains the inputs and outputs of a linear solve:
//! - Linear (Jacobian) factors and the graph that collects them
//! - The variable ordering that fixes the column layout of the system
//! - The per-variable result container

use thiserror::Error;

pub mod graph;
pub mod ordering;
pub mod values;

pub use graph::{GaussianFactorGraph, JacobianFactor};
pub use ordering::Ordering;
pub use values::VectorValues;

/// Identifier of one unknown block of the linear system.
pub type Key = u64;

/// Errors raised while building or inspecting a factor graph
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    /// A factor block has the wrong number of rows
    #[error("Block for key {key} has {actual} rows, factor has {expected}")]
    BlockRowMismatch {
        key: Key,
        expected: usize,
        actual: usize,
    },

    /// Keys and blocks do not pair up
    #[error("Factor has {keys} keys but {blocks} blocks")]
    KeyBlockMismatch { keys: usize, blocks: usize },

    /// The same key appears twice in one factor or ordering
    #[error("Duplicate key {0}")]
    DuplicateKey(Key),

    /// Two factors disagree on the dimension of a variable
    #[error("Key {key} has dimension {first} in one factor and {second} in another")]
    DimensionConflict {
        key: Key,
        first: usize,
        second: usize,
    },

    /// A value has the wrong length for its variable
    #[error("Value for key {key} has length {actual}, expected {expected}")]
    ValueDimension {
        key: Key,
        expected: usize,
        actual: usize,
    },

    /// A value needed for evaluation is missing
    #[error("Missing value for key {0}")]
    MissingValue(Key),
}

/// Result type for graph operations
pub type GraphResult<T> = Result<T, GraphError>;
