//! Sparse Jacobian assembly.
//!
//! Stacks the rows of every factor (in graph order) into one sparse matrix
//! whose columns follow the variable ordering. The right-hand side is stored
//! as one extra trailing column, giving the augmented system `[A | b]`.

use faer::sparse::{SparseColMat, Triplet};
use tracing::debug;

use crate::core::{GaussianFactorGraph, Ordering};
use crate::linalg::{LinAlgError, LinAlgResult, SparseMatrix, remap::ColumnOffsets};

/// Assemble `[A | b]` for `graph` with columns laid out by `ordering`.
///
/// Exact zeros in the dense factor blocks are not stored.
///
/// # Errors
/// [`LinAlgError::InvalidInput`] if a factor touches a key that is missing
/// from the ordering, or two factors disagree on a variable's dimension.
pub fn sparse_jacobian(
    graph: &GaussianFactorGraph,
    ordering: &Ordering,
) -> LinAlgResult<SparseMatrix> {
    let offsets = ColumnOffsets::from_graph(graph, ordering)?;
    sparse_jacobian_with_offsets(graph, &offsets)
}

/// Assemble `[A | b]` with columns placed at precomputed `offsets`.
///
/// # Errors
/// [`LinAlgError::InvalidInput`] if a factor touches a key without an offset.
pub fn sparse_jacobian_with_offsets(
    graph: &GaussianFactorGraph,
    offsets: &ColumnOffsets,
) -> LinAlgResult<SparseMatrix> {
    let rhs_col = offsets.total();
    let rows = graph.rows();

    let capacity: usize = graph
        .iter()
        .map(|f| f.rows() * (f.iter().map(|(_, block)| block.ncols()).sum::<usize>() + 1))
        .sum();
    let mut triplets = Vec::with_capacity(capacity);

    let mut row_start = 0;
    for factor in graph.iter() {
        for (key, block) in factor.iter() {
            let col_start = offsets.offset(key).ok_or_else(|| {
                LinAlgError::InvalidInput(format!("Key {key} is not in the ordering"))
            })?;
            for c in 0..block.ncols() {
                for r in 0..block.nrows() {
                    let value = block[(r, c)];
                    if value != 0.0 {
                        triplets.push(Triplet::new(row_start + r, col_start + c, value));
                    }
                }
            }
        }
        for (r, &value) in factor.rhs().iter().enumerate() {
            if value != 0.0 {
                triplets.push(Triplet::new(row_start + r, rhs_col, value));
            }
        }
        row_start += factor.rows();
    }

    debug!(
        "Assembled [A|b]: {} x {} with {} entries",
        rows,
        rhs_col + 1,
        triplets.len()
    );

    SparseColMat::try_new_from_triplets(rows, rhs_col + 1, &triplets)
        .map_err(|e| LinAlgError::SparseMatrixCreation(format!("[A|b]: {:?}", e)))
}
