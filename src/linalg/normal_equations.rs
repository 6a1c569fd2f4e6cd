//! Reduction of the augmented least-squares system to normal equations.
//!
//! Given `[A | b]` this computes `AᵀA` and `Aᵀb`. Only the upper triangle
//! (`row <= col`) of `AᵀA` is stored; the Cholesky primitive reads the same
//! arrays as the lower triangle in compressed-row form.
//!
//! Rank-deficient systems are reduced without complaint. Singularity is
//! detected later, by the factorization.

use std::ops::Mul;

use faer::Mat;
use faer::sparse::{SparseColMat, Triplet};
use tracing::debug;

use crate::linalg::{FaerMatrix, LinAlgError, LinAlgResult, SparseMatrix};

/// `AᵀA x = Aᵀb` with `AᵀA` in upper-triangular compressed-column storage
#[derive(Debug, Clone)]
pub struct NormalEquations {
    /// Upper triangle of `AᵀA`, `n × n`
    pub ata: SparseMatrix,
    /// `Aᵀb`, `n × 1`
    pub atb: FaerMatrix,
}

impl NormalEquations {
    /// Reduce the augmented matrix `[A | b]` (`rows × (n + 1)`).
    ///
    /// # Errors
    /// [`LinAlgError::InvalidInput`] if the matrix has no rhs column, and the
    /// conversion errors of faer if the transpose cannot be formed.
    pub fn from_augmented(ab: &SparseMatrix) -> LinAlgResult<Self> {
        if ab.ncols() == 0 {
            return Err(LinAlgError::InvalidInput(
                "Augmented matrix must have a right-hand side column".to_string(),
            ));
        }
        let (a, b) = split_augmented(ab)?;
        let n = a.ncols();

        let at = a
            .as_ref()
            .transpose()
            .to_col_major()
            .map_err(|e| LinAlgError::MatrixConversion(format!("Transpose failed: {:?}", e)))?;

        let atb = a.as_ref().transpose().mul(b.as_ref());
        let ata = upper_triangle(&at.mul(a.as_ref()))?;

        debug!(
            "Normal equations: {} x {}, {} upper entries from {} Jacobian entries",
            n,
            n,
            ata.symbolic().compute_nnz(),
            a.symbolic().compute_nnz()
        );

        Ok(Self { ata, atb })
    }

    /// Number of unknowns
    pub fn dim(&self) -> usize {
        self.atb.nrows()
    }

    /// `Aᵀb` as a host slice in column order
    pub fn rhs(&self) -> Vec<f64> {
        (0..self.atb.nrows()).map(|i| self.atb[(i, 0)]).collect()
    }
}

/// Split `[A | b]` into the sparse `A` and a dense `b`.
fn split_augmented(ab: &SparseMatrix) -> LinAlgResult<(SparseMatrix, FaerMatrix)> {
    let rows = ab.nrows();
    let n = ab.ncols() - 1;

    let mut triplets = Vec::new();
    for col in 0..n {
        let row_idx = ab.symbolic().row_idx_of_col_raw(col);
        let vals = ab.val_of_col(col);
        for (&row, &val) in row_idx.iter().zip(vals) {
            triplets.push(Triplet::new(row, col, val));
        }
    }
    let a = SparseColMat::try_new_from_triplets(rows, n, &triplets)
        .map_err(|e| LinAlgError::SparseMatrixCreation(format!("A: {:?}", e)))?;

    let mut b = Mat::<f64>::zeros(rows, 1);
    let row_idx = ab.symbolic().row_idx_of_col_raw(n);
    let vals = ab.val_of_col(n);
    for (&row, &val) in row_idx.iter().zip(vals) {
        b[(row, 0)] += val;
    }

    Ok((a, b))
}

/// Keep the entries of `full` with `row <= col`.
fn upper_triangle(full: &SparseMatrix) -> LinAlgResult<SparseMatrix> {
    let symbolic = full.symbolic();
    let triplets: Vec<_> = (0..full.ncols())
        .flat_map(|col| {
            symbolic
                .row_idx_of_col_raw(col)
                .iter()
                .zip(full.val_of_col(col))
                .filter(move |&(&row, _)| row <= col)
                .map(move |(&row, &value)| Triplet::new(row, col, value))
        })
        .collect();

    SparseColMat::try_new_from_triplets(full.nrows(), full.ncols(), &triplets)
        .map_err(|e| LinAlgError::SparseMatrixCreation(format!("AtA: {:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn sparse_from_dense(m: &DMatrix<f64>) -> SparseMatrix {
        let mut triplets = Vec::new();
        for c in 0..m.ncols() {
            for r in 0..m.nrows() {
                if m[(r, c)] != 0.0 {
                    triplets.push(Triplet::new(r, c, m[(r, c)]));
                }
            }
        }
        SparseColMat::try_new_from_triplets(m.nrows(), m.ncols(), &triplets).unwrap()
    }

    fn dense(m: &SparseMatrix) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(m.nrows(), m.ncols());
        for col in 0..m.ncols() {
            let rows = m.symbolic().row_idx_of_col_raw(col);
            let vals = m.val_of_col(col);
            for (&row, &val) in rows.iter().zip(vals) {
                out[(row, col)] += val;
            }
        }
        out
    }

    fn augmented() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            4,
            4,
            &[
                1.5, 0.8, 0.0, 0.5, //
                0.0, 2.0, 1.2, -0.3, //
                0.9, 0.0, 0.0, 0.8, //
                0.0, 0.0, 1.1, -0.2,
            ],
        )
    }

    #[test]
    fn test_matches_dense_normal_equations() {
        let ab = augmented();
        let a = ab.columns(0, 3).into_owned();
        let b = ab.column(3).into_owned();
        let expected_ata = a.transpose() * &a;
        let expected_atb = a.transpose() * b;

        let normal = NormalEquations::from_augmented(&sparse_from_dense(&ab)).unwrap();
        let ata = dense(&normal.ata);

        assert_eq!(normal.dim(), 3);
        for j in 0..3 {
            for i in 0..3 {
                if i <= j {
                    assert!((ata[(i, j)] - expected_ata[(i, j)]).abs() < 1e-12);
                } else {
                    assert_eq!(ata[(i, j)], 0.0, "lower entry ({i},{j}) stored");
                }
            }
            assert!((normal.atb[(j, 0)] - expected_atb[j]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_upper_storage_has_sorted_rows() {
        let normal = NormalEquations::from_augmented(&sparse_from_dense(&augmented())).unwrap();
        for col in 0..normal.ata.ncols() {
            let rows = normal.ata.symbolic().row_idx_of_col_raw(col);
            assert!(rows.windows(2).all(|w| w[0] < w[1]));
            assert!(rows.iter().all(|&r| r <= col));
        }
    }

    #[test]
    fn test_upper_storage_keeps_only_coupled_pairs() {
        // Columns 0 and 2 share no row, so (0, 2) is never stored
        let normal = NormalEquations::from_augmented(&sparse_from_dense(&augmented())).unwrap();
        assert_eq!(normal.ata.symbolic().compute_nnz(), 5);
        assert!(!normal.ata.symbolic().row_idx_of_col_raw(2).contains(&0));
    }

    #[test]
    fn test_rank_deficient_is_not_rejected() {
        // Column 1 is never touched
        let ab = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 1.0, 2.0, 0.0, 1.0]);
        let normal = NormalEquations::from_augmented(&sparse_from_dense(&ab)).unwrap();
        let ata = dense(&normal.ata);
        assert!((ata[(0, 0)] - 5.0).abs() < 1e-12);
        assert_eq!(ata[(1, 1)], 0.0);
        assert_eq!(normal.rhs(), vec![3.0, 0.0]);
    }

    #[test]
    fn test_missing_rhs_column_is_rejected() {
        let empty = SparseColMat::<usize, f64>::try_new_from_triplets(2, 0, &[]).unwrap();
        assert!(matches!(
            NormalEquations::from_augmented(&empty),
            Err(LinAlgError::InvalidInput(_))
        ));
    }
}
