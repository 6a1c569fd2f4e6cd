//! Linear Gaussian factors and the graph that holds them.
//!
//! A [`JacobianFactor`] represents the residual `Σ_j A_j x_j - b` over the
//! variables it touches. Each key owns a dense block `A_j` with the same
//! number of rows as the factor; the block's column count is the dimension
//! the factor reports for that variable.

use nalgebra::{DMatrix, DVector};

use crate::core::{GraphError, GraphResult, Key, VectorValues};

/// Dense linear factor `‖Σ_j A_j x_j - b‖²`
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianFactor {
    keys: Vec<Key>,
    blocks: Vec<DMatrix<f64>>,
    rhs: DVector<f64>,
}

impl JacobianFactor {
    /// Create a factor from keys, their blocks and the right-hand side.
    ///
    /// # Errors
    /// Returns [`GraphError`] if keys and blocks do not pair up, a key repeats,
    /// or a block row count differs from `rhs.len()`.
    pub fn new(
        keys: Vec<Key>,
        blocks: Vec<DMatrix<f64>>,
        rhs: DVector<f64>,
    ) -> GraphResult<Self> {
        if keys.len() != blocks.len() {
            return Err(GraphError::KeyBlockMismatch {
                keys: keys.len(),
                blocks: blocks.len(),
            });
        }
        for (i, key) in keys.iter().enumerate() {
            if keys[..i].contains(key) {
                return Err(GraphError::DuplicateKey(*key));
            }
        }
        for (key, block) in keys.iter().zip(&blocks) {
            if block.nrows() != rhs.len() {
                return Err(GraphError::BlockRowMismatch {
                    key: *key,
                    expected: rhs.len(),
                    actual: block.nrows(),
                });
            }
        }
        Ok(Self { keys, blocks, rhs })
    }

    /// Factor on a single variable, e.g. a prior.
    pub fn unary(key: Key, a: DMatrix<f64>, rhs: DVector<f64>) -> GraphResult<Self> {
        Self::new(vec![key], vec![a], rhs)
    }

    /// Factor linking two variables, e.g. a linearized between factor.
    pub fn binary(
        key1: Key,
        a1: DMatrix<f64>,
        key2: Key,
        a2: DMatrix<f64>,
        rhs: DVector<f64>,
    ) -> GraphResult<Self> {
        Self::new(vec![key1, key2], vec![a1, a2], rhs)
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Number of residual rows this factor contributes
    pub fn rows(&self) -> usize {
        self.rhs.len()
    }

    /// Dimension reported for the key at `position`
    pub fn dim(&self, position: usize) -> usize {
        self.blocks[position].ncols()
    }

    /// Dimension reported for `key`, if the factor touches it
    pub fn dim_of(&self, key: Key) -> Option<usize> {
        self.keys
            .iter()
            .position(|k| *k == key)
            .map(|position| self.dim(position))
    }

    pub fn block(&self, position: usize) -> &DMatrix<f64> {
        &self.blocks[position]
    }

    pub fn rhs(&self) -> &DVector<f64> {
        &self.rhs
    }

    /// Iterate `(key, block)` pairs in factor order
    pub fn iter(&self) -> impl Iterator<Item = (Key, &DMatrix<f64>)> {
        self.keys.iter().copied().zip(self.blocks.iter())
    }

    /// Residual `Σ_j A_j x_j - b` evaluated at `values`
    pub fn residual(&self, values: &VectorValues) -> GraphResult<DVector<f64>> {
        let mut residual = -self.rhs.clone();
        for (key, block) in self.iter() {
            let x = values.get(key).ok_or(GraphError::MissingValue(key))?;
            if x.len() != block.ncols() {
                return Err(GraphError::ValueDimension {
                    key,
                    expected: block.ncols(),
                    actual: x.len(),
                });
            }
            residual += block * x;
        }
        Ok(residual)
    }

    /// Half squared residual norm at `values`
    pub fn error(&self, values: &VectorValues) -> GraphResult<f64> {
        Ok(0.5 * self.residual(values)?.norm_squared())
    }
}

/// Ordered collection of linear factors.
///
/// Slots may be empty (`None`) after a factor is removed; empty slots are
/// skipped by every consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GaussianFactorGraph {
    factors: Vec<Option<JacobianFactor>>,
}

impl GaussianFactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a factor and return its slot index
    pub fn push(&mut self, factor: JacobianFactor) -> usize {
        self.factors.push(Some(factor));
        self.factors.len() - 1
    }

    /// Take the factor out of `slot`, leaving the slot empty
    pub fn remove(&mut self, slot: usize) -> Option<JacobianFactor> {
        self.factors.get_mut(slot).and_then(Option::take)
    }

    /// Number of slots, including empty ones
    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.iter().all(Option::is_none)
    }

    /// Iterate over the non-empty factors
    pub fn iter(&self) -> impl Iterator<Item = &JacobianFactor> {
        self.factors.iter().flatten()
    }

    /// Sorted, de-duplicated keys of every variable touched by a factor
    pub fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.iter().flat_map(|f| f.keys().iter().copied()).collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// Total number of residual rows
    pub fn rows(&self) -> usize {
        self.iter().map(JacobianFactor::rows).sum()
    }

    /// Sum of the factor errors at `values`
    pub fn error(&self, values: &VectorValues) -> GraphResult<f64> {
        self.iter().map(|f| f.error(values)).sum()
    }
}

impl FromIterator<JacobianFactor> for GaussianFactorGraph {
    fn from_iter<I: IntoIterator<Item = JacobianFactor>>(iter: I) -> Self {
        Self {
            factors: iter.into_iter().map(Some).collect(),
        }
    }
}
