//! Variable ordering: the column order of the assembled linear system.
//!
//! The ordering is computed elsewhere (e.g. by a fill-reducing heuristic) and
//! consumed here as an opaque sequence. The same ordering must be used to
//! assemble the Jacobian and to read the solution back; the solver keeps the
//! two in lockstep by owning a single `Ordering`.

use std::ops::Index;

use crate::core::{GaussianFactorGraph, GraphError, GraphResult, Key};

/// Ordered sequence of distinct keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ordering {
    keys: Vec<Key>,
}

impl Ordering {
    /// Create an ordering, rejecting repeated keys.
    pub fn new(keys: Vec<Key>) -> GraphResult<Self> {
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        if let Some(pair) = sorted.windows(2).find(|w| w[0] == w[1]) {
            return Err(GraphError::DuplicateKey(pair[0]));
        }
        Ok(Self { keys })
    }

    /// Keys of `graph` in ascending order
    pub fn natural(graph: &GaussianFactorGraph) -> Self {
        Self { keys: graph.keys() }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Key> + '_ {
        self.keys.iter().copied()
    }

    pub fn as_slice(&self) -> &[Key] {
        &self.keys
    }

    /// Position of `key` in the ordering
    pub fn position(&self, key: Key) -> Option<usize> {
        self.keys.iter().position(|k| *k == key)
    }

    /// Same keys, reversed
    pub fn reversed(&self) -> Self {
        Self {
            keys: self.keys.iter().rev().copied().collect(),
        }
    }
}

impl Index<usize> for Ordering {
    type Output = Key;

    fn index(&self, index: usize) -> &Key {
        &self.keys[index]
    }
}

impl TryFrom<Vec<Key>> for Ordering {
    type Error = GraphError;

    fn try_from(keys: Vec<Key>) -> GraphResult<Self> {
        Self::new(keys)
    }
}

impl<'a> IntoIterator for &'a Ordering {
    type Item = &'a Key;
    type IntoIter = std::slice::Iter<'a, Key>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JacobianFactor;
    use nalgebra::{DMatrix, DVector};

    #[test]
    fn test_ordering_rejects_duplicates() {
        assert_eq!(Ordering::new(vec![3, 1, 3]), Err(GraphError::DuplicateKey(3)));
    }

    #[test]
    fn test_ordering_positions() {
        let ordering = Ordering::new(vec![10, 2, 7]).unwrap();
        assert_eq!(ordering.len(), 3);
        assert_eq!(ordering.position(2), Some(1));
        assert_eq!(ordering.position(5), None);
        assert_eq!(ordering[2], 7);
        assert_eq!(ordering.reversed().as_slice(), &[7, 2, 10]);
    }

    #[test]
    fn test_natural_ordering_is_sorted() {
        let graph: GaussianFactorGraph = [9, 4, 6]
            .into_iter()
            .map(|k| {
                JacobianFactor::unary(k, DMatrix::identity(1, 1), DVector::zeros(1)).unwrap()
            })
            .collect();
        assert_eq!(Ordering::natural(&graph).as_slice(), &[4, 6, 9]);
    }
}
