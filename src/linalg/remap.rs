//! Bookkeeping between keys, ordering positions and column offsets.
//!
//! Two derived maps are built once per solve:
//! - [`DimensionMap`]: key -> block size, scanned from the factors
//! - [`ColumnOffsets`]: key -> first column, a prefix sum over the ordering
//!
//! [`remap`] is a pure function of these maps and the flat solution vector.

use std::collections::BTreeMap;

use nalgebra::DVector;

use crate::core::{GaussianFactorGraph, GraphError, Key, Ordering, VectorValues};
use crate::linalg::{LinAlgError, LinAlgResult};

/// Block size of every variable touched by at least one factor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DimensionMap {
    dims: BTreeMap<Key, usize>,
}

impl DimensionMap {
    /// Scan all factors and record each variable's reported dimension.
    ///
    /// # Errors
    /// [`GraphError::DimensionConflict`] if two factors report different
    /// dimensions for the same key.
    pub fn from_graph(graph: &GaussianFactorGraph) -> Result<Self, GraphError> {
        let mut dims = BTreeMap::new();
        for factor in graph.iter() {
            for (position, &key) in factor.keys().iter().enumerate() {
                let dim = factor.dim(position);
                match dims.insert(key, dim) {
                    Some(first) if first != dim => {
                        return Err(GraphError::DimensionConflict {
                            key,
                            first,
                            second: dim,
                        });
                    }
                    _ => {}
                }
            }
        }
        Ok(Self { dims })
    }

    pub fn get(&self, key: Key) -> Option<usize> {
        self.dims.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, usize)> + '_ {
        self.dims.iter().map(|(&k, &d)| (k, d))
    }
}

impl FromIterator<(Key, usize)> for DimensionMap {
    fn from_iter<I: IntoIterator<Item = (Key, usize)>>(iter: I) -> Self {
        Self {
            dims: iter.into_iter().collect(),
        }
    }
}

/// First column of every variable in the assembled system
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnOffsets {
    offsets: BTreeMap<Key, usize>,
    total: usize,
}

impl ColumnOffsets {
    /// Prefix sum of block sizes in ordering order.
    ///
    /// Keys in the ordering that no factor touches take zero columns.
    pub fn new(ordering: &Ordering, dims: &DimensionMap) -> Self {
        let mut offsets = BTreeMap::new();
        let mut current = 0;
        for key in ordering.iter() {
            offsets.insert(key, current);
            current += dims.get(key).unwrap_or(0);
        }
        Self {
            offsets,
            total: current,
        }
    }

    /// Derive dimensions from `graph` and lay them out by `ordering`.
    pub fn from_graph(graph: &GaussianFactorGraph, ordering: &Ordering) -> LinAlgResult<Self> {
        let dims = DimensionMap::from_graph(graph)
            .map_err(|e| LinAlgError::InvalidInput(e.to_string()))?;
        Ok(Self::new(ordering, &dims))
    }

    pub fn offset(&self, key: Key) -> Option<usize> {
        self.offsets.get(&key).copied()
    }

    /// Number of scalar unknowns
    pub fn total(&self) -> usize {
        self.total
    }
}

/// Slice the flat `solution` into one segment per key of `dims`.
///
/// The ordering must be the one used to assemble the system. A different
/// ordering of the same total width cannot be detected here and yields
/// segments taken from the wrong columns.
///
/// # Errors
/// [`LinAlgError::InvalidInput`] if the solution length differs from the
/// total width, or a key of `dims` is missing from the ordering.
pub fn remap(
    solution: &[f64],
    ordering: &Ordering,
    dims: &DimensionMap,
) -> LinAlgResult<VectorValues> {
    remap_with_offsets(solution, &ColumnOffsets::new(ordering, dims), dims)
}

/// [`remap`] with offsets already computed for the assembly.
pub fn remap_with_offsets(
    solution: &[f64],
    offsets: &ColumnOffsets,
    dims: &DimensionMap,
) -> LinAlgResult<VectorValues> {
    if solution.len() != offsets.total() {
        return Err(LinAlgError::InvalidInput(format!(
            "Solution has {} entries, ordering spans {} columns",
            solution.len(),
            offsets.total()
        )));
    }

    dims.iter()
        .map(|(key, dim)| {
            let start = offsets.offset(key).ok_or_else(|| {
                LinAlgError::InvalidInput(format!("Key {key} is not in the ordering"))
            })?;
            Ok((key, DVector::from_column_slice(&solution[start..start + dim])))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JacobianFactor;
    use nalgebra::DMatrix;

    fn graph() -> GaussianFactorGraph {
        let mut graph = GaussianFactorGraph::new();
        graph.push(
            JacobianFactor::unary(0, DMatrix::identity(2, 2), DVector::zeros(2)).unwrap(),
        );
        graph.push(
            JacobianFactor::binary(
                0,
                DMatrix::zeros(3, 2),
                1,
                DMatrix::identity(3, 3),
                DVector::zeros(3),
            )
            .unwrap(),
        );
        graph
    }

    #[test]
    fn test_column_offsets_prefix_sum() {
        let graph = graph();
        let offsets = ColumnOffsets::from_graph(&graph, &Ordering::new(vec![0, 1]).unwrap())
            .unwrap();
        assert_eq!(offsets.offset(0), Some(0));
        assert_eq!(offsets.offset(1), Some(2));
        assert_eq!(offsets.total(), 5);

        let reversed = ColumnOffsets::from_graph(&graph, &Ordering::new(vec![1, 0]).unwrap())
            .unwrap();
        assert_eq!(reversed.offset(1), Some(0));
        assert_eq!(reversed.offset(0), Some(3));
    }

    #[test]
    fn test_unreferenced_ordering_key_takes_no_columns() {
        let graph = graph();
        let ordering = Ordering::new(vec![0, 42, 1]).unwrap();
        let offsets = ColumnOffsets::from_graph(&graph, &ordering).unwrap();
        assert_eq!(offsets.offset(42), Some(2));
        assert_eq!(offsets.offset(1), Some(2));
        assert_eq!(offsets.total(), 5);

        let dims = DimensionMap::from_graph(&graph).unwrap();
        let values = remap(&[1.0, 2.0, 3.0, 4.0, 5.0], &ordering, &dims).unwrap();
        assert_eq!(values.len(), 2);
        assert!(!values.contains(42));
        assert_eq!(values.get(1).unwrap().as_slice(), &[3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_dimension_conflict_is_rejected() {
        let mut graph = graph();
        graph.push(
            JacobianFactor::unary(1, DMatrix::identity(2, 2), DVector::zeros(2)).unwrap(),
        );
        assert_eq!(
            DimensionMap::from_graph(&graph),
            Err(GraphError::DimensionConflict {
                key: 1,
                first: 3,
                second: 2
            })
        );
    }

    #[test]
    fn test_remap_rejects_wrong_length() {
        let dims: DimensionMap = [(0, 2), (1, 3)].into_iter().collect();
        let ordering = Ordering::new(vec![0, 1]).unwrap();
        assert!(matches!(
            remap(&[0.0; 4], &ordering, &dims),
            Err(LinAlgError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_remap_with_offsets_rejects_key_outside_offsets() {
        let dims: DimensionMap = [(0, 2), (1, 3)].into_iter().collect();
        let offsets = ColumnOffsets::new(&Ordering::new(vec![0]).unwrap(), &dims);
        assert_eq!(offsets.total(), 2);
        assert!(matches!(
            remap_with_offsets(&[1.0, 2.0], &offsets, &dims),
            Err(LinAlgError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_remap_segments_follow_offsets() {
        let dims: DimensionMap = [(7, 1), (3, 2)].into_iter().collect();
        let ordering = Ordering::new(vec![7, 3]).unwrap();
        let values = remap(&[9.0, 1.0, 2.0], &ordering, &dims).unwrap();
        assert_eq!(values.get(7).unwrap().as_slice(), &[9.0]);
        assert_eq!(values.get(3).unwrap().as_slice(), &[1.0, 2.0]);
        assert_eq!(values.to_flat(&ordering).as_slice(), &[9.0, 1.0, 2.0]);
    }
}
