//! Per-variable solution container.

use std::collections::BTreeMap;
use std::collections::btree_map;

use nalgebra::DVector;

use crate::core::{Key, Ordering};

/// Mapping from key to the dense vector solved for it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorValues {
    values: BTreeMap<Key, DVector<f64>>,
}

impl VectorValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a segment, returning the previous one for `key` if any
    pub fn insert(&mut self, key: Key, value: DVector<f64>) -> Option<DVector<f64>> {
        self.values.insert(key, value)
    }

    pub fn get(&self, key: Key) -> Option<&DVector<f64>> {
        self.values.get(&key)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.values.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Keys in ascending order
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.values.keys().copied()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, Key, DVector<f64>> {
        self.values.iter()
    }

    /// Sum of segment lengths
    pub fn dim(&self) -> usize {
        self.values.values().map(DVector::len).sum()
    }

    /// Concatenate the segments of the keys in `ordering` that are present.
    ///
    /// For a solution returned by the solver this reproduces the flat
    /// solution vector.
    pub fn to_flat(&self, ordering: &Ordering) -> DVector<f64> {
        let segments: Vec<f64> = ordering
            .iter()
            .filter_map(|key| self.values.get(&key))
            .flat_map(|segment| segment.iter().copied())
            .collect();
        DVector::from_vec(segments)
    }
}

impl<'a> IntoIterator for &'a VectorValues {
    type Item = (&'a Key, &'a DVector<f64>);
    type IntoIter = btree_map::Iter<'a, Key, DVector<f64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

impl FromIterator<(Key, DVector<f64>)> for VectorValues {
    fn from_iter<I: IntoIterator<Item = (Key, DVector<f64>)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
