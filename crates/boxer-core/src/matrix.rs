//! Sparse, row-indexed weight matrix.
//!
//! One row per feature index, one column per class of a single
//! discrimination. Rows are allocated on first write; an unallocated row
//! reads as all zeros. Rows are kept in a `BTreeMap` so that iteration (and
//! therefore checkpoint output) is ordered by feature index.

use std::collections::BTreeMap;
use std::mem::size_of;

/// Sparse weight matrix with a fixed column count.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseMatrix {
    width: usize,
    rows: BTreeMap<usize, Vec<f64>>,
}

impl SparseMatrix {
    /// Create an empty matrix whose rows have `width` columns.
    pub fn new(width: usize) -> Self {
        Self {
            width,
            rows: BTreeMap::new(),
        }
    }

    /// Number of columns (classes) per row.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of allocated rows.
    #[inline]
    pub fn allocated_rows(&self) -> usize {
        self.rows.len()
    }

    /// True if no row has been allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Allocated row, if any.
    #[inline]
    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(&index).map(Vec::as_slice)
    }

    /// Single cell; zero for unallocated rows.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.rows
            .get(&row)
            .and_then(|r| r.get(col).copied())
            .unwrap_or(0.0)
    }

    /// Mutable view of a row, allocating a zero row on first touch.
    pub fn row_mut(&mut self, index: usize) -> &mut [f64] {
        let width = self.width;
        self.rows
            .entry(index)
            .or_insert_with(|| vec![0.0; width])
            .as_mut_slice()
    }

    /// Adds `scale * delta` to the row, allocating it on first touch.
    ///
    /// `delta` must have exactly `width()` entries.
    pub fn add_to_row(&mut self, index: usize, delta: &[f64], scale: f64) {
        debug_assert_eq!(delta.len(), self.width, "delta width mismatch");
        let row = self.row_mut(index);
        for (w, d) in row.iter_mut().zip(delta) {
            *w += scale * d;
        }
    }

    /// Replace a whole row. Used when restoring from a checkpoint.
    pub fn set_row(&mut self, index: usize, values: Vec<f64>) {
        debug_assert_eq!(values.len(), self.width, "row width mismatch");
        self.rows.insert(index, values);
    }

    /// Allocated rows in ascending feature order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[f64])> {
        self.rows.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    /// Allocated row indices in ascending order.
    pub fn row_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows.keys().copied()
    }

    /// Per-class linear scores `s[c] = sum_h values[h] * W[features[h]][c]`.
    pub fn linear_scores(&self, features: &[usize], values: &[f64]) -> Vec<f64> {
        let mut scores = vec![0.0; self.width];
        for (j, v) in features.iter().zip(values) {
            if let Some(row) = self.rows.get(j) {
                for (s, w) in scores.iter_mut().zip(row) {
                    *s += v * w;
                }
            }
        }
        scores
    }

    /// Rough heap footprint in bytes.
    pub fn memory_estimate(&self) -> usize {
        let per_row = size_of::<usize>() + size_of::<Vec<f64>>() + self.width * size_of::<f64>();
        size_of::<Self>() + self.rows.len() * per_row
    }

    pub(crate) fn rows_mut(&mut self) -> impl Iterator<Item = (usize, &mut Vec<f64>)> {
        self.rows.iter_mut().map(|(k, v)| (*k, v))
    }
}
