//! Sparse labeled examples.

use std::collections::{BTreeMap, HashSet};

use crate::error::{BoxerError, BoxerResult};

/// One sparse training or scoring example.
///
/// Features are parallel `(index, value)` lists with distinct indices. Labels
/// map a discrimination id to the single class the point belongs to; a
/// discrimination with no entry means "unlabeled" for that task.
///
/// Only the log-likelihood accumulator changes after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    name: String,
    features: Vec<usize>,
    values: Vec<f64>,
    labels: BTreeMap<usize, usize>,
    log_lik: f64,
    log_lik_count: usize,
}

impl DataPoint {
    /// Build a point from `(feature, value)` pairs and `did -> class` labels.
    ///
    /// # Errors
    /// - `InvalidDataPoint` for repeated feature indices or non-finite values
    pub fn new(
        name: impl Into<String>,
        pairs: impl IntoIterator<Item = (usize, f64)>,
        labels: BTreeMap<usize, usize>,
    ) -> BoxerResult<Self> {
        let name = name.into();
        let mut features = Vec::new();
        let mut values = Vec::new();
        let mut seen = HashSet::new();
        for (j, v) in pairs {
            if !v.is_finite() {
                return Err(BoxerError::InvalidDataPoint {
                    point: name,
                    details: format!("feature {} has non-finite value {}", j, v),
                });
            }
            if !seen.insert(j) {
                return Err(BoxerError::InvalidDataPoint {
                    point: name,
                    details: format!("feature {} appears more than once", j),
                });
            }
            features.push(j);
            values.push(v);
        }
        Ok(Self {
            name,
            features,
            values,
            labels,
            log_lik: 0.0,
            log_lik_count: 0,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn features(&self) -> &[usize] {
        &self.features
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of non-zero features.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.features.len()
    }

    /// `(feature, value)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.features.iter().copied().zip(self.values.iter().copied())
    }

    /// Class of this point in discrimination `did`, if labeled there.
    #[inline]
    pub fn label_for(&self, did: usize) -> Option<usize> {
        self.labels.get(&did).copied()
    }

    /// All `(did, class)` assignments in discrimination order.
    pub fn labels(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.labels.iter().map(|(d, c)| (*d, *c))
    }

    /// True if the point is labeled in any discrimination.
    pub fn is_labeled(&self) -> bool {
        !self.labels.is_empty()
    }

    /// One-hot (or all-false) membership vector over `class_count` classes.
    pub fn membership(&self, did: usize, class_count: usize) -> Vec<bool> {
        let mut y = vec![false; class_count];
        if let Some(c) = self.label_for(did) {
            if c < class_count {
                y[c] = true;
            }
        }
        y
    }

    /// Accumulate the log-likelihood of the true classes under `log_scores`
    /// (indexed `[did][class]`). Returns the amount added.
    pub fn add_log_lik(&mut self, log_scores: &[Vec<f64>]) -> f64 {
        let mut added = 0.0;
        for (did, class) in &self.labels {
            if let Some(s) = log_scores.get(*did).and_then(|row| row.get(*class)) {
                added += s;
                self.log_lik_count += 1;
            }
        }
        self.log_lik += added;
        added
    }

    /// Running log-likelihood total.
    pub fn log_lik(&self) -> f64 {
        self.log_lik
    }

    /// Number of (discrimination, class) terms in the running total.
    pub fn log_lik_count(&self) -> usize {
        self.log_lik_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(usize, usize)]) -> BTreeMap<usize, usize> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_new_keeps_parallel_lists() {
        let p = DataPoint::new("p", vec![(3, 1.0), (1, 2.5)], labels(&[(1, 0)])).unwrap();
        assert_eq!(p.features(), &[3, 1]);
        assert_eq!(p.values(), &[1.0, 2.5]);
        assert_eq!(p.nnz(), 2);
        assert_eq!(p.label_for(1), Some(0));
        assert_eq!(p.label_for(2), None);
        assert!(p.is_labeled());
    }

    #[test]
    fn test_duplicate_feature_rejected() {
        let err = DataPoint::new("p", vec![(1, 1.0), (1, 2.0)], BTreeMap::new()).unwrap_err();
        assert!(matches!(err, BoxerError::InvalidDataPoint { .. }));
    }

    #[test]
    fn test_duplicate_feature_rejected_in_long_list() {
        let mut pairs: Vec<(usize, f64)> = (0..50_000).map(|j| (j, 1.0)).collect();
        assert_eq!(DataPoint::new("wide", pairs.clone(), BTreeMap::new()).unwrap().nnz(), 50_000);
        pairs.push((12_345, 2.0));
        let err = DataPoint::new("wide", pairs, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, BoxerError::InvalidDataPoint { .. }));
    }

    #[test]
    fn test_non_finite_rejected() {
        assert!(DataPoint::new("p", vec![(1, f64::NAN)], BTreeMap::new()).is_err());
        assert!(DataPoint::new("p", vec![(1, f64::INFINITY)], BTreeMap::new()).is_err());
    }

    #[test]
    fn test_membership_vector() {
        let p = DataPoint::new("p", vec![(0, 1.0)], labels(&[(1, 2)])).unwrap();
        assert_eq!(p.membership(1, 3), vec![false, false, true]);
        assert_eq!(p.membership(2, 2), vec![false, false]);
    }

    #[test]
    fn test_add_log_lik_accumulates() {
        let mut p = DataPoint::new("p", vec![(0, 1.0)], labels(&[(1, 1)])).unwrap();
        let scores = vec![vec![0.0], vec![-2.0, -0.5]];
        assert_eq!(p.add_log_lik(&scores), -0.5);
        assert_eq!(p.add_log_lik(&scores), -0.5);
        assert_eq!(p.log_lik(), -1.0);
        assert_eq!(p.log_lik_count(), 2);
    }
}
