//! Lazy truncation (L1-style shrinkage) bookkeeping.
//!
//! Truncated gradient shrinks every weight whose magnitude is at most
//! `theta` toward zero by `alpha` once every `k` global steps. Doing that
//! densely touches every allocated row at every event. Instead each row
//! carries the step at which it was last brought up to date, and is caught
//! up with a closed form right before it is read or written:
//!
//! ```text
//! events(row) = t / k - stamp(row) / k
//! w <- truncate(w, events * alpha, theta)
//! ```
//!
//! This equals applying `truncate(w, alpha, theta)` `events` times, because a
//! weight that is not being updated either stays above `theta` (untouched)
//! or keeps shrinking until it reaches zero.

use std::collections::HashMap;

use tracing::trace;

use crate::config::TruncatedGradientConfig;
use crate::matrix::SparseMatrix;

/// One truncation of `value` by `shrink`, guarded by `theta`.
///
/// Values with `|value| > theta` are left alone; others move toward zero by
/// `shrink` without crossing it.
#[inline]
pub fn truncate_value(value: f64, shrink: f64, theta: f64) -> f64 {
    if value.abs() > theta {
        value
    } else if value > 0.0 {
        (value - shrink).max(0.0)
    } else {
        (value + shrink).min(0.0)
    }
}

/// Number of truncation events in the step interval `(from, to]`.
#[inline]
pub fn events_between(from: u64, to: u64, k: u64) -> u64 {
    (to / k).saturating_sub(from / k)
}

/// Truncation state for one weight matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Truncation {
    theta: f64,
    alpha: f64,
    k: u64,
    lazy: bool,
    /// Global step counter.
    t: u64,
    /// Step up to which rows without a stamp are current.
    baseline: u64,
    /// Per-row catch-up stamps, for rows touched since `baseline`.
    stamps: HashMap<usize, u64>,
}

impl Truncation {
    /// Truncation with explicit parameters; `alpha` is the shrink per event.
    pub fn new(theta: f64, alpha: f64, k: u64, lazy: bool) -> Self {
        Self {
            theta,
            alpha,
            k: k.max(1),
            lazy,
            t: 0,
            baseline: 0,
            stamps: HashMap::new(),
        }
    }

    /// Truncation configured from learner parameters.
    pub fn from_config(config: &TruncatedGradientConfig) -> Self {
        Self::new(config.theta, config.truncation_step(), config.k, config.lazy)
    }

    #[inline]
    pub fn t(&self) -> u64 {
        self.t
    }

    /// Restore the step counter, e.g. from a checkpoint. The matrix is
    /// assumed fully caught up at that step.
    pub fn set_t(&mut self, t: u64) {
        self.t = t;
        self.baseline = t;
        self.stamps.clear();
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn k(&self) -> u64 {
        self.k
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    /// False when truncation can never change a weight.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.theta.is_finite() && self.alpha > 0.0
    }

    /// Advance the global step by one. In eager mode a full truncation pass
    /// runs whenever the step reaches a multiple of `k`.
    pub fn request_truncation(&mut self, matrix: &mut SparseMatrix) {
        self.t += 1;
        if !self.lazy && self.t % self.k == 0 {
            self.apply_truncation_to_all_rows(matrix);
        }
    }

    /// Pending truncation events for `row`.
    pub fn pending_events(&self, row: usize) -> u64 {
        let stamp = self.stamps.get(&row).copied().unwrap_or(self.baseline);
        events_between(stamp, self.t, self.k)
    }

    /// Bring one row up to date and stamp it with the current step.
    ///
    /// Must run before the row is read or written during training.
    pub fn apply_truncation(&mut self, matrix: &mut SparseMatrix, row: usize) {
        if self.is_active() {
            let events = self.pending_events(row);
            if events > 0 {
                if let Some(values) = matrix.row(row) {
                    let shrink = events as f64 * self.alpha;
                    let theta = self.theta;
                    let caught_up: Vec<f64> = values
                        .iter()
                        .map(|w| truncate_value(*w, shrink, theta))
                        .collect();
                    matrix.row_mut(row).copy_from_slice(&caught_up);
                    trace!(row, events, "caught up truncation");
                }
            }
        }
        self.stamps.insert(row, self.t);
    }

    /// Bring every allocated row up to date.
    ///
    /// Runs at batch boundaries and before serialization so persisted or
    /// reported weights are never stale.
    pub fn apply_truncation_to_all_rows(&mut self, matrix: &mut SparseMatrix) {
        if self.is_active() {
            let (theta, alpha, t, k, baseline) =
                (self.theta, self.alpha, self.t, self.k, self.baseline);
            for (row, values) in matrix.rows_mut() {
                let stamp = self.stamps.get(&row).copied().unwrap_or(baseline);
                let events = events_between(stamp, t, k);
                if events > 0 {
                    let shrink = events as f64 * alpha;
                    for w in values.iter_mut() {
                        *w = truncate_value(*w, shrink, theta);
                    }
                }
            }
        }
        self.baseline = self.t;
        self.stamps.clear();
    }

    /// Independent copy for another matrix, keeping `t` and all parameters.
    ///
    /// The copy shares no state with `self`; per-row stamps are carried over
    /// so a cloned matrix continues exactly where this one left off.
    pub fn live_copy(&self) -> Self {
        self.clone()
    }

    /// One-line summary of the truncation parameters.
    pub fn describe(&self) -> String {
        let theta = if self.theta.is_infinite() {
            "INF".to_string()
        } else {
            self.theta.to_string()
        };
        format!(
            "Truncation(theta={}, alpha={}, K={}, lazy={}, t={})",
            theta, self.alpha, self.k, self.lazy, self.t
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_value_respects_threshold() {
        assert!((truncate_value(0.5, 0.2, 1.0) - 0.3).abs() < 1e-12);
        assert!((truncate_value(-0.5, 0.2, 1.0) + 0.3).abs() < 1e-12);
        assert_eq!(truncate_value(0.1, 0.2, 1.0), 0.0);
        assert_eq!(truncate_value(-0.1, 0.2, 1.0), 0.0);
        assert_eq!(truncate_value(2.0, 0.2, 1.0), 2.0);
        assert_eq!(truncate_value(1.0, 0.25, 1.0), 0.75);
    }

    #[test]
    fn test_events_between() {
        assert_eq!(events_between(0, 10, 10), 1);
        assert_eq!(events_between(9, 10, 10), 1);
        assert_eq!(events_between(10, 19, 10), 0);
        assert_eq!(events_between(3, 25, 10), 2);
        assert_eq!(events_between(4, 7, 1), 3);
    }

    #[test]
    fn test_infinite_theta_is_inactive() {
        let mut trunc = Truncation::new(f64::INFINITY, 0.5, 1, true);
        assert!(!trunc.is_active());
        let mut m = SparseMatrix::new(1);
        m.set_row(0, vec![0.3]);
        for _ in 0..5 {
            trunc.request_truncation(&mut m);
        }
        trunc.apply_truncation(&mut m, 0);
        trunc.apply_truncation_to_all_rows(&mut m);
        assert_eq!(m.get(0, 0), 0.3);
        assert_eq!(trunc.t(), 5);
    }

    #[test]
    fn test_lazy_catch_up_matches_repeated_truncation() {
        let mut trunc = Truncation::new(1.0, 0.1, 2, true);
        let mut m = SparseMatrix::new(2);
        m.set_row(3, vec![0.65, -0.25]);
        trunc.set_t(0);
        for _ in 0..5 {
            trunc.request_truncation(&mut m);
        }
        // steps 2 and 4 are events
        assert_eq!(trunc.pending_events(3), 2);
        trunc.apply_truncation(&mut m, 3);
        assert!((m.get(3, 0) - 0.45).abs() < 1e-12);
        assert!((m.get(3, 1) + 0.05).abs() < 1e-12);
        assert_eq!(trunc.pending_events(3), 0);
    }

    #[test]
    fn test_eager_mode_truncates_every_k_steps() {
        let mut trunc = Truncation::new(1.0, 0.1, 3, false);
        let mut m = SparseMatrix::new(1);
        m.set_row(0, vec![0.5]);
        trunc.request_truncation(&mut m);
        trunc.request_truncation(&mut m);
        assert_eq!(m.get(0, 0), 0.5);
        trunc.request_truncation(&mut m);
        assert!((m.get(0, 0) - 0.4).abs() < 1e-12);
        trunc.apply_truncation(&mut m, 0);
        assert!((m.get(0, 0) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_unallocated_row_stays_unallocated() {
        let mut trunc = Truncation::new(1.0, 0.1, 1, true);
        let mut m = SparseMatrix::new(2);
        trunc.request_truncation(&mut m);
        trunc.apply_truncation(&mut m, 42);
        assert!(m.row(42).is_none());
        assert_eq!(trunc.pending_events(42), 0);
    }

    #[test]
    fn test_all_rows_resets_stamps() {
        let mut trunc = Truncation::new(1.0, 0.1, 1, true);
        let mut m = SparseMatrix::new(1);
        m.set_row(0, vec![0.5]);
        m.set_row(1, vec![-0.5]);
        trunc.request_truncation(&mut m);
        trunc.apply_truncation(&mut m, 0);
        trunc.request_truncation(&mut m);
        trunc.apply_truncation_to_all_rows(&mut m);
        assert!((m.get(0, 0) - 0.3).abs() < 1e-12);
        assert!((m.get(1, 0) + 0.3).abs() < 1e-12);
        assert_eq!(trunc.pending_events(0), 0);
        assert_eq!(trunc.pending_events(1), 0);
    }

    #[test]
    fn test_live_copy_is_independent() {
        let mut trunc = Truncation::new(1.0, 0.1, 1, true);
        let mut m = SparseMatrix::new(1);
        trunc.request_truncation(&mut m);
        let mut copy = trunc.live_copy();
        assert_eq!(copy.t(), 1);
        copy.request_truncation(&mut m);
        assert_eq!(copy.t(), 2);
        assert_eq!(trunc.t(), 1);
        assert_eq!(copy.theta(), trunc.theta());
        assert_eq!(copy.k(), trunc.k());
        assert_eq!(copy.alpha(), trunc.alpha());
    }

    #[test]
    fn test_describe_reports_inf() {
        let trunc = Truncation::new(f64::INFINITY, 0.1, 10, true);
        assert!(trunc.describe().contains("theta=INF"));
    }
}
