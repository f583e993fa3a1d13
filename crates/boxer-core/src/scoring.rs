//! Score conversion, rendering, and evaluation tallies.
//!
//! Scores are per-discrimination, per-class log-probabilities indexed
//! `[did][class]`. Rendered probabilities always use three decimals.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::data::{DataPoint, Registry};
use crate::learner::process::LOG_FLOOR;

/// Log-softmax of raw linear scores, computed around the maximum so large
/// scores cannot overflow.
pub fn log_softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        let uniform = -(scores.len() as f64).ln();
        return vec![uniform; scores.len()];
    }
    let sum: f64 = scores.iter().map(|s| (s - max).exp()).sum();
    let log_z = max + sum.ln();
    scores.iter().map(|s| s - log_z).collect()
}

/// Probabilities from log-scores. Values at or below [`LOG_FLOOR`] map to 0.
pub fn exp_prob(log_scores: &[f64]) -> Vec<f64> {
    log_scores
        .iter()
        .map(|s| if *s <= LOG_FLOOR { 0.0 } else { s.exp() })
        .collect()
}

/// Fixed three-decimal rendering.
#[inline]
pub fn format_probability(p: f64) -> String {
    format!("{:.3}", p)
}

/// `discrimination -> class -> probability` with rendered probabilities.
pub fn probability_map(
    registry: &Registry,
    log_scores: &[Vec<f64>],
) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (dis, scores) in registry.discriminations().iter().zip(log_scores) {
        let classes = dis
            .classes()
            .iter()
            .zip(exp_prob(scores))
            .map(|(c, p)| (c.clone(), format_probability(p)))
            .collect();
        out.insert(dis.name().to_string(), classes);
    }
    out
}

/// One line per discrimination: `name: class prob class prob ...`.
pub fn describe_scores(registry: &Registry, log_scores: &[Vec<f64>]) -> String {
    let mut out = String::new();
    for (dis, scores) in registry.discriminations().iter().zip(log_scores) {
        let _ = write!(out, "{}:", dis.name());
        for (class, p) in dis.classes().iter().zip(exp_prob(scores)) {
            let _ = write!(out, " {} {}", class, format_probability(p));
        }
        out.push('\n');
    }
    out
}

/// Index of the highest score; the first one wins ties.
pub fn best_class(scores: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, s) in scores.iter().enumerate() {
        match best {
            Some((_, b)) if *s <= b => {}
            _ => best = Some((i, *s)),
        }
    }
    best.map(|(i, _)| i)
}

/// Accuracy and log-likelihood for one discrimination.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiscriminationTally {
    pub scored: usize,
    pub correct: usize,
    pub log_lik: f64,
}

impl DiscriminationTally {
    pub fn accuracy(&self) -> f64 {
        if self.scored == 0 {
            0.0
        } else {
            self.correct as f64 / self.scored as f64
        }
    }

    pub fn mean_log_lik(&self) -> f64 {
        if self.scored == 0 {
            0.0
        } else {
            self.log_lik / self.scored as f64
        }
    }
}

/// Running evaluation over scored, labeled points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreTally {
    per_discrimination: Vec<DiscriminationTally>,
}

impl ScoreTally {
    pub fn new(discriminations: usize) -> Self {
        Self {
            per_discrimination: vec![DiscriminationTally::default(); discriminations],
        }
    }

    /// Count a point's scores against its labels. Unlabeled discriminations
    /// are skipped.
    pub fn eval_scores(&mut self, point: &DataPoint, log_scores: &[Vec<f64>]) {
        for (did, class) in point.labels() {
            let Some(scores) = log_scores.get(did) else {
                continue;
            };
            let Some(score) = scores.get(class) else {
                continue;
            };
            if self.per_discrimination.len() <= did {
                self.per_discrimination
                    .resize(did + 1, DiscriminationTally::default());
            }
            let tally = &mut self.per_discrimination[did];
            tally.scored += 1;
            tally.log_lik += score;
            if best_class(scores) == Some(class) {
                tally.correct += 1;
            }
        }
    }

    /// Like [`eval_scores`](Self::eval_scores) and also adds to the point's
    /// own log-likelihood.
    pub fn record(&mut self, point: &mut DataPoint, log_scores: &[Vec<f64>]) {
        self.eval_scores(point, log_scores);
        point.add_log_lik(log_scores);
    }

    pub fn get(&self, did: usize) -> Option<&DiscriminationTally> {
        self.per_discrimination.get(did)
    }

    /// Accuracy per discrimination with at least one scored point.
    pub fn scoring_report(&self, registry: &Registry) -> String {
        let mut out = String::new();
        for (did, tally) in self.per_discrimination.iter().enumerate() {
            if tally.scored == 0 {
                continue;
            }
            let name = registry.discrimination(did).map_or("?", |d| d.name());
            let _ = writeln!(
                out,
                "{}: {}/{} correct ({})",
                name,
                tally.correct,
                tally.scored,
                format_probability(tally.accuracy())
            );
        }
        out
    }

    /// Total and mean log-likelihood per discrimination.
    pub fn loglik_report(&self, registry: &Registry) -> String {
        let mut out = String::new();
        for (did, tally) in self.per_discrimination.iter().enumerate() {
            if tally.scored == 0 {
                continue;
            }
            let name = registry.discrimination(did).map_or("?", |d| d.name());
            let _ = writeln!(
                out,
                "{}: log-likelihood {} (mean {})",
                name,
                format_probability(tally.log_lik),
                format_probability(tally.mean_log_lik())
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Discrimination, FALLBACK_CLASS};

    fn registry() -> Registry {
        let mut reg = Registry::new(Discrimination::fallback([FALLBACK_CLASS]).unwrap()).unwrap();
        reg.add_discrimination(Discrimination::new("topic", ["sports", "politics"]).unwrap())
            .unwrap();
        reg
    }

    #[test]
    fn test_log_softmax_normalizes() {
        let out = log_softmax(&[1.0, 2.0, 3.0]);
        let total: f64 = out.iter().map(|s| s.exp()).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(out[2] > out[1] && out[1] > out[0]);
    }

    #[test]
    fn test_log_softmax_large_scores() {
        let out = log_softmax(&[1000.0, 0.0]);
        assert!(out[0].abs() < 1e-12);
        assert!(out[1].is_finite());
    }

    #[test]
    fn test_exp_prob_floor_maps_to_zero() {
        let p = exp_prob(&[0.0, LOG_FLOOR]);
        assert_eq!(p, vec![1.0, 0.0]);
    }

    #[test]
    fn test_describe_scores_three_decimals() {
        let reg = registry();
        let scores = vec![vec![0.0], vec![0.75f64.ln(), 0.25f64.ln()]];
        let text = describe_scores(&reg, &scores);
        assert!(text.contains("topic: sports 0.750 politics 0.250"));
        let map = probability_map(&reg, &scores);
        assert_eq!(map["topic"]["sports"], "0.750");
        assert_eq!(map["topic"]["politics"], "0.250");
    }

    #[test]
    fn test_best_class_first_wins_ties() {
        assert_eq!(best_class(&[0.1, 0.5, 0.5]), Some(1));
        assert_eq!(best_class(&[]), None);
    }

    #[test]
    fn test_tally_accuracy_and_loglik() {
        let reg = registry();
        let mut hit =
            DataPoint::new("hit", vec![(0, 1.0)], [(1, 0)].into_iter().collect()).unwrap();
        let miss = DataPoint::new("miss", vec![(0, 1.0)], [(1, 1)].into_iter().collect()).unwrap();
        let scores = vec![vec![0.0], vec![-0.5, -1.0]];

        let mut tally = ScoreTally::new(reg.len());
        tally.record(&mut hit, &scores);
        tally.eval_scores(&miss, &scores);

        let t = tally.get(1).unwrap();
        assert_eq!(t.scored, 2);
        assert_eq!(t.correct, 1);
        assert!((t.log_lik + 1.5).abs() < 1e-12);
        assert_eq!(hit.log_lik(), -0.5);
        assert!(tally.scoring_report(&reg).contains("topic: 1/2 correct (0.500)"));
        assert!(tally.loglik_report(&reg).contains("mean -0.750"));
        assert_eq!(tally.get(0).unwrap().scored, 0);
    }
}
