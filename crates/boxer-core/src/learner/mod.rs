//! Learners: training strategies with one shared lifecycle and checkpoint
//! format.
//!
//! A [`Learner`] is one of a closed set of kinds, each owning one
//! [`LearnerBlock`] per concrete discrimination:
//!
//! | Kind | Training | Scoring |
//! |------|----------|---------|
//! | [`TruncatedGradient`] | online, repeatable | single point or batch |
//! | [`ExternalProcessLearner`] | once per block | batch only |
//!
//! The fallback discrimination never has a block. Absorbing is a no-op for
//! it and its scores are always uniform.

pub mod block;
pub mod checkpoint;
pub mod external;
pub mod process;
pub mod truncated_gradient;
pub mod truncation;

use std::collections::HashSet;
use std::fmt;
use std::ops::Range;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::data::{DataPoint, Registry};
use crate::error::{BoxerError, BoxerResult};

pub use block::{BlockSet, LearnerBlock};
pub use checkpoint::{
    ClassifierElement, LearnerDocument, LearnerElement, MatrixElement, MatrixRowElement,
    FORMAT_VERSION,
};
pub use external::{ExternalProcessBlock, ExternalProcessLearner, ModelState};
pub use process::LOG_FLOOR;
pub use truncated_gradient::{LearnerParams, TruncatedGradient, TruncatedGradientBlock};
pub use truncation::Truncation;

/// Learner kind, also the `name` tag of a learner element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LearnerKind {
    TruncatedGradient,
    ExternalProcess,
}

impl LearnerKind {
    pub const ALL: [LearnerKind; 2] = [LearnerKind::TruncatedGradient, LearnerKind::ExternalProcess];

    pub fn tag(&self) -> &'static str {
        match self {
            LearnerKind::TruncatedGradient => "TruncatedGradient",
            LearnerKind::ExternalProcess => "ExternalProcess",
        }
    }

    /// Kind for a learner element tag.
    ///
    /// # Errors
    /// - `CheckpointSchema` for an unknown tag
    pub fn from_tag(tag: &str) -> BoxerResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.tag() == tag)
            .ok_or_else(|| {
                BoxerError::schema(
                    checkpoint::element::LEARNER,
                    format!("unknown learner kind '{}'", tag),
                )
            })
    }
}

impl fmt::Display for LearnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A training strategy plus its per-discrimination blocks.
///
/// Every method takes the [`Registry`] the learner was built against; block
/// slots follow its discrimination ids.
#[derive(Debug, Clone)]
pub enum Learner {
    TruncatedGradient(TruncatedGradient),
    ExternalProcess(ExternalProcessLearner),
}

fn check_range(points: &[DataPoint], range: &Range<usize>) -> BoxerResult<()> {
    if range.start > range.end || range.end > points.len() {
        return Err(BoxerError::RangeOutOfBounds {
            start: range.start,
            end: range.end,
            len: points.len(),
        });
    }
    Ok(())
}

/// Every feature index must be registered in the dictionary.
fn check_features(registry: &Registry, points: &[DataPoint]) -> BoxerResult<()> {
    let dimension = registry.dictionary().dimension();
    for point in points {
        if let Some(j) = point.features().iter().find(|&&j| j >= dimension) {
            return Err(BoxerError::InvalidDataPoint {
                point: point.name().to_string(),
                details: format!(
                    "feature {} is not in the dictionary ({} features)",
                    j, dimension
                ),
            });
        }
    }
    Ok(())
}

fn absorb_blocks<B: LearnerBlock>(
    blocks: &mut BlockSet<B>,
    registry: &Registry,
    points: &[DataPoint],
    range: &Range<usize>,
) -> BoxerResult<()> {
    for ctx in registry.contexts() {
        if ctx.discrimination.is_fallback() {
            continue;
        }
        blocks
            .require_mut(&ctx)?
            .absorb(points, range.clone(), &ctx)?;
    }
    Ok(())
}

fn score_blocks<B: LearnerBlock>(
    blocks: &BlockSet<B>,
    registry: &Registry,
    point: &DataPoint,
) -> BoxerResult<Vec<Vec<f64>>> {
    registry
        .contexts()
        .map(|ctx| {
            if ctx.discrimination.is_fallback() {
                Ok(ctx.discrimination.uniform_log_scores())
            } else {
                blocks.require(&ctx)?.score(point, &ctx)
            }
        })
        .collect()
}

/// Scores indexed `[point][did][class]`.
fn score_batch_blocks<B: LearnerBlock>(
    blocks: &BlockSet<B>,
    registry: &Registry,
    points: &[DataPoint],
    range: &Range<usize>,
) -> BoxerResult<Vec<Vec<Vec<f64>>>> {
    let mut out: Vec<Vec<Vec<f64>>> = vec![Vec::with_capacity(registry.len()); range.len()];
    for ctx in registry.contexts() {
        let rows = if ctx.discrimination.is_fallback() {
            vec![ctx.discrimination.uniform_log_scores(); range.len()]
        } else {
            blocks.require(&ctx)?.score_batch(points, range.clone(), &ctx)?
        };
        for (point_scores, row) in out.iter_mut().zip(rows) {
            point_scores.push(row);
        }
    }
    Ok(out)
}

fn block_elements<B: LearnerBlock>(
    blocks: &BlockSet<B>,
    registry: &Registry,
) -> BoxerResult<Vec<ClassifierElement>> {
    registry
        .contexts()
        .filter(|ctx| !ctx.discrimination.is_fallback())
        .map(|ctx| blocks.require(&ctx)?.to_element(&ctx))
        .collect()
}

fn describe_blocks<B: LearnerBlock>(
    blocks: &BlockSet<B>,
    registry: &Registry,
    verbose: bool,
) -> String {
    let mut out = String::new();
    for ctx in registry.contexts() {
        if let Some(block) = blocks.get(ctx.did) {
            out.push_str(&block.describe(&ctx, verbose));
        }
    }
    out
}

impl Learner {
    /// Fresh learner of `kind` for every discrimination of `registry`.
    pub fn new(kind: LearnerKind, config: &EngineConfig, registry: &Registry) -> BoxerResult<Self> {
        let learner = match kind {
            LearnerKind::TruncatedGradient => Learner::TruncatedGradient(TruncatedGradient::new(
                config.truncated_gradient.clone(),
                registry,
            )?),
            LearnerKind::ExternalProcess => Learner::ExternalProcess(ExternalProcessLearner::new(
                config.external.clone(),
                registry,
            )?),
        };
        info!(kind = %kind, discriminations = registry.len(), "created learner");
        Ok(learner)
    }

    pub fn kind(&self) -> LearnerKind {
        match self {
            Learner::TruncatedGradient(_) => LearnerKind::TruncatedGradient,
            Learner::ExternalProcess(_) => LearnerKind::ExternalProcess,
        }
    }

    /// True if [`absorb`](Self::absorb) may be called repeatedly.
    pub fn is_incremental(&self) -> bool {
        matches!(self, Learner::TruncatedGradient(_))
    }

    /// True if [`apply_model_log`](Self::apply_model_log) works on one point.
    pub fn supports_single_apply(&self) -> bool {
        matches!(self, Learner::TruncatedGradient(_))
    }

    /// Train on `points[range]`.
    ///
    /// # Errors
    /// - `RangeOutOfBounds` if the range does not fit
    /// - `InvalidDataPoint` if a point uses a feature outside the dictionary
    /// - `AlreadyTrained` when a once-only block is trained twice
    /// - environment errors from the external program
    pub fn absorb(
        &mut self,
        registry: &Registry,
        points: &[DataPoint],
        range: Range<usize>,
    ) -> BoxerResult<()> {
        check_range(points, &range)?;
        check_features(registry, &points[range.clone()])?;
        debug!(kind = %self.kind(), start = range.start, end = range.end, "absorbing examples");
        match self {
            Learner::TruncatedGradient(l) => absorb_blocks(l.blocks_mut(), registry, points, &range),
            Learner::ExternalProcess(l) => absorb_blocks(l.blocks_mut(), registry, points, &range),
        }
    }

    /// Log-scores of one point, indexed `[did][class]`.
    ///
    /// # Errors
    /// - `UnsupportedOperation` for batch-only learners
    pub fn apply_model_log(
        &self,
        registry: &Registry,
        point: &DataPoint,
    ) -> BoxerResult<Vec<Vec<f64>>> {
        match self {
            Learner::TruncatedGradient(l) => {
                check_features(registry, std::slice::from_ref(point))?;
                score_blocks(l.blocks(), registry, point)
            }
            Learner::ExternalProcess(_) => Err(BoxerError::UnsupportedOperation {
                learner: self.kind().to_string(),
                operation: "apply_model_log on a single point".to_string(),
            }),
        }
    }

    /// Log-scores of `points[range]`, indexed `[point][did][class]`.
    pub fn apply_model_log_batch(
        &self,
        registry: &Registry,
        points: &[DataPoint],
        range: Range<usize>,
    ) -> BoxerResult<Vec<Vec<Vec<f64>>>> {
        check_range(points, &range)?;
        check_features(registry, &points[range.clone()])?;
        match self {
            Learner::TruncatedGradient(l) => {
                score_batch_blocks(l.blocks(), registry, points, &range)
            }
            Learner::ExternalProcess(l) => score_batch_blocks(l.blocks(), registry, points, &range),
        }
    }

    /// (Re)create the block of discrimination `did`, optionally carrying over
    /// the state of the block of `prior`.
    pub fn create_block(
        &mut self,
        registry: &Registry,
        did: usize,
        prior: Option<usize>,
    ) -> BoxerResult<()> {
        let dis = registry
            .discrimination(did)
            .ok_or_else(|| BoxerError::UnknownDiscrimination(format!("#{}", did)))?;
        if dis.is_fallback() {
            return Err(BoxerError::FallbackDiscrimination(dis.name().to_string()));
        }
        let ctx = registry.context(did);
        let prior_ctx = match prior {
            Some(p) if p < registry.len() => Some(registry.context(p)),
            Some(p) => return Err(BoxerError::UnknownDiscrimination(format!("#{}", p))),
            None => None,
        };
        match self {
            Learner::TruncatedGradient(l) => l.create_block(&ctx, prior_ctx.as_ref()),
            Learner::ExternalProcess(l) => l.create_block(&ctx, prior_ctx.as_ref()),
        }
    }

    /// Drop all state of discrimination `did`. Must be called together with
    /// removing it from the registry, since later ids shift.
    pub(crate) fn delete_discrimination(&mut self, did: usize) {
        match self {
            Learner::TruncatedGradient(l) => {
                l.blocks_mut().remove(did);
            }
            Learner::ExternalProcess(l) => {
                l.blocks_mut().remove(did);
            }
        }
        debug!(did, "deleted learner block");
    }

    /// Learner element with one classifier per concrete discrimination.
    pub fn to_element(&self, registry: &Registry) -> BoxerResult<LearnerElement> {
        let (parameters, classifiers) = match self {
            Learner::TruncatedGradient(l) => (
                checkpoint::params_to_value(&l.parameters())?,
                block_elements(l.blocks(), registry)?,
            ),
            Learner::ExternalProcess(l) => (
                serde_json::Value::Object(serde_json::Map::new()),
                block_elements(l.blocks(), registry)?,
            ),
        };
        Ok(LearnerElement {
            name: self.kind().tag().to_string(),
            version: FORMAT_VERSION.to_string(),
            parameters,
            classifiers,
        })
    }

    /// Rebuild a learner from its element.
    ///
    /// Discriminations without a classifier element start fresh. External
    /// program settings come from `config`.
    ///
    /// # Errors
    /// - `CheckpointSchema` for an unknown kind, malformed parameters, or
    ///   classifiers that are duplicated or name unknown discriminations
    pub fn from_element(
        element: &LearnerElement,
        config: &EngineConfig,
        registry: &Registry,
    ) -> BoxerResult<Self> {
        let kind = LearnerKind::from_tag(&element.name)?;
        if element.version != FORMAT_VERSION {
            debug!(found = %element.version, current = FORMAT_VERSION, "loading learner saved by another version");
        }

        let mut seen = HashSet::new();
        for c in &element.classifiers {
            if !seen.insert(c.discrimination.as_str()) {
                return Err(BoxerError::schema(
                    checkpoint::element::CLASSIFIER,
                    format!("duplicate classifier for '{}'", c.discrimination),
                ));
            }
        }
        for dis in registry.discriminations() {
            if !dis.is_fallback() && !seen.contains(dis.name()) {
                info!(discrimination = dis.name(), "no saved classifier; starting fresh");
            }
        }

        let learner = match kind {
            LearnerKind::TruncatedGradient => Learner::TruncatedGradient(
                TruncatedGradient::from_parts(&element.parameters, &element.classifiers, registry)?,
            ),
            LearnerKind::ExternalProcess => {
                Learner::ExternalProcess(ExternalProcessLearner::from_parts(
                    &element.parameters,
                    &element.classifiers,
                    config.external.clone(),
                    registry,
                )?)
            }
        };
        Ok(learner)
    }

    /// Text report of parameters, plus matrix contents when `verbose`.
    pub fn describe(&self, registry: &Registry, verbose: bool) -> String {
        match self {
            Learner::TruncatedGradient(l) => {
                let c = l.config();
                let theta = if c.theta.is_infinite() {
                    "INF".to_string()
                } else {
                    c.theta.to_string()
                };
                format!(
                    "TruncatedGradient(eta={}, g={}, theta={}, K={}, lazy={})\n{}",
                    c.eta,
                    c.g,
                    theta,
                    c.k,
                    c.lazy,
                    describe_blocks(l.blocks(), registry, verbose)
                )
            }
            Learner::ExternalProcess(l) => {
                let c = l.config();
                format!(
                    "ExternalProcess(train={}, classify={}, model_dir={})\n{}",
                    c.train_command,
                    c.classify_command,
                    c.model_dir.display(),
                    describe_blocks(l.blocks(), registry, verbose)
                )
            }
        }
    }

    /// Rough heap footprint in bytes.
    pub fn memory_estimate(&self) -> usize {
        std::mem::size_of::<Self>()
            + match self {
                Learner::TruncatedGradient(l) => l.blocks().memory_estimate(),
                Learner::ExternalProcess(l) => l.blocks().memory_estimate(),
            }
    }

    pub fn as_truncated_gradient(&self) -> BoxerResult<&TruncatedGradient> {
        match self {
            Learner::TruncatedGradient(l) => Ok(l),
            other => Err(BoxerError::WrongLearnerKind {
                expected: LearnerKind::TruncatedGradient.to_string(),
                found: other.kind().to_string(),
            }),
        }
    }

    pub fn as_external(&self) -> BoxerResult<&ExternalProcessLearner> {
        match self {
            Learner::ExternalProcess(l) => Ok(l),
            other => Err(BoxerError::WrongLearnerKind {
                expected: LearnerKind::ExternalProcess.to_string(),
                found: other.kind().to_string(),
            }),
        }
    }

    pub fn as_external_mut(&mut self) -> BoxerResult<&mut ExternalProcessLearner> {
        match self {
            Learner::ExternalProcess(l) => Ok(l),
            other => Err(BoxerError::WrongLearnerKind {
                expected: LearnerKind::ExternalProcess.to_string(),
                found: other.kind().to_string(),
            }),
        }
    }
}
