//! Truncated-gradient multinomial logistic regression.
//!
//! Each block owns one weight matrix `W` (row per feature, column per class)
//! and its own [`Truncation`] state. Per example, for a block's
//! discrimination `d`:
//!
//! 1. advance the truncation step
//! 2. catch up every row the example touches
//! 3. skip the rest if the example is unlabeled in `d`
//! 4. `z = y - softmax(x W)`
//! 5. `W[j] += eta * x_j * z` for every feature `j` of the example
//!
//! After the batch every row is caught up, so scores and checkpoints always
//! see current weights. Example order matters; nothing is shuffled.

use std::fmt::Write as _;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::{threshold_serde, TruncatedGradientConfig};
use crate::data::{BlockContext, DataPoint, Registry};
use crate::error::{BoxerError, BoxerResult};
use crate::learner::block::{BlockSet, LearnerBlock};
use crate::learner::checkpoint::{
    element, params_to_value, parse_params, ClassifierElement, MatrixElement, MatrixRowElement,
    WEIGHT_MATRIX_NAME,
};
use crate::learner::process::LOG_FLOOR;
use crate::learner::truncation::Truncation;
use crate::matrix::SparseMatrix;
use crate::scoring::log_softmax;

/// Learner-wide parameters as stored in a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LearnerParams {
    #[serde(with = "threshold_serde")]
    pub theta: f64,
    pub eta: f64,
    pub g: f64,
    #[serde(rename = "K")]
    pub k: u64,
    pub lazy: bool,
}

impl From<&TruncatedGradientConfig> for LearnerParams {
    fn from(config: &TruncatedGradientConfig) -> Self {
        Self {
            theta: config.theta,
            eta: config.eta,
            g: config.g,
            k: config.k,
            lazy: config.lazy,
        }
    }
}

impl From<LearnerParams> for TruncatedGradientConfig {
    fn from(params: LearnerParams) -> Self {
        Self {
            eta: params.eta,
            g: params.g,
            theta: params.theta,
            k: params.k,
            lazy: params.lazy,
        }
    }
}

/// Per-block parameters as stored in a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BlockParams {
    t: u64,
}

/// Weights and truncation state for one discrimination.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncatedGradientBlock {
    discrimination: String,
    matrix: SparseMatrix,
    trunc: Truncation,
    eta: f64,
}

impl TruncatedGradientBlock {
    pub fn new(ctx: &BlockContext<'_>, config: &TruncatedGradientConfig) -> Self {
        Self {
            discrimination: ctx.discrimination.name().to_string(),
            matrix: SparseMatrix::new(ctx.discrimination.class_count()),
            trunc: Truncation::from_config(config),
            eta: config.eta,
        }
    }

    pub fn matrix(&self) -> &SparseMatrix {
        &self.matrix
    }

    pub fn truncation(&self) -> &Truncation {
        &self.trunc
    }

    /// One online update for the point, for discrimination `ctx.did`.
    fn absorb_point(&mut self, point: &DataPoint, ctx: &BlockContext<'_>) {
        self.trunc.request_truncation(&mut self.matrix);
        for &j in point.features() {
            self.trunc.apply_truncation(&mut self.matrix, j);
        }

        if point.label_for(ctx.did).is_none() {
            return;
        }
        let y = point.membership(ctx.did, self.matrix.width());

        let scores = self.matrix.linear_scores(point.features(), point.values());
        let z: Vec<f64> = log_softmax(&scores)
            .iter()
            .zip(&y)
            .map(|(lp, member)| (if *member { 1.0 } else { 0.0 }) - lp.exp())
            .collect();
        trace!(point = point.name(), discrimination = %self.discrimination, ?z, "gradient step");

        for (j, v) in point.pairs() {
            self.matrix.add_to_row(j, &z, self.eta * v);
        }
    }

    fn from_element(
        ctx: &BlockContext<'_>,
        config: &TruncatedGradientConfig,
        elem: &ClassifierElement,
    ) -> BoxerResult<Self> {
        let dis = ctx.discrimination;
        if let Some(classes) = &elem.classes {
            if classes.as_slice() != dis.classes() {
                return Err(BoxerError::schema(
                    element::CLASSIFIER,
                    format!(
                        "classes {:?} of '{}' do not match the suite's {:?}",
                        classes,
                        dis.name(),
                        dis.classes()
                    ),
                ));
            }
        }
        if elem.model.is_some() {
            return Err(BoxerError::schema(
                element::CLASSIFIER,
                format!("unexpected model artifact in classifier '{}'", dis.name()),
            ));
        }
        let params_value = elem.parameters.as_ref().ok_or_else(|| {
            BoxerError::schema(
                element::CLASSIFIER,
                format!("classifier '{}' has no parameters", dis.name()),
            )
        })?;
        let params: BlockParams = parse_params(dis.name(), params_value)?;

        let mut block = Self::new(ctx, config);
        if let Some(matrix) = &elem.matrix {
            if matrix.name != WEIGHT_MATRIX_NAME {
                return Err(BoxerError::schema(
                    element::MATRIX,
                    format!("expected matrix '{}', found '{}'", WEIGHT_MATRIX_NAME, matrix.name),
                ));
            }
            for row in &matrix.rows {
                let j = ctx.dictionary.lookup(&row.feature).ok_or_else(|| {
                    BoxerError::schema(
                        element::MATRIX,
                        format!("feature '{}' is not in the dictionary", row.feature),
                    )
                })?;
                if row.values.len() != dis.class_count() {
                    return Err(BoxerError::schema(
                        element::MATRIX,
                        format!(
                            "row '{}' has {} values, expected {}",
                            row.feature,
                            row.values.len(),
                            dis.class_count()
                        ),
                    ));
                }
                if block.matrix.row(j).is_some() {
                    return Err(BoxerError::schema(
                        element::MATRIX,
                        format!("row '{}' appears more than once", row.feature),
                    ));
                }
                block.matrix.set_row(j, row.values.clone());
            }
        }
        block.trunc.set_t(params.t);
        Ok(block)
    }
}

impl LearnerBlock for TruncatedGradientBlock {
    fn discrimination(&self) -> &str {
        &self.discrimination
    }

    fn absorb(
        &mut self,
        points: &[DataPoint],
        range: Range<usize>,
        ctx: &BlockContext<'_>,
    ) -> BoxerResult<()> {
        for point in &points[range] {
            self.absorb_point(point, ctx);
        }
        self.trunc.apply_truncation_to_all_rows(&mut self.matrix);
        debug!(
            discrimination = %self.discrimination,
            t = self.trunc.t(),
            rows = self.matrix.allocated_rows(),
            "absorbed batch"
        );
        Ok(())
    }

    fn score(&self, point: &DataPoint, _ctx: &BlockContext<'_>) -> BoxerResult<Vec<f64>> {
        let scores = self.matrix.linear_scores(point.features(), point.values());
        Ok(log_softmax(&scores)
            .into_iter()
            .map(|s| s.max(LOG_FLOOR))
            .collect())
    }

    fn transfer(&self, ctx: &BlockContext<'_>) -> BoxerResult<Self> {
        if ctx.discrimination.class_count() != self.matrix.width() {
            return Err(BoxerError::InvalidConfig(format!(
                "cannot transfer weights of '{}' ({} classes) to '{}' ({} classes)",
                self.discrimination,
                self.matrix.width(),
                ctx.discrimination.name(),
                ctx.discrimination.class_count()
            )));
        }
        Ok(Self {
            discrimination: ctx.discrimination.name().to_string(),
            matrix: self.matrix.clone(),
            trunc: self.trunc.live_copy(),
            eta: self.eta,
        })
    }

    fn to_element(&self, ctx: &BlockContext<'_>) -> BoxerResult<ClassifierElement> {
        let mut rows = Vec::with_capacity(self.matrix.allocated_rows());
        for (j, values) in self.matrix.iter() {
            let feature = ctx.dictionary.name(j).ok_or_else(|| {
                BoxerError::Serialization(format!(
                    "row {} of '{}' has no dictionary entry",
                    j, self.discrimination
                ))
            })?;
            rows.push(MatrixRowElement {
                feature: feature.to_string(),
                values: values.to_vec(),
            });
        }
        let mut elem = ClassifierElement::new(self.discrimination.clone());
        elem.classes = Some(ctx.discrimination.classes().to_vec());
        elem.parameters = Some(params_to_value(&BlockParams { t: self.trunc.t() })?);
        elem.matrix = Some(MatrixElement {
            name: WEIGHT_MATRIX_NAME.to_string(),
            rows,
        });
        Ok(elem)
    }

    fn describe(&self, ctx: &BlockContext<'_>, verbose: bool) -> String {
        let mut out = format!(
            "  {}: {} rows x {} classes, {}\n",
            self.discrimination,
            self.matrix.allocated_rows(),
            self.matrix.width(),
            self.trunc.describe()
        );
        if verbose {
            for (j, values) in self.matrix.iter() {
                let feature = ctx.dictionary.name(j).unwrap_or("?");
                let _ = writeln!(out, "    {} {:?}", feature, values);
            }
        }
        out
    }

    fn memory_estimate(&self) -> usize {
        std::mem::size_of::<Self>() + self.matrix.memory_estimate()
    }
}

/// Native incremental learner: one [`TruncatedGradientBlock`] per
/// concrete discrimination.
#[derive(Debug, Clone)]
pub struct TruncatedGradient {
    config: TruncatedGradientConfig,
    blocks: BlockSet<TruncatedGradientBlock>,
}

impl TruncatedGradient {
    /// Learner with a fresh block for every concrete discrimination.
    pub fn new(config: TruncatedGradientConfig, registry: &Registry) -> BoxerResult<Self> {
        config.validate().map_err(BoxerError::InvalidConfig)?;
        let mut blocks = BlockSet::new();
        for ctx in registry.contexts() {
            if !ctx.discrimination.is_fallback() {
                blocks.insert(ctx.did, TruncatedGradientBlock::new(&ctx, &config));
            }
        }
        Ok(Self { config, blocks })
    }

    pub fn config(&self) -> &TruncatedGradientConfig {
        &self.config
    }

    pub fn blocks(&self) -> &BlockSet<TruncatedGradientBlock> {
        &self.blocks
    }

    pub(crate) fn blocks_mut(&mut self) -> &mut BlockSet<TruncatedGradientBlock> {
        &mut self.blocks
    }

    /// Fresh block for `ctx`, or a copy of the block of `prior`.
    pub(crate) fn create_block(
        &mut self,
        ctx: &BlockContext<'_>,
        prior: Option<&BlockContext<'_>>,
    ) -> BoxerResult<()> {
        let block = match prior {
            Some(prior) => self.blocks.require(prior)?.transfer(ctx)?,
            None => TruncatedGradientBlock::new(ctx, &self.config),
        };
        self.blocks.insert(ctx.did, block);
        Ok(())
    }

    pub fn parameters(&self) -> LearnerParams {
        LearnerParams::from(&self.config)
    }

    /// Rebuild from checkpoint parameters and classifier elements.
    ///
    /// Discriminations without a classifier element get a fresh block.
    pub(crate) fn from_parts(
        params: &serde_json::Value,
        classifiers: &[ClassifierElement],
        registry: &Registry,
    ) -> BoxerResult<Self> {
        let params: LearnerParams = parse_params(element::LEARNER, params)?;
        let config = TruncatedGradientConfig::from(params);
        config
            .validate()
            .map_err(|e| BoxerError::schema(element::PARAMETERS, e))?;

        let mut learner = Self::new(config, registry)?;
        for elem in classifiers {
            let did = registry.discrimination_id(&elem.discrimination).ok_or_else(|| {
                BoxerError::schema(
                    element::CLASSIFIER,
                    format!("unknown discrimination '{}'", elem.discrimination),
                )
            })?;
            let ctx = registry.context(did);
            if ctx.discrimination.is_fallback() {
                return Err(BoxerError::schema(
                    element::CLASSIFIER,
                    "the fallback discrimination has no classifier",
                ));
            }
            let block = TruncatedGradientBlock::from_element(&ctx, &learner.config, elem)?;
            learner.blocks.insert(did, block);
        }
        Ok(learner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Discrimination, FALLBACK_CLASS};
    use std::collections::BTreeMap;

    fn registry() -> Registry {
        let mut reg = Registry::new(Discrimination::fallback([FALLBACK_CLASS]).unwrap()).unwrap();
        reg.add_discrimination(Discrimination::new("ab", ["A", "B"]).unwrap())
            .unwrap();
        reg.dictionary_mut().add("f1");
        reg.dictionary_mut().add("f2");
        reg
    }

    fn point(pairs: &[(usize, f64)], label: Option<usize>) -> DataPoint {
        let labels: BTreeMap<usize, usize> = label.map(|c| (1, c)).into_iter().collect();
        DataPoint::new("p", pairs.to_vec(), labels).unwrap()
    }

    fn no_truncation() -> TruncatedGradientConfig {
        TruncatedGradientConfig {
            eta: 0.1,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_update_matches_closed_form() {
        let reg = registry();
        let ctx = reg.context(1);
        let mut block = TruncatedGradientBlock::new(&ctx, &no_truncation());
        let points = vec![point(&[(0, 2.0)], Some(0))];
        block.absorb(&points, 0..1, &ctx).unwrap();

        // Uniform start: z = [0.5, -0.5], step = eta * v = 0.2.
        assert!((block.matrix().get(0, 0) - 0.1).abs() < 1e-12);
        assert!((block.matrix().get(0, 1) + 0.1).abs() < 1e-12);
        assert_eq!(block.truncation().t(), 1);
    }

    #[test]
    fn test_unlabeled_point_advances_step_only() {
        let reg = registry();
        let ctx = reg.context(1);
        let mut block = TruncatedGradientBlock::new(&ctx, &no_truncation());
        let points = vec![point(&[(0, 1.0)], None)];
        block.absorb(&points, 0..1, &ctx).unwrap();
        assert!(block.matrix().is_empty());
        assert_eq!(block.truncation().t(), 1);
    }

    #[test]
    fn test_score_prefers_trained_class() {
        let reg = registry();
        let ctx = reg.context(1);
        let mut block = TruncatedGradientBlock::new(&ctx, &no_truncation());
        let points = vec![point(&[(0, 1.0)], Some(0))];
        block.absorb(&points, 0..1, &ctx).unwrap();
        let scores = block.score(&points[0], &ctx).unwrap();
        assert!(scores[0] > scores[1]);
        let total: f64 = scores.iter().map(|s| s.exp()).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_element_round_trip() {
        let reg = registry();
        let ctx = reg.context(1);
        let config = TruncatedGradientConfig {
            theta: 0.5,
            k: 2,
            ..Default::default()
        };
        let mut block = TruncatedGradientBlock::new(&ctx, &config);
        let points = vec![
            point(&[(0, 1.0), (1, 0.5)], Some(1)),
            point(&[(1, 1.0)], Some(0)),
            point(&[(0, 1.0)], Some(1)),
        ];
        block.absorb(&points, 0..3, &ctx).unwrap();

        let elem = block.to_element(&ctx).unwrap();
        let restored = TruncatedGradientBlock::from_element(&ctx, &config, &elem).unwrap();
        assert_eq!(restored.matrix(), block.matrix());
        assert_eq!(restored.truncation().t(), 3);
        assert_eq!(restored.to_element(&ctx).unwrap(), elem);
    }

    #[test]
    fn test_from_element_rejects_unknown_feature() {
        let reg = registry();
        let ctx = reg.context(1);
        let mut elem = ClassifierElement::new("ab");
        elem.parameters = Some(serde_json::json!({ "t": 0 }));
        elem.matrix = Some(MatrixElement {
            name: WEIGHT_MATRIX_NAME.to_string(),
            rows: vec![MatrixRowElement {
                feature: "nope".to_string(),
                values: vec![0.0, 0.0],
            }],
        });
        let err = TruncatedGradientBlock::from_element(&ctx, &no_truncation(), &elem).unwrap_err();
        assert!(matches!(err, BoxerError::CheckpointSchema { .. }));
    }

    #[test]
    fn test_from_element_rejects_wrong_width_and_name() {
        let reg = registry();
        let ctx = reg.context(1);
        let mut elem = ClassifierElement::new("ab");
        elem.parameters = Some(serde_json::json!({ "t": 0 }));
        elem.matrix = Some(MatrixElement {
            name: WEIGHT_MATRIX_NAME.to_string(),
            rows: vec![MatrixRowElement {
                feature: "f1".to_string(),
                values: vec![0.0],
            }],
        });
        assert!(TruncatedGradientBlock::from_element(&ctx, &no_truncation(), &elem).is_err());

        elem.matrix = Some(MatrixElement {
            name: "V".to_string(),
            rows: Vec::new(),
        });
        assert!(TruncatedGradientBlock::from_element(&ctx, &no_truncation(), &elem).is_err());
    }

    #[test]
    fn test_from_element_requires_parameters() {
        let reg = registry();
        let ctx = reg.context(1);
        let elem = ClassifierElement::new("ab");
        let err = TruncatedGradientBlock::from_element(&ctx, &no_truncation(), &elem).unwrap_err();
        assert!(matches!(err, BoxerError::CheckpointSchema { .. }));
    }

    #[test]
    fn test_transfer_is_independent() {
        let mut reg = registry();
        reg.add_discrimination(Discrimination::new("ab2", ["A", "B"]).unwrap())
            .unwrap();
        let ctx = reg.context(1);
        let mut block = TruncatedGradientBlock::new(&ctx, &no_truncation());
        let points = vec![point(&[(0, 1.0)], Some(0))];
        block.absorb(&points, 0..1, &ctx).unwrap();

        let copy = block.transfer(&reg.context(2)).unwrap();
        assert_eq!(copy.discrimination(), "ab2");
        assert_eq!(copy.matrix(), block.matrix());

        block.absorb(&points, 0..1, &ctx).unwrap();
        assert_ne!(copy.matrix(), block.matrix());
        assert_eq!(copy.truncation().t(), 1);
    }

    #[test]
    fn test_learner_params_use_checkpoint_names() {
        let value = params_to_value(&LearnerParams::from(&TruncatedGradientConfig::default())).unwrap();
        assert_eq!(value["K"], 10);
        assert_eq!(value["theta"], "INF");
        assert!(value.get("k").is_none());
    }

    #[test]
    fn test_learner_skips_fallback() {
        let reg = registry();
        let learner = TruncatedGradient::new(no_truncation(), &reg).unwrap();
        assert!(learner.blocks().get(0).is_none());
        assert!(learner.blocks().get(1).is_some());
    }
}
