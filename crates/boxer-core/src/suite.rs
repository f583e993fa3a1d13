//! Suites: a feature dictionary, a set of discriminations, and one learner.
//!
//! A suite serializes to a single "learner complex" document:
//!
//! ```json
//! {
//!   "suite": {
//!     "name": "news",
//!     "version": "0.6.6",
//!     "features": ["ball", "goal", "vote"],
//!     "discriminations": [
//!       { "name": "__fallback", "classes": ["unlabeled"], "fallback": true },
//!       { "name": "topic", "classes": ["sports", "politics"], "fallback": false }
//!     ],
//!     "learner": { "name": "TruncatedGradient", "...": "..." }
//!   }
//! }
//! ```
//!
//! Loading a document replaces all in-memory state. Saving twice without
//! training in between produces identical bytes.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::data::{
    parse_dataset, DataPoint, DatasetDocument, DatasetElement, Dictionary, Discrimination,
    Registry, FALLBACK_CLASS, FALLBACK_NAME,
};
use crate::error::{BoxerError, BoxerResult};
use crate::learner::checkpoint::FORMAT_VERSION;
use crate::learner::{Learner, LearnerDocument, LearnerElement, LearnerKind};
use crate::scoring::ScoreTally;

const SUITE_ELEMENT: &str = "suite";

/// Root of a suite document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteDocument {
    pub suite: SuiteElement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteElement {
    pub name: String,
    pub version: String,
    /// Feature names in index order.
    #[serde(default)]
    pub features: Vec<String>,
    /// Discriminations in id order, fallback first.
    pub discriminations: Vec<DiscriminationElement>,
    pub learner: LearnerElement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscriminationElement {
    pub name: String,
    pub classes: Vec<String>,
    #[serde(default)]
    pub fallback: bool,
}

impl SuiteDocument {
    pub fn from_json_str(json: &str) -> BoxerResult<Self> {
        serde_json::from_str(json).map_err(|e| BoxerError::schema(SUITE_ELEMENT, e.to_string()))
    }

    pub fn to_json_string(&self) -> BoxerResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| BoxerError::Serialization(e.to_string()))
    }
}

/// Registry plus learner, kept in step with each other.
#[derive(Debug, Clone)]
pub struct Suite {
    name: String,
    config: EngineConfig,
    registry: Registry,
    learner: Learner,
}

impl Suite {
    /// Suite with only the default fallback discrimination.
    pub fn new(name: impl Into<String>, kind: LearnerKind, config: EngineConfig) -> BoxerResult<Self> {
        Self::with_fallback_classes(name, [FALLBACK_CLASS], kind, config)
    }

    /// Suite whose fallback discrimination has the given classes.
    pub fn with_fallback_classes<I, S>(
        name: impl Into<String>,
        fallback_classes: I,
        kind: LearnerKind,
        config: EngineConfig,
    ) -> BoxerResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        config.validate()?;
        let registry = Registry::new(Discrimination::fallback(fallback_classes)?)?;
        let learner = Learner::new(kind, &config, &registry)?;
        Ok(Self {
            name: name.into(),
            config,
            registry,
            learner,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn dictionary(&self) -> &Dictionary {
        self.registry.dictionary()
    }

    pub fn learner(&self) -> &Learner {
        &self.learner
    }

    /// Register a new discrimination and give it a fresh learner block.
    pub fn add_discrimination<I, S>(&mut self, name: &str, classes: I) -> BoxerResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let did = self
            .registry
            .add_discrimination(Discrimination::new(name, classes)?)?;
        self.learner.create_block(&self.registry, did, None)?;
        info!(discrimination = name, did, "added discrimination");
        Ok(did)
    }

    /// Copy discrimination `source` under `new_name`, carrying its learned
    /// state into the new block. The two evolve independently afterwards.
    pub fn fork_discrimination(&mut self, source: &str, new_name: &str) -> BoxerResult<usize> {
        let source_id = self.registry.require_discrimination(source)?;
        let source_dis = &self.registry.discriminations()[source_id];
        if source_dis.is_fallback() {
            return Err(BoxerError::FallbackDiscrimination(source.to_string()));
        }
        let copy = source_dis.renamed(new_name)?;
        let did = self.registry.add_discrimination(copy)?;
        if let Err(e) = self.learner.create_block(&self.registry, did, Some(source_id)) {
            self.registry.remove_discrimination(did)?;
            return Err(e);
        }
        info!(source, discrimination = new_name, did, "forked discrimination");
        Ok(did)
    }

    /// Remove a discrimination and purge its learner state. Ids of later
    /// discriminations shift down by one.
    pub fn delete_discrimination(&mut self, name: &str) -> BoxerResult<()> {
        let did = self.registry.require_discrimination(name)?;
        self.registry.remove_discrimination(did)?;
        self.learner.delete_discrimination(did);
        info!(discrimination = name, "deleted discrimination");
        Ok(())
    }

    /// Convert a dataset element, registering any new features.
    pub fn parse_dataset(&mut self, element: &DatasetElement) -> BoxerResult<Vec<DataPoint>> {
        let points = parse_dataset(element, &mut self.registry)?;
        debug!(dataset = %element.name, points = points.len(), features = self.dictionary().dimension(), "parsed dataset");
        Ok(points)
    }

    pub fn parse_dataset_json(&mut self, json: &str) -> BoxerResult<Vec<DataPoint>> {
        let doc = DatasetDocument::from_json_str(json)?;
        self.parse_dataset(&doc.dataset)
    }

    /// Train on `points[range]`.
    pub fn absorb(&mut self, points: &[DataPoint], range: Range<usize>) -> BoxerResult<()> {
        self.learner.absorb(&self.registry, points, range)
    }

    /// Train on all of `points`.
    pub fn absorb_all(&mut self, points: &[DataPoint]) -> BoxerResult<()> {
        self.absorb(points, 0..points.len())
    }

    /// Log-scores of one point, indexed `[did][class]`.
    pub fn apply_model_log(&self, point: &DataPoint) -> BoxerResult<Vec<Vec<f64>>> {
        self.learner.apply_model_log(&self.registry, point)
    }

    /// Log-scores of every point, indexed `[point][did][class]`, through
    /// whichever scoring path the learner supports.
    ///
    /// Any failure is returned; no point is silently left unscored.
    pub fn score_dataset(&self, points: &[DataPoint]) -> BoxerResult<Vec<Vec<Vec<f64>>>> {
        if self.learner.supports_single_apply() {
            points.iter().map(|p| self.apply_model_log(p)).collect()
        } else {
            self.learner
                .apply_model_log_batch(&self.registry, points, 0..points.len())
        }
    }

    /// Score every point and tally accuracy and log-likelihood against its
    /// labels. Each point's own log-likelihood accumulator is updated.
    pub fn evaluate(&self, points: &mut [DataPoint]) -> BoxerResult<ScoreTally> {
        let scores = self.score_dataset(points)?;
        let mut tally = ScoreTally::new(self.registry.len());
        for (point, s) in points.iter_mut().zip(&scores) {
            tally.record(point, s);
        }
        Ok(tally)
    }

    /// Bind a pre-existing model artifact to one discrimination.
    pub fn bind_model(&mut self, discrimination: &str, path: impl Into<PathBuf>) -> BoxerResult<()> {
        let did = self.registry.require_discrimination(discrimination)?;
        let ctx = self.registry.context(did);
        self.learner.as_external_mut()?.bind_model(&ctx, path)
    }

    /// Bind one model artifact per concrete discrimination.
    pub fn bind_model_files(&mut self, files: &[PathBuf]) -> BoxerResult<()> {
        self.learner
            .as_external_mut()?
            .bind_model_files(&self.registry, files)
    }

    pub fn to_document(&self) -> BoxerResult<SuiteDocument> {
        Ok(SuiteDocument {
            suite: SuiteElement {
                name: self.name.clone(),
                version: FORMAT_VERSION.to_string(),
                features: self.dictionary().names().to_vec(),
                discriminations: self
                    .registry
                    .discriminations()
                    .iter()
                    .map(|d| DiscriminationElement {
                        name: d.name().to_string(),
                        classes: d.classes().to_vec(),
                        fallback: d.is_fallback(),
                    })
                    .collect(),
                learner: self.learner.to_element(&self.registry)?,
            },
        })
    }

    /// Rebuild a suite from a document. External program settings come from
    /// `config`.
    ///
    /// # Errors
    /// - `CheckpointSchema` if the fallback is missing or not first, a
    ///   feature repeats, or the learner element does not fit
    pub fn from_document(doc: &SuiteDocument, config: EngineConfig) -> BoxerResult<Self> {
        let elem = &doc.suite;
        let (first, rest) = elem.discriminations.split_first().ok_or_else(|| {
            BoxerError::schema(SUITE_ELEMENT, "suite has no discriminations")
        })?;
        if !first.fallback || first.name != FALLBACK_NAME {
            return Err(BoxerError::schema(
                SUITE_ELEMENT,
                format!(
                    "first discrimination must be the fallback '{}', found '{}'",
                    FALLBACK_NAME, first.name
                ),
            ));
        }
        let mut registry = Registry::new(Discrimination::fallback(first.classes.iter().cloned())?)?;
        for d in rest {
            if d.fallback {
                return Err(BoxerError::schema(
                    SUITE_ELEMENT,
                    format!("discrimination '{}' is marked as a second fallback", d.name),
                ));
            }
            registry.add_discrimination(Discrimination::new(d.name.clone(), d.classes.iter().cloned())?)?;
        }
        for (expected, feature) in elem.features.iter().enumerate() {
            if registry.dictionary_mut().add(feature) != expected {
                return Err(BoxerError::schema(
                    SUITE_ELEMENT,
                    format!("feature '{}' appears more than once", feature),
                ));
            }
        }

        let learner = Learner::from_element(&elem.learner, &config, &registry)?;
        info!(suite = %elem.name, discriminations = registry.len(), features = registry.dictionary().dimension(), "loaded suite");
        Ok(Self {
            name: elem.name.clone(),
            config,
            registry,
            learner,
        })
    }

    pub fn to_json_string(&self) -> BoxerResult<String> {
        self.to_document()?.to_json_string()
    }

    pub fn from_json_str(json: &str, config: EngineConfig) -> BoxerResult<Self> {
        Self::from_document(&SuiteDocument::from_json_str(json)?, config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> BoxerResult<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json_string()?)?;
        info!(path = %path.display(), "saved suite");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>, config: EngineConfig) -> BoxerResult<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json, config)
    }

    /// Learner-only document for this suite's learner.
    pub fn learner_document(&self) -> BoxerResult<LearnerDocument> {
        Ok(LearnerDocument {
            learner: self.learner.to_element(&self.registry)?,
        })
    }

    /// Replace the learner with one loaded from `element`. Features and
    /// discriminations stay as they are; classifiers must refer to them.
    pub fn load_learner_element(&mut self, element: &LearnerElement) -> BoxerResult<()> {
        self.learner = Learner::from_element(element, &self.config, &self.registry)?;
        info!(kind = %self.learner.kind(), "replaced learner");
        Ok(())
    }

    /// Text report of discriminations and learner state.
    pub fn describe(&self, verbose: bool) -> String {
        let mut out = format!(
            "Suite '{}': {} features, {} discriminations\n",
            self.name,
            self.dictionary().dimension(),
            self.registry.len()
        );
        for d in self.registry.discriminations() {
            out.push_str(&format!(
                "  {}{}: {}\n",
                d.name(),
                if d.is_fallback() { " (fallback)" } else { "" },
                d.classes().join(" ")
            ));
        }
        out.push_str(&self.learner.describe(&self.registry, verbose));
        out
    }

    /// Rough heap footprint of the learner in bytes.
    pub fn memory_estimate(&self) -> usize {
        self.learner.memory_estimate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suite() -> Suite {
        let mut s = Suite::new("t", LearnerKind::TruncatedGradient, EngineConfig::default()).unwrap();
        s.add_discrimination("topic", ["sports", "politics"]).unwrap();
        s
    }

    const DATA: &str = r#"{"dataset":{"name":"d","datapoints":[
        {"name":"a","features":"ball:2 goal","labels":{"topic":"sports"}},
        {"name":"b","features":"vote:3","labels":{"topic":"politics"}},
        {"name":"c","features":"ball vote"}
    ]}}"#;

    #[test]
    fn test_add_discrimination_creates_block() {
        let s = suite();
        assert_eq!(s.registry().len(), 2);
        let tg = s.learner().as_truncated_gradient().unwrap();
        assert!(tg.blocks().get(1).is_some());
    }

    #[test]
    fn test_train_and_score() {
        let mut s = suite();
        let points = s.parse_dataset_json(DATA).unwrap();
        s.absorb_all(&points).unwrap();
        let scores = s.score_dataset(&points).unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores[0][1][0] > scores[0][1][1]);
        assert!(scores[1][1][1] > scores[1][1][0]);
    }

    #[test]
    fn test_document_round_trip_is_byte_stable() {
        let mut s = suite();
        let points = s.parse_dataset_json(DATA).unwrap();
        s.absorb_all(&points).unwrap();
        let first = s.to_json_string().unwrap();
        let loaded = Suite::from_json_str(&first, EngineConfig::default()).unwrap();
        assert_eq!(loaded.to_json_string().unwrap(), first);
    }

    #[test]
    fn test_from_document_requires_fallback_first() {
        let s = suite();
        let mut doc = s.to_document().unwrap();
        doc.suite.discriminations.swap(0, 1);
        let err = Suite::from_document(&doc, EngineConfig::default()).unwrap_err();
        assert!(matches!(err, BoxerError::CheckpointSchema { .. }));
    }

    #[test]
    fn test_from_document_rejects_duplicate_features() {
        let s = suite();
        let mut doc = s.to_document().unwrap();
        doc.suite.features = vec!["x".to_string(), "x".to_string()];
        assert!(Suite::from_document(&doc, EngineConfig::default()).is_err());
    }

    #[test]
    fn test_fork_discrimination_transfers_state() {
        let mut s = suite();
        let points = s.parse_dataset_json(DATA).unwrap();
        s.absorb_all(&points).unwrap();
        let did = s.fork_discrimination("topic", "topic2").unwrap();
        assert_eq!(did, 2);
        let scores = s.apply_model_log(&points[0]).unwrap();
        assert_eq!(scores[1], scores[2]);
        assert!(s.fork_discrimination("__fallback", "x").is_err());
    }

    #[test]
    fn test_delete_discrimination_shifts_blocks() {
        let mut s = suite();
        s.add_discrimination("mood", ["happy", "sad"]).unwrap();
        s.delete_discrimination("topic").unwrap();
        assert_eq!(s.registry().discrimination_id("mood"), Some(1));
        let tg = s.learner().as_truncated_gradient().unwrap();
        assert_eq!(tg.blocks().get(1).unwrap().matrix().width(), 2);
        assert_eq!(tg.blocks().len(), 2);
        assert!(s.delete_discrimination(FALLBACK_NAME).is_err());
    }

    #[test]
    fn test_evaluate_tallies_labeled_points() {
        let mut s = suite();
        let mut points = s.parse_dataset_json(DATA).unwrap();
        s.absorb_all(&points).unwrap();
        let tally = s.evaluate(&mut points).unwrap();
        assert_eq!(tally.get(1).unwrap().scored, 2);
        assert_eq!(tally.get(1).unwrap().correct, 2);
        assert!(points[0].log_lik() < 0.0);
        assert_eq!(points[2].log_lik_count(), 0);
    }

    #[test]
    fn test_load_learner_element_replaces_learner() {
        let mut s = suite();
        let points = s.parse_dataset_json(DATA).unwrap();
        let trained = {
            let mut t = s.clone();
            t.absorb_all(&points).unwrap();
            t.learner_document().unwrap()
        };
        s.load_learner_element(&trained.learner).unwrap();
        let tg = s.learner().as_truncated_gradient().unwrap();
        assert!(!tg.blocks().get(1).unwrap().matrix().is_empty());
    }

    #[test]
    fn test_bind_model_requires_external_learner() {
        let mut s = suite();
        let err = s.bind_model("topic", "/tmp/x.model").unwrap_err();
        assert!(matches!(err, BoxerError::WrongLearnerKind { .. }));
    }

    #[test]
    fn test_describe_lists_discriminations() {
        let s = suite();
        let text = s.describe(false);
        assert!(text.contains("__fallback (fallback): unlabeled"));
        assert!(text.contains("topic: sports politics"));
        assert!(s.memory_estimate() > 0);
    }
}
