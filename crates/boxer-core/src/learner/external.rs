//! Learner that delegates training and scoring to an external batch program.
//!
//! Each block moves through `Untrained -> Trained { model }` exactly once,
//! either by training (the program writes a fresh model artifact) or by
//! binding a pre-existing artifact. There is no way back to `Untrained`, and
//! no artifact is ever overwritten.

use std::fmt::Write as _;
use std::fs;
use std::mem::size_of;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::config::ExternalProcessConfig;
use crate::data::{write_batch, BlockContext, DataPoint, Registry};
use crate::error::{BoxerError, BoxerResult};
use crate::learner::block::{BlockSet, LearnerBlock};
use crate::learner::checkpoint::{element, ClassifierElement};
use crate::learner::process::{run_blocking, Invocation, StdoutMode};

/// Kind tag used in error messages.
const LEARNER_NAME: &str = "ExternalProcess";

/// File suffix of model artifacts.
pub const MODEL_SUFFIX: &str = "model";

/// Lifecycle of one block's model artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelState {
    Untrained,
    Trained { model: PathBuf },
}

/// One discrimination's binding to a model artifact.
#[derive(Debug, Clone)]
pub struct ExternalProcessBlock {
    discrimination: String,
    config: Arc<ExternalProcessConfig>,
    state: ModelState,
}

impl ExternalProcessBlock {
    pub fn new(ctx: &BlockContext<'_>, config: Arc<ExternalProcessConfig>) -> Self {
        Self {
            discrimination: ctx.discrimination.name().to_string(),
            config,
            state: ModelState::Untrained,
        }
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    pub fn model(&self) -> Option<&Path> {
        match &self.state {
            ModelState::Trained { model } => Some(model),
            ModelState::Untrained => None,
        }
    }

    /// Bind an existing artifact instead of training.
    ///
    /// # Errors
    /// - `ModelAlreadyBound` if this block already has an artifact
    /// - `ArtifactUnreadable` if the file cannot be opened
    pub fn bind_model(&mut self, path: impl Into<PathBuf>) -> BoxerResult<()> {
        let path = path.into();
        if let ModelState::Trained { model } = &self.state {
            return Err(BoxerError::ModelAlreadyBound {
                discrimination: self.discrimination.clone(),
                path: model.display().to_string(),
            });
        }
        fs::File::open(&path).map_err(|e| BoxerError::ArtifactUnreadable {
            path: path.display().to_string(),
            details: e.to_string(),
        })?;
        info!(discrimination = %self.discrimination, model = %path.display(), "bound model artifact");
        self.state = ModelState::Trained { model: path };
        Ok(())
    }

    /// Path for a new artifact: `<model_dir>/<discrimination>_<millis>.model`.
    fn new_model_path(&self) -> PathBuf {
        let stem: String = self
            .discrimination
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.config.model_dir.join(format!(
            "{}_{}.{}",
            stem,
            Utc::now().timestamp_millis(),
            MODEL_SUFFIX
        ))
    }

    fn require_model(&self) -> BoxerResult<&Path> {
        self.model()
            .ok_or_else(|| BoxerError::NotTrained(self.discrimination.clone()))
    }

    fn from_element(
        ctx: &BlockContext<'_>,
        config: Arc<ExternalProcessConfig>,
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
        if elem.matrix.is_some() {
            return Err(BoxerError::schema(
                element::CLASSIFIER,
                format!("classifier '{}' must not carry a weight matrix", dis.name()),
            ));
        }
        if let Some(params) = &elem.parameters {
            if !is_empty_object(params) {
                return Err(BoxerError::schema(
                    element::PARAMETERS,
                    format!("classifier '{}' takes no parameters, found {}", dis.name(), params),
                ));
            }
        }
        let mut block = Self::new(ctx, config);
        if let Some(model) = &elem.model {
            block.bind_model(model)?;
        }
        Ok(block)
    }
}

fn is_empty_object(value: &serde_json::Value) -> bool {
    value.as_object().map_or(false, |m| m.is_empty())
}

fn check_model_dir(dir: &Path) -> BoxerResult<()> {
    let failure = |details: String| BoxerError::ArtifactDirectory {
        path: dir.display().to_string(),
        details,
    };
    let meta = fs::metadata(dir).map_err(|e| failure(e.to_string()))?;
    if !meta.is_dir() {
        return Err(failure("not a directory".to_string()));
    }
    if meta.permissions().readonly() {
        return Err(failure("directory is read-only".to_string()));
    }
    Ok(())
}

impl LearnerBlock for ExternalProcessBlock {
    fn discrimination(&self) -> &str {
        &self.discrimination
    }

    /// Train once on the labeled points of `points[range]`.
    fn absorb(
        &mut self,
        points: &[DataPoint],
        range: Range<usize>,
        ctx: &BlockContext<'_>,
    ) -> BoxerResult<()> {
        if self.model().is_some() {
            return Err(BoxerError::AlreadyTrained {
                discrimination: self.discrimination.clone(),
            });
        }
        check_model_dir(&self.config.model_dir)?;
        let model = self.new_model_path();
        if model.exists() {
            return Err(BoxerError::ArtifactExists(model.display().to_string()));
        }

        let mut input = Vec::new();
        let written = write_batch(points, range, ctx, true, &mut input)?;
        debug!(discrimination = %self.discrimination, examples = written, "training batch prepared");

        let invocation =
            Invocation::from_command_line(self.config.training_command_line(&model), input)?;
        run_blocking(&invocation, StdoutMode::Log)?;

        if !model.exists() {
            return Err(BoxerError::ArtifactMissing {
                program: invocation.program,
                path: model.display().to_string(),
            });
        }
        info!(discrimination = %self.discrimination, model = %model.display(), "trained model artifact");
        self.state = ModelState::Trained { model };
        Ok(())
    }

    fn score(&self, _point: &DataPoint, _ctx: &BlockContext<'_>) -> BoxerResult<Vec<f64>> {
        Err(BoxerError::UnsupportedOperation {
            learner: LEARNER_NAME.to_string(),
            operation: "apply_model_log on a single point".to_string(),
        })
    }

    fn score_batch(
        &self,
        points: &[DataPoint],
        range: Range<usize>,
        ctx: &BlockContext<'_>,
    ) -> BoxerResult<Vec<Vec<f64>>> {
        let model = self.require_model()?;
        let rows = range.len();
        if rows == 0 {
            return Ok(Vec::new());
        }
        let mut input = Vec::new();
        write_batch(points, range, ctx, false, &mut input)?;
        let invocation =
            Invocation::from_command_line(self.config.scoring_command_line(model), input)?;
        run_blocking(
            &invocation,
            StdoutMode::Scores {
                rows,
                classes: ctx.discrimination.class_count(),
            },
        )
    }

    /// Copy for another discrimination with the same classes. A bound
    /// artifact is shared read-only by both blocks.
    fn transfer(&self, ctx: &BlockContext<'_>) -> BoxerResult<Self> {
        Ok(Self {
            discrimination: ctx.discrimination.name().to_string(),
            config: Arc::clone(&self.config),
            state: self.state.clone(),
        })
    }

    fn to_element(&self, ctx: &BlockContext<'_>) -> BoxerResult<ClassifierElement> {
        let mut elem = ClassifierElement::new(self.discrimination.clone());
        elem.classes = Some(ctx.discrimination.classes().to_vec());
        elem.model = self.model().map(|m| m.display().to_string());
        Ok(elem)
    }

    fn describe(&self, _ctx: &BlockContext<'_>, _verbose: bool) -> String {
        let mut out = String::new();
        let _ = match self.model() {
            Some(model) => writeln!(out, "  {}: model {}", self.discrimination, model.display()),
            None => writeln!(out, "  {}: untrained", self.discrimination),
        };
        out
    }

    fn memory_estimate(&self) -> usize {
        size_of::<Self>()
            + self.discrimination.len()
            + self.model().map_or(0, |m| m.as_os_str().len())
    }
}

/// Learner backed by external training and scoring programs.
#[derive(Debug, Clone)]
pub struct ExternalProcessLearner {
    config: Arc<ExternalProcessConfig>,
    blocks: BlockSet<ExternalProcessBlock>,
}

impl ExternalProcessLearner {
    /// Learner with an untrained block for every concrete discrimination.
    pub fn new(config: ExternalProcessConfig, registry: &Registry) -> BoxerResult<Self> {
        config.validate().map_err(BoxerError::InvalidConfig)?;
        let config = Arc::new(config);
        let mut blocks = BlockSet::new();
        for ctx in registry.contexts() {
            if !ctx.discrimination.is_fallback() {
                blocks.insert(ctx.did, ExternalProcessBlock::new(&ctx, Arc::clone(&config)));
            }
        }
        Ok(Self { config, blocks })
    }

    pub fn config(&self) -> &ExternalProcessConfig {
        &self.config
    }

    pub fn blocks(&self) -> &BlockSet<ExternalProcessBlock> {
        &self.blocks
    }

    pub(crate) fn blocks_mut(&mut self) -> &mut BlockSet<ExternalProcessBlock> {
        &mut self.blocks
    }

    /// Bind a pre-existing artifact to the block of `ctx`.
    pub fn bind_model(&mut self, ctx: &BlockContext<'_>, path: impl Into<PathBuf>) -> BoxerResult<()> {
        if ctx.discrimination.is_fallback() {
            return Err(BoxerError::FallbackDiscrimination(
                ctx.discrimination.name().to_string(),
            ));
        }
        self.blocks.require_mut(ctx)?.bind_model(path)
    }

    /// Bind one artifact per concrete discrimination from `files`.
    ///
    /// Every file must end in `.model`, and every concrete discrimination
    /// must match exactly one file whose stem contains its name. All
    /// matches are resolved before anything is bound.
    pub fn bind_model_files(&mut self, registry: &Registry, files: &[PathBuf]) -> BoxerResult<()> {
        for file in files {
            if file.extension().and_then(|e| e.to_str()) != Some(MODEL_SUFFIX) {
                return Err(BoxerError::InvalidConfig(format!(
                    "model file '{}' does not end in .{}",
                    file.display(),
                    MODEL_SUFFIX
                )));
            }
        }

        let mut assignments = Vec::new();
        for ctx in registry.contexts() {
            if ctx.discrimination.is_fallback() {
                continue;
            }
            let name = ctx.discrimination.name();
            let matches: Vec<&PathBuf> = files
                .iter()
                .filter(|f| {
                    f.file_stem()
                        .and_then(|s| s.to_str())
                        .map_or(false, |s| s.contains(name))
                })
                .collect();
            match matches.as_slice() {
                [single] => assignments.push((ctx, (*single).clone())),
                other => {
                    return Err(BoxerError::InvalidConfig(format!(
                        "expected exactly one model file for discrimination '{}', found {}",
                        name,
                        other.len()
                    )))
                }
            }
        }

        for (ctx, path) in assignments {
            self.bind_model(&ctx, path)?;
        }
        Ok(())
    }

    pub(crate) fn create_block(
        &mut self,
        ctx: &BlockContext<'_>,
        prior: Option<&BlockContext<'_>>,
    ) -> BoxerResult<()> {
        let block = match prior {
            Some(prior) => self.blocks.require(prior)?.transfer(ctx)?,
            None => ExternalProcessBlock::new(ctx, Arc::clone(&self.config)),
        };
        self.blocks.insert(ctx.did, block);
        Ok(())
    }

    /// Rebuild from a checkpoint. Program settings come from `config`; the
    /// learner element itself carries no parameters.
    pub(crate) fn from_parts(
        params: &serde_json::Value,
        classifiers: &[ClassifierElement],
        config: ExternalProcessConfig,
        registry: &Registry,
    ) -> BoxerResult<Self> {
        if !is_empty_object(params) {
            return Err(BoxerError::schema(
                element::PARAMETERS,
                format!("{} learner takes no parameters, found {}", LEARNER_NAME, params),
            ));
        }
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
            let block = ExternalProcessBlock::from_element(&ctx, Arc::clone(&learner.config), elem)?;
            learner.blocks.insert(did, block);
        }
        Ok(learner)
    }
}
