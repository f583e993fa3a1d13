//! Engine configuration.
//!
//! Two learner families are configured here:
//! - the native truncated-gradient learner (`TruncatedGradientConfig`)
//! - the external batch-program learner (`ExternalProcessConfig`)
//!
//! # TOML Structure
//!
//! ```toml
//! [truncated_gradient]
//! eta = 0.1
//! g = 0.1
//! theta = "INF"
//! k = 10
//! lazy = true
//!
//! [external]
//! train_command = "BXRtrain"
//! classify_command = "BXRclassify"
//! command_prefix = ["/usr/bin/time"]
//! eps = 0.001
//! model_dir = "/tmp"
//! ```
//!
//! Invalid values are rejected by [`EngineConfig::validate`]; nothing is
//! silently clamped.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BoxerError, BoxerResult};

// ============================================================================
// DEFAULT FUNCTIONS
// ============================================================================

fn default_eta() -> f64 {
    0.1
}

fn default_g() -> f64 {
    0.1
}

fn default_theta() -> f64 {
    f64::INFINITY
}

fn default_k() -> u64 {
    10
}

fn default_lazy() -> bool {
    true
}

fn default_train_command() -> String {
    "BXRtrain".to_string()
}

fn default_classify_command() -> String {
    "BXRclassify".to_string()
}

fn default_eps() -> f64 {
    1e-3
}

fn default_model_dir() -> PathBuf {
    env::temp_dir()
}

// ============================================================================
// THRESHOLD ENCODING
// ============================================================================

/// Serde helpers that write an infinite threshold as the string `"INF"`.
///
/// JSON has no infinity literal, so both the TOML config and the JSON
/// checkpoint documents share this encoding.
pub mod threshold_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub const INF: &str = "INF";

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_infinite() && *value > 0.0 {
            serializer.serialize_str(INF)
        } else {
            serializer.serialize_f64(*value)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(s) => parse(&s).map_err(serde::de::Error::custom),
        }
    }

    /// Parse a threshold written as a number or as `INF`/`inf`/`Infinity`.
    pub fn parse(s: &str) -> Result<f64, String> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case(INF) || trimmed.eq_ignore_ascii_case("infinity") {
            return Ok(f64::INFINITY);
        }
        trimmed
            .parse::<f64>()
            .map_err(|e| format!("invalid threshold '{}': {}", s, e))
    }
}

// ============================================================================
// TRUNCATED GRADIENT CONFIG
// ============================================================================

/// Parameters of the truncated-gradient learner.
///
/// Each truncation event shrinks eligible weights toward zero by
/// `k * g * eta`. Weights whose magnitude exceeds `theta` are left alone;
/// an infinite `theta` disables truncation entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TruncatedGradientConfig {
    /// Learning rate.
    #[serde(default = "default_eta")]
    pub eta: f64,

    /// Gravity: per-step shrink rate, scaled by `eta` and `k`.
    #[serde(default = "default_g")]
    pub g: f64,

    /// Truncation threshold. `INF` means no truncation.
    #[serde(default = "default_theta", with = "threshold_serde")]
    pub theta: f64,

    /// Truncation happens once every `k` global steps.
    #[serde(default = "default_k")]
    pub k: u64,

    /// Postpone truncation of each row until it is next touched.
    #[serde(default = "default_lazy")]
    pub lazy: bool,
}

impl Default for TruncatedGradientConfig {
    fn default() -> Self {
        Self {
            eta: default_eta(),
            g: default_g(),
            theta: default_theta(),
            k: default_k(),
            lazy: default_lazy(),
        }
    }
}

impl TruncatedGradientConfig {
    /// Shrink amount applied at each truncation event.
    pub fn truncation_step(&self) -> f64 {
        self.k as f64 * self.g * self.eta
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.eta.is_finite() && self.eta > 0.0) {
            return Err(format!("eta must be finite and > 0, got {}", self.eta));
        }
        if !(self.g.is_finite() && self.g >= 0.0) {
            return Err(format!("g must be finite and >= 0, got {}", self.g));
        }
        if self.theta.is_nan() || self.theta < 0.0 {
            return Err(format!("theta must be >= 0 or INF, got {}", self.theta));
        }
        if self.k == 0 {
            return Err("k must be >= 1".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// EXTERNAL PROCESS CONFIG
// ============================================================================

/// Parameters of the external batch-program learner.
///
/// The final command line for training is
/// `command_prefix.. train_command train_prefix_args.. -l 0 -e <eps> - <model>`
/// and for scoring
/// `command_prefix.. classify_command classify_prefix_args.. --classic - <model>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalProcessConfig {
    /// Training program.
    #[serde(default = "default_train_command")]
    pub train_command: String,

    /// Scoring program.
    #[serde(default = "default_classify_command")]
    pub classify_command: String,

    /// Wrapper placed before either program (e.g. `/usr/bin/time`).
    #[serde(default)]
    pub command_prefix: Vec<String>,

    /// Extra arguments placed right after the training program name.
    #[serde(default)]
    pub train_prefix_args: Vec<String>,

    /// Extra arguments placed right after the scoring program name.
    #[serde(default)]
    pub classify_prefix_args: Vec<String>,

    /// Convergence tolerance passed to the training program.
    #[serde(default = "default_eps")]
    pub eps: f64,

    /// Directory in which per-discrimination model artifacts are created.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
}

impl Default for ExternalProcessConfig {
    fn default() -> Self {
        Self {
            train_command: default_train_command(),
            classify_command: default_classify_command(),
            command_prefix: Vec::new(),
            train_prefix_args: Vec::new(),
            classify_prefix_args: Vec::new(),
            eps: default_eps(),
            model_dir: default_model_dir(),
        }
    }
}

impl ExternalProcessConfig {
    /// Full training command line, program first. Examples arrive on stdin.
    pub fn training_command_line(&self, model: &Path) -> Vec<String> {
        let mut line = self.command_prefix.clone();
        line.push(self.train_command.clone());
        line.extend(self.train_prefix_args.iter().cloned());
        line.extend([
            "-l".to_string(),
            "0".to_string(),
            "-e".to_string(),
            self.eps.to_string(),
            "-".to_string(),
            model.display().to_string(),
        ]);
        line
    }

    /// Full scoring command line, program first. Examples arrive on stdin.
    pub fn scoring_command_line(&self, model: &Path) -> Vec<String> {
        let mut line = self.command_prefix.clone();
        line.push(self.classify_command.clone());
        line.extend(self.classify_prefix_args.iter().cloned());
        line.extend([
            "--classic".to_string(),
            "-".to_string(),
            model.display().to_string(),
        ]);
        line
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.train_command.trim().is_empty() {
            return Err("train_command must not be empty".to_string());
        }
        if self.classify_command.trim().is_empty() {
            return Err("classify_command must not be empty".to_string());
        }
        if !(self.eps.is_finite() && self.eps > 0.0) {
            return Err(format!("eps must be finite and > 0, got {}", self.eps));
        }
        if self.model_dir.as_os_str().is_empty() {
            return Err("model_dir must not be empty".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// ROOT ENGINE CONFIG
// ============================================================================

/// Root configuration for the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub truncated_gradient: TruncatedGradientConfig,

    #[serde(default)]
    pub external: ExternalProcessConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `BoxerError::InvalidConfig` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> BoxerResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BoxerError::InvalidConfig(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&contents).map_err(|e| {
            BoxerError::InvalidConfig(format!(
                "Failed to parse TOML in '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> BoxerResult<Self> {
        toml::from_str(toml)
            .map_err(|e| BoxerError::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml_string(&self) -> BoxerResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BoxerError::Serialization(format!("Failed to serialize TOML: {}", e)))
    }

    /// Validate all sections, returning the first error found.
    pub fn validate(&self) -> BoxerResult<()> {
        self.truncated_gradient
            .validate()
            .map_err(|e| BoxerError::InvalidConfig(format!("[truncated_gradient] {}", e)))?;
        self.external
            .validate()
            .map_err(|e| BoxerError::InvalidConfig(format!("[external] {}", e)))?;
        Ok(())
    }

    /// Apply environment variable overrides. Prefix: `BOXER_`
    ///
    /// | Variable | Config Path |
    /// |----------|-------------|
    /// | `BOXER_ETA` | `truncated_gradient.eta` |
    /// | `BOXER_G` | `truncated_gradient.g` |
    /// | `BOXER_THETA` | `truncated_gradient.theta` |
    /// | `BOXER_K` | `truncated_gradient.k` |
    /// | `BOXER_LAZY` | `truncated_gradient.lazy` |
    /// | `BOXER_TRAIN_COMMAND` | `external.train_command` |
    /// | `BOXER_CLASSIFY_COMMAND` | `external.classify_command` |
    /// | `BOXER_EPS` | `external.eps` |
    /// | `BOXER_MODEL_DIR` | `external.model_dir` |
    ///
    /// Values that fail to parse are ignored; call `validate()` afterwards.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        let tg = &mut self.truncated_gradient;
        if let Some(v) = env_parse::<f64>("BOXER_ETA") {
            tg.eta = v;
        }
        if let Some(v) = env_parse::<f64>("BOXER_G") {
            tg.g = v;
        }
        if let Ok(val) = env::var("BOXER_THETA") {
            if let Ok(v) = threshold_serde::parse(&val) {
                tg.theta = v;
            }
        }
        if let Some(v) = env_parse::<u64>("BOXER_K") {
            tg.k = v;
        }
        if let Some(v) = env_parse::<bool>("BOXER_LAZY") {
            tg.lazy = v;
        }

        let ext = &mut self.external;
        if let Ok(val) = env::var("BOXER_TRAIN_COMMAND") {
            ext.train_command = val;
        }
        if let Ok(val) = env::var("BOXER_CLASSIFY_COMMAND") {
            ext.classify_command = val;
        }
        if let Some(v) = env_parse::<f64>("BOXER_EPS") {
            ext.eps = v;
        }
        if let Ok(val) = env::var("BOXER_MODEL_DIR") {
            ext.model_dir = PathBuf::from(val);
        }

        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}
