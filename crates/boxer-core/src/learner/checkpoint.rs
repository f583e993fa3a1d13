//! Checkpoint document elements for learner state.
//!
//! A learner serializes to one `learner` element carrying its kind tag,
//! learner-wide parameters, and one `classifier` element per
//! discrimination:
//!
//! ```json
//! {
//!   "learner": {
//!     "name": "TruncatedGradient",
//!     "version": "0.6.6",
//!     "parameters": { "theta": "INF", "eta": 0.1, "g": 0.1, "K": 10, "lazy": true },
//!     "classifiers": [
//!       {
//!         "discrimination": "topic",
//!         "classes": ["sports", "politics"],
//!         "parameters": { "t": 12 },
//!         "matrix": { "name": "W", "rows": [ { "feature": "ball", "values": [0.3, -0.3] } ] }
//!       }
//!     ]
//!   }
//! }
//! ```
//!
//! Every element denies unknown fields, so a document of the wrong shape
//! fails to load with a schema error instead of being partially applied.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{BoxerError, BoxerResult};

/// Element names, used in schema error messages.
pub mod element {
    pub const LEARNER: &str = "learner";
    pub const CLASSIFIER: &str = "classifier";
    pub const PARAMETERS: &str = "parameters";
    pub const MATRIX: &str = "matrix";
}

/// Name of the weight matrix inside a classifier element.
pub const WEIGHT_MATRIX_NAME: &str = "W";

/// Version stamped into every saved learner element.
pub const FORMAT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Standalone learner checkpoint (root element `learner`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LearnerDocument {
    pub learner: LearnerElement,
}

impl LearnerDocument {
    pub fn from_json_str(json: &str) -> BoxerResult<Self> {
        serde_json::from_str(json).map_err(|e| BoxerError::schema(element::LEARNER, e.to_string()))
    }

    pub fn to_json_string(&self) -> BoxerResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| BoxerError::Serialization(e.to_string()))
    }
}

/// Learner state: kind tag, learner-wide parameters, per-discrimination blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LearnerElement {
    /// Learner kind tag, e.g. `TruncatedGradient`.
    pub name: String,
    pub version: String,
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub classifiers: Vec<ClassifierElement>,
}

/// State of one learner block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifierElement {
    pub discrimination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    /// Bound model artifact of an external-process block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixElement>,
}

impl ClassifierElement {
    pub fn new(discrimination: impl Into<String>) -> Self {
        Self {
            discrimination: discrimination.into(),
            classes: None,
            parameters: None,
            model: None,
            matrix: None,
        }
    }
}

/// Sparse matrix keyed by feature name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixElement {
    pub name: String,
    #[serde(default)]
    pub rows: Vec<MatrixRowElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixRowElement {
    pub feature: String,
    pub values: Vec<f64>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Serialize a typed parameter struct into a parameters element.
pub fn params_to_value<T: Serialize>(params: &T) -> BoxerResult<serde_json::Value> {
    serde_json::to_value(params).map_err(|e| BoxerError::Serialization(e.to_string()))
}

/// Parse a parameters element into the typed shape of a learner kind.
///
/// Unknown or missing fields are schema errors.
pub fn parse_params<T: DeserializeOwned>(
    owner: &str,
    value: &serde_json::Value,
) -> BoxerResult<T> {
    serde_json::from_value(value.clone()).map_err(|e| {
        BoxerError::schema(
            element::PARAMETERS,
            format!("invalid parameters for {}: {}", owner, e),
        )
    })
}
