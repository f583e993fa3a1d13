//! Error types for learner, registry, checkpoint and subprocess operations.
//!
//! Errors fall into three families:
//!
//! - **Usage**: the caller asked for something the current lifecycle state
//!   does not allow (absorbing twice into a once-only learner, binding a
//!   model artifact twice, loading a checkpoint of the wrong kind).
//! - **Environment**: the filesystem or an external program misbehaved
//!   (unwritable artifact directory, launch failure, non-zero exit).
//! - **Format**: a checkpoint or dataset document could not be parsed.
//!
//! Near-zero probabilities are NOT errors; they are floored by the scorers.

use thiserror::Error;

/// Result type alias for engine operations.
pub type BoxerResult<T> = Result<T, BoxerError>;

/// Error type for all engine operations.
///
/// Every variant carries enough context to identify the discrimination,
/// element, or file involved. Nothing is silently defaulted.
#[derive(Error, Debug)]
pub enum BoxerError {
    // ========== Usage Errors ==========
    /// A once-only learner block was asked to train a second time.
    #[error("Learner block for discrimination '{discrimination}' is already trained; incremental training is not supported")]
    AlreadyTrained { discrimination: String },

    /// A model artifact was bound to a block that already has one.
    #[error("Model artifact already set for discrimination '{discrimination}': {path}")]
    ModelAlreadyBound { discrimination: String, path: String },

    /// The learner kind does not implement the requested operation.
    #[error("Operation '{operation}' is not supported by the {learner} learner")]
    UnsupportedOperation { learner: String, operation: String },

    /// An operation expected a different learner kind.
    #[error("Expected a {expected} learner, found {found}")]
    WrongLearnerKind { expected: String, found: String },

    /// The fallback discrimination cannot be modified this way.
    #[error("The fallback discrimination '{0}' cannot be used for this operation")]
    FallbackDiscrimination(String),

    /// A block exists for a discrimination but the model is not yet available.
    #[error("Learner block for discrimination '{0}' has no trained model")]
    NotTrained(String),

    /// An example range does not fit in the supplied example slice.
    #[error("Example range {start}..{end} is out of bounds for {len} examples")]
    RangeOutOfBounds { start: usize, end: usize, len: usize },

    // ========== Registry Errors ==========
    /// Discrimination name not registered in the suite.
    #[error("Unknown discrimination: {0}")]
    UnknownDiscrimination(String),

    /// Class name not registered in the discrimination.
    #[error("Unknown class '{class}' in discrimination '{discrimination}'")]
    UnknownClass { discrimination: String, class: String },

    /// Discrimination name registered twice.
    #[error("Duplicate discrimination: {0}")]
    DuplicateDiscrimination(String),

    /// Class name registered twice in one discrimination.
    #[error("Duplicate class '{class}' in discrimination '{discrimination}'")]
    DuplicateClass { discrimination: String, class: String },

    /// A data point violates the sparse-vector invariants.
    #[error("Invalid data point '{point}': {details}")]
    InvalidDataPoint { point: String, details: String },

    // ========== Format Errors ==========
    /// Checkpoint element name or parameter shape does not match the schema.
    #[error("Checkpoint schema mismatch in <{element}>: {details}")]
    CheckpointSchema { element: String, details: String },

    /// Dataset document could not be interpreted.
    #[error("Dataset parse error: {0}")]
    DatasetParse(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // ========== Configuration Errors ==========
    /// Invalid configuration parameter.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ========== Environment / Process Errors ==========
    /// Model artifact directory is missing or not writable.
    #[error("Cannot write model artifacts to directory '{path}': {details}")]
    ArtifactDirectory { path: String, details: String },

    /// A model artifact already exists and would be overwritten.
    #[error("Model artifact already exists and will not be overwritten: {0}")]
    ArtifactExists(String),

    /// A pre-existing model artifact cannot be read.
    #[error("Model artifact cannot be read: {path} ({details})")]
    ArtifactUnreadable { path: String, details: String },

    /// Training finished but did not produce the expected artifact.
    #[error("{program} failed to create model artifact {path}")]
    ArtifactMissing { program: String, path: String },

    /// The external program could not be launched.
    #[error("Failed to launch '{program}': {details}")]
    ProcessLaunch { program: String, details: String },

    /// The external program exited abnormally.
    #[error("'{program}' exited abnormally: {status}")]
    ProcessFailed { program: String, status: String },

    /// The external program produced output that cannot be interpreted.
    #[error("Malformed output from '{program}' at line {line}: {details}")]
    MalformedOutput {
        program: String,
        line: usize,
        details: String,
    },

    // ========== I/O Errors ==========
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BoxerError {
    /// True for programming / lifecycle errors that retrying cannot fix.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            BoxerError::AlreadyTrained { .. }
                | BoxerError::ModelAlreadyBound { .. }
                | BoxerError::UnsupportedOperation { .. }
                | BoxerError::WrongLearnerKind { .. }
                | BoxerError::FallbackDiscrimination(_)
                | BoxerError::NotTrained(_)
                | BoxerError::RangeOutOfBounds { .. }
                | BoxerError::CheckpointSchema { .. }
                | BoxerError::InvalidConfig(_)
        )
    }

    /// True for failures caused by the filesystem or an external program.
    pub fn is_environment_error(&self) -> bool {
        matches!(
            self,
            BoxerError::ArtifactDirectory { .. }
                | BoxerError::ArtifactExists(_)
                | BoxerError::ArtifactUnreadable { .. }
                | BoxerError::ArtifactMissing { .. }
                | BoxerError::ProcessLaunch { .. }
                | BoxerError::ProcessFailed { .. }
                | BoxerError::MalformedOutput { .. }
                | BoxerError::Io(_)
        )
    }

    pub(crate) fn schema(element: &str, details: impl Into<String>) -> Self {
        BoxerError::CheckpointSchema {
            element: element.to_string(),
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for BoxerError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            BoxerError::Io(e.into())
        } else {
            BoxerError::Deserialization(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_already_trained() {
        let err = BoxerError::AlreadyTrained {
            discrimination: "topic".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("topic"));
        assert!(msg.contains("already trained"));
    }

    #[test]
    fn test_error_display_unknown_class() {
        let err = BoxerError::UnknownClass {
            discrimination: "topic".to_string(),
            class: "sports".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("topic"));
        assert!(msg.contains("sports"));
    }

    #[test]
    fn test_error_display_checkpoint_schema() {
        let err = BoxerError::schema("parameters", "unknown field `zeta`");
        let msg = err.to_string();
        assert!(msg.contains("<parameters>"));
        assert!(msg.contains("zeta"));
    }

    #[test]
    fn test_error_display_malformed_output() {
        let err = BoxerError::MalformedOutput {
            program: "BXRclassify".to_string(),
            line: 7,
            details: "expected 3 probabilities".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("BXRclassify"));
        assert!(msg.contains("line 7"));
    }

    #[test]
    fn test_usage_and_environment_are_disjoint() {
        let usage = BoxerError::ModelAlreadyBound {
            discrimination: "d".to_string(),
            path: "/tmp/d.model".to_string(),
        };
        assert!(usage.is_usage_error());
        assert!(!usage.is_environment_error());

        let env = BoxerError::ProcessFailed {
            program: "BXRtrain".to_string(),
            status: "exit status: 1".to_string(),
        };
        assert!(env.is_environment_error());
        assert!(!env.is_usage_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BoxerError = io_err.into();
        assert!(matches!(err, BoxerError::Io(_)));
        assert!(err.is_environment_error());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<u32>("{not json").unwrap_err();
        let err: BoxerError = json_err.into();
        assert!(matches!(err, BoxerError::Deserialization(_)));
    }

    #[test]
    fn test_boxer_result_type_alias() {
        fn example_fn() -> BoxerResult<u32> {
            Ok(42)
        }
        assert_eq!(example_fn().unwrap(), 42);
    }
}
