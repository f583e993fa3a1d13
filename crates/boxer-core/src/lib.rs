//! Online multi-label classification with truncated-gradient and external
//! batch learners.
//!
//! A [`Suite`] binds a feature dictionary and a set of discriminations (one
//! closed label space each) to a single [`Learner`]. Learners train on
//! batches of sparse [`DataPoint`]s and return per-discrimination,
//! per-class log-scores.
//!
//! # Architecture
//!
//! - **config**: learner parameters, TOML loading, `BOXER_*` overrides
//! - **error**: [`BoxerError`] covering usage, format and environment failures
//! - **data**: dictionary, discriminations, data points, dataset documents
//! - **matrix**: sparse row-indexed weight matrix
//! - **learner**: truncation bookkeeping, learner kinds, checkpoints,
//!   subprocess driver
//! - **scoring**: probability rendering and evaluation tallies
//! - **suite**: the registry/learner pair and its document format
//! - **logging**: `tracing-subscriber` setup
//!
//! # Example
//!
//! ```
//! use boxer_core::{EngineConfig, LearnerKind, Suite};
//!
//! fn example() -> boxer_core::BoxerResult<()> {
//!     let mut suite = Suite::new("news", LearnerKind::TruncatedGradient, EngineConfig::default())?;
//!     suite.add_discrimination("topic", ["sports", "politics"])?;
//!     let points = suite.parse_dataset_json(
//!         r#"{"dataset":{"name":"d","datapoints":[
//!             {"name":"a","features":"ball:2","labels":{"topic":"sports"}}
//!         ]}}"#,
//!     )?;
//!     suite.absorb_all(&points)?;
//!     let scores = suite.apply_model_log(&points[0])?;
//!     assert!(scores[1][0] > scores[1][1]);
//!     Ok(())
//! }
//! # example().unwrap();
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod learner;
pub mod logging;
pub mod matrix;
pub mod scoring;
pub mod suite;

// Re-exports for convenience
pub use config::{EngineConfig, ExternalProcessConfig, TruncatedGradientConfig};
pub use data::{DataPoint, Dictionary, Discrimination, Registry};
pub use error::{BoxerError, BoxerResult};
pub use learner::{Learner, LearnerKind, LOG_FLOOR};
pub use matrix::SparseMatrix;
pub use suite::{Suite, SuiteDocument};
