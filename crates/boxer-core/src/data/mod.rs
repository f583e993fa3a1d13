//! Data model: features, label spaces, and sparse examples.
//!
//! - [`Dictionary`]: append-only feature name registry
//! - [`Discrimination`]: one closed label space
//! - [`Registry`]: dictionary plus ordered discriminations (fallback first)
//! - [`DataPoint`]: sparse example with per-discrimination labels
//! - [`dataset`]: dataset documents and the subprocess batch format

pub mod datapoint;
pub mod dataset;
pub mod dictionary;
pub mod discrimination;
pub mod registry;

pub use datapoint::DataPoint;
pub use dataset::{
    parse_dataset, parse_features, word_counts, write_batch, DataPointElement, DatasetDocument,
    DatasetElement, PAIR_SEPARATOR,
};
pub use dictionary::Dictionary;
pub use discrimination::{Discrimination, FALLBACK_CLASS, FALLBACK_NAME};
pub use registry::{BlockContext, Registry, FALLBACK_ID};
