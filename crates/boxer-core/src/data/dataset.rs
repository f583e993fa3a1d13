//! Dataset documents and the line-oriented batch format.
//!
//! # Dataset document (JSON)
//!
//! ```json
//! {
//!   "dataset": {
//!     "name": "train",
//!     "datapoints": [
//!       { "name": "doc1", "features": "ball:2 goal:1", "labels": { "topic": "sports" } }
//!     ]
//!   }
//! }
//! ```
//!
//! Features are a whitespace-separated multiset of `name:count` pairs; a
//! bare name counts once and repeated names are summed.
//!
//! # Batch format (subprocess input)
//!
//! One line per example: `label j:v j:v ...` where `label` is the 1-based
//! class id (0 when unlabeled) and `j` is the 1-based feature index in
//! ascending order.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::data::datapoint::DataPoint;
use crate::data::registry::{BlockContext, Registry};
use crate::error::{BoxerError, BoxerResult};

/// Separator between a feature name and its count.
pub const PAIR_SEPARATOR: char = ':';

/// Root of a dataset document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetDocument {
    pub dataset: DatasetElement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetElement {
    pub name: String,
    #[serde(default)]
    pub datapoints: Vec<DataPointElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataPointElement {
    pub name: String,
    #[serde(default)]
    pub features: String,
    /// Discrimination name -> class name.
    #[serde(default, deserialize_with = "labels_serde::deserialize")]
    pub labels: BTreeMap<String, String>,
}

/// Label maps reject a discrimination named twice instead of keeping the
/// last entry.
mod labels_serde {
    use std::collections::BTreeMap;
    use std::fmt;

    use serde::de::{Error, MapAccess, Visitor};
    use serde::Deserializer;

    struct LabelsVisitor;

    impl<'de> Visitor<'de> for LabelsVisitor {
        type Value = BTreeMap<String, String>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map from discrimination name to class name")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut labels = BTreeMap::new();
            while let Some((discrimination, class)) = map.next_entry::<String, String>()? {
                if labels.contains_key(&discrimination) {
                    return Err(A::Error::custom(format!(
                        "more than one label for discrimination '{}'",
                        discrimination
                    )));
                }
                labels.insert(discrimination, class);
            }
            Ok(labels)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, String>, D::Error> {
        deserializer.deserialize_map(LabelsVisitor)
    }
}

impl DatasetDocument {
    pub fn from_json_str(json: &str) -> BoxerResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| BoxerError::DatasetParse(format!("invalid dataset document: {}", e)))
    }
}

/// Parse a feature multiset into `(name, total)` pairs in first-seen order.
///
/// # Errors
/// - `DatasetParse` for an empty feature name or a non-finite count
pub fn parse_features(text: &str) -> BoxerResult<Vec<(String, f64)>> {
    let mut out: Vec<(String, f64)> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();
    for token in text.split_whitespace() {
        let (name, value) = match token.rsplit_once(PAIR_SEPARATOR) {
            Some((name, count)) => match count.parse::<f64>() {
                Ok(v) => (name, v),
                Err(_) => (token, 1.0),
            },
            None => (token, 1.0),
        };
        if name.is_empty() {
            return Err(BoxerError::DatasetParse(format!(
                "empty feature name in token '{}'",
                token
            )));
        }
        if !value.is_finite() {
            return Err(BoxerError::DatasetParse(format!(
                "non-finite count in token '{}'",
                token
            )));
        }
        match position.get(name) {
            Some(&i) => out[i].1 += value,
            None => {
                position.insert(name, out.len());
                out.push((name.to_string(), value));
            }
        }
    }
    Ok(out)
}

/// Convert one element to a point, registering its features.
pub fn parse_datapoint(element: &DataPointElement, registry: &mut Registry) -> BoxerResult<DataPoint> {
    let mut labels = BTreeMap::new();
    for (dis_name, class_name) in &element.labels {
        let did = registry.require_discrimination(dis_name)?;
        let class = registry
            .discrimination(did)
            .ok_or_else(|| BoxerError::UnknownDiscrimination(dis_name.clone()))?
            .require_class(class_name)?;
        labels.insert(did, class);
    }

    let features = parse_features(&element.features)?;
    let dictionary = registry.dictionary_mut();
    let pairs: Vec<(usize, f64)> = features
        .iter()
        .map(|(name, v)| (dictionary.add(name), *v))
        .collect();

    DataPoint::new(element.name.clone(), pairs, labels)
}

/// Convert a whole dataset element, in order.
pub fn parse_dataset(element: &DatasetElement, registry: &mut Registry) -> BoxerResult<Vec<DataPoint>> {
    element
        .datapoints
        .iter()
        .map(|p| parse_datapoint(p, registry))
        .collect()
}

/// Turn free text into sorted `word:count` pairs.
///
/// Any pair separator already in the text is treated as whitespace.
pub fn word_counts(text: &str) -> String {
    let cleaned = text.replace(PAIR_SEPARATOR, " ");
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for word in cleaned.split_whitespace() {
        *counts.entry(word).or_insert(0) += 1;
    }
    counts
        .iter()
        .map(|(w, c)| format!("{}{}{}", w, PAIR_SEPARATOR, c))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Write `points[range]` in batch format for discrimination `ctx.did`.
///
/// With `labeled_only`, points unlabeled in this discrimination are skipped.
/// Returns the number of lines written.
pub fn write_batch<W: Write>(
    points: &[DataPoint],
    range: Range<usize>,
    ctx: &BlockContext<'_>,
    labeled_only: bool,
    out: &mut W,
) -> std::io::Result<usize> {
    let mut written = 0;
    for point in &points[range] {
        let label = point.label_for(ctx.did);
        if labeled_only && label.is_none() {
            continue;
        }
        let mut pairs: Vec<(usize, f64)> = point.pairs().collect();
        pairs.sort_by_key(|(j, _)| *j);

        write!(out, "{}", label.map(|c| c + 1).unwrap_or(0))?;
        for (j, v) in pairs {
            write!(out, " {}:{}", j + 1, v)?;
        }
        writeln!(out)?;
        written += 1;
    }
    Ok(written)
}
