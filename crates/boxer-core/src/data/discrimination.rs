//! Discriminations: closed, named label spaces.

use std::collections::HashMap;

use crate::error::{BoxerError, BoxerResult};

/// Reserved name of the fallback discrimination.
pub const FALLBACK_NAME: &str = "__fallback";

/// Default class list of the fallback discrimination.
pub const FALLBACK_CLASS: &str = "unlabeled";

/// A single classification task: an ordered set of named classes.
///
/// Class ids are positions in the class list and never change.
#[derive(Debug, Clone, PartialEq)]
pub struct Discrimination {
    name: String,
    classes: Vec<String>,
    class_index: HashMap<String, usize>,
    fallback: bool,
}

impl Discrimination {
    /// Create a concrete (trainable) discrimination.
    ///
    /// # Errors
    /// - `InvalidConfig` if the name is empty, reserved, or there are no classes
    /// - `DuplicateClass` if a class name repeats
    pub fn new<I, S>(name: impl Into<String>, classes: I) -> BoxerResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        if name == FALLBACK_NAME {
            return Err(BoxerError::InvalidConfig(format!(
                "discrimination name '{}' is reserved",
                FALLBACK_NAME
            )));
        }
        Self::build(name, classes, false)
    }

    /// Create the fallback discrimination with the given classes.
    pub fn fallback<I, S>(classes: I) -> BoxerResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(FALLBACK_NAME.to_string(), classes, true)
    }

    fn build<I, S>(name: String, classes: I, fallback: bool) -> BoxerResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if name.trim().is_empty() {
            return Err(BoxerError::InvalidConfig(
                "discrimination name must not be empty".to_string(),
            ));
        }
        let mut list = Vec::new();
        let mut class_index = HashMap::new();
        for class in classes {
            let class = class.into();
            if class_index.contains_key(&class) {
                return Err(BoxerError::DuplicateClass {
                    discrimination: name,
                    class,
                });
            }
            class_index.insert(class.clone(), list.len());
            list.push(class);
        }
        if list.is_empty() {
            return Err(BoxerError::InvalidConfig(format!(
                "discrimination '{}' must have at least one class",
                name
            )));
        }
        Ok(Self {
            name,
            classes: list,
            class_index,
            fallback,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    #[inline]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn class_name(&self, id: usize) -> Option<&str> {
        self.classes.get(id).map(String::as_str)
    }

    pub fn class_id(&self, name: &str) -> Option<usize> {
        self.class_index.get(name).copied()
    }

    /// Like [`class_id`](Self::class_id) but fails with `UnknownClass`.
    pub fn require_class(&self, name: &str) -> BoxerResult<usize> {
        self.class_id(name).ok_or_else(|| BoxerError::UnknownClass {
            discrimination: self.name.clone(),
            class: name.to_string(),
        })
    }

    /// Log-scores of the uniform distribution over this discrimination's classes.
    pub fn uniform_log_scores(&self) -> Vec<f64> {
        let n = self.classes.len();
        vec![-(n as f64).ln(); n]
    }

    /// Copy of this discrimination's class list under a new name.
    pub fn renamed(&self, name: impl Into<String>) -> BoxerResult<Self> {
        Self::new(name, self.classes.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_ids_follow_order() {
        let d = Discrimination::new("topic", ["sports", "politics", "arts"]).unwrap();
        assert_eq!(d.class_count(), 3);
        assert_eq!(d.class_id("politics"), Some(1));
        assert_eq!(d.class_name(2), Some("arts"));
        assert!(!d.is_fallback());
    }

    #[test]
    fn test_duplicate_class_rejected() {
        let err = Discrimination::new("topic", ["a", "b", "a"]).unwrap_err();
        assert!(matches!(err, BoxerError::DuplicateClass { .. }));
    }

    #[test]
    fn test_empty_and_reserved_rejected() {
        assert!(Discrimination::new("topic", Vec::<String>::new()).is_err());
        assert!(Discrimination::new("", ["a"]).is_err());
        assert!(Discrimination::new(FALLBACK_NAME, ["a"]).is_err());
    }

    #[test]
    fn test_require_class_unknown() {
        let d = Discrimination::new("topic", ["a"]).unwrap();
        let err = d.require_class("zzz").unwrap_err();
        assert!(err.to_string().contains("zzz"));
    }

    #[test]
    fn test_uniform_log_scores() {
        let d = Discrimination::fallback(["x", "y", "z", "w"]).unwrap();
        assert!(d.is_fallback());
        for s in d.uniform_log_scores() {
            assert_eq!(s, -(4.0f64).ln());
            assert!((s - (0.25f64).ln()).abs() < 1e-15);
        }
    }

    #[test]
    fn test_renamed_keeps_classes() {
        let d = Discrimination::new("topic", ["a", "b"]).unwrap();
        let r = d.renamed("topic2").unwrap();
        assert_eq!(r.name(), "topic2");
        assert_eq!(r.classes(), d.classes());
    }
}
