//! Feature dictionary: feature name <-> dense feature index.

use std::collections::HashMap;

/// Append-only bidirectional feature registry.
///
/// Indices are dense and assigned in registration order; a name never
/// changes index once registered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dictionary {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `name`, registering it if unseen.
    pub fn add(&mut self, name: &str) -> usize {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        id
    }

    #[inline]
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    #[inline]
    pub fn name(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    /// Number of registered features.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Feature names in index order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}
