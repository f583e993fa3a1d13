//! Feature and label-space registry shared by a suite and its learner.

use crate::data::dictionary::Dictionary;
use crate::data::discrimination::Discrimination;
use crate::error::{BoxerError, BoxerResult};

/// Id of the fallback discrimination. It is always registered first.
pub const FALLBACK_ID: usize = 0;

/// The feature dictionary plus the ordered discriminations of a suite.
///
/// Discrimination ids are positions in the list. Deleting a discrimination
/// shifts the ids of those registered after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Registry {
    dictionary: Dictionary,
    discriminations: Vec<Discrimination>,
}

/// Read-only view handed to a learner block for one discrimination.
#[derive(Debug, Clone, Copy)]
pub struct BlockContext<'a> {
    pub did: usize,
    pub discrimination: &'a Discrimination,
    pub dictionary: &'a Dictionary,
}

impl Registry {
    /// Registry holding only the fallback discrimination.
    pub fn new(fallback: Discrimination) -> BoxerResult<Self> {
        if !fallback.is_fallback() {
            return Err(BoxerError::InvalidConfig(format!(
                "'{}' is not a fallback discrimination",
                fallback.name()
            )));
        }
        Ok(Self {
            dictionary: Dictionary::new(),
            discriminations: vec![fallback],
        })
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    pub fn dictionary_mut(&mut self) -> &mut Dictionary {
        &mut self.dictionary
    }

    pub fn discriminations(&self) -> &[Discrimination] {
        &self.discriminations
    }

    /// Number of discriminations, fallback included.
    #[inline]
    pub fn len(&self) -> usize {
        self.discriminations.len()
    }

    /// Always false: the fallback discrimination is permanent.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.discriminations.is_empty()
    }

    pub fn discrimination(&self, did: usize) -> Option<&Discrimination> {
        self.discriminations.get(did)
    }

    pub fn fallback(&self) -> &Discrimination {
        &self.discriminations[FALLBACK_ID]
    }

    pub fn discrimination_id(&self, name: &str) -> Option<usize> {
        self.discriminations.iter().position(|d| d.name() == name)
    }

    /// Like [`discrimination_id`](Self::discrimination_id) but fails with `UnknownDiscrimination`.
    pub fn require_discrimination(&self, name: &str) -> BoxerResult<usize> {
        self.discrimination_id(name)
            .ok_or_else(|| BoxerError::UnknownDiscrimination(name.to_string()))
    }

    pub(crate) fn add_discrimination(&mut self, dis: Discrimination) -> BoxerResult<usize> {
        if dis.is_fallback() {
            return Err(BoxerError::FallbackDiscrimination(dis.name().to_string()));
        }
        if self.discrimination_id(dis.name()).is_some() {
            return Err(BoxerError::DuplicateDiscrimination(dis.name().to_string()));
        }
        self.discriminations.push(dis);
        Ok(self.discriminations.len() - 1)
    }

    pub(crate) fn remove_discrimination(&mut self, did: usize) -> BoxerResult<Discrimination> {
        match self.discriminations.get(did) {
            None => Err(BoxerError::UnknownDiscrimination(format!("#{}", did))),
            Some(d) if d.is_fallback() => {
                Err(BoxerError::FallbackDiscrimination(d.name().to_string()))
            }
            Some(_) => Ok(self.discriminations.remove(did)),
        }
    }

    /// Context for the block of discrimination `did`.
    ///
    /// # Panics
    /// If `did` is out of range; callers iterate over `0..len()`.
    pub fn context(&self, did: usize) -> BlockContext<'_> {
        BlockContext {
            did,
            discrimination: &self.discriminations[did],
            dictionary: &self.dictionary,
        }
    }

    /// Contexts for every discrimination in id order.
    pub fn contexts(&self) -> impl Iterator<Item = BlockContext<'_>> {
        (0..self.discriminations.len()).map(move |did| self.context(did))
    }
}
