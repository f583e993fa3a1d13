//! Per-discrimination learner state.

use std::ops::Range;

use crate::data::{BlockContext, DataPoint};
use crate::error::{BoxerError, BoxerResult};
use crate::learner::checkpoint::ClassifierElement;

/// Training and scoring state for one concrete discrimination.
///
/// Blocks never see the fallback discrimination; the owning learner answers
/// for it directly.
pub trait LearnerBlock: Sized {
    /// Name of the discrimination this block serves.
    fn discrimination(&self) -> &str;

    /// Train on `points[range]`.
    fn absorb(
        &mut self,
        points: &[DataPoint],
        range: Range<usize>,
        ctx: &BlockContext<'_>,
    ) -> BoxerResult<()>;

    /// Per-class log-scores of a single point.
    fn score(&self, point: &DataPoint, ctx: &BlockContext<'_>) -> BoxerResult<Vec<f64>>;

    /// Per-point, per-class log-scores of `points[range]`.
    fn score_batch(
        &self,
        points: &[DataPoint],
        range: Range<usize>,
        ctx: &BlockContext<'_>,
    ) -> BoxerResult<Vec<Vec<f64>>> {
        points[range].iter().map(|p| self.score(p, ctx)).collect()
    }

    /// New block for `ctx` carrying over the state of `self`.
    fn transfer(&self, ctx: &BlockContext<'_>) -> BoxerResult<Self>;

    fn to_element(&self, ctx: &BlockContext<'_>) -> BoxerResult<ClassifierElement>;

    fn describe(&self, ctx: &BlockContext<'_>, verbose: bool) -> String;

    fn memory_estimate(&self) -> usize;
}

/// Blocks indexed by discrimination id. The fallback slot stays empty.
#[derive(Debug, Clone)]
pub struct BlockSet<B> {
    slots: Vec<Option<B>>,
}

impl<B> Default for BlockSet<B> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<B: LearnerBlock> BlockSet<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots, fallback included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn get(&self, did: usize) -> Option<&B> {
        self.slots.get(did).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, did: usize) -> Option<&mut B> {
        self.slots.get_mut(did).and_then(Option::as_mut)
    }

    /// Block for `ctx`, or `NotTrained` if none was created.
    pub fn require(&self, ctx: &BlockContext<'_>) -> BoxerResult<&B> {
        self.get(ctx.did)
            .ok_or_else(|| BoxerError::NotTrained(ctx.discrimination.name().to_string()))
    }

    pub fn require_mut(&mut self, ctx: &BlockContext<'_>) -> BoxerResult<&mut B> {
        self.get_mut(ctx.did)
            .ok_or_else(|| BoxerError::NotTrained(ctx.discrimination.name().to_string()))
    }

    /// Put `block` in slot `did`, replacing any previous block.
    pub fn insert(&mut self, did: usize, block: B) {
        if self.slots.len() <= did {
            self.slots.resize_with(did + 1, || None);
        }
        self.slots[did] = Some(block);
    }

    /// Drop slot `did`; later ids shift down by one.
    pub fn remove(&mut self, did: usize) -> Option<B> {
        if did < self.slots.len() {
            self.slots.remove(did)
        } else {
            None
        }
    }

    /// Occupied slots in id order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &B)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(did, slot)| slot.as_ref().map(|b| (did, b)))
    }

    pub fn memory_estimate(&self) -> usize {
        self.iter().map(|(_, b)| b.memory_estimate()).sum()
    }
}
