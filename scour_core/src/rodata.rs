//! The read-only data snapshot shared by all workers.
//!
//! A coordinator owns the mutable corpus state. Whenever it changes, it
//! builds a fresh [`RoData`] and publishes it through a [`SnapshotCell`];
//! workers load the current snapshot once per generation cycle and operate
//! against that pointer for the whole cycle, so the corpus view is stable
//! without any read-side locking. Readers never mutate a snapshot.

use crate::sonar::SonarSite;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One corpus entry as the engine consumes it: the input bytes, its mutation
/// depth, and the running sum of corpus scores up to and including it.
///
/// The corpus vector is ordered so the running sums are non-decreasing; the
/// last entry's sum is the total weight used for sampling.
#[derive(Debug, Clone)]
pub struct InputRecord {
    pub data: Vec<u8>,
    pub depth: usize,
    pub running_score_sum: u64,
}

/// Everything a worker reads while synthesising inputs.
#[derive(Debug, Default)]
pub struct RoData {
    pub corpus: Vec<InputRecord>,
    pub str_lits: Vec<Vec<u8>>,
    pub int_lits: Vec<Vec<u8>>,
    /// Prefix sums over the per-operator effectiveness scores; the last
    /// element is the total. Meaningful only when `can_exploit` is set.
    pub mut_weights: Vec<u32>,
    pub can_exploit: bool,
    pub sonar_sites: Vec<SonarSite>,
}

/// Atomically-swappable publication point for [`RoData`] snapshots.
///
/// `load` is wait-free and returns a reference-counted snapshot the reader
/// can hold across one generate/mutate call; `publish` swaps in a whole new
/// snapshot without blocking readers.
#[derive(Debug)]
pub struct SnapshotCell {
    inner: ArcSwap<RoData>,
}

impl SnapshotCell {
    pub fn new(ro: RoData) -> Self {
        Self {
            inner: ArcSwap::from_pointee(ro),
        }
    }

    pub fn load(&self) -> Arc<RoData> {
        self.inner.load_full()
    }

    pub fn publish(&self, ro: RoData) {
        self.inner.store(Arc::new(ro));
    }
}

/// String and integer literals extracted from the target's source, consumed
/// once at worker startup to seed the substring corpus and the literal pool.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Literals {
    pub strings: Vec<String>,
    pub ints: Vec<Vec<u8>>,
}

/// Per-target metadata shipped by the build pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetaData {
    pub literals: Literals,
}
