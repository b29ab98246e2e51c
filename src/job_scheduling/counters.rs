//! Per-submitter counters for every pipeline stage
//!
//! Counters are only mutated from the scheduler's state-change hook and from
//! the worker guard of an execution task; everything else reads snapshots.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use strum::{Display, EnumIter, IntoEnumIterator};
use tracing::warn;

/// Pipeline stage a counter tracks
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    PriorityQueued,
    ThreadQueued,
    Running,
    RunningWithoutThread,
    ReadyQueued,
    Ready,
    AsyncWait,
    RetryWait,
    Restored,
    WorkerThreads,
}

/// Mapping from submitter id to a non-negative count
#[derive(Debug, Default)]
pub struct CreatorCounters {
    counts: Mutex<HashMap<String, usize>>,
}

impl CreatorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, submitter: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.entry(submitter.to_string()).or_insert(0) += 1;
    }

    /// Decrement, never going below zero
    pub fn decrement(&self, submitter: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        match counts.get_mut(submitter) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.remove(submitter);
            }
            None => warn!(submitter, "Counter decrement for submitter with zero count"),
        }
    }

    pub fn value(&self, submitter: &str) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(submitter)
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    /// Point-in-time copy ordered by submitter id
    pub fn snapshot(&self) -> BTreeMap<String, usize> {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

/// One [`CreatorCounters`] per [`Stage`]
#[derive(Debug)]
pub struct StageCounters {
    stages: HashMap<Stage, CreatorCounters>,
}

impl Default for StageCounters {
    fn default() -> Self {
        Self {
            stages: Stage::iter().map(|s| (s, CreatorCounters::new())).collect(),
        }
    }
}

impl StageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, stage: Stage) -> &CreatorCounters {
        // every variant is inserted by Default
        &self.stages[&stage]
    }

    pub fn increment(&self, stage: Stage, submitter: &str) {
        self.stage(stage).increment(submitter);
    }

    pub fn decrement(&self, stage: Stage, submitter: &str) {
        self.stage(stage).decrement(submitter);
    }

    pub fn value(&self, stage: Stage, submitter: &str) -> usize {
        self.stage(stage).value(submitter)
    }

    pub fn total(&self, stage: Stage) -> usize {
        self.stage(stage).total()
    }
}
