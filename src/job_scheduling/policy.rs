//! Job priority policies and the name-based policy registry

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::job::Job;
use crate::errors::{SchedulerError, SchedulerResult};

/// Scores a queued job given the submitter's current usage.
///
/// `running_by_owner` is the submitter's usage of the resource the queue
/// feeds (running jobs for the admission queues, ready jobs for the ready
/// queue) and `max_running_by_owner` its quota.
pub trait JobPriorityPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate_job_priority(
        &self,
        queue_length: usize,
        position: usize,
        running_by_owner: usize,
        max_running_by_owner: usize,
        job: &Job,
    ) -> i64;
}

impl fmt::Debug for dyn JobPriorityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobPriorityPolicy({})", self.name())
    }
}

/// Fair share between submitters.
///
/// Below quota a job scores its FIFO age plus a bonus proportional to the
/// submitter's remaining quota, so the result is always at least 1. At or
/// above quota it scores below zero, keeping FIFO order among such jobs.
#[derive(Debug, Default, Clone, Copy)]
pub struct FairSharePolicy;

impl JobPriorityPolicy for FairSharePolicy {
    fn name(&self) -> &'static str {
        "default"
    }

    fn evaluate_job_priority(
        &self,
        queue_length: usize,
        position: usize,
        running_by_owner: usize,
        max_running_by_owner: usize,
        _job: &Job,
    ) -> i64 {
        let length = queue_length as i64;
        let age = length - position as i64;
        if max_running_by_owner == 0 || running_by_owner >= max_running_by_owner {
            return age - length - 1;
        }
        let max = max_running_by_owner as i64;
        let remaining = max - running_by_owner as i64;
        age + length * remaining / max
    }
}

/// Plain FIFO aging, ignoring usage
#[derive(Debug, Default, Clone, Copy)]
pub struct FifoPolicy;

impl JobPriorityPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn evaluate_job_priority(
        &self,
        queue_length: usize,
        position: usize,
        _running_by_owner: usize,
        _max_running_by_owner: usize,
        _job: &Job,
    ) -> i64 {
        queue_length as i64 - position as i64
    }
}

pub type PolicyConstructor = fn() -> Arc<dyn JobPriorityPolicy>;

fn fair_share() -> Arc<dyn JobPriorityPolicy> {
    Arc::new(FairSharePolicy)
}

fn fifo() -> Arc<dyn JobPriorityPolicy> {
    Arc::new(FifoPolicy)
}

/// Maps configuration names to policy constructors
#[derive(Clone)]
pub struct PolicyRegistry {
    constructors: BTreeMap<String, PolicyConstructor>,
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl PolicyRegistry {
    /// Registry without any policy
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry holding `default` and `fifo`
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("default", fair_share);
        registry.register("fifo", fifo);
        registry
    }

    /// Add or replace a policy constructor
    pub fn register<S: Into<String>>(&mut self, name: S, constructor: PolicyConstructor) {
        self.constructors.insert(name.into(), constructor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn create(&self, name: &str) -> SchedulerResult<Arc<dyn JobPriorityPolicy>> {
        self.constructors
            .get(name)
            .map(|constructor| constructor())
            .ok_or_else(|| SchedulerError::unknown_policy(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_scheduling::job::{JobOutcome, action_fn};
    use proptest::prelude::*;

    fn job() -> Arc<Job> {
        Job::builder("any", action_fn(|_ctx| async { JobOutcome::done() })).build()
    }

    #[test]
    fn test_registry_builtins() {
        let registry = PolicyRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["default", "fifo"]);
        assert_eq!(registry.create("fifo").unwrap().name(), "fifo");
        assert!(matches!(
            registry.create("lottery"),
            Err(SchedulerError::UnknownPolicy { .. })
        ));
    }

    #[test]
    fn test_fifo_prefers_head() {
        let job = job();
        let policy = FifoPolicy;
        assert!(
            policy.evaluate_job_priority(5, 0, 0, 10, &job)
                > policy.evaluate_job_priority(5, 4, 0, 10, &job)
        );
    }

    #[test]
    fn test_fair_share_prefers_lighter_submitter() {
        let job = job();
        let policy = FairSharePolicy;
        // same position, less usage wins
        assert!(
            policy.evaluate_job_priority(10, 3, 1, 10, &job)
                > policy.evaluate_job_priority(10, 3, 8, 10, &job)
        );
    }

    proptest! {
        #[test]
        fn prop_over_quota_never_beats_under_quota(
            length in 1usize..200,
            under_pos_seed in any::<usize>(),
            over_pos_seed in any::<usize>(),
            max in 1usize..50,
            under_seed in any::<usize>(),
            over_extra in 0usize..50,
        ) {
            let job = job();
            let policy = FairSharePolicy;
            let under_pos = under_pos_seed % length;
            let over_pos = over_pos_seed % length;
            let under_running = under_seed % max;
            let over_running = max + over_extra;

            let under = policy.evaluate_job_priority(length, under_pos, under_running, max, &job);
            let over = policy.evaluate_job_priority(length, over_pos, over_running, max, &job);
            prop_assert!(under >= 1);
            prop_assert!(over <= -1);
            prop_assert!(under > over);
        }
    }
}
