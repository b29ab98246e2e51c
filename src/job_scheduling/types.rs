//! Introspection snapshots of a scheduler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::counters::Stage;
use super::job::JobId;

/// Totals of one pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage: Stage,
    pub total: usize,
    pub by_submitter: BTreeMap<String, usize>,
}

/// Contents of one queue in head-to-tail order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub len: usize,
    pub capacity: usize,
    pub job_ids: Vec<JobId>,
}

/// Point-in-time statistics of a scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub scheduler_id: String,
    pub running: bool,
    pub thread_pool_size: usize,
    pub available_workers: usize,
    pub use_fairness: bool,
    pub priority_policy: String,
    pub stages: Vec<StageSnapshot>,
    pub queues: Vec<QueueSnapshot>,
    pub captured_at: DateTime<Utc>,
}

impl SchedulerStats {
    pub fn stage_total(&self, stage: Stage) -> usize {
        self.stages
            .iter()
            .find(|snapshot| snapshot.stage == stage)
            .map_or(0, |snapshot| snapshot.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_serialize_stage_names() {
        let stats = SchedulerStats {
            scheduler_id: "get".to_string(),
            running: true,
            thread_pool_size: 2,
            available_workers: 1,
            use_fairness: true,
            priority_policy: "default".to_string(),
            stages: vec![StageSnapshot {
                stage: Stage::RunningWithoutThread,
                total: 1,
                by_submitter: BTreeMap::from([("alice".to_string(), 1)]),
            }],
            queues: vec![],
            captured_at: Utc::now(),
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["stages"][0]["stage"], "running_without_thread");
        assert_eq!(stats.stage_total(Stage::RunningWithoutThread), 1);
        assert_eq!(stats.stage_total(Stage::Ready), 0);
    }
}
