//! Job persistence boundary
//!
//! The scheduler never waits for persistence before a transition becomes
//! visible; saves are issued in the background and failures are logged.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::job::{JobId, JobRecord};
use super::state::State;
use crate::errors::{StorageError, StorageResult};

#[async_trait]
pub trait JobStorage: Send + Sync {
    /// Insert or replace the record of a job
    async fn save(&self, record: JobRecord) -> StorageResult<()>;

    async fn load(&self, id: JobId) -> StorageResult<JobRecord>;

    /// Every record not in a terminal state
    async fn load_active(&self) -> StorageResult<Vec<JobRecord>>;

    /// Records owned by a scheduler, optionally restricted to one state
    async fn load_by_scheduler(
        &self,
        scheduler_id: &str,
        state: Option<State>,
    ) -> StorageResult<Vec<JobRecord>>;
}

/// Process-local storage keeping the latest record of each job
#[derive(Debug, Default)]
pub struct InMemoryJobStorage {
    records: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn sorted(mut records: Vec<JobRecord>) -> Vec<JobRecord> {
    records.sort_by_key(|record| record.id);
    records
}

#[async_trait]
impl JobStorage for InMemoryJobStorage {
    async fn save(&self, record: JobRecord) -> StorageResult<()> {
        let mut records = self.records.write().await;
        // saves are issued concurrently; never let an older snapshot win
        if let Some(existing) = records.get(&record.id) {
            if existing.history.len() > record.history.len() {
                debug!(job_id = record.id, "Ignoring stale job record");
                return Ok(());
            }
        }
        records.insert(record.id, record);
        Ok(())
    }

    async fn load(&self, id: JobId) -> StorageResult<JobRecord> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound { id })
    }

    async fn load_active(&self) -> StorageResult<Vec<JobRecord>> {
        let records = self.records.read().await;
        Ok(sorted(
            records
                .values()
                .filter(|record| !record.state.is_final())
                .cloned()
                .collect(),
        ))
    }

    async fn load_by_scheduler(
        &self,
        scheduler_id: &str,
        state: Option<State>,
    ) -> StorageResult<Vec<JobRecord>> {
        let records = self.records.read().await;
        Ok(sorted(
            records
                .values()
                .filter(|record| record.scheduler_id.as_deref() == Some(scheduler_id))
                .filter(|record| state.is_none_or(|wanted| record.state == wanted))
                .cloned()
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_scheduling::job::{Job, JobOutcome, action_fn};

    fn record(submitter: &str, scheduler: &str, state: State) -> JobRecord {
        let job = Job::builder(submitter, action_fn(|_ctx| async { JobOutcome::done() })).build();
        let mut record = job.record();
        record.scheduler_id = Some(scheduler.to_string());
        record.state = state;
        record
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let storage = InMemoryJobStorage::new();
        let r = record("alice", "get", State::Running);
        storage.save(r.clone()).await.unwrap();
        assert_eq!(storage.load(r.id).await.unwrap(), r);
        assert!(matches!(
            storage.load(u64::MAX).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_queries_filter_by_scheduler_and_state() {
        let storage = InMemoryJobStorage::new();
        storage.save(record("a", "get", State::Running)).await.unwrap();
        storage.save(record("b", "get", State::Done)).await.unwrap();
        storage.save(record("c", "put", State::Restored)).await.unwrap();

        assert_eq!(storage.load_active().await.unwrap().len(), 2);
        assert_eq!(storage.load_by_scheduler("get", None).await.unwrap().len(), 2);
        let restored = storage
            .load_by_scheduler("put", Some(State::Restored))
            .await
            .unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].submitter_id, "c");
        assert!(
            storage
                .load_by_scheduler("put", Some(State::Done))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_stale_record_does_not_overwrite() {
        let storage = InMemoryJobStorage::new();
        let old = record("a", "get", State::TQueued);
        let mut newer = old.clone();
        newer.state = State::Running;
        newer.history.push(crate::job_scheduling::job::JobHistoryEntry {
            state: State::Running,
            description: "running".to_string(),
            at: chrono::Utc::now(),
        });

        storage.save(newer.clone()).await.unwrap();
        storage.save(old.clone()).await.unwrap();
        assert_eq!(storage.load(old.id).await.unwrap().state, State::Running);
    }
}
