//! Capacity-bounded job queue with blocking and non-blocking access
//!
//! The synchronous operations (`try_offer`, `peek`, `remove`, scans) never
//! wait and can be called while a job lock is held. The async operations
//! (`offer` with a timeout, `put`, `take`, `poll`) suspend until space or an
//! element is available.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::job::{Job, JobId};

/// Scores a queued job; the highest score is selected next
pub trait ValueCalculator {
    fn value(&self, queue_length: usize, position: usize, job: &Job) -> i64;
}

impl<F> ValueCalculator for F
where
    F: Fn(usize, usize, &Job) -> i64,
{
    fn value(&self, queue_length: usize, position: usize, job: &Job) -> i64 {
        self(queue_length, position, job)
    }
}

enum Insert {
    Inserted,
    Duplicate,
    Full,
}

#[derive(Debug)]
struct QueueInner {
    jobs: VecDeque<Arc<Job>>,
    capacity: usize,
}

/// FIFO queue of job references with a capacity bound
#[derive(Debug)]
pub struct JobQueue {
    name: String,
    inner: Mutex<QueueInner>,
    not_empty: Notify,
    not_full: Notify,
}

impl JobQueue {
    pub fn new<S: Into<String>>(name: S, capacity: usize) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(QueueInner {
                jobs: VecDeque::new(),
                capacity,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn locked(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn insert(&self, job: &Arc<Job>) -> Insert {
        let mut inner = self.locked();
        if inner.jobs.iter().any(|queued| queued.id() == job.id()) {
            return Insert::Duplicate;
        }
        if inner.jobs.len() >= inner.capacity {
            return Insert::Full;
        }
        inner.jobs.push_back(Arc::clone(job));
        drop(inner);
        self.not_empty.notify_one();
        Insert::Inserted
    }

    fn pop_front(&self) -> Option<Arc<Job>> {
        let job = self.locked().jobs.pop_front();
        if job.is_some() {
            self.not_full.notify_one();
        }
        job
    }

    /// Insert without waiting; false when full or already queued
    pub fn try_offer(&self, job: &Arc<Job>) -> bool {
        match self.insert(job) {
            Insert::Inserted => true,
            Insert::Duplicate => {
                warn!(queue = %self.name, job_id = job.id(), "Job is already queued");
                false
            }
            Insert::Full => {
                debug!(queue = %self.name, job_id = job.id(), "Queue is full");
                false
            }
        }
    }

    /// Insert, waiting up to `timeout` for space. A zero timeout never waits.
    pub async fn offer(&self, job: &Arc<Job>, timeout: Duration) -> bool {
        if timeout.is_zero() {
            return self.try_offer(job);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.insert(job) {
                Insert::Inserted => return true,
                Insert::Duplicate => return false,
                Insert::Full => {}
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_offer(job);
            }
        }
    }

    /// Insert, waiting as long as it takes; false only for a duplicate
    pub async fn put(&self, job: &Arc<Job>) -> bool {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.insert(job) {
                Insert::Inserted => return true,
                Insert::Duplicate => return false,
                Insert::Full => notified.await,
            }
        }
    }

    /// Remove the head, waiting until one is available
    pub async fn take(&self) -> Arc<Job> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.pop_front() {
                return job;
            }
            notified.await;
        }
    }

    /// Remove the head, waiting up to `timeout`
    pub async fn poll(&self, timeout: Duration) -> Option<Arc<Job>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.pop_front() {
                return Some(job);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pop_front();
            }
        }
    }

    pub fn peek(&self) -> Option<Arc<Job>> {
        self.locked().jobs.front().cloned()
    }

    /// Remove a specific job wherever it sits; `None` if it is not queued
    pub fn remove(&self, job: &Job) -> Option<Arc<Job>> {
        self.remove_by_id(job.id())
    }

    pub fn remove_by_id(&self, id: JobId) -> Option<Arc<Job>> {
        let mut inner = self.locked();
        let position = inner.jobs.iter().position(|queued| queued.id() == id)?;
        let removed = inner.jobs.remove(position);
        drop(inner);
        self.not_full.notify_one();
        removed
    }

    pub fn contains(&self, job: &Job) -> bool {
        self.locked().jobs.iter().any(|queued| queued.id() == job.id())
    }

    pub fn len(&self) -> usize {
        self.locked().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().jobs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.locked().capacity
    }

    /// Change the bound for future insertions; queued jobs are never evicted
    pub fn set_capacity(&self, capacity: usize) {
        self.locked().capacity = capacity;
        self.not_full.notify_waiters();
    }

    /// Ordered copy of the queue contents
    pub fn snapshot(&self) -> Vec<Arc<Job>> {
        self.locked().jobs.iter().cloned().collect()
    }

    /// Highest scoring job of a point-in-time snapshot, left in the queue.
    ///
    /// Ties go to the job closest to the head. The snapshot may be stale by
    /// the time the caller acts on it.
    pub fn greatest_value(&self, calculator: &dyn ValueCalculator) -> Option<Arc<Job>> {
        let snapshot = self.snapshot();
        let length = snapshot.len();
        let mut best: Option<(i64, &Arc<Job>)> = None;
        for (position, job) in snapshot.iter().enumerate() {
            let value = calculator.value(length, position, job);
            if best.is_none_or(|(best_value, _)| value > best_value) {
                best = Some((value, job));
            }
        }
        best.map(|(_, job)| Arc::clone(job))
    }

    /// One line per queued job: `id submitter state`
    pub fn describe(&self) -> String {
        let mut out = format!("{} ({}/{}):\n", self.name, self.len(), self.capacity());
        for job in self.snapshot() {
            out.push_str(&format!(
                "    {} {} {}\n",
                job.id(),
                job.submitter_id(),
                job.state()
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_scheduling::job::{JobOutcome, action_fn};

    fn job(submitter: &str) -> Arc<Job> {
        Job::builder(submitter, action_fn(|_ctx| async { JobOutcome::done() })).build()
    }

    #[test]
    fn test_capacity_and_zero_timeout_offer() {
        let queue = JobQueue::new("thread", 2);
        let (a, b, c) = (job("a"), job("b"), job("c"));
        assert!(queue.try_offer(&a));
        assert!(queue.try_offer(&b));
        assert!(!queue.try_offer(&c));
        assert_eq!(queue.len(), 2);

        assert!(queue.remove(&a).is_some());
        assert!(queue.try_offer(&c));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let queue = JobQueue::new("thread", 4);
        let a = job("a");
        queue.try_offer(&a);
        assert!(queue.remove(&a).is_some());
        assert!(queue.remove(&a).is_none());
        assert!(queue.peek().is_none());
        assert!(!queue.contains(&a));
    }

    #[test]
    fn test_duplicate_offer_is_rejected() {
        let queue = JobQueue::new("thread", 4);
        let a = job("a");
        assert!(queue.try_offer(&a));
        assert!(!queue.try_offer(&a));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_shrinking_capacity_keeps_existing_entries() {
        let queue = JobQueue::new("ready", 3);
        for name in ["a", "b", "c"] {
            queue.try_offer(&job(name));
        }
        queue.set_capacity(1);
        assert_eq!(queue.len(), 3);
        assert!(!queue.try_offer(&job("d")));
        queue.pop_front();
        queue.pop_front();
        assert!(!queue.try_offer(&job("e")));
        queue.pop_front();
        assert!(queue.try_offer(&job("f")));
    }

    #[test]
    fn test_greatest_value_prefers_earliest_on_tie() {
        let queue = JobQueue::new("thread", 4);
        let (a, b, c) = (job("a"), job("b"), job("c"));
        for j in [&a, &b, &c] {
            queue.try_offer(j);
        }

        let flat = |_len: usize, _pos: usize, _job: &Job| -> i64 { 0 };
        assert_eq!(queue.greatest_value(&flat).unwrap().id(), a.id());

        let prefer_c = |_len: usize, _pos: usize, job: &Job| -> i64 {
            if job.submitter_id() == "c" { 10 } else { 0 }
        };
        let chosen = queue.greatest_value(&prefer_c).unwrap();
        assert_eq!(chosen.id(), c.id());
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_offer_and_poll() {
        let queue = Arc::new(JobQueue::new("priority", 1));
        let a = job("a");
        let b = job("b");
        assert!(queue.offer(&a, Duration::from_secs(1)).await);
        assert!(!queue.offer(&b, Duration::from_secs(1)).await);

        let consumer = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            consumer.poll(Duration::from_secs(1)).await
        });
        assert!(queue.offer(&b, Duration::from_secs(5)).await);
        assert_eq!(handle.await.unwrap().unwrap().id(), a.id());

        assert_eq!(queue.take().await.id(), b.id());
        assert!(queue.poll(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_put_waits_for_take() {
        let queue = Arc::new(JobQueue::new("thread", 1));
        queue.put(&job("a")).await;

        let producer = Arc::clone(&queue);
        let b = job("b");
        let b_id = b.id();
        let handle = tokio::spawn(async move { producer.put(&b).await });

        queue.take().await;
        assert!(handle.await.unwrap());
        assert_eq!(queue.take().await.id(), b_id);
    }
}
