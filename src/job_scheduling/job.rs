//! Job entity, its lock guard, and the action contract
//!
//! A [`Job`] owns a short-held mutex around its state and retry metadata.
//! Every state change goes through [`JobGuard::set_state`], which validates
//! the transition, records history, and then notifies the owning scheduler
//! while the lock is still held. That keeps the per-job transition order
//! identical to the order in which the scheduler observes it.

use super::job_scheduler::Scheduler;
use super::state::State;
use super::timer::TimerHandle;
use crate::config::defaults::DEFAULT_JOB_MAX_RETRIES;
use crate::errors::{IllegalStateTransition, SchedulerError, SchedulerResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type JobId = u64;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

fn next_job_id() -> JobId {
    NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed)
}

/// One entry of a job's transition log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHistoryEntry {
    pub state: State,
    pub description: String,
    pub at: DateTime<Utc>,
}

/// Serializable snapshot of a job, used for persistence and diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub submitter_id: String,
    pub scheduler_id: Option<String>,
    pub state: State,
    pub retries: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_transition: DateTime<Utc>,
    pub error_message: String,
    pub history: Vec<JobHistoryEntry>,
}

/// Successful completion modes of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Nothing left to do, the job goes to DONE
    Done,
    /// The result must be staged on the ready queue
    Staged,
}

/// What a job action reports back to the execution task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success(Completion),
    RecoverableFailure { reason: String },
    FatalFailure { reason: String },
}

impl JobOutcome {
    pub fn done() -> Self {
        Self::Success(Completion::Done)
    }

    pub fn staged() -> Self {
        Self::Success(Completion::Staged)
    }

    pub fn recoverable<S: Into<String>>(reason: S) -> Self {
        Self::RecoverableFailure {
            reason: reason.into(),
        }
    }

    pub fn fatal<S: Into<String>>(reason: S) -> Self {
        Self::FatalFailure {
            reason: reason.into(),
        }
    }
}

/// The opaque work a job performs.
///
/// Actions run on a worker without the job lock held. Cancellation of a
/// running job is cooperative: an action that wants to stop early should
/// watch [`JobContext::cancelled`].
#[async_trait]
pub trait JobAction: Send + Sync {
    async fn run(&self, ctx: JobContext) -> JobOutcome;
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> JobAction for FnAction<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> JobOutcome {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`JobAction`]
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn JobAction>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    Arc::new(FnAction(f))
}

/// Handle given to a running action
#[derive(Clone)]
pub struct JobContext {
    job: Arc<Job>,
    scheduler: Arc<Scheduler>,
}

impl JobContext {
    pub(crate) fn new(job: Arc<Job>, scheduler: Arc<Scheduler>) -> Self {
        Self { job, scheduler }
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn is_cancelled(&self) -> bool {
        self.job.cancel_token.is_cancelled()
    }

    /// Resolves once the job has been moved to CANCELED
    pub async fn cancelled(&self) {
        self.job.cancel_token.cancelled().await
    }

    /// Let the action finish or park the job itself (DONE, ASYNCWAIT, ...).
    ///
    /// Goes through [`Scheduler::set_state`], so staging a result or asking
    /// for a retry gets the same queue and timer handling as an outcome.
    pub fn set_state(&self, state: State, description: &str) -> SchedulerResult<()> {
        self.scheduler.set_state(&self.job, state, description)
    }
}

/// Receives every state change of the jobs attached to it.
///
/// Called with the job lock held: implementations must not lock the job
/// again and must not block.
pub(crate) trait StateObserver: Send + Sync {
    fn state_changed(&self, job: &JobGuard<'_>, old: State, dangling_timer: Option<TimerHandle>);
}

struct SchedulerLink {
    id: String,
    observer: Weak<dyn StateObserver>,
}

pub(crate) struct JobInner {
    state: State,
    retries: u32,
    max_retries: u32,
    retry_timer: Option<TimerHandle>,
    lifetime_timer: Option<TimerHandle>,
    lifetime_deadline: Option<Instant>,
    history: Vec<JobHistoryEntry>,
    error_message: String,
    last_transition: DateTime<Utc>,
}

pub struct Job {
    id: JobId,
    submitter_id: String,
    created_at: DateTime<Utc>,
    lifetime: Option<Duration>,
    action: Arc<dyn JobAction>,
    scheduler: OnceLock<SchedulerLink>,
    cancel_token: CancellationToken,
    self_ref: Weak<Job>,
    inner: Mutex<JobInner>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("submitter_id", &self.submitter_id)
            .field("scheduler_id", &self.scheduler_id())
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn builder<S: Into<String>>(submitter_id: S, action: Arc<dyn JobAction>) -> JobBuilder {
        JobBuilder {
            id: None,
            submitter_id: submitter_id.into(),
            action,
            max_retries: DEFAULT_JOB_MAX_RETRIES,
            lifetime: None,
            restored_retries: None,
            history: Vec::new(),
            error_message: String::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn submitter_id(&self) -> &str {
        &self.submitter_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn lifetime(&self) -> Option<Duration> {
        self.lifetime
    }

    pub fn scheduler_id(&self) -> Option<&str> {
        self.scheduler.get().map(|link| link.id.as_str())
    }

    pub(crate) fn action(&self) -> Arc<dyn JobAction> {
        Arc::clone(&self.action)
    }

    /// Token cancelled when the job reaches CANCELED
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Owning handle to this job
    pub fn handle(&self) -> Option<Arc<Job>> {
        self.self_ref.upgrade()
    }

    /// Acquire the job's exclusive lock
    pub fn lock(&self) -> JobGuard<'_> {
        JobGuard {
            job: self,
            inner: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn state(&self) -> State {
        self.lock().state()
    }

    pub fn retries(&self) -> u32 {
        self.lock().retries()
    }

    pub fn error_message(&self) -> String {
        self.lock().error_message().to_string()
    }

    pub fn history(&self) -> Vec<JobHistoryEntry> {
        self.lock().history().to_vec()
    }

    /// Transition log, one line per entry
    pub fn history_text(&self) -> String {
        let guard = self.lock();
        guard
            .history()
            .iter()
            .map(|entry| {
                format!(
                    "{} {}: {}",
                    entry.at.format("%Y-%m-%d %H:%M:%S%.3f"),
                    entry.state,
                    entry.description
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn record(&self) -> JobRecord {
        self.lock().record()
    }

    /// Bind the job to a scheduler; a job can only ever belong to one.
    /// Returns true when this call created the binding.
    pub(crate) fn attach(
        &self,
        scheduler_id: &str,
        observer: Weak<dyn StateObserver>,
    ) -> SchedulerResult<bool> {
        let mut attached_now = false;
        let link = self.scheduler.get_or_init(|| {
            attached_now = true;
            SchedulerLink {
                id: scheduler_id.to_string(),
                observer,
            }
        });
        if link.id == scheduler_id {
            Ok(attached_now)
        } else {
            Err(SchedulerError::SchedulerMismatch {
                job_id: self.id,
                attached: link.id.clone(),
                requested: scheduler_id.to_string(),
            })
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.lock();
        write!(
            f,
            "{} {} {} retries={}",
            self.id,
            self.submitter_id,
            guard.state(),
            guard.retries()
        )
    }
}

/// Exclusive access to a job's mutable state
pub struct JobGuard<'a> {
    job: &'a Job,
    inner: MutexGuard<'a, JobInner>,
}

impl<'a> JobGuard<'a> {
    pub fn job(&self) -> &'a Job {
        self.job
    }

    pub fn state(&self) -> State {
        self.inner.state
    }

    pub fn retries(&self) -> u32 {
        self.inner.retries
    }

    pub fn max_retries(&self) -> u32 {
        self.inner.max_retries
    }

    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.inner.max_retries = max_retries;
    }

    pub fn error_message(&self) -> &str {
        &self.inner.error_message
    }

    pub fn history(&self) -> &[JobHistoryEntry] {
        &self.inner.history
    }

    pub fn last_transition(&self) -> DateTime<Utc> {
        self.inner.last_transition
    }

    pub fn record(&self) -> JobRecord {
        JobRecord {
            id: self.job.id,
            submitter_id: self.job.submitter_id.clone(),
            scheduler_id: self.job.scheduler_id().map(str::to_string),
            state: self.inner.state,
            retries: self.inner.retries,
            max_retries: self.inner.max_retries,
            created_at: self.job.created_at,
            last_transition: self.inner.last_transition,
            error_message: self.inner.error_message.clone(),
            history: self.inner.history.clone(),
        }
    }

    /// Move the job to `new`.
    ///
    /// Setting the current state again is a no-op. An illegal transition
    /// leaves the job untouched.
    pub fn set_state<S: AsRef<str>>(
        &mut self,
        new: State,
        description: S,
    ) -> Result<(), IllegalStateTransition> {
        let old = self.inner.state;
        if old == new {
            return Ok(());
        }
        if !old.can_transition_to(new) {
            return Err(IllegalStateTransition {
                job_id: self.job.id,
                from: old,
                to: new,
            });
        }

        let description = description.as_ref().trim();
        let now = Utc::now();
        self.inner.state = new;
        self.inner.last_transition = now;
        self.inner.history.push(JobHistoryEntry {
            state: new,
            description: description.to_string(),
            at: now,
        });
        if !description.is_empty() {
            if !self.inner.error_message.is_empty() {
                self.inner.error_message.push('\n');
            }
            self.inner.error_message.push_str(description);
        }

        if new == State::RetryWait {
            self.inner.retries += 1;
        }
        if new == State::Canceled {
            self.job.cancel_token.cancel();
        }
        if new.is_final() {
            if let Some(timer) = self.inner.lifetime_timer.take() {
                timer.cancel();
            }
        }
        let dangling_timer = if old == State::RetryWait {
            self.inner.retry_timer.take()
        } else {
            None
        };

        match self.job.scheduler.get().and_then(|l| l.observer.upgrade()) {
            Some(observer) => observer.state_changed(self, old, dangling_timer),
            None => {
                if let Some(timer) = dangling_timer {
                    timer.cancel();
                }
            }
        }
        Ok(())
    }

    /// Attach the retry timer; only meaningful while in RETRYWAIT
    pub(crate) fn set_retry_timer(&mut self, timer: TimerHandle) {
        if let Some(previous) = self.inner.retry_timer.replace(timer) {
            previous.cancel();
        }
    }

    /// A retry timer is armed and has not been cancelled
    pub(crate) fn has_live_retry_timer(&self) -> bool {
        self.inner
            .retry_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_cancelled())
    }

    pub(crate) fn has_live_lifetime_timer(&self) -> bool {
        self.inner
            .lifetime_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_cancelled())
    }

    /// Expiry instant, fixed the first time the lifetime is armed
    pub(crate) fn lifetime_deadline(&mut self, lifetime: Duration) -> Instant {
        *self
            .inner
            .lifetime_deadline
            .get_or_insert_with(|| Instant::now() + lifetime)
    }

    pub(crate) fn has_lifetime_deadline(&self) -> bool {
        self.inner.lifetime_deadline.is_some()
    }

    pub(crate) fn set_lifetime_timer(&mut self, timer: TimerHandle) {
        if let Some(previous) = self.inner.lifetime_timer.replace(timer) {
            previous.cancel();
        }
    }
}

/// Builder returned by [`Job::builder`]
pub struct JobBuilder {
    id: Option<JobId>,
    submitter_id: String,
    action: Arc<dyn JobAction>,
    max_retries: u32,
    lifetime: Option<Duration>,
    restored_retries: Option<u32>,
    history: Vec<JobHistoryEntry>,
    error_message: String,
}

impl JobBuilder {
    /// Rebuild a job from a persisted record; the job starts RESTORED
    pub fn from_record(record: &JobRecord, action: Arc<dyn JobAction>) -> Self {
        let mut builder = Job::builder(record.submitter_id.clone(), action)
            .id(record.id)
            .max_retries(record.max_retries)
            .restored(record.retries);
        builder.history = record.history.clone();
        builder.error_message = record.error_message.clone();
        builder
    }

    pub fn id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Start in RESTORED with the given retry count instead of PENDING
    pub fn restored(mut self, retries: u32) -> Self {
        self.restored_retries = Some(retries);
        self
    }

    pub fn build(self) -> Arc<Job> {
        let now = Utc::now();
        let (state, retries, description) = match self.restored_retries {
            Some(retries) => (State::Restored, retries, "restored"),
            None => (State::Pending, 0, "created"),
        };
        let mut history = self.history;
        history.push(JobHistoryEntry {
            state,
            description: description.to_string(),
            at: now,
        });

        Arc::new_cyclic(|self_ref| Job {
            id: self.id.unwrap_or_else(next_job_id),
            submitter_id: self.submitter_id,
            created_at: now,
            lifetime: self.lifetime,
            action: self.action,
            scheduler: OnceLock::new(),
            cancel_token: CancellationToken::new(),
            self_ref: self_ref.clone(),
            inner: Mutex::new(JobInner {
                state,
                retries,
                max_retries: self.max_retries,
                retry_timer: None,
                lifetime_timer: None,
                lifetime_deadline: None,
                history,
                error_message: self.error_message,
                last_transition: now,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;

    fn noop() -> Arc<dyn JobAction> {
        action_fn(|_ctx| async { JobOutcome::done() })
    }

    #[test]
    fn test_new_job_is_pending_with_unique_id() {
        let a = Job::builder("alice", noop()).build();
        let b = Job::builder("alice", noop()).build();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), State::Pending);
        assert_eq!(a.retries(), 0);
        assert_eq!(a.lock().max_retries(), DEFAULT_JOB_MAX_RETRIES);
        assert!(Arc::ptr_eq(&a.handle().unwrap(), &a));
    }

    #[test]
    fn test_illegal_transition_leaves_state_untouched() {
        let job = Job::builder("alice", noop()).build();
        let err = job.lock().set_state(State::Running, "skip ahead").unwrap_err();
        assert_eq!(err.from, State::Pending);
        assert_eq!(err.to, State::Running);
        assert_eq!(job.state(), State::Pending);
        assert_eq!(job.history().len(), 1);
    }

    #[test]
    fn test_history_and_error_message_accumulate() {
        let job = Job::builder("alice", noop()).build();
        {
            let mut guard = job.lock();
            guard.set_state(State::TQueued, "queued").unwrap();
            guard.set_state(State::Running, "running").unwrap();
            guard.set_state(State::RetryWait, "transient").unwrap();
        }
        assert_eq!(job.retries(), 1);
        let states: Vec<State> = job.history().iter().map(|h| h.state).collect();
        assert_eq!(
            states,
            vec![State::Pending, State::TQueued, State::Running, State::RetryWait]
        );
        assert_eq!(job.error_message(), "queued\nrunning\ntransient");
        assert!(job.history_text().contains("RETRYWAIT: transient"));
    }

    #[test]
    fn test_cancel_triggers_token_and_is_terminal() {
        let job = Job::builder("bob", noop()).build();
        let token = job.cancellation_token();
        job.lock().set_state(State::Canceled, "user request").unwrap();
        assert!(token.is_cancelled());
        assert!(job.lock().set_state(State::TQueued, "again").is_err());
    }

    #[test]
    fn test_restored_job_from_record() {
        let job = Job::builder("carol", noop()).max_retries(3).build();
        let mut record = job.record();
        record.retries = 2;

        let restored = JobBuilder::from_record(&record, noop()).build();
        assert_eq!(restored.id(), job.id());
        assert_eq!(restored.state(), State::Restored);
        assert_eq!(restored.retries(), 2);
        assert_eq!(restored.lock().max_retries(), 3);
        assert_eq!(restored.history().len(), 2);
    }

    #[tokio::test]
    async fn test_action_fn_runs_closure() {
        let scheduler = Scheduler::with_config(SchedulerConfig::with_id("ctx")).unwrap();
        let action = action_fn(|ctx| async move {
            if ctx.job().submitter_id() == "alice" {
                JobOutcome::staged()
            } else {
                JobOutcome::fatal("unknown submitter")
            }
        });
        let job = Job::builder("alice", Arc::clone(&action)).build();
        let outcome = job
            .action()
            .run(JobContext::new(Arc::clone(&job), scheduler))
            .await;
        assert_eq!(outcome, JobOutcome::staged());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timers_are_not_live() {
        let timer = crate::job_scheduling::timer::JobTimer::new();
        let job = Job::builder("dave", noop()).lifetime(Duration::from_secs(5)).build();
        let mut guard = job.lock();
        assert!(!guard.has_live_lifetime_timer());
        assert!(!guard.has_lifetime_deadline());

        let deadline = guard.lifetime_deadline(Duration::from_secs(5));
        guard.set_lifetime_timer(timer.schedule(Duration::from_secs(5), || async {}));
        guard.set_retry_timer(timer.schedule(Duration::from_secs(1), || async {}));
        assert!(guard.has_live_lifetime_timer());
        assert!(guard.has_live_retry_timer());

        timer.shutdown();
        assert!(!guard.has_live_lifetime_timer());
        assert!(!guard.has_live_retry_timer());
        // re-arming keeps the original deadline
        assert_eq!(guard.lifetime_deadline(Duration::from_secs(60)), deadline);
    }
}
