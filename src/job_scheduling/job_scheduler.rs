//! Scheduler: admission, fair selection, dispatch and retry of jobs
//!
//! Each scheduler owns three queues:
//! - the thread queue for first admission (PENDING/RESTORED jobs)
//! - the priority queue for re-admission (after ASYNCWAIT, RETRYWAIT,
//!   RUNNINGWITHOUTTHREAD)
//! - the ready queue for jobs whose results are staged for consumption
//!
//! A single control loop task per scheduler drains the priority queue, then
//! the thread queue, onto the worker pool, promotes staged jobs to READY, and
//! sleeps until it is woken or the maximum wait elapses. All counter updates
//! and queue removals caused by transitions happen in the state-change hook.

use super::counters::{Stage, StageCounters};
use super::job::{Job, JobAction, JobBuilder, JobGuard, JobId, JobRecord, StateObserver};
use super::job_executor::{JobExecutionTask, WorkerPool};
use super::job_queue::JobQueue;
use super::policy::{JobPriorityPolicy, PolicyRegistry};
use super::state::State;
use super::storage::JobStorage;
use super::timer::{JobTimer, TimerHandle};
use super::types::{QueueSnapshot, SchedulerStats, StageSnapshot};
use crate::config::{RestorePolicy, SchedulerConfig};
use crate::errors::{IllegalStateTransition, SchedulerError, SchedulerResult};
use crate::observability::SchedulerMetrics;
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct ControlLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainOutcome {
    Empty,
    Saturated,
    Rejected,
}

pub struct Scheduler {
    id: String,
    self_ref: Weak<Scheduler>,
    settings: RwLock<SchedulerConfig>,
    policies: PolicyRegistry,
    policy: RwLock<Arc<dyn JobPriorityPolicy>>,
    thread_queue: JobQueue,
    priority_queue: JobQueue,
    ready_queue: JobQueue,
    counters: StageCounters,
    pool: WorkerPool,
    timer: JobTimer,
    wakeup: Notify,
    control: Mutex<Option<ControlLoop>>,
    /// Unfinished jobs attached to this scheduler
    jobs: Mutex<HashMap<JobId, Weak<Job>>>,
    storage: Option<Arc<dyn JobStorage>>,
    metrics: SchedulerMetrics,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler; the control loop is not running until `start`
    pub fn new(
        config: SchedulerConfig,
        policies: &PolicyRegistry,
        storage: Option<Arc<dyn JobStorage>>,
        metrics: SchedulerMetrics,
    ) -> SchedulerResult<Arc<Self>> {
        config.validate(policies)?;
        let policy = policies.create(&config.priority_policy)?;

        Ok(Arc::new_cyclic(|self_ref| Self {
            id: config.id.clone(),
            self_ref: self_ref.clone(),
            thread_queue: JobQueue::new("thread queue", config.max_thread_queue_size),
            priority_queue: JobQueue::new("priority thread queue", config.max_thread_queue_size),
            ready_queue: JobQueue::new("ready queue", config.max_ready_queue_size),
            pool: WorkerPool::new(config.thread_pool_size),
            settings: RwLock::new(config),
            policies: policies.clone(),
            policy: RwLock::new(policy),
            counters: StageCounters::new(),
            timer: JobTimer::new(),
            wakeup: Notify::new(),
            control: Mutex::new(None),
            jobs: Mutex::new(HashMap::new()),
            storage,
            metrics,
        }))
    }

    /// Scheduler with the built-in policies, no storage and global metrics
    pub fn with_config(config: SchedulerConfig) -> SchedulerResult<Arc<Self>> {
        let metrics = SchedulerMetrics::new(&config.id);
        Self::new(config, &PolicyRegistry::with_builtins(), None, metrics)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn settings(&self) -> RwLockReadGuard<'_, SchedulerConfig> {
        self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_settings(&self, update: impl FnOnce(&mut SchedulerConfig)) {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut settings);
    }

    /// Current settings
    pub fn config(&self) -> SchedulerConfig {
        self.settings().clone()
    }

    fn policy(&self) -> Arc<dyn JobPriorityPolicy> {
        Arc::clone(&self.policy.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn counters(&self) -> &StageCounters {
        &self.counters
    }

    pub fn thread_queue(&self) -> &JobQueue {
        &self.thread_queue
    }

    pub fn priority_queue(&self) -> &JobQueue {
        &self.priority_queue
    }

    pub fn ready_queue(&self) -> &JobQueue {
        &self.ready_queue
    }

    pub(crate) fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    pub(crate) fn max_number_of_retries(&self) -> u32 {
        self.settings().max_number_of_retries
    }

    /// Wake the control loop for an early pass
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawn the control loop and re-arm the timers a previous `stop`
    /// disarmed
    pub fn start(&self) -> SchedulerResult<()> {
        {
            let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
            if control.is_some() {
                return Err(SchedulerError::AlreadyRunning {
                    id: self.id.clone(),
                });
            }
            let this = self
                .self_ref
                .upgrade()
                .ok_or_else(|| SchedulerError::not_running(&self.id))?;
            let token = CancellationToken::new();
            let handle = tokio::spawn(this.control_loop(token.clone()));
            *control = Some(ControlLoop { token, handle });
        }
        self.rearm_timers();
        info!(scheduler_id = %self.id, "Scheduler started");
        Ok(())
    }

    fn live_jobs(&self) -> Vec<Arc<Job>> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.retain(|_, job| job.strong_count() > 0);
        jobs.values().filter_map(Weak::upgrade).collect()
    }

    /// Lifetime timers resume with their original deadline; RETRYWAIT jobs
    /// get a fresh retry timer
    fn rearm_timers(&self) {
        let mut rearmed = 0;
        for job in self.live_jobs() {
            let mut guard = job.lock();
            let state = guard.state();
            if state.is_final() {
                continue;
            }
            if guard.has_lifetime_deadline() && !guard.has_live_lifetime_timer() {
                self.arm_lifetime(&mut guard, &job);
                rearmed += 1;
            }
            if state == State::RetryWait && !guard.has_live_retry_timer() {
                guard.set_retry_timer(self.start_retry_timer(&job));
                rearmed += 1;
            }
        }
        if rearmed > 0 {
            debug!(scheduler_id = %self.id, "Re-armed {} job timers", rearmed);
        }
    }

    /// Stop the control loop and disarm all timers.
    ///
    /// Jobs stay in their queues and in-flight actions run to completion.
    pub async fn stop(&self) -> SchedulerResult<()> {
        let control = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SchedulerError::not_running(&self.id))?;
        control.token.cancel();
        self.timer.shutdown();
        if let Err(e) = control.handle.await {
            error!(scheduler_id = %self.id, "Control loop ended abnormally: {}", e);
        }
        info!(scheduler_id = %self.id, "Scheduler stopped");
        Ok(())
    }

    /// Wait for every dispatched action to finish
    pub async fn wait_idle(&self) {
        self.pool.wait_idle().await;
    }

    /// Attach the job on first contact, accounting it under its current stage
    fn ensure_owner(&self, job: &Arc<Job>) -> SchedulerResult<()> {
        let observer: Weak<dyn StateObserver> = self.self_ref.clone();
        if job.attach(&self.id, observer)? {
            let state = job.state();
            if let Some(stage) = state.stage() {
                self.counters.increment(stage, job.submitter_id());
            }
            if !state.is_final() {
                self.jobs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(job.id(), Arc::downgrade(job));
            }
        }
        Ok(())
    }

    /// Admit a job.
    ///
    /// PENDING and RESTORED jobs go to the thread queue; jobs coming back
    /// from ASYNCWAIT, RETRYWAIT or RUNNINGWITHOUTTHREAD go to the priority
    /// queue. A full queue fails the job rather than blocking the caller.
    pub fn schedule(&self, job: &Arc<Job>) -> SchedulerResult<()> {
        self.ensure_owner(job)?;
        let mut guard = job.lock();
        match guard.state() {
            State::Pending | State::Restored => {
                let max = self.settings().max_thread_queue_size;
                if self.counters.total(Stage::ThreadQueued) >= max {
                    self.metrics.record_admission_rejection("thread");
                    guard.set_state(State::Failed, "too many jobs in the queue")?;
                    return Ok(());
                }
                guard.set_state(State::TQueued, "put on the thread queue")?;
                self.arm_lifetime(&mut guard, job);
                if self.thread_queue.try_offer(job) {
                    self.metrics.record_scheduled();
                    self.wake();
                } else {
                    self.metrics.record_admission_rejection("thread");
                    guard.set_state(State::Failed, "thread queue is full")?;
                }
            }
            State::AsyncWait | State::RetryWait | State::RunningWithoutThread => {
                guard.set_state(State::PriorityTQueued, "in priority thread queue")?;
                self.enqueue_priority(&mut guard, job)?;
            }
            state => {
                return Err(SchedulerError::CannotSchedule {
                    job_id: job.id(),
                    state,
                });
            }
        }
        Ok(())
    }

    fn enqueue_priority(&self, guard: &mut JobGuard<'_>, job: &Arc<Job>) -> SchedulerResult<()> {
        if self.priority_queue.try_offer(job) {
            self.metrics.record_scheduled();
            self.wake();
        } else {
            self.metrics.record_admission_rejection("priority");
            guard.set_state(State::Failed, "priority thread queue is full, failing request")?;
        }
        Ok(())
    }

    /// Cancel a job. Returns false if it had already finished.
    ///
    /// A queued job leaves its queue immediately. A running action is not
    /// interrupted; it can observe the cancellation through its context.
    pub fn cancel(&self, job: &Arc<Job>, reason: &str) -> SchedulerResult<bool> {
        self.ensure_owner(job)?;
        let mut guard = job.lock();
        if guard.state().is_final() {
            return Ok(false);
        }
        guard.set_state(State::Canceled, reason)?;
        info!(scheduler_id = %self.id, job_id = job.id(), "Job canceled: {}", reason);
        Ok(true)
    }

    /// Apply an externally requested transition through the state machine.
    ///
    /// Requests for a queued state are admissions and go through `schedule`.
    /// RQUEUED offers the job to the ready queue and RETRYWAIT arms a retry
    /// timer, or fails the job once its retry budget is spent. RUNNING and
    /// READY are only entered by the control loop and are refused.
    pub fn set_state(&self, job: &Arc<Job>, state: State, description: &str) -> SchedulerResult<()> {
        self.ensure_owner(job)?;
        match state {
            State::TQueued | State::PriorityTQueued => {
                let current = job.state();
                if !current.can_transition_to(state) {
                    return Err(IllegalStateTransition {
                        job_id: job.id(),
                        from: current,
                        to: state,
                    }
                    .into());
                }
                self.schedule(job)
            }
            State::Running | State::Ready => Err(SchedulerError::ReservedState {
                job_id: job.id(),
                state,
            }),
            State::RQueued | State::RetryWait => {
                let mut guard = job.lock();
                let current = guard.state();
                if current == state {
                    return Ok(());
                }
                if !current.can_transition_to(state) {
                    return Err(IllegalStateTransition {
                        job_id: job.id(),
                        from: current,
                        to: state,
                    }
                    .into());
                }
                if state == State::RQueued {
                    self.stage_result(&mut guard, job, description)?;
                } else {
                    self.retry_or_fail(&mut guard, job, description)?;
                }
                Ok(())
            }
            _ => {
                job.lock().set_state(state, description)?;
                Ok(())
            }
        }
    }

    /// Move a RUNNING job to RQUEUED and offer it to the ready queue
    pub(crate) fn stage_result(
        &self,
        guard: &mut JobGuard<'_>,
        job: &Arc<Job>,
        description: &str,
    ) -> Result<(), IllegalStateTransition> {
        guard.set_state(State::RQueued, description)?;
        if self.ready_queue.try_offer(job) {
            self.wake();
        } else {
            guard.set_state(
                State::Failed,
                "all ready slots are taken and the ready queue is full",
            )?;
        }
        Ok(())
    }

    /// Park a RUNNING job in RETRYWAIT with a retry timer, or fail it when
    /// `min(max_number_of_retries, job max_retries)` retries are used up
    pub(crate) fn retry_or_fail(
        &self,
        guard: &mut JobGuard<'_>,
        job: &Arc<Job>,
        reason: &str,
    ) -> Result<(), IllegalStateTransition> {
        let budget = self.max_number_of_retries().min(guard.max_retries());
        if guard.retries() < budget {
            guard.set_state(State::RetryWait, format!("nonfatal error [{reason}] retrying"))?;
            guard.set_retry_timer(self.start_retry_timer(job));
            info!(
                job_id = job.id(),
                retries = guard.retries(),
                "Job will be retried: {}", reason
            );
        } else {
            guard.set_state(State::Failed, format!("number of retries exceeded: {reason}"))?;
        }
        Ok(())
    }

    /// Lifetime expiry: staged results are considered delivered, anything
    /// still in progress fails. Finished jobs are left alone.
    pub fn expire(&self, job: &Arc<Job>) -> SchedulerResult<()> {
        self.ensure_owner(job)?;
        let mut guard = job.lock();
        let state = guard.state();
        if state.is_final() {
            return Ok(());
        }
        let target = match state {
            State::Ready | State::Transferring => State::Done,
            _ => State::Failed,
        };
        guard.set_state(target, "lifetime expired")?;
        info!(scheduler_id = %self.id, job_id = job.id(), %state, "Job lifetime expired");
        Ok(())
    }

    fn arm_lifetime(&self, guard: &mut JobGuard<'_>, job: &Arc<Job>) {
        let Some(lifetime) = job.lifetime() else {
            return;
        };
        if guard.has_live_lifetime_timer() {
            return;
        }
        let delay = guard
            .lifetime_deadline(lifetime)
            .saturating_duration_since(Instant::now());
        let scheduler = self.self_ref.clone();
        let target = Arc::clone(job);
        let timer = self.timer.schedule(delay, move || async move {
            if let Some(scheduler) = scheduler.upgrade() {
                if let Err(e) = scheduler.expire(&target) {
                    warn!(job_id = target.id(), "Lifetime expiry failed: {}", e);
                }
            }
        });
        guard.set_lifetime_timer(timer);
    }

    /// Register a job that was found RESTORED after a restart and apply the
    /// configured restore policy to it.
    pub fn restore(&self, job: &Arc<Job>) -> SchedulerResult<()> {
        self.ensure_owner(job)?;
        let policy = self.settings().restore_policy;
        {
            let mut guard = job.lock();
            let state = guard.state();
            if state != State::Restored {
                return Err(SchedulerError::CannotSchedule {
                    job_id: job.id(),
                    state,
                });
            }
            match policy {
                RestorePolicy::Fail => {
                    guard.set_state(State::Failed, "restored job failed by restore policy")?;
                    return Ok(());
                }
                RestorePolicy::WaitForUpdate => {
                    debug!(job_id = job.id(), "Restored job waits for a client update");
                    return Ok(());
                }
                RestorePolicy::Restore => {}
            }
        }
        self.schedule(job)
    }

    /// Rebuild this scheduler's unfinished jobs from storage and restore
    /// them. `action_for` supplies the action of each record; records it
    /// returns `None` for are skipped.
    pub async fn restore_from_storage<F>(&self, action_for: F) -> SchedulerResult<Vec<Arc<Job>>>
    where
        F: Fn(&JobRecord) -> Option<Arc<dyn JobAction>>,
    {
        let Some(storage) = &self.storage else {
            return Ok(Vec::new());
        };
        let records = storage.load_by_scheduler(&self.id, None).await?;
        let mut restored = Vec::new();
        for record in records.iter().filter(|record| !record.state.is_final()) {
            let Some(action) = action_for(record) else {
                warn!(scheduler_id = %self.id, job_id = record.id, "No action for restored job, skipping");
                continue;
            };
            let job = JobBuilder::from_record(record, action).build();
            self.restore(&job)?;
            restored.push(job);
        }
        info!(scheduler_id = %self.id, "Restored {} jobs from storage", restored.len());
        Ok(restored)
    }

    pub(crate) fn start_retry_timer(&self, job: &Arc<Job>) -> TimerHandle {
        let delay = self.settings().retry_timeout;
        let scheduler = self.self_ref.clone();
        let job = Arc::clone(job);
        self.timer.schedule(delay, move || async move {
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.retry(&job);
            }
        })
    }

    fn retry(&self, job: &Arc<Job>) {
        let mut guard = job.lock();
        let state = guard.state();
        if state != State::RetryWait {
            debug!(job_id = job.id(), %state, "Retry timer fired for job no longer waiting");
            return;
        }
        if let Err(e) = guard.set_state(State::PriorityTQueued, "retrying job, putting on priority queue") {
            error!(scheduler_id = %self.id, "{}", e);
            return;
        }
        if let Err(e) = self.enqueue_priority(&mut guard, job) {
            error!(scheduler_id = %self.id, "{}", e);
        }
    }

    async fn control_loop(self: Arc<Self>, token: CancellationToken) {
        info!(scheduler_id = %self.id, "Scheduler control loop started");
        loop {
            let rejected = match AssertUnwindSafe(self.update_queues()).catch_unwind().await {
                Ok(rejected) => rejected,
                Err(_) => {
                    error!(scheduler_id = %self.id, "Queue update pass panicked");
                    false
                }
            };

            let (max_wait, backoff) = {
                let settings = self.settings();
                (settings.queues_update_max_wait, settings.rejection_backoff)
            };
            if rejected && !backoff.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(max_wait) => {}
            }
        }
        info!(scheduler_id = %self.id, "Scheduler control loop stopped");
    }

    /// One pass over all queues; true if the worker pool rejected a dispatch
    async fn update_queues(self: &Arc<Self>) -> bool {
        let priority = self
            .drain_queue(&self.priority_queue, State::PriorityTQueued)
            .await;
        let thread = self.drain_queue(&self.thread_queue, State::TQueued).await;
        self.update_ready_queue();
        priority == DrainOutcome::Rejected || thread == DrainOutcome::Rejected
    }

    fn pool_saturated(&self) -> bool {
        let busy = self.counters.total(Stage::WorkerThreads)
            + self.counters.total(Stage::RunningWithoutThread);
        busy >= self.pool.size()
    }

    /// Pick the next job of a queue: fairness-aware if enabled, else the head
    fn select_next(&self, queue: &JobQueue, usage: &[Stage], max_by_owner: usize) -> Option<Arc<Job>> {
        if !self.settings().use_fairness {
            return queue.peek();
        }
        let policy = self.policy();
        let calculator = |length: usize, position: usize, job: &Job| -> i64 {
            let used: usize = usage
                .iter()
                .map(|stage| self.counters.value(*stage, job.submitter_id()))
                .sum();
            policy.evaluate_job_priority(length, position, used, max_by_owner, job)
        };
        queue.greatest_value(&calculator).or_else(|| queue.peek())
    }

    async fn drain_queue(self: &Arc<Self>, queue: &JobQueue, expected: State) -> DrainOutcome {
        loop {
            if self.pool_saturated() {
                return DrainOutcome::Saturated;
            }
            let max_by_owner = self.settings().max_running_by_owner;
            let Some(job) = self.select_next(
                queue,
                &[Stage::Running, Stage::RunningWithoutThread],
                max_by_owner,
            ) else {
                return DrainOutcome::Empty;
            };

            let state = job.state();
            if state != expected {
                debug!(
                    scheduler_id = %self.id,
                    job_id = job.id(),
                    %state,
                    "Discarding job found in {} with unexpected state", queue.name()
                );
                queue.remove(&job);
                continue;
            }

            let (started_tx, started_rx) = oneshot::channel();
            let task = JobExecutionTask::new(Arc::clone(&job), Arc::clone(self), started_tx);
            if !self.pool.try_spawn(move |permit| task.run(permit)) {
                self.metrics.record_pool_rejection();
                debug!(
                    scheduler_id = %self.id,
                    job_id = job.id(),
                    "Worker pool is saturated, job stays queued"
                );
                return DrainOutcome::Rejected;
            }

            let startup_wait = self.settings().startup_wait;
            if tokio::time::timeout(startup_wait, started_rx).await.is_err() {
                warn!(
                    scheduler_id = %self.id,
                    job_id = job.id(),
                    "Worker did not take the job within {:?}", startup_wait
                );
            }
        }
    }

    /// Promote staged jobs to READY while READY slots are free
    fn update_ready_queue(&self) {
        loop {
            let max_ready = self.settings().max_ready_jobs;
            if self.counters.total(Stage::Ready) >= max_ready {
                return;
            }
            let Some(job) = self.select_next(&self.ready_queue, &[Stage::Ready], max_ready) else {
                return;
            };
            let mut guard = job.lock();
            let state = guard.state();
            if state != State::RQueued {
                drop(guard);
                debug!(job_id = job.id(), %state, "Discarding job found in ready queue with unexpected state");
                self.ready_queue.remove(&job);
                continue;
            }
            if let Err(e) = guard.set_state(State::Ready, "execution succeeded") {
                error!(scheduler_id = %self.id, "{}", e);
                return;
            }
        }
    }

    fn persist(&self, record: JobRecord) {
        let Some(storage) = &self.storage else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(job_id = record.id, "No runtime available, job record not saved");
            return;
        };
        let storage = Arc::clone(storage);
        let scheduler_id = self.id.clone();
        runtime.spawn(async move {
            let job_id = record.id;
            if let Err(e) = storage.save(record).await {
                warn!(%scheduler_id, job_id, "Failed to save job: {}", e);
            }
        });
    }

    // Runtime configuration

    pub fn set_thread_pool_size(&self, size: usize) -> SchedulerResult<()> {
        if size == 0 {
            return Err(SchedulerError::configuration("thread_pool_size must be at least 1"));
        }
        self.update_settings(|s| s.thread_pool_size = size);
        self.pool.resize(size);
        self.wake();
        Ok(())
    }

    /// Capacity of both admission queues
    pub fn set_max_thread_queue_size(&self, size: usize) -> SchedulerResult<()> {
        if size == 0 {
            return Err(SchedulerError::configuration("queue capacities must be at least 1"));
        }
        self.update_settings(|s| s.max_thread_queue_size = size);
        self.thread_queue.set_capacity(size);
        self.priority_queue.set_capacity(size);
        Ok(())
    }

    pub fn set_max_ready_queue_size(&self, size: usize) -> SchedulerResult<()> {
        if size == 0 {
            return Err(SchedulerError::configuration("queue capacities must be at least 1"));
        }
        self.update_settings(|s| s.max_ready_queue_size = size);
        self.ready_queue.set_capacity(size);
        Ok(())
    }

    pub fn set_max_ready_jobs(&self, max: usize) {
        self.update_settings(|s| s.max_ready_jobs = max);
        self.wake();
    }

    pub fn set_max_running_by_owner(&self, max: usize) -> SchedulerResult<()> {
        if max == 0 {
            return Err(SchedulerError::configuration("max_running_by_owner must be at least 1"));
        }
        self.update_settings(|s| s.max_running_by_owner = max);
        Ok(())
    }

    pub fn set_max_number_of_retries(&self, max: u32) {
        self.update_settings(|s| s.max_number_of_retries = max);
    }

    /// Applies to retry timers armed from now on
    pub fn set_retry_timeout(&self, timeout: Duration) {
        self.update_settings(|s| s.retry_timeout = timeout);
    }

    pub fn set_queues_update_max_wait(&self, max_wait: Duration) {
        self.update_settings(|s| s.queues_update_max_wait = max_wait);
        self.wake();
    }

    pub fn set_use_fairness(&self, enabled: bool) {
        self.update_settings(|s| s.use_fairness = enabled);
    }

    /// Switch the priority policy; an unknown name keeps the current one
    pub fn set_priority_policy(&self, name: &str) -> SchedulerResult<()> {
        let policy = self.policies.create(name)?;
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
        self.update_settings(|s| s.priority_policy = name.to_string());
        info!(scheduler_id = %self.id, "Priority policy set to {}", name);
        Ok(())
    }

    pub fn set_restore_policy(&self, policy: RestorePolicy) {
        self.update_settings(|s| s.restore_policy = policy);
    }

    pub fn set_rejection_backoff(&self, backoff: Duration) {
        self.update_settings(|s| s.rejection_backoff = backoff);
    }

    // Introspection

    fn stage_snapshots(&self) -> Vec<StageSnapshot> {
        Stage::iter()
            .map(|stage| {
                let by_submitter = self.counters.stage(stage).snapshot();
                StageSnapshot {
                    stage,
                    total: by_submitter.values().sum(),
                    by_submitter,
                }
            })
            .collect()
    }

    /// Settings, per-stage totals and per-submitter counts as text
    pub fn info(&self) -> String {
        let settings = self.config();
        let mut out = format!("Scheduler id={} running={}\n", self.id, self.is_running());
        out.push_str(&format!(
            "  thread pool size: {} (free workers {})\n",
            settings.thread_pool_size,
            self.pool.available()
        ));
        out.push_str(&format!(
            "  thread queue: {}/{}  priority queue: {}/{}  ready queue: {}/{}\n",
            self.thread_queue.len(),
            self.thread_queue.capacity(),
            self.priority_queue.len(),
            self.priority_queue.capacity(),
            self.ready_queue.len(),
            self.ready_queue.capacity()
        ));
        out.push_str(&format!(
            "  max ready jobs: {}  max running by owner: {}\n",
            settings.max_ready_jobs, settings.max_running_by_owner
        ));
        out.push_str(&format!(
            "  max retries: {}  retry timeout: {}  max wait: {}\n",
            settings.max_number_of_retries,
            humantime::format_duration(settings.retry_timeout),
            humantime::format_duration(settings.queues_update_max_wait)
        ));
        out.push_str(&format!(
            "  fairness: {} (policy {})  restore policy: {:?}\n",
            if settings.use_fairness { "on" } else { "off" },
            settings.priority_policy,
            settings.restore_policy
        ));
        for snapshot in self.stage_snapshots() {
            out.push_str(&format!("  {}: {}", snapshot.stage, snapshot.total));
            if !snapshot.by_submitter.is_empty() {
                let parts: Vec<String> = snapshot
                    .by_submitter
                    .iter()
                    .map(|(submitter, count)| format!("{submitter}={count}"))
                    .collect();
                out.push_str(&format!(" [{}]", parts.join(", ")));
            }
            out.push('\n');
        }
        out
    }

    pub fn print_thread_queue(&self) -> String {
        self.thread_queue.describe()
    }

    pub fn print_priority_thread_queue(&self) -> String {
        self.priority_queue.describe()
    }

    pub fn print_ready_queue(&self) -> String {
        self.ready_queue.describe()
    }

    pub fn stats(&self) -> SchedulerStats {
        let settings = self.config();
        let queue = |q: &JobQueue| QueueSnapshot {
            name: q.name().to_string(),
            len: q.len(),
            capacity: q.capacity(),
            job_ids: q.snapshot().iter().map(|job| job.id()).collect(),
        };
        SchedulerStats {
            scheduler_id: self.id.clone(),
            running: self.is_running(),
            thread_pool_size: settings.thread_pool_size,
            available_workers: self.pool.available(),
            use_fairness: settings.use_fairness,
            priority_policy: settings.priority_policy,
            stages: self.stage_snapshots(),
            queues: vec![
                queue(&self.priority_queue),
                queue(&self.thread_queue),
                queue(&self.ready_queue),
            ],
            captured_at: Utc::now(),
        }
    }
}

impl StateObserver for Scheduler {
    fn state_changed(&self, job: &JobGuard<'_>, old: State, dangling_timer: Option<TimerHandle>) {
        let new = job.state();
        let owner = job.job();
        let submitter = owner.submitter_id();

        if let Some(stage) = new.stage() {
            self.counters.increment(stage, submitter);
        }
        match old {
            State::TQueued => {
                self.thread_queue.remove(owner);
            }
            State::PriorityTQueued => {
                self.priority_queue.remove(owner);
            }
            State::RQueued => {
                self.ready_queue.remove(owner);
            }
            _ => {}
        }
        if let Some(stage) = old.stage() {
            self.counters.decrement(stage, submitter);
        }
        if new.is_final() {
            self.jobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&owner.id());
        }
        if let Some(timer) = dangling_timer {
            timer.cancel();
        }

        self.metrics.record_transition(new);
        debug!(
            scheduler_id = %self.id,
            job_id = owner.id(),
            submitter,
            from = %old,
            to = %new,
            "Job state changed"
        );
        self.persist(job.record());
        self.wake();
    }
}
