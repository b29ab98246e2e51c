//! Bounded worker pool and the per-job execution protocol

use super::counters::Stage;
use super::job::{Completion, Job, JobContext, JobGuard, JobOutcome};
use super::job_scheduler::Scheduler;
use super::state::State;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Fixed-size set of workers; a dispatch either gets a worker or is rejected
#[derive(Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: Mutex<usize>,
    tracker: TaskTracker,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size: Mutex::new(size),
            tracker: TaskTracker::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Workers currently executing a task
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `task` on a free worker. Returns false without running it when
    /// every worker is busy. The task receives the worker permit and must
    /// keep it for as long as it occupies the worker.
    pub fn try_spawn<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce(OwnedSemaphorePermit) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            return false;
        };
        let active = Arc::clone(&self.active);
        active.fetch_add(1, Ordering::Relaxed);
        let future = task(permit);
        self.tracker.spawn(async move {
            future.await;
            active.fetch_sub(1, Ordering::Relaxed);
        });
        true
    }

    /// Grow or shrink the pool. Shrinking never interrupts running tasks:
    /// the surplus permits are retired as the tasks holding them finish.
    pub fn resize(&self, new_size: usize) {
        let mut size = self.size.lock().unwrap_or_else(PoisonError::into_inner);
        let old_size = *size;
        *size = new_size;
        drop(size);

        if new_size > old_size {
            self.semaphore.add_permits(new_size - old_size);
        } else if new_size < old_size {
            let surplus = (old_size - new_size) as u32;
            match Arc::clone(&self.semaphore).try_acquire_many_owned(surplus) {
                Ok(permits) => permits.forget(),
                Err(_) => {
                    let semaphore = Arc::clone(&self.semaphore);
                    tokio::spawn(async move {
                        if let Ok(permits) = semaphore.acquire_many_owned(surplus).await {
                            permits.forget();
                        }
                    });
                }
            }
        }
        debug!("Worker pool resized from {} to {}", old_size, new_size);
    }

    /// Wait until every spawned task has finished
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// Holds the worker for the lifetime of one execution and releases it,
/// the worker-thread count, and a wake-up of the control loop on drop,
/// whatever way the execution ends.
struct WorkerGuard {
    scheduler: Arc<Scheduler>,
    submitter: String,
    permit: Option<OwnedSemaphorePermit>,
}

impl WorkerGuard {
    fn new(scheduler: Arc<Scheduler>, job: &Job, permit: OwnedSemaphorePermit) -> Self {
        let submitter = job.submitter_id().to_string();
        scheduler.counters().increment(Stage::WorkerThreads, &submitter);
        Self {
            scheduler,
            submitter,
            permit: Some(permit),
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        // free the worker before waking the loop so the next dispatch finds it
        drop(self.permit.take());
        self.scheduler
            .counters()
            .decrement(Stage::WorkerThreads, &self.submitter);
        self.scheduler.wake();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "action panicked".to_string()
    }
}

/// The unit handed to the worker pool for one job
pub(crate) struct JobExecutionTask {
    job: Arc<Job>,
    scheduler: Arc<Scheduler>,
    started: Option<oneshot::Sender<()>>,
}

impl JobExecutionTask {
    pub(crate) fn new(
        job: Arc<Job>,
        scheduler: Arc<Scheduler>,
        started: oneshot::Sender<()>,
    ) -> Self {
        Self {
            job,
            scheduler,
            started: Some(started),
        }
    }

    pub(crate) async fn run(mut self, permit: OwnedSemaphorePermit) {
        let _worker = WorkerGuard::new(Arc::clone(&self.scheduler), &self.job, permit);

        let began = self.begin();
        // dropping the sender also releases the control loop
        self.started.take();
        if !began {
            return;
        }

        let started_at = Instant::now();
        let ctx = JobContext::new(Arc::clone(&self.job), Arc::clone(&self.scheduler));
        let outcome = AssertUnwindSafe(self.job.action().run(ctx))
            .catch_unwind()
            .await;
        self.scheduler
            .metrics()
            .record_job_duration(started_at.elapsed().as_secs_f64());

        match outcome {
            Ok(outcome) => self.finish(outcome),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    scheduler_id = %self.scheduler.id(),
                    job_id = self.job.id(),
                    "Job action panicked: {}", message
                );
                self.fail(&format!("Internal error: {message}"));
            }
        }
    }

    /// Move the job to RUNNING; false if it must not be executed
    fn begin(&self) -> bool {
        let mut guard = self.job.lock();
        let state = guard.state();
        if state.is_final() {
            debug!(
                job_id = self.job.id(),
                %state,
                "Job finished before a worker picked it up"
            );
            return false;
        }
        if !matches!(state, State::TQueued | State::PriorityTQueued) {
            error!(
                scheduler_id = %self.scheduler.id(),
                job_id = self.job.id(),
                %state,
                "Job is not in a queued state and cannot be executed"
            );
            return false;
        }
        if let Err(e) = guard.set_state(State::Running, "executing") {
            error!(scheduler_id = %self.scheduler.id(), "Cannot execute job: {}", e);
            return false;
        }
        true
    }

    fn finish(&self, outcome: JobOutcome) {
        let mut guard = self.job.lock();
        let state = guard.state();

        if state != State::Running {
            match &outcome {
                JobOutcome::Success(_) => {
                    debug!(job_id = self.job.id(), %state, "Action finalized the job itself");
                }
                _ if state.is_final() => {
                    debug!(job_id = self.job.id(), %state, "Ignoring outcome of finished job");
                }
                JobOutcome::RecoverableFailure { .. } if state == State::RetryWait => {
                    debug!(job_id = self.job.id(), "Action already parked the job for a retry");
                }
                JobOutcome::RecoverableFailure { reason } | JobOutcome::FatalFailure { reason } => {
                    Self::force_failed(&mut guard, reason);
                }
            }
            return;
        }

        match outcome {
            JobOutcome::Success(Completion::Done) => {
                Self::transition(&mut guard, State::Done, "completed");
            }
            JobOutcome::Success(Completion::Staged) => {
                if let Err(e) = self.scheduler.stage_result(
                    &mut guard,
                    &self.job,
                    "putting on a ready queue",
                ) {
                    error!("{}", e);
                }
            }
            JobOutcome::RecoverableFailure { reason } => {
                if let Err(e) = self.scheduler.retry_or_fail(&mut guard, &self.job, &reason) {
                    error!("{}", e);
                }
            }
            JobOutcome::FatalFailure { reason } => {
                warn!(job_id = self.job.id(), "Job failed: {}", reason);
                Self::transition(&mut guard, State::Failed, &reason);
            }
        }
    }

    fn fail(&self, description: &str) {
        let mut guard = self.job.lock();
        Self::force_failed(&mut guard, description);
    }

    fn force_failed(guard: &mut JobGuard<'_>, description: &str) {
        if !guard.state().is_final() {
            Self::transition(guard, State::Failed, description);
        }
    }

    fn transition(guard: &mut JobGuard<'_>, state: State, description: &str) {
        if let Err(e) = guard.set_state(state, description) {
            error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pool_rejects_when_saturated() {
        let pool = WorkerPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        assert!(pool.try_spawn(|permit| async move {
            let _permit = permit;
            let _ = release_rx.await;
        }));
        assert_eq!(pool.available(), 0);
        assert!(!pool.try_spawn(|_permit| async {}));

        release_tx.send(()).unwrap();
        pool.wait_idle().await;
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.active(), 0);
        assert!(pool.try_spawn(|_permit| async {}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_resize() {
        let pool = WorkerPool::new(2);
        pool.resize(4);
        assert_eq!(pool.available(), 4);

        pool.resize(1);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.available(), 1);

        // shrinking below the busy count waits for the busy worker
        let (release_tx, release_rx) = oneshot::channel::<()>();
        assert!(pool.try_spawn(|permit| async move {
            let _permit = permit;
            let _ = release_rx.await;
        }));
        pool.resize(0);
        pool.resize(1);
        assert_eq!(pool.available(), 1);
        release_tx.send(()).unwrap();
        pool.wait_idle().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "action panicked");
    }
}
