//! One-shot cancellable timers for retry re-admission and lifetime expiry

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Handle of an armed timer; cancelling it prevents the callback from running
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Timer facility shared by all jobs of a scheduler.
///
/// Every armed timer is a child of one root token, so `shutdown` disarms
/// all of them at once. Timers armed after a shutdown work normally.
#[derive(Debug, Default)]
pub struct JobTimer {
    root: Mutex<CancellationToken>,
}

impl JobTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` after `delay` unless cancelled first
    pub fn schedule<F, Fut>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self
            .root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token();
        let armed = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = armed.cancelled() => {
                    trace!("Timer cancelled before firing");
                }
                _ = tokio::time::sleep(delay) => {
                    if !armed.is_cancelled() {
                        callback().await;
                    }
                }
            }
        });
        TimerHandle { token }
    }

    /// Disarm every pending timer
    pub fn shutdown(&self) {
        let mut root = self.root.lock().unwrap_or_else(PoisonError::into_inner);
        root.cancel();
        *root = CancellationToken::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let timer = JobTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        timer.schedule(Duration::from_secs(5), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let timer = JobTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let handle = timer.schedule(Duration::from_secs(1), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();

        let counter = Arc::clone(&fired);
        timer.schedule(Duration::from_secs(1), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.shutdown();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_work_after_shutdown() {
        let timer = JobTimer::new();
        timer.shutdown();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        timer.schedule(Duration::from_secs(1), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
