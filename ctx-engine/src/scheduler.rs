//! Bounded runner for the indexing and fan-out work that follows a store or
//! delete.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Runs follow-up jobs for stores and deletes with at most `max_concurrency`
/// executing at once. [`wait_idle`](Self::wait_idle) lets shutdown and
/// `settle` wait for every job already accepted.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    semaphore: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    in_flight: Arc<InFlight>,
}

impl TaskScheduler {
    /// Constructs a scheduler allowing `max_concurrency` jobs to run at once.
    #[must_use]
    pub fn new(max_concurrency: NonZeroUsize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.get())),
            closed: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Returns `true` if the scheduler has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tasks spawned and not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Closes the scheduler once the engine stops accepting writes.
    ///
    /// Tasks still waiting for a permit resolve to `None` without running.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();
    }

    /// Waits until every accepted job has finished or been cancelled.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Spawns a job, waiting for a free slot before it runs.
    ///
    /// The handle resolves to `None` when the scheduler closed before the task
    /// obtained a permit.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] when the scheduler is closed before the
    /// task is enqueued.
    pub fn spawn<F, T>(&self, future: F) -> SchedulerResult<JoinHandle<Option<T>>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(SchedulerError::Closed);
        }

        let semaphore = Arc::clone(&self.semaphore);
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.count.fetch_add(1, Ordering::AcqRel);

        let handle = tokio::spawn(async move {
            let output = match semaphore.acquire_owned().await {
                Ok(permit) => {
                    let output = future.await;
                    drop(permit);
                    Some(output)
                }
                Err(_) => None,
            };
            if in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
                in_flight.idle.notify_waiters();
            }
            output
        });

        Ok(handle)
    }
}

/// Errors produced by the scheduler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Scheduler is closed and will not accept new tasks.
    #[error("scheduler closed")]
    Closed,
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limit(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test]
    async fn fan_out_burst_stays_within_limit() {
        let scheduler = TaskScheduler::new(limit(2));
        let delivering = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let delivered = Arc::new(AtomicUsize::new(0));

        // One job per stored key, each delivering to a slow consumer.
        for _ in 0..5 {
            let delivering = Arc::clone(&delivering);
            let peak = Arc::clone(&peak);
            let delivered = Arc::clone(&delivered);
            scheduler
                .spawn(async move {
                    let now = delivering.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    delivering.fetch_sub(1, Ordering::SeqCst);
                    delivered.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert!(scheduler.in_flight() > 0);

        scheduler.wait_idle().await;
        assert_eq!(delivered.load(Ordering::SeqCst), 5);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn stopped_engine_rejects_follow_up_jobs() {
        let scheduler = TaskScheduler::new(limit(4));
        scheduler.spawn(async {}).unwrap().await.unwrap();
        scheduler.close();

        assert!(scheduler.is_closed());
        let result = scheduler.spawn(async { "retract" });
        assert_eq!(result.unwrap_err(), SchedulerError::Closed);
        scheduler.wait_idle().await;
    }

    #[tokio::test]
    async fn wait_idle_on_fresh_scheduler_returns_at_once() {
        let scheduler = TaskScheduler::new(limit(1));
        tokio::time::timeout(Duration::from_millis(50), scheduler.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn close_cancels_jobs_waiting_for_a_slot() {
        let scheduler = TaskScheduler::new(NonZeroUsize::MIN);
        let running = scheduler
            .spawn(tokio::time::sleep(Duration::from_millis(20)))
            .unwrap();
        let queued = scheduler.spawn(async { 7 }).unwrap();
        tokio::task::yield_now().await;
        scheduler.close();

        assert!(running.await.unwrap().is_some());
        assert_eq!(queued.await.unwrap(), None);
        scheduler.wait_idle().await;
        assert_eq!(scheduler.in_flight(), 0);
    }
}
