//! Bounded-concurrency task queue.
//!
//! Runs at most `pool` jobs at once on the tokio runtime and parks the rest in a
//! FIFO wait list. Every job produces a [`JobResult`]; a failing (or panicking) job
//! never aborts its siblings or the queue.

use crate::error::SyncError;
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome of one submitted job.
#[derive(Debug)]
pub struct JobResult<T> {
    pub success: bool,
    pub result: Option<T>,
    pub error: Option<anyhow::Error>,
}

impl<T> JobResult<T> {
    fn from_outcome(outcome: Result<T>) -> Self {
        match outcome {
            Ok(value) => Self {
                success: true,
                result: Some(value),
                error: None,
            },
            Err(e) => Self {
                success: false,
                result: None,
                error: Some(e),
            },
        }
    }
}

type Job<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

struct QueueState<T> {
    pool_size: usize,
    running: usize,
    pending: VecDeque<(usize, Job<T>)>,
    /// One slot per submitted job, filled as jobs finish
    results: Vec<Option<JobResult<T>>>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl<T> QueueState<T> {
    fn is_idle(&self) -> bool {
        self.running == 0 && self.pending.is_empty()
    }

    fn take_results(&mut self) -> Vec<JobResult<T>> {
        self.results.drain(..).flatten().collect()
    }
}

/// Bounded-concurrency executor. Cloning shares the same queue.
pub struct TaskQueue<T> {
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> TaskQueue<T> {
    /// Create a queue running at most `pool` jobs concurrently.
    pub fn new(pool: usize) -> Result<Self, SyncError> {
        if pool == 0 {
            return Err(SyncError::InvalidPoolSize(pool));
        }
        Ok(Self {
            state: Arc::new(Mutex::new(QueueState {
                pool_size: pool,
                running: 0,
                pending: VecDeque::new(),
                results: Vec::new(),
                waiters: Vec::new(),
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pool_size(&self) -> usize {
        self.lock().pool_size
    }

    /// Submit a job. Starts it right away when a slot is free, otherwise queues it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn execute<F, Fut>(&self, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let job: Job<T> = Box::new(move || job().boxed());

        let start_now = {
            let mut state = self.lock();
            let index = state.results.len();
            state.results.push(None);
            if state.running < state.pool_size {
                state.running += 1;
                Some((index, job))
            } else {
                state.pending.push_back((index, job));
                None
            }
        };

        if let Some((index, job)) = start_now {
            self.spawn(index, job);
        }
    }

    /// Wait until no job is running or waiting, then return every result
    /// collected since the previous `done()`, in submission order.
    pub async fn done(&self) -> Vec<JobResult<T>> {
        loop {
            let idle_signal = {
                let mut state = self.lock();
                if state.is_idle() {
                    return state.take_results();
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                rx
            };
            // New jobs may arrive between the signal and the re-check.
            let _ = idle_signal.await;
        }
    }

    /// Snapshot of queue counters.
    pub fn stats(&self) -> QueueStatistics {
        let state = self.lock();
        let mut stats = QueueStatistics {
            total: state.results.len(),
            running: state.running,
            waiting: state.pending.len(),
            ..Default::default()
        };
        for result in state.results.iter().flatten() {
            if result.success {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
        }
        stats
    }

    fn spawn(&self, index: usize, job: Job<T>) {
        let queue = self.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(job()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow!("job panicked")),
            };
            if let Err(ref e) = outcome {
                debug!("Queued job {} failed: {}", index, e);
            }
            queue.finish(index, outcome);
        });
    }

    fn finish(&self, index: usize, outcome: Result<T>) {
        let (next, waiters) = {
            let mut state = self.lock();
            if let Some(slot) = state.results.get_mut(index) {
                *slot = Some(JobResult::from_outcome(outcome));
            }
            state.running -= 1;

            // Hand the freed slot to the oldest waiting job before anyone can observe idleness.
            let next = state.pending.pop_front();
            if next.is_some() {
                state.running += 1;
            }

            let waiters = if state.is_idle() {
                std::mem::take(&mut state.waiters)
            } else {
                Vec::new()
            };
            (next, waiters)
        };

        if let Some((next_index, job)) = next {
            self.spawn(next_index, job);
        }
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}

/// Counters describing the queue at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    pub total: usize,
    pub running: usize,
    pub waiting: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl QueueStatistics {
    pub fn is_idle(&self) -> bool {
        self.running == 0 && self.waiting == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "Total: {} | Running: {} | Waiting: {} | Succeeded: {} | Failed: {}",
            self.total, self.running, self.waiting, self.succeeded, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_pool_is_rejected() {
        let result = TaskQueue::<()>::new(0);
        assert!(matches!(result, Err(SyncError::InvalidPoolSize(0))));
    }

    #[tokio::test]
    async fn test_done_without_jobs_returns_empty() {
        let queue = TaskQueue::<u32>::new(2).unwrap();
        assert!(queue.done().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_running_never_exceeds_pool() {
        for pool in 1..=4 {
            let queue = TaskQueue::new(pool).unwrap();
            let current = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));

            for i in 0..12u64 {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                queue.execute(move || async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2 + i % 3)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                });
            }

            let results = queue.done().await;
            assert_eq!(results.len(), 12);
            assert!(peak.load(Ordering::SeqCst) <= pool, "pool {} exceeded", pool);
        }
    }

    #[tokio::test]
    async fn test_results_are_in_submission_order() {
        let queue = TaskQueue::new(3).unwrap();
        for i in 0..6u64 {
            queue.execute(move || async move {
                // later jobs finish first
                tokio::time::sleep(Duration::from_millis(30 - i * 5)).await;
                Ok(i)
            });
        }

        let values: Vec<u64> = queue
            .done()
            .await
            .into_iter()
            .map(|r| r.result.unwrap())
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_failing_job_does_not_stop_siblings() {
        let queue = TaskQueue::new(2).unwrap();
        queue.execute(|| async { Ok(1u32) });
        queue.execute(|| async { Err(anyhow!("rpc exploded")) });
        queue.execute(|| async {
            if true {
                panic!("bad response");
            }
            Ok(3u32)
        });
        queue.execute(|| async { Ok(4u32) });

        let results = queue.done().await;
        assert_eq!(results.len(), 4);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(results[1].error.as_ref().unwrap().to_string().contains("rpc exploded"));
        assert!(!results[2].success);
        assert!(results[2].result.is_none());
        assert!(results[3].success);
        assert_eq!(results[3].result, Some(4));
    }

    #[tokio::test]
    async fn test_queued_jobs_wait_for_free_slots() {
        let queue = TaskQueue::new(3).unwrap();
        let started = Arc::new(Mutex::new(Vec::new()));
        let mut gates = Vec::new();

        for i in 0..5usize {
            let started = Arc::clone(&started);
            let (tx, rx) = oneshot::channel::<()>();
            gates.push(tx);
            queue.execute(move || async move {
                started.lock().unwrap().push(i);
                let _ = rx.await;
                Ok(i)
            });
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.lock().unwrap().len(), 3);
        let stats = queue.stats();
        assert_eq!(stats.running, 3);
        assert_eq!(stats.waiting, 2);
        assert!(!started.lock().unwrap().contains(&3));

        // Release job 0; only job 3 may start.
        let mut gates = gates.into_iter();
        gates.next().unwrap().send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*started.lock().unwrap(), vec![0, 1, 2, 3]);

        for gate in gates {
            let _ = gate.send(());
        }
        let results = queue.done().await;
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(*started.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_done_waits_for_jobs_submitted_meanwhile() {
        let queue = TaskQueue::new(2).unwrap();
        let (release, gate) = oneshot::channel::<()>();
        queue.execute(move || async move {
            let _ = gate.await;
            Ok(0u64)
        });

        let submitter = tokio::spawn({
            let queue = queue.clone();
            async move {
                for i in 1..=5u64 {
                    queue.execute(move || async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(i)
                    });
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                // The first job holds the queue busy until every job is in.
                let _ = release.send(());
            }
        });

        let values: Vec<u64> = queue
            .done()
            .await
            .into_iter()
            .map(|r| r.result.unwrap())
            .collect();
        submitter.await.unwrap();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
        assert!(queue.stats().is_idle());
    }

    #[tokio::test]
    async fn test_stats_count_outcomes() {
        let queue = TaskQueue::new(1).unwrap();
        queue.execute(|| async { Ok(()) });
        queue.execute(|| async { Err(anyhow!("nope")) });

        let stats_before = queue.stats();
        assert_eq!(stats_before.total, 2);

        let results = queue.done().await;
        assert_eq!(results.len(), 2);
        assert!(queue.stats().is_idle());
        assert_eq!(queue.stats().total, 0);
    }

    #[test]
    fn test_statistics_summary() {
        let stats = QueueStatistics {
            total: 5,
            running: 1,
            waiting: 2,
            succeeded: 1,
            failed: 1,
        };
        assert_eq!(
            stats.summary(),
            "Total: 5 | Running: 1 | Waiting: 2 | Succeeded: 1 | Failed: 1"
        );
        assert!(!stats.is_idle());
    }
}
