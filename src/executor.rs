use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::{join_all, try_join_all};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::error::Elapsed;
use tokio::time::{Instant, timeout_at};

use crate::error::{BatchError, TaskError};
use crate::http::BoxError;

/// A named unit of blocking work for [`TaskExecutor::run_many`].
pub type BlockingTask<T> = Box<dyn FnOnce() -> Result<T, BoxError> + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub workers: usize,
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub saturation_events: u64,
}

struct Inner {
    permits: Arc<Semaphore>,
    workers: usize,
    default_timeout: Duration,
    accepting: AtomicBool,
    saturated: AtomicBool,
    active: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    saturation_events: AtomicU64,
}

/// Decrements a gauge when dropped.
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Runs blocking work on a bounded set of workers with a deadline.
///
/// At most `workers` tasks execute at once; further submissions wait for a
/// free worker. The deadline covers both the wait and the execution. When
/// it passes the caller gets [`TaskError::Timeout`] right away, but blocking
/// work cannot be interrupted: it finishes in the background and keeps its
/// worker until then.
///
/// Cheaply cloneable; clones share workers and counters.
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<Inner>,
}

impl TaskExecutor {
    pub fn new(workers: usize, default_timeout: Duration) -> Self {
        let workers = workers.max(1);
        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(workers)),
                workers,
                default_timeout,
                accepting: AtomicBool::new(true),
                saturated: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
                saturation_events: AtomicU64::new(0),
            }),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    async fn worker(&self) -> Result<OwnedSemaphorePermit, TaskError> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(TaskError::ShutDown);
        }
        match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                if self.inner.saturated.swap(false, Ordering::AcqRel) {
                    tracing::info!(workers = self.inner.workers, "worker pool no longer saturated");
                }
                Ok(permit)
            }
            Err(TryAcquireError::Closed) => Err(TaskError::ShutDown),
            Err(TryAcquireError::NoPermits) => {
                let _queued = Gauge::enter(&self.inner.queued);
                if !self.inner.saturated.swap(true, Ordering::AcqRel) {
                    self.inner.saturation_events.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        workers = self.inner.workers,
                        queued = self.inner.queued.load(Ordering::Relaxed),
                        "worker pool saturated, tasks are queueing"
                    );
                }
                self.inner
                    .permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| TaskError::ShutDown)
            }
        }
    }

    fn settle<T>(&self, outcome: Result<Result<T, TaskError>, Elapsed>, limit: Duration) -> Result<T, TaskError> {
        let result = outcome.unwrap_or_else(|_| Err(TaskError::Timeout(limit)));
        let counter = match &result {
            Ok(_) => &self.inner.completed,
            Err(TaskError::ShutDown) => return Err(TaskError::ShutDown),
            Err(TaskError::Timeout(_)) => {
                tracing::warn!(timeout_ms = limit.as_millis() as u64, "task exceeded its deadline");
                &self.inner.timed_out
            }
            Err(_) => &self.inner.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Run blocking `f` on a worker, within `timeout` (or the default).
    pub async fn run<F, T, E>(&self, f: F, timeout: Option<Duration>) -> Result<T, TaskError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let limit = timeout.unwrap_or(self.inner.default_timeout);
        let deadline = Instant::now() + limit;

        let work = async {
            let permit = self.worker().await?;
            let inner = self.inner.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let _active = Gauge::enter(&inner.active);
                f()
            });
            match handle.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(TaskError::Failed(e.into())),
                Err(e) if e.is_panic() => Err(TaskError::Panicked(panic_message(e.into_panic()))),
                Err(_) => Err(TaskError::ShutDown),
            }
        };
        self.settle(timeout_at(deadline, work).await, limit)
    }

    /// Run an async future under the same worker limit and deadline. Unlike
    /// blocking work, a future that misses its deadline is dropped.
    pub async fn run_async<Fut, T, E>(&self, fut: Fut, timeout: Option<Duration>) -> Result<T, TaskError>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let limit = timeout.unwrap_or(self.inner.default_timeout);
        let deadline = Instant::now() + limit;

        let work = async {
            let _permit = self.worker().await?;
            let _active = Gauge::enter(&self.inner.active);
            fut.await.map_err(|e| TaskError::Failed(e.into()))
        };
        self.settle(timeout_at(deadline, work).await, limit)
    }

    /// Run a named batch concurrently, each task with the default deadline.
    ///
    /// With `tolerate_failures` every task's outcome is returned. Without
    /// it the first failure aborts the batch; tasks already running on a
    /// worker still finish in the background.
    pub async fn run_many<T>(
        &self,
        tasks: impl IntoIterator<Item = (String, BlockingTask<T>)>,
        tolerate_failures: bool,
    ) -> Result<HashMap<String, Result<T, TaskError>>, BatchError>
    where
        T: Send + 'static,
    {
        let runs = tasks.into_iter().map(|(name, task)| async move {
            let result = self.run(task, None).await;
            (name, result)
        });

        if tolerate_failures {
            let results = join_all(runs).await;
            return Ok(results.into_iter().collect());
        }

        let results = try_join_all(runs.map(|run| async move {
            match run.await {
                (name, Ok(value)) => Ok((name, Ok(value))),
                (task, Err(source)) => Err(BatchError { task, source }),
            }
        }))
        .await?;
        Ok(results.into_iter().collect())
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            workers: self.inner.workers,
            active: self.inner.active.load(Ordering::Relaxed),
            queued: self.inner.queued.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            timed_out: self.inner.timed_out.load(Ordering::Relaxed),
            saturation_events: self.inner.saturation_events.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work and wait up to `drain` for running and queued
    /// tasks to finish. Returns `true` if everything finished in time.
    pub async fn shutdown(&self, drain: Duration) -> bool {
        if !self.inner.accepting.swap(false, Ordering::AcqRel) {
            return true;
        }
        let all = u32::try_from(self.inner.workers).unwrap_or(u32::MAX);
        let drained = matches!(
            tokio::time::timeout(drain, self.inner.permits.acquire_many(all)).await,
            Ok(Ok(_))
        );
        self.inner.permits.close();
        if drained {
            tracing::info!("executor drained");
        } else {
            tracing::warn!(
                active = self.inner.active.load(Ordering::Relaxed),
                drain_ms = drain.as_millis() as u64,
                "executor shut down with tasks still running"
            );
        }
        drained
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant as StdInstant;

    use super::*;

    #[tokio::test]
    async fn returns_value_and_counts_completion() {
        let executor = TaskExecutor::new(2, Duration::from_secs(5));
        let out = executor.run(|| Ok::<_, BoxError>(21 * 2), None).await.unwrap();
        assert_eq!(out, 42);
        assert_eq!(executor.stats().completed, 1);
    }

    #[tokio::test]
    async fn failure_and_panic_are_reported() {
        let executor = TaskExecutor::new(1, Duration::from_secs(5));
        let err = executor
            .run(|| Err::<(), _>(BoxError::from("bad input")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Failed(ref e) if e.to_string() == "bad input"));

        let err = executor
            .run(|| -> Result<(), BoxError> { panic!("worker blew up") }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Panicked(ref m) if m == "worker blew up"));
        assert_eq!(executor.stats().failed, 2);
    }

    #[tokio::test]
    async fn deadline_returns_before_work_finishes() {
        let executor = TaskExecutor::new(1, Duration::from_secs(5));
        let started = StdInstant::now();
        let err = executor
            .run(
                || {
                    std::thread::sleep(Duration::from_millis(400));
                    Ok::<_, BoxError>(())
                },
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(executor.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn queueing_counts_against_the_deadline() {
        let executor = TaskExecutor::new(1, Duration::from_secs(5));
        let busy = executor.clone();
        let blocker = tokio::spawn(async move {
            busy.run(
                || {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok::<_, BoxError>(())
                },
                None,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = executor
            .run(|| Ok::<_, BoxError>(()), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(executor.stats().saturation_events, 1);
        blocker.await.unwrap().unwrap();
    }

    fn task<T: Send + 'static>(f: impl FnOnce() -> Result<T, BoxError> + Send + 'static) -> BlockingTask<T> {
        Box::new(f)
    }

    #[tokio::test]
    async fn run_many_tolerating_failures_returns_every_result() {
        let executor = TaskExecutor::new(4, Duration::from_secs(5));
        let results = executor
            .run_many(
                vec![
                    ("a".to_string(), task(|| Ok(1))),
                    ("b".to_string(), task(|| Err("nope".into()))),
                    ("c".to_string(), task(|| Ok(3))),
                ],
                true,
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(*results["a"].as_ref().unwrap(), 1);
        assert!(results["b"].is_err());
        assert_eq!(*results["c"].as_ref().unwrap(), 3);
    }

    #[tokio::test]
    async fn run_many_aborts_on_first_failure() {
        let executor = TaskExecutor::new(4, Duration::from_secs(5));
        let err = executor
            .run_many(
                vec![
                    ("ok".to_string(), task(|| Ok(()))),
                    ("broken".to_string(), task(|| Err("nope".into()))),
                ],
                false,
            )
            .await
            .unwrap_err();
        assert_eq!(err.task, "broken");
        assert!(matches!(err.source, TaskError::Failed(_)));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let executor = TaskExecutor::new(2, Duration::from_secs(5));
        assert!(executor.shutdown(Duration::from_secs(1)).await);
        let err = executor.run(|| Ok::<_, BoxError>(()), None).await.unwrap_err();
        assert!(matches!(err, TaskError::ShutDown));
    }
}
