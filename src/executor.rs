//! Concurrency-capped task executor.
//!
//! Tasks run as plain tokio tasks — tens of thousands of logical tasks
//! without OS-thread-per-task overhead. A semaphore enforces the
//! concurrency cap: the permit is acquired before spawning and released by
//! a drop guard that runs on success, failure and panic paths alike.
//!
//! Task errors are absorbed: a failing or panicking task becomes a failure
//! `TaskResult` recorded in the metrics engine, never an executor error.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::VajraError;
use crate::metrics::{MetricsEngine, TaskGauges};
use crate::task::{next_task_id, Task, TaskResult};

/// Runs submitted tasks concurrently, bounded by a configured cap.
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    submitted: AtomicU64,
    completed: AtomicU64,
    active: AtomicU64,
    interrupted: AtomicU64,
    accepting: AtomicBool,
    cancel: CancellationToken,
    engine: MetricsEngine,
    gauges: TaskGauges,
}

/// Releases the permit and settles the counters when an execution ends,
/// no matter how it ends.
struct CompletionGuard {
    inner: Arc<ExecutorInner>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::Relaxed);
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
        self.inner.publish_gauges();
    }
}

impl ExecutorInner {
    fn pending(&self) -> u64 {
        let submitted = self.submitted.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);
        let active = self.active.load(Ordering::Relaxed);
        submitted.saturating_sub(completed).saturating_sub(active)
    }

    fn publish_gauges(&self) {
        self.gauges.set_active(self.active.load(Ordering::Relaxed));
        self.gauges.set_pending(self.pending());
    }
}

impl TaskExecutor {
    /// Executor capped at `max_concurrency`, recording results into
    /// `engine`. The engine's gauges are kept current by the executor.
    pub fn new(max_concurrency: usize, engine: MetricsEngine, cancel: CancellationToken) -> Self {
        let gauges = engine.gauges();
        Self {
            inner: Arc::new(ExecutorInner {
                semaphore: Arc::new(Semaphore::new(max_concurrency)),
                max_concurrency,
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                active: AtomicU64::new(0),
                interrupted: AtomicU64::new(0),
                accepting: AtomicBool::new(true),
                cancel,
                engine,
                gauges,
            }),
        }
    }

    /// Submit one task, waiting for a free slot when the cap is reached.
    /// The wait is the backpressure signal to virtual-user loops. The
    /// returned handle resolves when the task has fully settled.
    pub async fn submit(&self, task: Arc<dyn Task>) -> Result<JoinHandle<()>, VajraError> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(VajraError::Cancelled);
        }
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        self.inner.publish_gauges();

        let permit = tokio::select! {
            permit = self.inner.semaphore.clone().acquire_owned() => {
                match permit {
                    Ok(p) => p,
                    // Semaphore closed mid-wait: shutdown raced the submit.
                    Err(_) => {
                        self.inner.completed.fetch_add(1, Ordering::Relaxed);
                        self.inner.publish_gauges();
                        return Err(VajraError::Cancelled);
                    }
                }
            }
            _ = self.inner.cancel.cancelled() => {
                self.inner.completed.fetch_add(1, Ordering::Relaxed);
                self.inner.publish_gauges();
                return Err(VajraError::Cancelled);
            }
        };

        Ok(self.spawn_execution(task, permit))
    }

    /// Submit without waiting; `None` when the cap is saturated.
    pub fn try_submit(&self, task: Arc<dyn Task>) -> Option<JoinHandle<()>> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return None;
        }
        match self.inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                self.inner.submitted.fetch_add(1, Ordering::Relaxed);
                Some(self.spawn_execution(task, permit))
            }
            Err(_) => None,
        }
    }

    fn spawn_execution(&self, task: Arc<dyn Task>, permit: OwnedSemaphorePermit) -> JoinHandle<()> {
        let inner = self.inner.clone();
        inner.active.fetch_add(1, Ordering::Relaxed);
        inner.publish_gauges();

        tokio::spawn(async move {
            let guard = CompletionGuard {
                inner: inner.clone(),
                _permit: permit,
            };

            // Run the task in its own tokio task so a panic surfaces as a
            // JoinError instead of unwinding through the executor.
            let execution = tokio::spawn(async move { task.execute().await });
            let abort = execution.abort_handle();

            let outcome = tokio::select! {
                joined = execution => match joined {
                    Ok(result) => Some(result),
                    Err(e) if e.is_panic() => Some(TaskResult::failure(
                        next_task_id(),
                        Duration::ZERO,
                        format!("task panicked: {}", e),
                    )),
                    Err(_) => None,
                },
                _ = inner.cancel.cancelled() => {
                    abort.abort();
                    None
                }
            };

            match outcome {
                Some(result) => inner.engine.record(&result),
                // Cancelled mid-flight: the result, if any, is dropped.
                None => {
                    inner.interrupted.fetch_add(1, Ordering::Relaxed);
                }
            }

            drop(guard);
        })
    }

    pub fn submitted(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// `submitted − completed − active`, clamped at zero.
    pub fn pending(&self) -> u64 {
        self.inner.pending()
    }

    pub fn interrupted(&self) -> u64 {
        self.inner.interrupted.load(Ordering::Relaxed)
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Stop accepting new submissions. In-flight tasks are unaffected.
    pub fn close(&self) {
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.semaphore.close();
        debug!("Executor closed to new submissions");
    }

    /// Wait until no task is in flight, up to `timeout`. Returns true when
    /// the executor went idle in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    /// Cancel every in-flight task. Their results are dropped and counted
    /// as interrupted.
    pub fn abort_active(&self) -> u64 {
        let active = self.active();
        if active > 0 {
            warn!(active = active, "Aborting in-flight tasks");
        }
        self.inner.cancel.cancel();
        active
    }

    /// Stop accepting, wait up to `grace` for in-flight tasks, then abort
    /// the stragglers. Returns the number of tasks still active when the
    /// grace period expired.
    pub async fn shutdown(&self, grace: Duration) -> u64 {
        self.close();
        if self.wait_idle(grace).await {
            0
        } else {
            self.abort_active()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FixedSleepTask {
        duration: Duration,
        succeed: bool,
    }

    #[async_trait]
    impl Task for FixedSleepTask {
        async fn execute(&self) -> TaskResult {
            tokio::time::sleep(self.duration).await;
            if self.succeed {
                TaskResult::ok(next_task_id(), self.duration)
            } else {
                TaskResult::failure(next_task_id(), self.duration, "deliberate failure")
            }
        }
    }

    struct PanickingTask;

    #[async_trait]
    impl Task for PanickingTask {
        async fn execute(&self) -> TaskResult {
            panic!("boom");
        }
    }

    fn sleep_task(ms: u64) -> Arc<dyn Task> {
        Arc::new(FixedSleepTask {
            duration: Duration::from_millis(ms),
            succeed: true,
        })
    }

    fn executor(cap: usize) -> (TaskExecutor, MetricsEngine) {
        let engine = MetricsEngine::new();
        let executor = TaskExecutor::new(cap, engine.clone(), CancellationToken::new());
        (executor, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn results_flow_into_engine() {
        let (executor, engine) = executor(10);
        for _ in 0..5 {
            let _ = executor.submit(sleep_task(10)).await.unwrap();
        }
        executor.wait_idle(Duration::from_secs(5)).await;

        assert_eq!(engine.total(), 5);
        assert_eq!(executor.completed(), 5);
        assert_eq!(executor.active(), 0);
        assert_eq!(executor.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn counter_identity_holds() {
        let (executor, _engine) = executor(2);
        for _ in 0..6 {
            let executor = executor.clone();
            tokio::spawn(async move {
                let _ = executor.submit(sleep_task(50)).await;
            });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let submitted = executor.submitted();
        let completed = executor.completed();
        let active = executor.active();
        let pending = executor.pending();
        assert_eq!(submitted, completed + active + pending);

        executor.wait_idle(Duration::from_secs(5)).await;
        assert_eq!(executor.submitted(), executor.completed());
        assert_eq!(executor.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cap_limits_in_flight_tasks() {
        let (executor, _engine) = executor(3);
        for _ in 0..10 {
            let executor = executor.clone();
            tokio::spawn(async move {
                let _ = executor.submit(sleep_task(100)).await;
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(executor.active() <= 3);
        executor.wait_idle(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn try_submit_refuses_when_saturated() {
        let (executor, _engine) = executor(1);
        assert!(executor.try_submit(sleep_task(200)).is_some());
        tokio::task::yield_now().await;
        assert!(executor.try_submit(sleep_task(200)).is_none());

        executor.wait_idle(Duration::from_secs(5)).await;
        assert!(executor.try_submit(sleep_task(1)).is_some());
        executor.wait_idle(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_task_recorded_as_failure() {
        let (executor, engine) = executor(4);
        let _ = executor
            .submit(Arc::new(FixedSleepTask {
                duration: Duration::from_millis(5),
                succeed: false,
            }))
            .await
            .unwrap();
        executor.wait_idle(Duration::from_secs(1)).await;

        let snap = engine.snapshot();
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.error_histogram.get("deliberate failure"), Some(&1));
    }

    #[tokio::test]
    async fn panicking_task_becomes_failure_result() {
        let (executor, engine) = executor(4);
        let _ = executor.submit(Arc::new(PanickingTask)).await.unwrap();
        executor.wait_idle(Duration::from_secs(2)).await;

        let snap = engine.snapshot();
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.total, 1);
        assert_eq!(executor.completed(), 1);
        assert!(snap
            .error_histogram
            .keys()
            .any(|k| k.contains("panicked")));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_stragglers_and_counts_them() {
        let (executor, engine) = executor(8);
        for _ in 0..4 {
            let _ = executor.submit(sleep_task(60_000)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let interrupted = executor.shutdown(Duration::from_millis(100)).await;
        assert_eq!(interrupted, 4);

        executor.wait_idle(Duration::from_secs(1)).await;
        // Aborted tasks never reach the engine.
        assert_eq!(engine.total(), 0);
        assert_eq!(executor.interrupted(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_executor_rejects_submissions() {
        let (executor, _engine) = executor(2);
        executor.close();
        assert!(executor.submit(sleep_task(1)).await.is_err());
        assert!(executor.try_submit(sleep_task(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn submit_handle_resolves_after_settlement() {
        let (executor, engine) = executor(2);
        let handle = executor.submit(sleep_task(30)).await.unwrap();
        handle.await.unwrap();
        assert_eq!(engine.total(), 1);
        assert_eq!(executor.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_lets_short_tasks_finish() {
        let (executor, engine) = executor(4);
        for _ in 0..4 {
            let _ = executor.submit(sleep_task(20)).await.unwrap();
        }
        let interrupted = executor.shutdown(Duration::from_secs(1)).await;
        assert_eq!(interrupted, 0);
        assert_eq!(engine.total(), 4);
    }
}
