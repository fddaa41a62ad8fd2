//! Virtual-user pool shaped by a ramp profile.
//!
//! Each virtual user is an independent loop: build a task from the factory,
//! run it through the executor, wait for it to finish, repeat. Within one
//! user tasks are strictly sequential; across users there is no ordering.
//!
//! A 200 ms tick evaluates the ramp strategy and spawns or retires users to
//! close the gap to the target size. In RATE_LIMITED mode every launch is
//! additionally gated by the rate controller while the pool size provides
//! the concurrency ceiling.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RampStrategy;
use crate::executor::TaskExecutor;
use crate::metrics::MetricsEngine;
use crate::rate::RateController;
use crate::task::{next_task_id, TaskFactory, TaskResult};

/// Ramp evaluation interval.
const TICK: Duration = Duration::from_millis(200);

struct VirtualUser {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Maintains a set of virtual users whose size follows a ramp profile.
pub struct ConcurrencyController {
    starting: u32,
    max: u32,
    ramp: RampStrategy,
    executor: TaskExecutor,
    factory: Arc<dyn TaskFactory>,
    params: HashMap<String, String>,
    rate: Option<Arc<RateController>>,
    engine: MetricsEngine,
    cancel: CancellationToken,
    users: Mutex<Vec<VirtualUser>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl ConcurrencyController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        starting: u32,
        max: u32,
        ramp: RampStrategy,
        executor: TaskExecutor,
        factory: Arc<dyn TaskFactory>,
        params: HashMap<String, String>,
        rate: Option<Arc<RateController>>,
        engine: MetricsEngine,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            starting,
            max,
            ramp,
            executor,
            factory,
            params,
            rate,
            engine,
            cancel,
            users: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Current pool size.
    pub fn current_users(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    /// Drive the pool until `deadline` or cancellation. Does not drain;
    /// call [`drain`](Self::drain) afterwards.
    pub async fn run_until(&self, deadline: Instant) {
        let ramp_start = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let elapsed = now - ramp_start;
            let target = self.ramp.target_at(elapsed, self.starting, self.max);
            self.resize(target as usize);

            let sleep = TICK.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    /// Spawn or retire users to hit `target`. Retired users finish their
    /// current task before exiting.
    fn resize(&self, target: usize) {
        let mut users = self.users.lock().unwrap();
        let current = users.len();

        if current < target {
            debug!(current = current, target = target, "Scaling virtual users up");
            for _ in current..target {
                users.push(self.spawn_user());
            }
        } else if current > target {
            debug!(current = current, target = target, "Scaling virtual users down");
            let mut retired = self.retired.lock().unwrap();
            for user in users.drain(target..) {
                user.cancel.cancel();
                retired.push(user.handle);
            }
        }
    }

    fn spawn_user(&self) -> VirtualUser {
        let user_cancel = self.cancel.child_token();
        let cancel = user_cancel.clone();
        let executor = self.executor.clone();
        let factory = self.factory.clone();
        let params = self.params.clone();
        let rate = self.rate.clone();
        let engine = self.engine.clone();

        let handle = tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                if let Some(rate) = &rate {
                    if rate.acquire(&cancel).await.is_err() {
                        break;
                    }
                }

                // Mid-test construction failures (bad correlation data,
                // exhausted pools) are absorbed as failed results; only the
                // runner's init-time probe is fatal.
                let task = match factory.create(&params) {
                    Ok(task) => task,
                    Err(e) => {
                        engine.record(&TaskResult::failure(
                            next_task_id(),
                            Duration::ZERO,
                            e.to_string(),
                        ));
                        // Brief backoff so a persistently failing factory
                        // (e.g. an exhausted data pool) cannot busy-spin.
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };

                match executor.submit(task).await {
                    // Sequential within one user: wait for this task before
                    // launching the next.
                    Ok(done) => {
                        let _ = done.await;
                    }
                    Err(_) => break,
                }
            }
        });

        VirtualUser {
            cancel: user_cancel,
            handle,
        }
    }

    /// Stop all users, let in-flight tasks finish within `timeout`, then
    /// abort stragglers. Returns the number of interrupted tasks.
    pub async fn drain(&self, timeout: Duration) -> u64 {
        let handles: Vec<JoinHandle<()>> = {
            let mut users = self.users.lock().unwrap();
            let mut retired = self.retired.lock().unwrap();
            users
                .drain(..)
                .map(|user| {
                    user.cancel.cancel();
                    user.handle
                })
                .chain(retired.drain(..))
                .collect()
        };

        info!(users = handles.len(), "Draining virtual users");

        let interrupted = if self.executor.wait_idle(timeout).await {
            0
        } else {
            self.executor.abort_active()
        };

        // Users exit after their current task; give them a moment to
        // observe cancellation before abandoning the handles.
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                break;
            }
        }

        interrupted
    }
}
