//! Per-test orchestrator.
//!
//! Drives one test through its lifecycle:
//!
//! ```text
//! CREATED → WARMING_UP → RUNNING → DRAINING → COMPLETED
//!                                 ↘ STOPPED (on external cancel)
//!                                 ↘ FAILED  (on fatal init)
//! ```
//!
//! The runner binds the executor, the rate/concurrency controllers and the
//! metrics engine, and publishes a phase-stamped snapshot every 500 ms.
//! `test_duration_seconds` is the outer wall-clock bound; ramp and sustain
//! are clipped to it, and sustain ends no later than the test itself.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{TestConfig, TestMode};
use crate::error::VajraError;
use crate::executor::TaskExecutor;
use crate::metrics::{MetricsEngine, MetricsSnapshot};
use crate::rate::RateController;
use crate::stream::{SnapshotHub, TestStatusUpdate};
use crate::task::TaskFactory;
use crate::vusers::ConcurrencyController;

/// Snapshot publication interval.
const PUBLISH_INTERVAL: Duration = Duration::from_millis(500);

/// How long DRAINING waits for in-flight tasks before abandoning them.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool size used for the optional warmup phase.
const WARMUP_USERS: u32 = 5;

// ── Phase ─────────────────────────────────────────────────────────────────────

/// Where a test is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestPhase {
    Created,
    WarmingUp,
    Running,
    Draining,
    Completed,
    Stopped,
    Failed,
}

impl TestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestPhase::Created => "CREATED",
            TestPhase::WarmingUp => "WARMING_UP",
            TestPhase::Running => "RUNNING",
            TestPhase::Draining => "DRAINING",
            TestPhase::Completed => "COMPLETED",
            TestPhase::Stopped => "STOPPED",
            TestPhase::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestPhase::Completed | TestPhase::Stopped | TestPhase::Failed
        )
    }
}

/// Final accounting for a finished test.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub phase: TestPhase,
    pub final_snapshot: MetricsSnapshot,
    pub tasks_interrupted: u64,
    pub error: Option<String>,
}

// ── Runner ────────────────────────────────────────────────────────────────────

/// Orchestrates a single test's lifecycle.
pub struct TestRunner {
    test_id: String,
    config: TestConfig,
    factory: Arc<dyn TaskFactory>,
    engine: MetricsEngine,
    executor: TaskExecutor,
    cancel: CancellationToken,
    phase_tx: watch::Sender<TestPhase>,
    hub: SnapshotHub,
    /// Pool handed from the measured phase to the drain phase.
    draining_pool: std::sync::Mutex<Option<Arc<ConcurrencyController>>>,
}

impl TestRunner {
    /// Build a runner for a validated config. The `cancel` token is the
    /// test's stop signal; cancelling it moves the test into DRAINING.
    pub fn new(
        test_id: impl Into<String>,
        config: TestConfig,
        factory: Arc<dyn TaskFactory>,
        hub: SnapshotHub,
        cancel: CancellationToken,
    ) -> Self {
        let engine = MetricsEngine::new();
        // The executor's context is deliberately independent of the test
        // token: on stop, virtual users exit after their current task; only
        // the drain timeout aborts in-flight work.
        let executor = TaskExecutor::new(
            config.max_concurrency as usize,
            engine.clone(),
            CancellationToken::new(),
        );
        let (phase_tx, _) = watch::channel(TestPhase::Created);

        Self {
            test_id: test_id.into(),
            config,
            factory,
            engine,
            executor,
            cancel,
            phase_tx,
            hub,
            draining_pool: std::sync::Mutex::new(None),
        }
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn engine(&self) -> MetricsEngine {
        self.engine.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Observe phase transitions.
    pub fn phase_receiver(&self) -> watch::Receiver<TestPhase> {
        self.phase_tx.subscribe()
    }

    pub fn current_phase(&self) -> TestPhase {
        *self.phase_tx.borrow()
    }

    fn set_phase(&self, phase: TestPhase) {
        info!(test_id = %self.test_id, phase = phase.as_str(), "Test phase changed");
        let _ = self.phase_tx.send(phase);
    }

    fn publish(&self, phase: TestPhase) {
        self.hub.publish(TestStatusUpdate {
            test_id: self.test_id.clone(),
            phase,
            snapshot: self.engine.snapshot(),
        });
    }

    /// Run the test to a terminal phase.
    pub async fn run(&self) -> TestOutcome {
        // A factory that cannot construct a task fails the test before any
        // concurrency is consumed.
        if let Err(e) = self.factory.create(&self.config.task_parameters) {
            error!(test_id = %self.test_id, error = %e, "Task factory failed at init");
            self.set_phase(TestPhase::Failed);
            self.publish(TestPhase::Failed);
            return TestOutcome {
                phase: TestPhase::Failed,
                final_snapshot: self.engine.snapshot(),
                tasks_interrupted: 0,
                error: Some(e.to_string()),
            };
        }

        let publisher = self.spawn_publisher();

        if self.config.warmup_seconds > 0 && !self.cancel.is_cancelled() {
            self.warmup().await;
        }

        self.set_phase(TestPhase::Running);
        self.measured_phase().await;

        self.set_phase(TestPhase::Draining);
        let interrupted = self.drain().await;

        let terminal = if self.cancel.is_cancelled() {
            TestPhase::Stopped
        } else {
            TestPhase::Completed
        };
        self.set_phase(terminal);

        publisher.abort();
        // Final snapshot always goes out, even if the publisher tick was
        // mid-sleep when the test ended.
        self.publish(terminal);

        let final_snapshot = self.engine.snapshot();
        info!(
            test_id = %self.test_id,
            phase = terminal.as_str(),
            total = final_snapshot.total,
            failed = final_snapshot.failed,
            interrupted = interrupted,
            "Test finished"
        );

        TestOutcome {
            phase: terminal,
            final_snapshot,
            tasks_interrupted: interrupted,
            error: None,
        }
    }

    /// Run a small pool briefly, then discard everything it measured.
    async fn warmup(&self) {
        self.set_phase(TestPhase::WarmingUp);

        let users = self.config.starting_concurrency.min(WARMUP_USERS);
        let warmup_engine = self.engine.clone();
        let warmup_cancel = self.cancel.child_token();
        let warmup_executor = TaskExecutor::new(
            users as usize,
            warmup_engine.clone(),
            CancellationToken::new(),
        );

        let pool = ConcurrencyController::new(
            users,
            users,
            crate::config::RampStrategy::Linear {
                duration_seconds: 0,
            },
            warmup_executor.clone(),
            self.factory.clone(),
            self.config.task_parameters.clone(),
            None,
            warmup_engine,
            warmup_cancel,
        );

        let deadline = Instant::now() + Duration::from_secs(self.config.warmup_seconds);
        pool.run_until(deadline).await;
        pool.drain(Duration::from_secs(5)).await;

        // Warmup numbers never leak into the measured phase.
        self.engine.reset();
        info!(test_id = %self.test_id, "Warmup complete, metrics reset");
    }

    async fn measured_phase(&self) {
        let rate = match self.config.mode {
            TestMode::RateLimited => {
                let target = self.config.max_tps_limit.unwrap_or(1.0);
                Some(Arc::new(RateController::new(
                    target,
                    self.config.ramp_duration(),
                )))
            }
            TestMode::ConcurrencyBased => None,
        };

        let pool = ConcurrencyController::new(
            self.config.starting_concurrency,
            self.config.max_concurrency,
            self.config.ramp_strategy,
            self.executor.clone(),
            self.factory.clone(),
            self.config.task_parameters.clone(),
            rate,
            self.engine.clone(),
            self.cancel.clone(),
        );

        let deadline = Instant::now() + self.config.test_duration();
        pool.run_until(deadline).await;

        // Hand the pool to the drain phase.
        self.draining_pool.lock().unwrap().replace(Arc::new(pool));
    }

    async fn drain(&self) -> u64 {
        let pool = self.draining_pool.lock().unwrap().take();
        match pool {
            Some(pool) => {
                let interrupted = pool.drain(DRAIN_TIMEOUT).await;
                self.executor.close();
                if interrupted > 0 {
                    warn!(
                        test_id = %self.test_id,
                        interrupted = interrupted,
                        "Drain timeout expired with tasks still in flight"
                    );
                }
                self.executor.interrupted().max(interrupted)
            }
            None => 0,
        }
    }

    fn spawn_publisher(&self) -> tokio::task::JoinHandle<()> {
        let hub = self.hub.clone();
        let engine = self.engine.clone();
        let test_id = self.test_id.clone();
        let mut phase_rx = self.phase_tx.subscribe();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PUBLISH_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let phase = *phase_rx.borrow_and_update();
                hub.publish(TestStatusUpdate {
                    test_id: test_id.clone(),
                    phase,
                    snapshot: engine.snapshot(),
                });
                crate::prom::SNAPSHOTS_PUBLISHED_TOTAL.inc();
                if phase.is_terminal() {
                    break;
                }
            }
        })
    }
}
