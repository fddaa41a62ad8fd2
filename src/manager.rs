//! Local test and suite lifecycle management.
//!
//! The manager owns the active-tests map behind the REST surface: it runs
//! pre-flight, enforces the process-wide concurrent-test ceiling, spawns a
//! [`TestRunner`] per accepted config and evicts terminal records after a
//! retention period. Suites get the same treatment with a
//! [`SuiteOrchestrator`] per accepted document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{TestConfig, TestSuite};
use crate::error::VajraError;
use crate::metrics::MetricsSnapshot;
use crate::preflight::{CheckContext, PreFlightHarness, ValidationReport};
use crate::runner::{TestOutcome, TestPhase, TestRunner};
use crate::stream::SnapshotHub;
use crate::suite::{ScenarioProgress, SuiteOrchestrator, SuiteStatus};
use crate::task::TaskRegistry;

/// Tests running at once before submissions bounce with a capacity error.
pub const MAX_CONCURRENT_TESTS: usize = 10;

/// Why a submission was refused.
#[derive(Debug)]
pub enum SubmitRejection {
    /// Schema/parse failure before pre-flight even ran.
    Invalid(String),
    /// Pre-flight aggregated to FAIL; the full report goes to the caller.
    Preflight(ValidationReport),
    /// The concurrent-test ceiling is reached; retry later.
    Capacity(String),
}

/// REST-facing view of one test record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestView {
    pub test_id: String,
    pub status: TestPhase,
    pub start_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<u64>,
    pub config: TestConfig,
    pub snapshot: MetricsSnapshot,
}

struct ManagedTest {
    config: TestConfig,
    runner: Arc<TestRunner>,
    cancel: CancellationToken,
    start_time_ms: u64,
    end_time_ms: Mutex<Option<u64>>,
    terminal_at: Mutex<Option<Instant>>,
    outcome: Mutex<Option<TestOutcome>>,
}

/// Owns every locally-running test. Cheap to clone.
#[derive(Clone)]
pub struct TestManager {
    registry: TaskRegistry,
    hub: SnapshotHub,
    harness: Arc<PreFlightHarness>,
    tests: Arc<Mutex<HashMap<String, Arc<ManagedTest>>>>,
    retention: Duration,
    max_concurrent: usize,
    next_id: Arc<AtomicU64>,
}

impl TestManager {
    pub fn new(registry: TaskRegistry, hub: SnapshotHub, retention: Duration) -> Self {
        Self {
            registry,
            hub,
            harness: Arc::new(PreFlightHarness::with_standard_checks()),
            tests: Arc::new(Mutex::new(HashMap::new())),
            retention,
            max_concurrent: MAX_CONCURRENT_TESTS,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn registry(&self) -> TaskRegistry {
        self.registry.clone()
    }

    pub fn hub(&self) -> SnapshotHub {
        self.hub.clone()
    }

    fn generate_test_id(&self) -> String {
        format!(
            "test-{}-{}",
            epoch_millis(),
            self.next_id.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn running_count(&self) -> usize {
        self.tests
            .lock()
            .unwrap()
            .values()
            .filter(|t| !t.runner.current_phase().is_terminal())
            .count()
    }

    /// Run pre-flight without starting anything.
    pub async fn validate(&self, config: &TestConfig) -> ValidationReport {
        let ctx = CheckContext {
            config: config.clone(),
            registry: self.registry.clone(),
        };
        self.harness.run(&ctx).await
    }

    /// Validate, admit and start one test. Returns its id.
    pub async fn submit(&self, config: TestConfig) -> Result<String, SubmitRejection> {
        let report = self.validate(&config).await;
        if !report.can_proceed {
            return Err(SubmitRejection::Preflight(report));
        }

        if self.running_count() >= self.max_concurrent {
            return Err(SubmitRejection::Capacity(format!(
                "{} tests already running",
                self.max_concurrent
            )));
        }

        let test_id = self.generate_test_id();
        let factory = self
            .registry
            .get(&config.task_type)
            .ok_or_else(|| SubmitRejection::Invalid(format!(
                "task type '{}' is not registered",
                config.task_type
            )))?;

        let cancel = CancellationToken::new();
        let runner = Arc::new(TestRunner::new(
            test_id.clone(),
            config.clone(),
            factory,
            self.hub.clone(),
            cancel.clone(),
        ));

        let managed = Arc::new(ManagedTest {
            config,
            runner: runner.clone(),
            cancel,
            start_time_ms: epoch_millis(),
            end_time_ms: Mutex::new(None),
            terminal_at: Mutex::new(None),
            outcome: Mutex::new(None),
        });

        self.tests
            .lock()
            .unwrap()
            .insert(test_id.clone(), managed.clone());

        info!(test_id = %test_id, "Test accepted");
        crate::prom::TESTS_STARTED_TOTAL.inc();
        crate::prom::ACTIVE_TESTS.set(self.running_count() as f64);

        let manager = self.clone();
        tokio::spawn(async move {
            let outcome = runner.run().await;
            crate::prom::TESTS_BY_OUTCOME
                .with_label_values(&[outcome.phase.as_str()])
                .inc();
            crate::prom::ACTIVE_TESTS.set(manager.running_count() as f64);
            *managed.end_time_ms.lock().unwrap() = Some(epoch_millis());
            *managed.terminal_at.lock().unwrap() = Some(Instant::now());
            *managed.outcome.lock().unwrap() = Some(outcome);
        });

        Ok(test_id)
    }

    pub fn get(&self, test_id: &str) -> Option<TestView> {
        let tests = self.tests.lock().unwrap();
        let managed = tests.get(test_id)?;
        let view = TestView {
            test_id: test_id.to_string(),
            status: managed.runner.current_phase(),
            start_time_ms: managed.start_time_ms,
            end_time_ms: *managed.end_time_ms.lock().unwrap(),
            config: managed.config.clone(),
            snapshot: managed.runner.engine().snapshot(),
        };
        Some(view)
    }

    /// Non-terminal tests only; this is the REST "active tests" listing.
    pub fn list_active(&self) -> HashMap<String, TestPhase> {
        self.tests
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| !t.runner.current_phase().is_terminal())
            .map(|(id, t)| (id.clone(), t.runner.current_phase()))
            .collect()
    }

    /// Request an orderly stop. False for unknown ids.
    pub fn stop(&self, test_id: &str) -> bool {
        let tests = self.tests.lock().unwrap();
        match tests.get(test_id) {
            Some(managed) => {
                info!(test_id = test_id, "Stop requested");
                managed.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn final_outcome(&self, test_id: &str) -> Option<TestOutcome> {
        let tests = self.tests.lock().unwrap();
        let outcome = tests.get(test_id)?.outcome.lock().unwrap().clone();
        outcome
    }

    /// Drop terminal records older than the retention window.
    pub fn evict_expired(&self) {
        let mut evicted = Vec::new();
        {
            let mut tests = self.tests.lock().unwrap();
            tests.retain(|test_id, managed| {
                let expired = managed
                    .terminal_at
                    .lock()
                    .unwrap()
                    .map(|at| at.elapsed() >= self.retention)
                    .unwrap_or(false);
                if expired {
                    evicted.push(test_id.clone());
                }
                !expired
            });
        }
        for test_id in evicted {
            info!(test_id = %test_id, "Evicted terminal test record");
            self.hub.remove(&test_id);
        }
    }

    /// Background eviction sweep.
    pub fn start_eviction_loop(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => manager.evict_expired(),
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

// ── Suites ────────────────────────────────────────────────────────────────────

/// Owns running suite orchestrators, keyed by suite id.
#[derive(Clone)]
pub struct SuiteManager {
    registry: TaskRegistry,
    hub: SnapshotHub,
    suites: Arc<Mutex<HashMap<String, Arc<SuiteOrchestrator>>>>,
}

impl SuiteManager {
    pub fn new(registry: TaskRegistry, hub: SnapshotHub) -> Self {
        Self {
            registry,
            hub,
            suites: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate and start a suite. The suite id comes from the document.
    pub fn start(&self, suite: TestSuite) -> Result<String, VajraError> {
        suite.validate()?;

        let suite_id = suite.suite_id.clone();
        {
            let suites = self.suites.lock().unwrap();
            if let Some(existing) = suites.get(&suite_id) {
                if !matches!(
                    existing.state(),
                    crate::suite::SuiteState::Completed
                        | crate::suite::SuiteState::Stopped
                        | crate::suite::SuiteState::Failed
                ) {
                    return Err(VajraError::RegistrationRejected(format!(
                        "suite '{}' is already running",
                        suite_id
                    )));
                }
            }
        }

        let orchestrator = Arc::new(SuiteOrchestrator::new(
            suite,
            self.registry.clone(),
            self.hub.clone(),
        ));
        self.suites
            .lock()
            .unwrap()
            .insert(suite_id.clone(), orchestrator.clone());

        info!(suite_id = %suite_id, "Suite accepted");
        tokio::spawn(async move {
            let state = orchestrator.run().await;
            if state != crate::suite::SuiteState::Completed {
                warn!(suite_id = %orchestrator.suite_id(), state = ?state, "Suite ended abnormally");
            }
        });

        Ok(suite_id)
    }

    pub fn status(&self, suite_id: &str) -> Option<SuiteStatus> {
        self.suites
            .lock()
            .unwrap()
            .get(suite_id)
            .map(|o| o.status())
    }

    pub fn results(&self, suite_id: &str) -> Option<Vec<ScenarioProgress>> {
        self.suites
            .lock()
            .unwrap()
            .get(suite_id)
            .map(|o| o.results())
    }

    pub fn stop(&self, suite_id: &str) -> bool {
        match self.suites.lock().unwrap().get(suite_id) {
            Some(orchestrator) => {
                orchestrator.stop();
                true
            }
            None => false,
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
