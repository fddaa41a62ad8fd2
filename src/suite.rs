//! Suite orchestration: composite scenarios, weighted task mixes and data
//! correlation.
//!
//! A suite expands into per-scenario test runs executed sequentially (array
//! order, honouring `delay_after_seconds`) or in parallel (all at once,
//! done when all are terminal). Scenarios share the suite's [`DataPool`]
//! when correlation is enabled: producers push values extracted from
//! successful results, consumers take them FIFO and inject them as task
//! parameters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ExecutionMode, GetRule, StoreRule, TaskMix, TestScenario, TestSuite};
use crate::data_pool::DataPool;
use crate::error::VajraError;
use crate::metrics::{MetricsEngine, MetricsSnapshot};
use crate::runner::{TestOutcome, TestPhase, TestRunner};
use crate::stream::SnapshotHub;
use crate::task::{Task, TaskFactory, TaskRegistry, TaskResult};

// ── Weighted task mix ─────────────────────────────────────────────────────────

/// Weighted union over named factories.
///
/// Selection probability is `w_i / Σw_j`; weights need not sum to 100.
/// Zero-weight entries are legal but unreachable. Ties break by
/// declaration order via the cumulative-weight layout.
pub struct WeightedTaskFactory {
    entries: Vec<MixEntry>,
    cumulative: Vec<u64>,
    total_weight: u64,
}

struct MixEntry {
    task_type: String,
    factory: Arc<dyn TaskFactory>,
    launches: AtomicU64,
}

impl WeightedTaskFactory {
    /// Resolve every mix entry against the registry. All-zero weights and
    /// unknown task types are rejected.
    pub fn from_mix(mix: &TaskMix, registry: &TaskRegistry) -> Result<Self, VajraError> {
        if mix.weights.is_empty() {
            return Err(VajraError::ConfigInvalid(
                "task mix must name at least one task type".to_string(),
            ));
        }

        let mut entries = Vec::with_capacity(mix.weights.len());
        let mut cumulative = Vec::with_capacity(mix.weights.len());
        let mut sum: u64 = 0;

        for (task_type, weight) in &mix.weights {
            let factory = registry.get(task_type).ok_or_else(|| {
                VajraError::ConfigInvalid(format!("task type '{}' is not registered", task_type))
            })?;
            sum += *weight as u64;
            cumulative.push(sum);
            entries.push(MixEntry {
                task_type: task_type.clone(),
                factory,
                launches: AtomicU64::new(0),
            });
        }

        if sum == 0 {
            return Err(VajraError::ConfigInvalid(
                "task mix needs at least one positive weight".to_string(),
            ));
        }

        Ok(Self {
            entries,
            cumulative,
            total_weight: sum,
        })
    }

    fn select(&self) -> &MixEntry {
        let roll = rand::thread_rng().gen_range(0..self.total_weight);
        // First cumulative strictly greater than the roll; zero-weight
        // entries can never satisfy this.
        let index = self
            .cumulative
            .partition_point(|&cum| cum <= roll);
        &self.entries[index]
    }

    /// Launches per task type so far, in declaration order.
    pub fn launch_counts(&self) -> Vec<(String, u64)> {
        self.entries
            .iter()
            .map(|e| (e.task_type.clone(), e.launches.load(Ordering::Relaxed)))
            .collect()
    }
}

impl TaskFactory for WeightedTaskFactory {
    fn create(&self, params: &HashMap<String, String>) -> Result<Arc<dyn Task>, VajraError> {
        let entry = self.select();
        let task = entry.factory.create(params)?;
        entry.launches.fetch_add(1, Ordering::Relaxed);
        Ok(task)
    }
}

// ── Correlation ───────────────────────────────────────────────────────────────

/// Wraps a task so values named by the store rules are pushed to the pool
/// after every successful result.
struct CorrelatedTask {
    inner: Arc<dyn Task>,
    pool: DataPool,
    store: Arc<Vec<StoreRule>>,
}

#[async_trait]
impl Task for CorrelatedTask {
    async fn execute(&self) -> TaskResult {
        let result = self.inner.execute().await;
        if result.success {
            for rule in self.store.iter() {
                if let Some(value) = result.metadata.get(&rule.from_metadata) {
                    self.pool.put(&rule.key, value.clone());
                }
            }
        }
        result
    }
}

/// Factory decorator that applies a scenario's get/store rules around the
/// inner factory.
pub struct CorrelatedTaskFactory {
    inner: Arc<dyn TaskFactory>,
    pool: DataPool,
    store: Arc<Vec<StoreRule>>,
    get: Vec<GetRule>,
}

impl CorrelatedTaskFactory {
    pub fn new(
        inner: Arc<dyn TaskFactory>,
        pool: DataPool,
        store: Vec<StoreRule>,
        get: Vec<GetRule>,
    ) -> Self {
        Self {
            inner,
            pool,
            store: Arc::new(store),
            get,
        }
    }
}

impl TaskFactory for CorrelatedTaskFactory {
    fn create(&self, params: &HashMap<String, String>) -> Result<Arc<dyn Task>, VajraError> {
        let mut params = params.clone();
        for rule in &self.get {
            match self.pool.take(&rule.key) {
                Some(value) => {
                    params.insert(rule.into_param.clone(), value);
                }
                // Empty pool: a required value fails this launch (recorded
                // as a task error by the caller); optional values are just
                // skipped.
                None if rule.required => {
                    return Err(VajraError::ConfigInvalid(format!(
                        "data pool '{}' is empty",
                        rule.key
                    )));
                }
                None => {}
            }
        }

        let task = self.inner.create(&params)?;
        if self.store.is_empty() {
            return Ok(task);
        }
        Ok(Arc::new(CorrelatedTask {
            inner: task,
            pool: self.pool.clone(),
            store: self.store.clone(),
        }))
    }
}

// ── Suite status ──────────────────────────────────────────────────────────────

/// Overall suite state, derived from its scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuiteState {
    Pending,
    Running,
    Completed,
    Stopped,
    Failed,
}

/// One scenario's progress inside a status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioProgress {
    pub name: String,
    pub phase: TestPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<MetricsSnapshot>,
}

/// Point-in-time suite status for the REST surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteStatus {
    pub suite_id: String,
    pub name: String,
    pub state: SuiteState,
    pub scenarios: Vec<ScenarioProgress>,
    pub percent_complete: f64,
}

struct ScenarioRuntime {
    name: String,
    phase: TestPhase,
    engine: Option<MetricsEngine>,
    outcome: Option<TestOutcome>,
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

/// Runs one suite to completion, threading the shared data pool through
/// its scenarios.
pub struct SuiteOrchestrator {
    suite: TestSuite,
    registry: TaskRegistry,
    hub: SnapshotHub,
    pool: DataPool,
    cancel: CancellationToken,
    state: Mutex<SuiteState>,
    runtimes: Arc<Mutex<Vec<ScenarioRuntime>>>,
    started: Mutex<Option<Instant>>,
}

impl SuiteOrchestrator {
    pub fn new(suite: TestSuite, registry: TaskRegistry, hub: SnapshotHub) -> Self {
        let runtimes = suite
            .scenarios
            .iter()
            .map(|s| ScenarioRuntime {
                name: s.name.clone(),
                phase: TestPhase::Created,
                engine: None,
                outcome: None,
            })
            .collect();

        Self {
            suite,
            registry,
            hub,
            pool: DataPool::new(),
            cancel: CancellationToken::new(),
            state: Mutex::new(SuiteState::Pending),
            runtimes: Arc::new(Mutex::new(runtimes)),
            started: Mutex::new(None),
        }
    }

    pub fn suite_id(&self) -> &str {
        &self.suite.suite_id
    }

    /// The suite's shared pool; exposed so callers can pre-seed it.
    pub fn data_pool(&self) -> DataPool {
        self.pool.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request an orderly stop of every running scenario.
    pub fn stop(&self) {
        info!(suite_id = %self.suite.suite_id, "Stopping suite");
        self.cancel.cancel();
    }

    /// Build the factory chain for one scenario: registry lookup or
    /// weighted mix, then the correlation decorator when enabled.
    fn build_factory(&self, scenario: &TestScenario) -> Result<Arc<dyn TaskFactory>, VajraError> {
        let base: Arc<dyn TaskFactory> = match &scenario.task_mix {
            Some(mix) => Arc::new(WeightedTaskFactory::from_mix(mix, &self.registry)?),
            None => self
                .registry
                .get(&scenario.config.task_type)
                .ok_or_else(|| {
                    VajraError::ConfigInvalid(format!(
                        "task type '{}' is not registered",
                        scenario.config.task_type
                    ))
                })?,
        };

        if self.suite.use_correlation
            && (!scenario.store_data.is_empty() || !scenario.get_data.is_empty())
        {
            Ok(Arc::new(CorrelatedTaskFactory::new(
                base,
                self.pool.clone(),
                scenario.store_data.clone(),
                scenario.get_data.clone(),
            )))
        } else {
            Ok(base)
        }
    }

    fn scenario_test_id(&self, scenario: &TestScenario) -> String {
        format!("{}:{}", self.suite.suite_id, scenario.name)
    }

    async fn run_scenario(&self, index: usize, scenario: &TestScenario) {
        let factory = match self.build_factory(scenario) {
            Ok(factory) => factory,
            Err(e) => {
                warn!(
                    suite_id = %self.suite.suite_id,
                    scenario = %scenario.name,
                    error = %e,
                    "Scenario factory construction failed"
                );
                let mut runtimes = self.runtimes.lock().unwrap();
                runtimes[index].phase = TestPhase::Failed;
                return;
            }
        };

        let runner = TestRunner::new(
            self.scenario_test_id(scenario),
            scenario.config.clone(),
            factory,
            self.hub.clone(),
            self.cancel.child_token(),
        );

        {
            let mut runtimes = self.runtimes.lock().unwrap();
            runtimes[index].engine = Some(runner.engine());
            runtimes[index].phase = TestPhase::Running;
        }

        let outcome = runner.run().await;

        let mut runtimes = self.runtimes.lock().unwrap();
        runtimes[index].phase = outcome.phase;
        runtimes[index].outcome = Some(outcome);
    }

    /// Run the whole suite to a terminal state.
    pub async fn run(self: &Arc<Self>) -> SuiteState {
        *self.state.lock().unwrap() = SuiteState::Running;
        *self.started.lock().unwrap() = Some(Instant::now());
        info!(
            suite_id = %self.suite.suite_id,
            scenarios = self.suite.scenarios.len(),
            mode = ?self.suite.execution_mode,
            "Suite starting"
        );

        match self.suite.execution_mode {
            ExecutionMode::Sequential => {
                for (index, scenario) in self.suite.scenarios.iter().enumerate() {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    self.run_scenario(index, scenario).await;

                    if scenario.delay_after_seconds > 0 && !self.cancel.is_cancelled() {
                        let delay = Duration::from_secs(scenario.delay_after_seconds);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.cancel.cancelled() => {}
                        }
                    }
                }
            }
            ExecutionMode::Parallel => {
                let mut handles = Vec::new();
                for (index, scenario) in self.suite.scenarios.iter().enumerate() {
                    let this = self.clone();
                    let scenario = scenario.clone();
                    handles.push(tokio::spawn(async move {
                        this.run_scenario(index, &scenario).await;
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            }
        }

        let terminal = self.derive_terminal_state();
        *self.state.lock().unwrap() = terminal;
        info!(suite_id = %self.suite.suite_id, state = ?terminal, "Suite finished");
        terminal
    }

    fn derive_terminal_state(&self) -> SuiteState {
        if self.cancel.is_cancelled() {
            return SuiteState::Stopped;
        }
        let runtimes = self.runtimes.lock().unwrap();
        if runtimes.iter().any(|r| r.phase == TestPhase::Failed) {
            SuiteState::Failed
        } else {
            SuiteState::Completed
        }
    }

    /// Percent complete: terminal scenarios over total for parallel suites,
    /// elapsed over planned duration for sequential ones.
    fn percent_complete(&self) -> f64 {
        let total = self.suite.scenarios.len();
        if total == 0 {
            return 100.0;
        }

        match self.suite.execution_mode {
            ExecutionMode::Parallel => {
                let runtimes = self.runtimes.lock().unwrap();
                let done = runtimes.iter().filter(|r| r.phase.is_terminal()).count();
                done as f64 / total as f64 * 100.0
            }
            ExecutionMode::Sequential => {
                let planned: u64 = self
                    .suite
                    .scenarios
                    .iter()
                    .map(|s| s.config.test_duration_seconds + s.delay_after_seconds)
                    .sum();
                if planned == 0 {
                    return 100.0;
                }
                let elapsed = self
                    .started
                    .lock()
                    .unwrap()
                    .map(|t| t.elapsed().as_secs_f64())
                    .unwrap_or(0.0);
                (elapsed / planned as f64 * 100.0).min(100.0)
            }
        }
    }

    /// Point-in-time status with per-scenario snapshots.
    pub fn status(&self) -> SuiteStatus {
        let runtimes = self.runtimes.lock().unwrap();
        let scenarios = runtimes
            .iter()
            .map(|r| ScenarioProgress {
                name: r.name.clone(),
                phase: r.phase,
                snapshot: r.engine.as_ref().map(|e| e.snapshot()),
            })
            .collect();

        SuiteStatus {
            suite_id: self.suite.suite_id.clone(),
            name: self.suite.name.clone(),
            state: *self.state.lock().unwrap(),
            scenarios,
            percent_complete: self.percent_complete(),
        }
    }

    /// Final snapshots per scenario; empty until scenarios finish.
    pub fn results(&self) -> Vec<ScenarioProgress> {
        let runtimes = self.runtimes.lock().unwrap();
        runtimes
            .iter()
            .filter(|r| r.outcome.is_some())
            .map(|r| ScenarioProgress {
                name: r.name.clone(),
                phase: r.phase,
                snapshot: r.outcome.as_ref().map(|o| o.final_snapshot.clone()),
            })
            .collect()
    }

    pub fn state(&self) -> SuiteState {
        *self.state.lock().unwrap()
    }
}
