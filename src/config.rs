//! Test and suite configuration documents.
//!
//! `TestConfig` is the per-scenario contract accepted over REST (JSON) or
//! from YAML files by the CLI front-end. Cross-field validation lives here
//! so a bad document is rejected with every field error at once, before any
//! resources are bound.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ValidationContext, VajraError};

/// Hard ceiling on concurrent tasks for a single test.
pub const MAX_CONCURRENCY_LIMIT: u32 = 50_000;

/// Hard ceiling on the TPS cap for rate-limited tests.
pub const MAX_TPS_LIMIT: f64 = 100_000.0;

/// Hard ceiling on test duration (24 h).
pub const MAX_DURATION_SECONDS: u64 = 86_400;

// ── Load shaping ──────────────────────────────────────────────────────────────

/// How offered load is shaped for a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestMode {
    /// A fixed-size pool of virtual users issues tasks back to back.
    ConcurrencyBased,
    /// Task launches are gated by a token bucket targeting `max_tps_limit`.
    RateLimited,
}

/// Ramp profile for the virtual-user pool (and the rate controller's
/// ramp-up window in RATE_LIMITED mode).
///
/// Modelled as a tagged variant rather than a trait hierarchy; the
/// concurrency controller switches on it at every tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum RampStrategy {
    /// Interpolate linearly from the starting size to the maximum over
    /// `duration_seconds`.
    Linear { duration_seconds: u64 },
    /// Add `step` users every `interval_seconds` until the maximum.
    Step { step: u32, interval_seconds: u64 },
}

impl RampStrategy {
    /// Wall-clock length of the ramp for a given start→max climb.
    pub fn ramp_duration(&self, starting: u32, max: u32) -> Duration {
        match self {
            RampStrategy::Linear { duration_seconds } => Duration::from_secs(*duration_seconds),
            RampStrategy::Step {
                step,
                interval_seconds,
            } => {
                if *step == 0 || max <= starting {
                    return Duration::ZERO;
                }
                let gap = max - starting;
                let steps = (gap + step - 1) / step;
                Duration::from_secs(steps as u64 * interval_seconds)
            }
        }
    }

    /// Target pool size at `elapsed` into the ramp.
    pub fn target_at(&self, elapsed: Duration, starting: u32, max: u32) -> u32 {
        if max <= starting {
            return max;
        }
        match self {
            RampStrategy::Linear { duration_seconds } => {
                if *duration_seconds == 0 {
                    return max;
                }
                let frac = elapsed.as_secs_f64() / *duration_seconds as f64;
                if frac >= 1.0 {
                    max
                } else {
                    let gap = (max - starting) as f64;
                    starting + (gap * frac).floor() as u32
                }
            }
            RampStrategy::Step {
                step,
                interval_seconds,
            } => {
                if *step == 0 || *interval_seconds == 0 {
                    return max;
                }
                let intervals = (elapsed.as_secs() / interval_seconds) as u32;
                starting.saturating_add(intervals.saturating_mul(*step)).min(max)
            }
        }
    }
}

// ── Per-test configuration ────────────────────────────────────────────────────

fn default_starting_concurrency() -> u32 {
    1
}

/// The per-scenario contract: what to run, how hard, and for how long.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConfig {
    pub mode: TestMode,

    /// Virtual users at t=0.
    #[serde(default = "default_starting_concurrency")]
    pub starting_concurrency: u32,

    /// Ceiling on concurrent tasks.
    pub max_concurrency: u32,

    pub ramp_strategy: RampStrategy,

    /// Hard TPS cap; required in RATE_LIMITED mode, ignored otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tps_limit: Option<f64>,

    /// Total wall-clock duration. Ramp and sustain are clipped to this
    /// outer bound.
    pub test_duration_seconds: u64,

    /// Hold-at-peak after the ramp completes.
    #[serde(default)]
    pub sustain_duration_seconds: u64,

    /// Warmup tasks run at low concurrency before the measured phase;
    /// 0 skips warmup entirely.
    #[serde(default)]
    pub warmup_seconds: u64,

    /// Name of a registered task factory.
    pub task_type: String,

    /// Opaque bag forwarded to the task factory. References only — never
    /// credentials.
    #[serde(default)]
    pub task_parameters: HashMap<String, String>,
}

impl TestConfig {
    /// Schema and cross-field validation. Collects every violation before
    /// returning so API callers see the full picture.
    pub fn validate(&self) -> Result<(), VajraError> {
        let mut ctx = ValidationContext::new();

        if self.task_type.trim().is_empty() {
            ctx.required("taskType");
        }

        if self.max_concurrency < 1 || self.max_concurrency > MAX_CONCURRENCY_LIMIT {
            ctx.out_of_range(
                "maxConcurrency",
                self.max_concurrency as u64,
                1,
                MAX_CONCURRENCY_LIMIT as u64,
            );
        }

        if self.starting_concurrency < 1 {
            ctx.out_of_range("startingConcurrency", self.starting_concurrency as u64, 1, self.max_concurrency as u64);
        } else if self.starting_concurrency > self.max_concurrency {
            ctx.field_error(
                "startingConcurrency",
                format!(
                    "must not exceed maxConcurrency ({} > {})",
                    self.starting_concurrency, self.max_concurrency
                ),
            );
        }

        if self.test_duration_seconds < 1 || self.test_duration_seconds > MAX_DURATION_SECONDS {
            ctx.out_of_range(
                "testDurationSeconds",
                self.test_duration_seconds,
                1,
                MAX_DURATION_SECONDS,
            );
        }

        match self.mode {
            TestMode::RateLimited => match self.max_tps_limit {
                None => ctx.required("maxTpsLimit"),
                Some(tps) => {
                    if !(1.0..=MAX_TPS_LIMIT).contains(&tps) {
                        ctx.out_of_range("maxTpsLimit", tps, 1.0, MAX_TPS_LIMIT);
                    }
                }
            },
            // CONCURRENCY_BASED ignores the cap entirely.
            TestMode::ConcurrencyBased => {}
        }

        if let RampStrategy::Step {
            step,
            interval_seconds,
        } = self.ramp_strategy
        {
            if step == 0 {
                ctx.field_error("rampStrategy.step", "must be at least 1");
            }
            if interval_seconds == 0 {
                ctx.field_error("rampStrategy.intervalSeconds", "must be at least 1");
            }
        }

        ctx.into_result()
    }

    pub fn test_duration(&self) -> Duration {
        Duration::from_secs(self.test_duration_seconds)
    }

    /// Ramp length clipped to the test duration.
    pub fn ramp_duration(&self) -> Duration {
        self.ramp_strategy
            .ramp_duration(self.starting_concurrency, self.max_concurrency)
            .min(self.test_duration())
    }

    /// Parse from a JSON document (the REST body format).
    pub fn from_json(body: &[u8]) -> Result<Self, VajraError> {
        serde_json::from_slice(body).map_err(|e| VajraError::ConfigInvalid(e.to_string()))
    }

    /// Parse from a YAML document (the CLI file format).
    pub fn from_yaml(text: &str) -> Result<Self, VajraError> {
        serde_yaml::from_str(text).map_err(|e| VajraError::ConfigInvalid(e.to_string()))
    }
}

// ── Suite configuration ───────────────────────────────────────────────────────

/// How a suite's scenarios are composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

/// Weighted union of task factories for a scenario.
///
/// Weights are non-negative integers; at least one must be positive. They
/// need not sum to 100 — probabilities are `w_i / Σw_j`. Zero-weight
/// entries are legal but never selected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMix {
    /// Declaration-ordered (taskType, weight) pairs; ties break by order.
    pub weights: Vec<(String, u32)>,
}

impl TaskMix {
    pub fn validate(&self, ctx: &mut ValidationContext) {
        if self.weights.is_empty() {
            ctx.field_error("taskMix.weights", "must name at least one task type");
            return;
        }
        if self.weights.iter().all(|(_, w)| *w == 0) {
            ctx.field_error("taskMix.weights", "at least one weight must be positive");
        }
    }
}

/// Push a value extracted from successful task results into the suite's
/// data pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRule {
    /// Pool key to push into.
    pub key: String,
    /// Metadata field of the task result to extract.
    pub from_metadata: String,
}

/// Take a value from the pool and inject it as a task parameter before
/// each launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRule {
    /// Pool key to take from (FIFO).
    pub key: String,
    /// Parameter name the value is injected under.
    pub into_param: String,
    /// When true, an empty pool fails the launch instead of skipping the
    /// injection.
    #[serde(default)]
    pub required: bool,
}

/// One scenario inside a suite: a test config plus mix and correlation
/// declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestScenario {
    pub name: String,
    pub config: TestConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_mix: Option<TaskMix>,

    /// Pause after this scenario completes (sequential mode only).
    #[serde(default)]
    pub delay_after_seconds: u64,

    #[serde(default)]
    pub store_data: Vec<StoreRule>,

    #[serde(default)]
    pub get_data: Vec<GetRule>,
}

/// An ordered or parallel composition of scenarios sharing a data pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSuite {
    pub suite_id: String,
    pub name: String,
    pub execution_mode: ExecutionMode,
    pub scenarios: Vec<TestScenario>,

    /// When false, store/get declarations are ignored and no pool is
    /// created.
    #[serde(default)]
    pub use_correlation: bool,
}

impl TestSuite {
    pub fn validate(&self) -> Result<(), VajraError> {
        let mut ctx = ValidationContext::new();

        if self.suite_id.trim().is_empty() {
            ctx.required("suiteId");
        }
        if self.scenarios.is_empty() {
            ctx.field_error("scenarios", "suite must contain at least one scenario");
        }

        for scenario in &self.scenarios {
            if let Err(VajraError::ConfigInvalid(msg)) = scenario.config.validate() {
                ctx.field_error(&format!("scenarios[{}].config", scenario.name), msg);
            }
            if let Some(mix) = &scenario.task_mix {
                mix.validate(&mut ctx);
            }
        }

        ctx.into_result()
    }

    pub fn from_json(body: &[u8]) -> Result<Self, VajraError> {
        serde_json::from_slice(body).map_err(|e| VajraError::ConfigInvalid(e.to_string()))
    }

    pub fn from_yaml(text: &str) -> Result<Self, VajraError> {
        serde_yaml::from_str(text).map_err(|e| VajraError::ConfigInvalid(e.to_string()))
    }
}

// ── Runtime configuration ─────────────────────────────────────────────────────

/// Which half of the system this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// REST + local runner, no fleet.
    Standalone,
    /// REST + worker registry + assignment plane.
    Controller,
    /// Dumb executor that dials a controller.
    Worker,
}

impl Role {
    fn from_env() -> Self {
        match std::env::var("VAJRA_ROLE")
            .unwrap_or_else(|_| "standalone".to_string())
            .to_lowercase()
            .as_str()
        {
            "controller" => Role::Controller,
            "worker" => Role::Worker,
            _ => Role::Standalone,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Standalone => "standalone",
            Role::Controller => "controller",
            Role::Worker => "worker",
        }
    }
}

/// Process-level settings parsed from environment variables.
///
/// All fields have defaults so the struct is always constructable; a
/// standalone node needs nothing set.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub role: Role,

    /// REST listener address.
    pub api_addr: String,

    /// Prometheus /metrics listener address.
    pub metrics_addr: String,

    /// gRPC listener (controller service, or the worker's own service).
    pub grpc_addr: String,

    /// Controller address a worker dials (`host:port`).
    pub controller_addr: String,

    /// Stable worker identity; defaults to `HOSTNAME` then a fixed name.
    pub worker_id: String,

    /// Worker capacity advertised at registration.
    pub worker_capacity: u32,

    /// Externally reachable address workers advertise for assignments.
    pub advertise_addr: String,

    /// Seconds a terminal test record is retained before eviction.
    pub test_retention_seconds: u64,

    /// Process-wide ceiling on concurrently running tests.
    pub max_concurrent_tests: usize,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let worker_id = std::env::var("VAJRA_WORKER_ID").unwrap_or_else(|_| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-worker".to_string())
        });

        let worker_capacity = env_or("VAJRA_WORKER_CAPACITY", "1000")
            .parse()
            .unwrap_or(1000);

        let test_retention_seconds = env_or("TEST_RETENTION_SECONDS", "300").parse().unwrap_or(300);

        let grpc_addr = env_or("VAJRA_GRPC_ADDR", "0.0.0.0:7000");

        Self {
            role: Role::from_env(),
            api_addr: env_or("VAJRA_API_ADDR", "0.0.0.0:8080"),
            metrics_addr: env_or("VAJRA_METRICS_ADDR", "0.0.0.0:9090"),
            advertise_addr: env_or("VAJRA_ADVERTISE_ADDR", &grpc_addr),
            grpc_addr,
            controller_addr: env_or("VAJRA_CONTROLLER_ADDR", "127.0.0.1:7000"),
            worker_id,
            worker_capacity,
            test_retention_seconds,
            max_concurrent_tests: 10,
        }
    }

    /// Fixed config for tests (no environment reads).
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            role: Role::Standalone,
            api_addr: "127.0.0.1:0".to_string(),
            metrics_addr: "127.0.0.1:0".to_string(),
            grpc_addr: "127.0.0.1:0".to_string(),
            controller_addr: "127.0.0.1:7000".to_string(),
            worker_id: "test-worker".to_string(),
            worker_capacity: 100,
            advertise_addr: "127.0.0.1:7001".to_string(),
            test_retention_seconds: 300,
            max_concurrent_tests: 10,
        }
    }
}
