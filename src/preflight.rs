//! Pre-flight validation harness.
//!
//! Runs an ordered set of checks against a proposed test config before any
//! resources are bound. The harness never stops early: every check runs,
//! panics are converted into FAIL results, and the aggregate is the worst
//! individual status. A FAIL aggregate blocks the test; WARN does not.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::TestConfig;
use crate::task::TaskRegistry;

// ── Check contract ────────────────────────────────────────────────────────────

/// Outcome class of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skip,
}

/// Result of one check execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub status: CheckStatus,
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
    pub duration_ms: u64,
}

impl CheckResult {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Pass,
            message: message.into(),
            details: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Warn,
            message: message.into(),
            details: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Fail,
            message: message.into(),
            details: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn skip(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Skip,
            message: message.into(),
            details: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }
}

/// What a check gets to look at.
pub struct CheckContext {
    pub config: TestConfig,
    pub registry: TaskRegistry,
}

/// One pre-flight check. Implementations should be quick; the harness runs
/// them sequentially in registration order.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, ctx: &CheckContext) -> CheckResult;
}

// ── Report ────────────────────────────────────────────────────────────────────

/// A named result inside the aggregated report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedCheckResult {
    pub name: String,
    #[serde(flatten)]
    pub result: CheckResult,
}

/// Aggregated pre-flight outcome: FAIL if any check failed, else WARN if
/// any warned, else PASS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub status: CheckStatus,
    pub can_proceed: bool,
    pub checks: Vec<NamedCheckResult>,
}

// ── Harness ───────────────────────────────────────────────────────────────────

/// Ordered set of checks with worst-of aggregation.
#[derive(Default)]
pub struct PreFlightHarness {
    checks: Vec<Arc<dyn Check>>,
}

impl PreFlightHarness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Harness loaded with the standard check set.
    pub fn with_standard_checks() -> Self {
        let mut harness = Self::new();
        harness.add(Arc::new(ServiceHealthCheck));
        harness.add(Arc::new(ConfigurationCheck));
        harness.add(Arc::new(ResourceCheck));
        harness.add(Arc::new(NetworkCheck));
        harness
    }

    pub fn add(&mut self, check: Arc<dyn Check>) {
        self.checks.push(check);
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check in order. Panicking checks become FAIL results; the
    /// harness itself never fails.
    pub async fn run(&self, ctx: &CheckContext) -> ValidationReport {
        let mut results = Vec::with_capacity(self.checks.len());

        for check in &self.checks {
            let name = check.name().to_string();
            let start = Instant::now();

            // Run each check in its own task so a panic surfaces as a
            // JoinError instead of tearing down the harness.
            let check = check.clone();
            let config = ctx.config.clone();
            let registry = ctx.registry.clone();
            let joined = tokio::spawn(async move {
                let ctx = CheckContext { config, registry };
                check.execute(&ctx).await
            })
            .await;

            let mut result = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(check = %name, error = %e, "Pre-flight check panicked");
                    CheckResult::fail(format!("check panicked: {}", e))
                }
            };
            result.duration_ms = start.elapsed().as_millis() as u64;

            results.push(NamedCheckResult { name, result });
        }

        let status = aggregate_status(&results);
        let report = ValidationReport {
            status,
            can_proceed: status != CheckStatus::Fail,
            checks: results,
        };

        info!(
            status = ?report.status,
            checks = report.checks.len(),
            can_proceed = report.can_proceed,
            "Pre-flight validation finished"
        );
        report
    }
}

fn aggregate_status(results: &[NamedCheckResult]) -> CheckStatus {
    if results
        .iter()
        .any(|r| r.result.status == CheckStatus::Fail)
    {
        CheckStatus::Fail
    } else if results
        .iter()
        .any(|r| r.result.status == CheckStatus::Warn)
    {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    }
}

// ── Standard checks ───────────────────────────────────────────────────────────

/// Placeholder health probe; deployment-specific probes replace it.
pub struct ServiceHealthCheck;

#[async_trait]
impl Check for ServiceHealthCheck {
    fn name(&self) -> &str {
        "ServiceHealthCheck"
    }

    async fn execute(&self, _ctx: &CheckContext) -> CheckResult {
        CheckResult::pass("no service probes configured")
    }
}

/// Validates the config document and that its task type is registered.
pub struct ConfigurationCheck;

#[async_trait]
impl Check for ConfigurationCheck {
    fn name(&self) -> &str {
        "ConfigurationCheck"
    }

    async fn execute(&self, ctx: &CheckContext) -> CheckResult {
        if let Err(e) = ctx.config.validate() {
            return CheckResult::fail("configuration is invalid").with_detail(e.to_string());
        }
        if !ctx.registry.contains(&ctx.config.task_type) {
            return CheckResult::fail(format!(
                "task type '{}' is not registered",
                ctx.config.task_type
            ));
        }
        CheckResult::pass("configuration is valid")
    }
}

/// Warns when the requested concurrency is high enough to need tuned file
/// descriptor and memory limits.
pub struct ResourceCheck;

#[async_trait]
impl Check for ResourceCheck {
    fn name(&self) -> &str {
        "ResourceCheck"
    }

    async fn execute(&self, ctx: &CheckContext) -> CheckResult {
        if ctx.config.max_concurrency > 20_000 {
            CheckResult::warn(format!(
                "maxConcurrency {} may exhaust file descriptors on default limits",
                ctx.config.max_concurrency
            ))
        } else {
            CheckResult::pass("resource envelope looks fine")
        }
    }
}

/// Placeholder connectivity probe; deployment-specific probes replace it.
pub struct NetworkCheck;

#[async_trait]
impl Check for NetworkCheck {
    fn name(&self) -> &str {
        "NetworkCheck"
    }

    async fn execute(&self, _ctx: &CheckContext) -> CheckResult {
        CheckResult::pass("no network probes configured")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RampStrategy, TestMode};
    use std::collections::HashMap;

    fn context() -> CheckContext {
        CheckContext {
            config: TestConfig {
                mode: TestMode::ConcurrencyBased,
                starting_concurrency: 1,
                max_concurrency: 10,
                ramp_strategy: RampStrategy::Linear {
                    duration_seconds: 0,
                },
                max_tps_limit: None,
                test_duration_seconds: 5,
                sustain_duration_seconds: 0,
                warmup_seconds: 0,
                task_type: "sleep".to_string(),
                task_parameters: HashMap::new(),
            },
            registry: TaskRegistry::with_builtins(),
        }
    }

    struct FixedCheck {
        name: &'static str,
        result: CheckResult,
    }

    #[async_trait]
    impl Check for FixedCheck {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _ctx: &CheckContext) -> CheckResult {
            self.result.clone()
        }
    }

    struct PanickingCheck;

    #[async_trait]
    impl Check for PanickingCheck {
        fn name(&self) -> &str {
            "PanickingCheck"
        }

        async fn execute(&self, _ctx: &CheckContext) -> CheckResult {
            panic!("check exploded");
        }
    }

    #[tokio::test]
    async fn all_pass_aggregates_to_pass() {
        let harness = PreFlightHarness::with_standard_checks();
        let report = harness.run(&context()).await;
        assert_eq!(report.status, CheckStatus::Pass);
        assert!(report.can_proceed);
        assert_eq!(report.checks.len(), 4);
    }

    #[tokio::test]
    async fn warn_dominates_pass() {
        let mut harness = PreFlightHarness::new();
        harness.add(Arc::new(FixedCheck {
            name: "a",
            result: CheckResult::pass("ok"),
        }));
        harness.add(Arc::new(FixedCheck {
            name: "b",
            result: CheckResult::warn("hmm"),
        }));

        let report = harness.run(&context()).await;
        assert_eq!(report.status, CheckStatus::Warn);
        assert!(report.can_proceed);
    }

    #[tokio::test]
    async fn fail_dominates_and_blocks() {
        let mut harness = PreFlightHarness::new();
        harness.add(Arc::new(FixedCheck {
            name: "a",
            result: CheckResult::warn("hmm"),
        }));
        harness.add(Arc::new(FixedCheck {
            name: "b",
            result: CheckResult::fail("nope"),
        }));
        harness.add(Arc::new(FixedCheck {
            name: "c",
            result: CheckResult::pass("fine"),
        }));

        let report = harness.run(&context()).await;
        assert_eq!(report.status, CheckStatus::Fail);
        assert!(!report.can_proceed);
        // All checks ran despite the FAIL in the middle.
        assert_eq!(report.checks.len(), 3);
    }

    #[tokio::test]
    async fn panicking_check_becomes_fail() {
        let mut harness = PreFlightHarness::new();
        harness.add(Arc::new(PanickingCheck));
        harness.add(Arc::new(FixedCheck {
            name: "after",
            result: CheckResult::pass("still ran"),
        }));

        let report = harness.run(&context()).await;
        assert_eq!(report.status, CheckStatus::Fail);
        assert_eq!(report.checks.len(), 2);
        assert!(report.checks[0].result.message.contains("panicked"));
        assert_eq!(report.checks[1].result.status, CheckStatus::Pass);
    }

    #[tokio::test]
    async fn configuration_check_rejects_unknown_task_type() {
        let mut ctx = context();
        ctx.config.task_type = "nonexistent".to_string();

        let report = PreFlightHarness::with_standard_checks().run(&ctx).await;
        assert_eq!(report.status, CheckStatus::Fail);
        let config_check = report
            .checks
            .iter()
            .find(|c| c.name == "ConfigurationCheck")
            .unwrap();
        assert_eq!(config_check.result.status, CheckStatus::Fail);
    }

    #[tokio::test]
    async fn resource_check_warns_on_huge_concurrency() {
        let mut ctx = context();
        ctx.config.max_concurrency = 30_000;

        let report = PreFlightHarness::with_standard_checks().run(&ctx).await;
        assert_eq!(report.status, CheckStatus::Warn);
        assert!(report.can_proceed);
    }

    #[tokio::test]
    async fn results_carry_durations() {
        let harness = PreFlightHarness::with_standard_checks();
        let report = harness.run(&context()).await;
        for check in &report.checks {
            assert!(check.result.duration_ms < 5_000);
        }
    }
}
