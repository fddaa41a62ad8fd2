//! The workload contract: tasks, factories and the task-type registry.
//!
//! A `Task` is one unit of work — the atomic measurement subject. Factories
//! are registered explicitly at startup under a task-type name; assignments
//! and test configs reference factories by that name only. Parameters are
//! plain `string → string` and each factory parses its own types, failing
//! fast on bad shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use crate::error::VajraError;

// ── Task result ───────────────────────────────────────────────────────────────

/// Immutable outcome of one task execution. Produced by the task, consumed
/// once by the metrics engine, then discarded — no storage beyond
/// aggregates.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: u64,
    pub latency: Duration,
    pub success: bool,
    pub error_message: Option<String>,
    pub response_size: Option<u64>,
    pub metadata: HashMap<String, String>,
}

impl TaskResult {
    pub fn ok(task_id: u64, latency: Duration) -> Self {
        Self {
            task_id,
            latency,
            success: true,
            error_message: None,
            response_size: None,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(task_id: u64, latency: Duration, message: impl Into<String>) -> Self {
        Self {
            task_id,
            latency,
            success: false,
            error_message: Some(message.into()),
            response_size: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Monotonic task-id source, unique within the process.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_task_id() -> u64 {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

// ── Traits ────────────────────────────────────────────────────────────────────

/// One unit of user-defined work.
#[async_trait]
pub trait Task: Send + Sync {
    async fn execute(&self) -> TaskResult;
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Task")
    }
}

/// Produces task instances for a named task type.
///
/// Construction failure is fatal for the owning test (`TestFatal`); it must
/// never consume executor concurrency.
pub trait TaskFactory: Send + Sync {
    fn create(&self, params: &HashMap<String, String>) -> Result<Arc<dyn Task>, VajraError>;
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Explicit task-type registry populated at startup.
///
/// Keys are the task-type names carried in configs and assignments; a
/// worker's advertised capabilities are exactly this registry's keys.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    factories: Arc<Mutex<HashMap<String, Arc<dyn TaskFactory>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in task types.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("noop", Arc::new(NoopTaskFactory));
        registry.register("sleep", Arc::new(SleepTaskFactory));
        registry.register("http_get", Arc::new(HttpGetTaskFactory::new()));
        registry
    }

    pub fn register(&self, task_type: &str, factory: Arc<dyn TaskFactory>) {
        let mut factories = self.factories.lock().unwrap();
        debug!(task_type = task_type, "Registered task factory");
        factories.insert(task_type.to_string(), factory);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskFactory>> {
        self.factories.lock().unwrap().get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.factories.lock().unwrap().contains_key(task_type)
    }

    /// Sorted task-type names; advertised as worker capabilities.
    pub fn task_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

// ── Built-in: noop ────────────────────────────────────────────────────────────

/// Completes immediately; useful for executor overhead measurement.
struct NoopTask;

#[async_trait]
impl Task for NoopTask {
    async fn execute(&self) -> TaskResult {
        TaskResult::ok(next_task_id(), Duration::ZERO)
    }
}

pub struct NoopTaskFactory;

impl TaskFactory for NoopTaskFactory {
    fn create(&self, _params: &HashMap<String, String>) -> Result<Arc<dyn Task>, VajraError> {
        Ok(Arc::new(NoopTask))
    }
}

// ── Built-in: sleep ───────────────────────────────────────────────────────────

/// Sleeps for `durationMs` (± `jitterMs` uniform) and succeeds.
struct SleepTask {
    duration: Duration,
    jitter: Duration,
    fail_rate: f64,
}

#[async_trait]
impl Task for SleepTask {
    async fn execute(&self) -> TaskResult {
        let start = Instant::now();
        let jitter_ms = if self.jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64)
        };
        tokio::time::sleep(self.duration + Duration::from_millis(jitter_ms)).await;

        let id = next_task_id();
        if self.fail_rate > 0.0 && rand::thread_rng().gen_bool(self.fail_rate.min(1.0)) {
            TaskResult::failure(id, start.elapsed(), "injected failure")
        } else {
            TaskResult::ok(id, start.elapsed())
        }
    }
}

pub struct SleepTaskFactory;

fn parse_param<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, VajraError> {
    match params.get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            VajraError::ConfigInvalid(format!("task parameter '{}' has invalid value '{}'", key, raw))
        }),
    }
}

impl TaskFactory for SleepTaskFactory {
    fn create(&self, params: &HashMap<String, String>) -> Result<Arc<dyn Task>, VajraError> {
        let duration_ms: u64 = parse_param(params, "durationMs", 10)?;
        let jitter_ms: u64 = parse_param(params, "jitterMs", 0)?;
        let fail_rate: f64 = parse_param(params, "failRate", 0.0)?;

        if !(0.0..=1.0).contains(&fail_rate) {
            return Err(VajraError::ConfigInvalid(
                "task parameter 'failRate' must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(Arc::new(SleepTask {
            duration: Duration::from_millis(duration_ms),
            jitter: Duration::from_millis(jitter_ms),
            fail_rate,
        }))
    }
}

// ── Built-in: http_get ────────────────────────────────────────────────────────

/// Issues a GET against `url` and treats any 2xx/3xx status as success.
///
/// Credentials never travel in task parameters. When `bearerEnv` names an
/// environment variable, the token is resolved locally at construction and
/// attached as an `Authorization` header.
struct HttpGetTask {
    client: reqwest::Client,
    url: String,
    bearer: Option<String>,
}

#[async_trait]
impl Task for HttpGetTask {
    async fn execute(&self) -> TaskResult {
        let start = Instant::now();
        let id = next_task_id();

        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(mut response) => {
                let status = response.status();

                // Consume the body in chunks; at high RPS unconsumed bodies
                // accumulate and blow the heap.
                let mut size: u64 = 0;
                while let Ok(Some(chunk)) = response.chunk().await {
                    size += chunk.len() as u64;
                }

                let latency = start.elapsed();
                if status.is_success() || status.is_redirection() {
                    let mut result = TaskResult::ok(id, latency);
                    result.response_size = Some(size);
                    result
                        .metadata
                        .insert("status".to_string(), status.as_u16().to_string());
                    result
                } else {
                    TaskResult::failure(id, latency, format!("HTTP {}", status.as_u16()))
                        .with_metadata("status", status.as_u16().to_string())
                }
            }
            Err(e) => {
                let latency = start.elapsed();
                let prefix = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connect"
                } else {
                    "request"
                };
                TaskResult::failure(id, latency, format!("{}: {}", prefix, e))
            }
        }
    }
}

pub struct HttpGetTaskFactory {
    client: reqwest::Client,
}

impl HttpGetTaskFactory {
    pub fn new() -> Self {
        // One shared client: connection pooling across all virtual users.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HttpGetTaskFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskFactory for HttpGetTaskFactory {
    fn create(&self, params: &HashMap<String, String>) -> Result<Arc<dyn Task>, VajraError> {
        let url = params
            .get("url")
            .cloned()
            .ok_or_else(|| VajraError::ConfigInvalid("task parameter 'url' is required".to_string()))?;

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(VajraError::ConfigInvalid(format!(
                "task parameter 'url' must be an http(s) URL, got '{}'",
                url
            )));
        }

        let bearer = match params.get("bearerEnv") {
            None => None,
            Some(var) => match std::env::var(var) {
                Ok(token) => Some(token),
                Err(_) => {
                    return Err(VajraError::ConfigInvalid(format!(
                        "credential environment variable '{}' is not set",
                        var
                    )))
                }
            },
        };

        Ok(Arc::new(HttpGetTask {
            client: self.client.clone(),
            url,
            bearer,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn builtins_are_registered() {
        let registry = TaskRegistry::with_builtins();
        assert!(registry.contains("noop"));
        assert!(registry.contains("sleep"));
        assert!(registry.contains("http_get"));
        assert_eq!(registry.task_types(), vec!["http_get", "noop", "sleep"]);
    }

    #[test]
    fn unknown_type_is_absent() {
        let registry = TaskRegistry::with_builtins();
        assert!(registry.get("kafka_produce").is_none());
    }

    #[test]
    fn sleep_factory_rejects_bad_duration() {
        let factory = SleepTaskFactory;
        let err = factory.create(&params(&[("durationMs", "fast")])).unwrap_err();
        assert!(matches!(err, VajraError::ConfigInvalid(_)));
    }

    #[test]
    fn sleep_factory_rejects_out_of_range_fail_rate() {
        let factory = SleepTaskFactory;
        let err = factory.create(&params(&[("failRate", "1.5")])).unwrap_err();
        assert!(matches!(err, VajraError::ConfigInvalid(_)));
    }

    #[test]
    fn http_factory_requires_url() {
        let factory = HttpGetTaskFactory::new();
        assert!(factory.create(&params(&[])).is_err());
        assert!(factory.create(&params(&[("url", "ftp://x")])).is_err());
        assert!(factory
            .create(&params(&[("url", "http://localhost:1/")]))
            .is_ok());
    }

    #[test]
    fn http_factory_rejects_missing_credential_env() {
        let factory = HttpGetTaskFactory::new();
        let err = factory
            .create(&params(&[
                ("url", "http://localhost:1/"),
                ("bearerEnv", "VAJRA_TEST_DEFINITELY_UNSET_TOKEN"),
            ]))
            .unwrap_err();
        assert!(err.to_string().contains("VAJRA_TEST_DEFINITELY_UNSET_TOKEN"));
    }

    #[tokio::test]
    async fn sleep_task_reports_latency() {
        let factory = SleepTaskFactory;
        let task = factory.create(&params(&[("durationMs", "20")])).unwrap();
        let result = task.execute().await;
        assert!(result.success);
        assert!(result.latency >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn noop_task_succeeds_immediately() {
        let factory = NoopTaskFactory;
        let task = factory.create(&HashMap::new()).unwrap();
        let result = task.execute().await;
        assert!(result.success);
        assert!(result.error_message.is_none());
    }

    #[test]
    fn task_ids_are_unique() {
        let a = next_task_id();
        let b = next_task_id();
        assert_ne!(a, b);
    }
}
