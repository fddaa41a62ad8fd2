//! Cluster-level coordination: the controller plane.
//!
//! Owns the worker registry, plans per-worker assignments, dispatches them
//! over gRPC, aggregates streamed metrics frames and coordinates stops. A
//! worker that goes silent mid-test has its contribution frozen at its last
//! frame and the test continues degraded; the test fails only when no
//! healthy assigned worker remains.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::TestConfig;
use crate::error::VajraError;
use crate::grpc::proto;
use crate::grpc::proto::worker_client::WorkerClient;
use crate::planner::{plan_assignments, PlannedShare};
use crate::registry::WorkerRegistry;
use crate::runner::{TestPhase, DRAIN_TIMEOUT};

/// Process-wide ceiling on concurrently running distributed tests.
pub const MAX_CONCURRENT_TESTS: usize = 10;

// ── Worker client pool ────────────────────────────────────────────────────────

/// Lazily-connected gRPC clients to workers, keyed by address.
///
/// Dialing retries a few times with short backoff; a worker that cannot be
/// reached at dispatch time is simply not part of the test.
#[derive(Clone, Default)]
pub struct WorkerClientPool {
    clients: Arc<tokio::sync::Mutex<HashMap<String, WorkerClient<tonic::transport::Channel>>>>,
}

impl WorkerClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_connect(
        &self,
        address: &str,
    ) -> Result<WorkerClient<tonic::transport::Channel>, VajraError> {
        {
            let clients = self.clients.lock().await;
            if let Some(client) = clients.get(address) {
                return Ok(client.clone());
            }
        }

        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        let endpoint = tonic::transport::Endpoint::from_shared(uri)
            .map_err(|e| VajraError::Transport(format!("invalid worker address: {}", e)))?
            .connect_timeout(Duration::from_secs(2));

        let mut backoff = Duration::from_millis(200);
        let mut last_err = None;
        for _ in 0..3 {
            match endpoint.connect().await {
                Ok(channel) => {
                    let client = WorkerClient::new(channel);
                    self.clients
                        .lock()
                        .await
                        .insert(address.to_string(), client.clone());
                    return Ok(client);
                }
                Err(e) => {
                    warn!(address = address, error = %e, "Failed to dial worker, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }

        Err(VajraError::Transport(format!(
            "worker at {} unreachable: {}",
            address,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Drop a cached client after transport errors so the next dispatch
    /// re-dials.
    pub async fn invalidate(&self, address: &str) {
        self.clients.lock().await.remove(address);
    }
}

// ── Aggregation ───────────────────────────────────────────────────────────────

/// Latest frame from one worker plus its freeze flag.
#[derive(Debug, Clone)]
struct WorkerContribution {
    total: u64,
    successful: u64,
    failed: u64,
    current_tps: f64,
    active_tasks: u64,
    p50_ms: f64,
    p95_ms: f64,
    p99_ms: f64,
    timestamp_ms: i64,
    /// Set when the worker is lost: the contribution stays in the sums but
    /// its TPS no longer counts as live.
    frozen: bool,
}

/// Cluster-wide aggregated view of one test.
///
/// Counters are sums across workers. Tail percentiles are the max across
/// workers — an approximation that loses 1–5 % accuracy at the tail, since
/// the wire frames carry summaries rather than full histograms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedSnapshot {
    pub test_id: String,
    pub status: TestPhase,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub current_tps: f64,
    pub active_tasks: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub workers_reporting: usize,
    pub degraded: bool,
    pub lost_workers: Vec<String>,
    pub timestamp_ms: u64,
}

struct DistributedTest {
    config: TestConfig,
    status: TestPhase,
    assigned: Vec<PlannedShare>,
    contributions: HashMap<String, WorkerContribution>,
    lost: Vec<String>,
    started: Instant,
}

impl DistributedTest {
    fn healthy_assigned(&self) -> usize {
        self.assigned
            .iter()
            .filter(|share| !self.lost.contains(&share.worker_id))
            .count()
    }
}

// ── Plane ─────────────────────────────────────────────────────────────────────

/// The controller's coordination core. Cheap to clone.
#[derive(Clone)]
pub struct ControllerPlane {
    registry: WorkerRegistry,
    clients: WorkerClientPool,
    tests: Arc<Mutex<HashMap<String, DistributedTest>>>,
    max_concurrent_tests: usize,
}

impl ControllerPlane {
    pub fn new(registry: WorkerRegistry) -> Self {
        Self {
            registry,
            clients: WorkerClientPool::new(),
            tests: Arc::new(Mutex::new(HashMap::new())),
            max_concurrent_tests: MAX_CONCURRENT_TESTS,
        }
    }

    pub fn registry(&self) -> WorkerRegistry {
        self.registry.clone()
    }

    fn running_count(&self) -> usize {
        self.tests
            .lock()
            .unwrap()
            .values()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    /// Plan and dispatch one test across the fleet. Returns the share list
    /// actually accepted by workers.
    pub async fn start_test(
        &self,
        test_id: &str,
        config: &TestConfig,
    ) -> Result<Vec<PlannedShare>, VajraError> {
        if self.running_count() >= self.max_concurrent_tests {
            return Err(VajraError::CapacityExceeded(format!(
                "{} tests already running",
                self.max_concurrent_tests
            )));
        }

        let mut required = HashSet::new();
        required.insert(config.task_type.clone());

        let workers = self.registry.healthy_workers();
        let shares = plan_assignments(config, &required, &workers)?;

        let ramp_up_seconds = config.ramp_duration().as_secs();
        let mut accepted = Vec::new();

        for share in shares {
            let assignment = proto::TaskAssignment {
                test_id: test_id.to_string(),
                task_type: config.task_type.clone(),
                parameters: config.task_parameters.clone(),
                target_tps: share.target_tps,
                max_concurrency: share.max_concurrency,
                duration_seconds: config.test_duration_seconds,
                ramp_up_seconds,
            };

            match self.dispatch_assignment(&share, assignment).await {
                Ok(response) if response.accepted => {
                    info!(
                        test_id = test_id,
                        worker_id = %share.worker_id,
                        concurrency = share.max_concurrency,
                        tps = share.target_tps,
                        estimated_tasks = response.estimated_task_count,
                        "Worker accepted assignment"
                    );
                    accepted.push(share);
                }
                Ok(response) => {
                    warn!(
                        test_id = test_id,
                        worker_id = %share.worker_id,
                        reason = %response.message,
                        "Worker rejected assignment"
                    );
                }
                Err(e) => {
                    warn!(
                        test_id = test_id,
                        worker_id = %share.worker_id,
                        error = %e,
                        "Failed to dispatch assignment"
                    );
                    self.clients.invalidate(&share.address).await;
                }
            }
        }

        if accepted.is_empty() {
            return Err(VajraError::CapacityExceeded(
                "no worker accepted the assignment".to_string(),
            ));
        }

        let mut tests = self.tests.lock().unwrap();
        tests.insert(
            test_id.to_string(),
            DistributedTest {
                config: config.clone(),
                status: TestPhase::Running,
                assigned: accepted.clone(),
                contributions: HashMap::new(),
                lost: Vec::new(),
                started: Instant::now(),
            },
        );

        Ok(accepted)
    }

    async fn dispatch_assignment(
        &self,
        share: &PlannedShare,
        assignment: proto::TaskAssignment,
    ) -> Result<proto::TaskAssignmentResponse, VajraError> {
        let mut client = self.clients.get_or_connect(&share.address).await?;
        let response = client
            .assign_task(tonic::Request::new(assignment))
            .await?;
        Ok(response.into_inner())
    }

    /// Broadcast a stop to every assigned worker and collate the acks.
    /// The test is marked terminal once all reachable workers answered.
    pub async fn stop_test(&self, test_id: &str, graceful: bool) -> Result<u64, VajraError> {
        let shares = {
            let tests = self.tests.lock().unwrap();
            let test = tests
                .get(test_id)
                .ok_or_else(|| VajraError::NotFound(format!("test '{}'", test_id)))?;
            test.assigned.clone()
        };

        let mut interrupted_total = 0u64;
        for share in &shares {
            match self.clients.get_or_connect(&share.address).await {
                Ok(mut client) => {
                    let request = proto::StopTestRequest {
                        test_id: test_id.to_string(),
                        graceful,
                    };
                    match client.stop_test(tonic::Request::new(request)).await {
                        Ok(response) => {
                            let inner = response.into_inner();
                            interrupted_total += inner.tasks_interrupted;
                        }
                        Err(status) => {
                            warn!(
                                test_id = test_id,
                                worker_id = %share.worker_id,
                                error = %status,
                                "Worker failed to acknowledge stop"
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        test_id = test_id,
                        worker_id = %share.worker_id,
                        error = %e,
                        "Worker unreachable during stop"
                    );
                }
            }
        }

        let mut tests = self.tests.lock().unwrap();
        if let Some(test) = tests.get_mut(test_id) {
            test.status = TestPhase::Stopped;
        }
        info!(
            test_id = test_id,
            interrupted = interrupted_total,
            "Stop broadcast complete"
        );
        Ok(interrupted_total)
    }

    /// Ingest one metrics frame from a worker stream. Frames are monotonic,
    /// so replays after a stream reconnect are benign.
    pub fn ingest_frame(&self, frame: &proto::WorkerMetrics) {
        crate::prom::METRICS_FRAMES_TOTAL.inc();
        let mut tests = self.tests.lock().unwrap();
        let Some(test) = tests.get_mut(&frame.test_id) else {
            return;
        };
        if test.lost.contains(&frame.worker_id) {
            // Contribution is frozen; late frames from a lost worker are
            // dropped to keep the freeze stable.
            return;
        }

        let latency = frame.latency.as_ref();
        test.contributions.insert(
            frame.worker_id.clone(),
            WorkerContribution {
                total: frame.total_requests,
                successful: frame.successful_requests,
                failed: frame.failed_requests,
                current_tps: frame.current_tps,
                active_tasks: frame.active_tasks,
                p50_ms: latency.map(|l| l.p50_ms).unwrap_or(0.0),
                p95_ms: latency.map(|l| l.p95_ms).unwrap_or(0.0),
                p99_ms: latency.map(|l| l.p99_ms).unwrap_or(0.0),
                timestamp_ms: frame.timestamp_ms,
                frozen: false,
            },
        );
    }

    /// React to lost workers: freeze their contributions in every running
    /// test; fail tests with no healthy worker left.
    pub fn handle_lost_workers(&self, worker_ids: &[String]) {
        if worker_ids.is_empty() {
            return;
        }
        let mut tests = self.tests.lock().unwrap();
        for (test_id, test) in tests.iter_mut() {
            if test.status.is_terminal() {
                continue;
            }
            for worker_id in worker_ids {
                if test.assigned.iter().any(|s| &s.worker_id == worker_id)
                    && !test.lost.contains(worker_id)
                {
                    warn!(
                        test_id = %test_id,
                        worker_id = %worker_id,
                        "Worker lost mid-test, freezing its contribution"
                    );
                    test.lost.push(worker_id.clone());
                    if let Some(contribution) = test.contributions.get_mut(worker_id) {
                        contribution.frozen = true;
                    }
                }
            }
            if test.healthy_assigned() == 0 {
                error!(test_id = %test_id, "All assigned workers lost, failing test");
                test.status = TestPhase::Failed;
            }
        }
    }

    /// Sweep running tests: mark those past their duration (plus drain
    /// margin) as completed.
    pub fn sweep_completed(&self) {
        let mut tests = self.tests.lock().unwrap();
        for (test_id, test) in tests.iter_mut() {
            if test.status.is_terminal() {
                continue;
            }
            let bound = test.config.test_duration() + DRAIN_TIMEOUT + Duration::from_secs(1);
            if test.started.elapsed() >= bound {
                info!(test_id = %test_id, "Distributed test past its outer bound, completing");
                test.status = TestPhase::Completed;
            }
        }
    }

    /// Cluster-wide snapshot for one test.
    pub fn aggregate(&self, test_id: &str) -> Option<AggregatedSnapshot> {
        let tests = self.tests.lock().unwrap();
        let test = tests.get(test_id)?;

        let mut snapshot = AggregatedSnapshot {
            test_id: test_id.to_string(),
            status: test.status,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            current_tps: 0.0,
            active_tasks: 0,
            p50_ms: 0.0,
            p95_ms: 0.0,
            p99_ms: 0.0,
            workers_reporting: test.contributions.len(),
            degraded: !test.lost.is_empty(),
            lost_workers: test.lost.clone(),
            timestamp_ms: epoch_millis(),
        };

        for contribution in test.contributions.values() {
            snapshot.total_requests += contribution.total;
            snapshot.successful_requests += contribution.successful;
            snapshot.failed_requests += contribution.failed;
            snapshot.active_tasks += contribution.active_tasks;
            if !contribution.frozen {
                snapshot.current_tps += contribution.current_tps;
            }
            // Max-of-workers percentile merge.
            snapshot.p50_ms = snapshot.p50_ms.max(contribution.p50_ms);
            snapshot.p95_ms = snapshot.p95_ms.max(contribution.p95_ms);
            snapshot.p99_ms = snapshot.p99_ms.max(contribution.p99_ms);
        }

        Some(snapshot)
    }

    pub fn test_status(&self, test_id: &str) -> Option<TestPhase> {
        self.tests.lock().unwrap().get(test_id).map(|t| t.status)
    }

    pub fn list_tests(&self) -> HashMap<String, TestPhase> {
        self.tests
            .lock()
            .unwrap()
            .iter()
            .map(|(id, test)| (id.clone(), test.status))
            .collect()
    }

    /// Drop terminal records older than `retention`.
    pub fn evict_terminal(&self, retention: Duration) {
        let mut tests = self.tests.lock().unwrap();
        tests.retain(|test_id, test| {
            let keep = !test.status.is_terminal()
                || test.started.elapsed()
                    < retention + test.config.test_duration() + DRAIN_TIMEOUT;
            if !keep {
                info!(test_id = %test_id, "Evicting terminal distributed test record");
            }
            keep
        });
    }

    /// Background loop: health sweep, lost-worker propagation, completion
    /// sweep and record eviction.
    pub fn start_monitor(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let plane = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let (unhealthy, evicted) = plane.registry.check_health();
                        plane.handle_lost_workers(&unhealthy);
                        plane.handle_lost_workers(&evicted);
                        plane.sweep_completed();
                        plane.evict_terminal(Duration::from_secs(300));
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RampStrategy, TestMode};
    use std::collections::HashSet;

    fn frame(worker_id: &str, test_id: &str, total: u64, tps: f64) -> proto::WorkerMetrics {
        proto::WorkerMetrics {
            worker_id: worker_id.to_string(),
            test_id: test_id.to_string(),
            timestamp_ms: 0,
            total_requests: total,
            successful_requests: total,
            failed_requests: 0,
            current_tps: tps,
            active_tasks: 5,
            latency: Some(proto::LatencySummary {
                p50_ms: 10.0,
                p95_ms: 20.0,
                p99_ms: 30.0,
            }),
        }
    }

    fn plane_with_test(test_id: &str, workers: &[&str]) -> ControllerPlane {
        let plane = ControllerPlane::new(WorkerRegistry::new());
        let assigned = workers
            .iter()
            .map(|w| PlannedShare {
                worker_id: w.to_string(),
                address: format!("{}:7001", w),
                max_concurrency: 100,
                target_tps: 100.0,
            })
            .collect();

        plane.tests.lock().unwrap().insert(
            test_id.to_string(),
            DistributedTest {
                config: TestConfig {
                    mode: TestMode::RateLimited,
                    starting_concurrency: 1,
                    max_concurrency: 300,
                    ramp_strategy: RampStrategy::Linear {
                        duration_seconds: 0,
                    },
                    max_tps_limit: Some(300.0),
                    test_duration_seconds: 60,
                    sustain_duration_seconds: 0,
                    warmup_seconds: 0,
                    task_type: "sleep".to_string(),
                    task_parameters: Default::default(),
                },
                status: TestPhase::Running,
                assigned,
                contributions: HashMap::new(),
                lost: Vec::new(),
                started: Instant::now(),
            },
        );
        plane
    }

    #[test]
    fn aggregate_sums_counters_and_tps() {
        let plane = plane_with_test("t1", &["w1", "w2", "w3"]);
        plane.ingest_frame(&frame("w1", "t1", 100, 100.0));
        plane.ingest_frame(&frame("w2", "t1", 200, 100.0));
        plane.ingest_frame(&frame("w3", "t1", 300, 100.0));

        let snap = plane.aggregate("t1").unwrap();
        assert_eq!(snap.total_requests, 600);
        assert!((snap.current_tps - 300.0).abs() < 1e-9);
        assert_eq!(snap.workers_reporting, 3);
        assert!(!snap.degraded);
        assert_eq!(snap.active_tasks, 15);
    }

    #[test]
    fn percentiles_merge_as_max() {
        let plane = plane_with_test("t1", &["w1", "w2"]);
        let mut slow = frame("w1", "t1", 10, 10.0);
        slow.latency = Some(proto::LatencySummary {
            p50_ms: 15.0,
            p95_ms: 80.0,
            p99_ms: 200.0,
        });
        plane.ingest_frame(&slow);
        plane.ingest_frame(&frame("w2", "t1", 10, 10.0));

        let snap = plane.aggregate("t1").unwrap();
        assert!((snap.p95_ms - 80.0).abs() < 1e-9);
        assert!((snap.p99_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn lost_worker_freezes_contribution_and_degrades() {
        let plane = plane_with_test("t1", &["w1", "w2", "w3"]);
        plane.ingest_frame(&frame("w1", "t1", 100, 100.0));
        plane.ingest_frame(&frame("w2", "t1", 100, 100.0));
        plane.ingest_frame(&frame("w3", "t1", 100, 100.0));

        plane.handle_lost_workers(&["w2".to_string()]);

        let snap = plane.aggregate("t1").unwrap();
        assert!(snap.degraded);
        assert_eq!(snap.lost_workers, vec!["w2"]);
        // Counters keep the frozen contribution, live TPS drops to ~200.
        assert_eq!(snap.total_requests, 300);
        assert!((snap.current_tps - 200.0).abs() < 1e-9);
        assert_eq!(snap.status, TestPhase::Running);

        // Late frames from the lost worker are dropped.
        plane.ingest_frame(&frame("w2", "t1", 999, 500.0));
        let snap = plane.aggregate("t1").unwrap();
        assert_eq!(snap.total_requests, 300);
    }

    #[test]
    fn losing_every_worker_fails_the_test() {
        let plane = plane_with_test("t1", &["w1", "w2"]);
        plane.handle_lost_workers(&["w1".to_string()]);
        assert_eq!(plane.test_status("t1"), Some(TestPhase::Running));

        plane.handle_lost_workers(&["w2".to_string()]);
        assert_eq!(plane.test_status("t1"), Some(TestPhase::Failed));
    }

    #[test]
    fn lost_workers_do_not_touch_unrelated_tests() {
        let plane = plane_with_test("t1", &["w1"]);
        plane.handle_lost_workers(&["stranger".to_string()]);
        assert_eq!(plane.test_status("t1"), Some(TestPhase::Running));
        assert!(!plane.aggregate("t1").unwrap().degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_completes_tests_past_their_bound() {
        let plane = plane_with_test("t1", &["w1"]);
        plane.sweep_completed();
        assert_eq!(plane.test_status("t1"), Some(TestPhase::Running));

        // 60 s duration + 30 s drain + 1 s margin.
        tokio::time::advance(Duration::from_secs(92)).await;
        plane.sweep_completed();
        assert_eq!(plane.test_status("t1"), Some(TestPhase::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_records_evicted_after_retention() {
        let plane = plane_with_test("t1", &["w1"]);
        plane.tests.lock().unwrap().get_mut("t1").unwrap().status = TestPhase::Completed;

        plane.evict_terminal(Duration::from_secs(300));
        assert!(plane.test_status("t1").is_some());

        tokio::time::advance(Duration::from_secs(400)).await;
        plane.evict_terminal(Duration::from_secs(300));
        assert!(plane.test_status("t1").is_none());
    }

    #[tokio::test]
    async fn start_test_requires_capable_workers() {
        let plane = ControllerPlane::new(WorkerRegistry::new());
        let config = TestConfig {
            mode: TestMode::ConcurrencyBased,
            starting_concurrency: 1,
            max_concurrency: 10,
            ramp_strategy: RampStrategy::Linear {
                duration_seconds: 0,
            },
            max_tps_limit: None,
            test_duration_seconds: 10,
            sustain_duration_seconds: 0,
            warmup_seconds: 0,
            task_type: "sleep".to_string(),
            task_parameters: Default::default(),
        };

        let err = plane.start_test("t1", &config).await.unwrap_err();
        assert!(matches!(err, VajraError::CapacityExceeded(_)));
    }

    #[test]
    fn registry_capability_filter_reaches_planner() {
        let registry = WorkerRegistry::new();
        let mut caps = HashSet::new();
        caps.insert("http_get".to_string());
        registry
            .register("w1", "host", "10.0.0.1:7001", caps, 100)
            .unwrap();

        let plane = ControllerPlane::new(registry);
        assert_eq!(plane.registry().healthy_count(), 1);
    }
}
