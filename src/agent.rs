//! Worker agent: dumb and correct.
//!
//! On startup the agent dials the controller with exponential backoff,
//! registers its capabilities (the local task registry's type names) and
//! capacity, then heartbeats at the interval the controller recommended.
//! Its own gRPC service accepts assignments — each one becomes a local
//! [`TestRunner`] with a fresh metrics engine — and stop requests.
//!
//! Metrics frames stream to the controller on the reporting tick. Frames
//! are monotonic snapshots, so when the stream breaks the agent simply
//! reopens it and resends the latest state; duplicates are benign.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{RampStrategy, TestConfig, TestMode};
use crate::error::VajraError;
use crate::grpc::proto;
use crate::grpc::proto::controller_client::ControllerClient;
use crate::grpc::proto::worker_server::{Worker, WorkerServer};
use crate::metrics::MetricsEngine;
use crate::runner::{TestOutcome, TestRunner, DRAIN_TIMEOUT};
use crate::stream::SnapshotHub;
use crate::task::TaskRegistry;

/// One assignment currently running on this worker.
struct LocalTest {
    engine: MetricsEngine,
    cancel: CancellationToken,
    max_concurrency: u32,
    outcome: Arc<Mutex<Option<TestOutcome>>>,
    done: Arc<tokio::sync::Notify>,
}

/// Settings the agent needs to join a fleet.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub worker_id: String,
    pub hostname: String,
    pub controller_addr: String,
    /// Address this agent's own gRPC service binds to.
    pub bind_addr: String,
    /// Externally reachable address advertised to the controller.
    pub advertise_addr: String,
    pub max_capacity: u32,
}

/// The worker process's brain. Cheap to clone.
#[derive(Clone)]
pub struct WorkerAgent {
    config: AgentConfig,
    registry: TaskRegistry,
    hub: SnapshotHub,
    running: Arc<Mutex<HashMap<String, Arc<LocalTest>>>>,
}

impl WorkerAgent {
    pub fn new(config: AgentConfig, registry: TaskRegistry, hub: SnapshotHub) -> Self {
        Self {
            config,
            registry,
            hub,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Concurrency reserved by running assignments; reported as load.
    pub fn current_load(&self) -> u32 {
        self.running
            .lock()
            .unwrap()
            .values()
            .map(|t| t.max_concurrency)
            .sum()
    }

    pub fn running_tests(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Translate a wire assignment into a local test config.
    fn config_from_assignment(assignment: &proto::TaskAssignment) -> TestConfig {
        let rate_limited = assignment.target_tps > 0.0;
        let max_concurrency = assignment.max_concurrency.max(1);
        TestConfig {
            mode: if rate_limited {
                TestMode::RateLimited
            } else {
                TestMode::ConcurrencyBased
            },
            // With a ramp the pool climbs from one user; without one it
            // starts at the ceiling.
            starting_concurrency: if assignment.ramp_up_seconds > 0 {
                1
            } else {
                max_concurrency
            },
            max_concurrency,
            ramp_strategy: RampStrategy::Linear {
                duration_seconds: assignment.ramp_up_seconds,
            },
            max_tps_limit: rate_limited.then_some(assignment.target_tps),
            test_duration_seconds: assignment.duration_seconds.max(1),
            sustain_duration_seconds: 0,
            warmup_seconds: 0,
            task_type: assignment.task_type.clone(),
            task_parameters: assignment.parameters.clone(),
        }
    }

    /// Accept an assignment and start a local runner for it.
    pub fn accept_assignment(
        &self,
        assignment: &proto::TaskAssignment,
    ) -> Result<u64, VajraError> {
        if assignment.test_id.trim().is_empty() {
            return Err(VajraError::ConfigInvalid("test_id must not be empty".to_string()));
        }
        {
            let running = self.running.lock().unwrap();
            if running.contains_key(&assignment.test_id) {
                return Err(VajraError::RegistrationRejected(format!(
                    "test '{}' is already running on this worker",
                    assignment.test_id
                )));
            }
        }
        if !self.registry.contains(&assignment.task_type) {
            return Err(VajraError::ConfigInvalid(format!(
                "task type '{}' is not supported by this worker",
                assignment.task_type
            )));
        }
        let reserved = self.current_load();
        if reserved + assignment.max_concurrency > self.config.max_capacity {
            return Err(VajraError::CapacityExceeded(format!(
                "capacity {} cannot hold {} more concurrency (reserved {})",
                self.config.max_capacity, assignment.max_concurrency, reserved
            )));
        }

        let config = Self::config_from_assignment(assignment);
        let factory = self
            .registry
            .get(&config.task_type)
            .ok_or_else(|| VajraError::TestFatal("factory disappeared".to_string()))?;

        let cancel = CancellationToken::new();
        let runner = TestRunner::new(
            assignment.test_id.clone(),
            config.clone(),
            factory,
            self.hub.clone(),
            cancel.clone(),
        );

        let local = Arc::new(LocalTest {
            engine: runner.engine(),
            cancel,
            max_concurrency: config.max_concurrency,
            outcome: Arc::new(Mutex::new(None)),
            done: Arc::new(tokio::sync::Notify::new()),
        });

        let estimated = if assignment.target_tps > 0.0 {
            (assignment.target_tps * assignment.duration_seconds as f64) as u64
        } else {
            config.max_concurrency as u64 * assignment.duration_seconds
        };

        self.running
            .lock()
            .unwrap()
            .insert(assignment.test_id.clone(), local.clone());

        let running = self.running.clone();
        let test_id = assignment.test_id.clone();
        tokio::spawn(async move {
            let outcome = runner.run().await;
            info!(
                test_id = %test_id,
                phase = outcome.phase.as_str(),
                total = outcome.final_snapshot.total,
                "Local test finished"
            );
            *local.outcome.lock().unwrap() = Some(outcome);
            local.done.notify_waiters();
            running.lock().unwrap().remove(&test_id);
        });

        Ok(estimated)
    }

    /// Stop a local test, waiting out the drain when graceful.
    pub async fn stop_local_test(&self, test_id: &str, graceful: bool) -> Option<u64> {
        let local = self.running.lock().unwrap().get(test_id).cloned()?;

        info!(test_id = test_id, graceful = graceful, "Stopping local test");
        local.cancel.cancel();

        let wait = if graceful {
            DRAIN_TIMEOUT + Duration::from_secs(5)
        } else {
            Duration::from_secs(2)
        };

        let done = local.done.clone();
        let _ = tokio::time::timeout(wait, done.notified()).await;

        let interrupted = local
            .outcome
            .lock()
            .unwrap()
            .as_ref()
            .map(|o| o.tasks_interrupted)
            .unwrap_or(0);
        Some(interrupted)
    }

    fn build_frames(&self) -> Vec<proto::WorkerMetrics> {
        let running = self.running.lock().unwrap();
        running
            .iter()
            .map(|(test_id, local)| {
                let snap = local.engine.snapshot();
                proto::WorkerMetrics {
                    worker_id: self.config.worker_id.clone(),
                    test_id: test_id.clone(),
                    timestamp_ms: epoch_millis() as i64,
                    total_requests: snap.total,
                    successful_requests: snap.successful,
                    failed_requests: snap.failed,
                    current_tps: snap.current_tps,
                    active_tasks: snap.active_tasks,
                    latency: Some(proto::LatencySummary {
                        p50_ms: snap.percentiles.p50,
                        p95_ms: snap.percentiles.p95,
                        p99_ms: snap.percentiles.p99,
                    }),
                }
            })
            .collect()
    }

    // ── Fleet membership ──────────────────────────────────────────────────

    /// Run the agent: serve the worker gRPC, join the fleet, heartbeat and
    /// stream metrics until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), VajraError> {
        let bind_addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| VajraError::TestFatal(format!("invalid bind address: {}", e)))?;

        let service = WorkerAgentService::new(self.clone());
        let server_cancel = cancel.clone();
        tokio::spawn(async move {
            info!(addr = %bind_addr, "Worker gRPC server starting");
            let result = Server::builder()
                .add_service(WorkerServer::new(service))
                .serve_with_shutdown(bind_addr, server_cancel.cancelled())
                .await;
            if let Err(e) = result {
                error!(error = %e, "Worker gRPC server error");
            }
        });

        let mut client = connect_with_backoff(&self.config.controller_addr, &cancel).await?;

        let response = client
            .register_worker(Request::new(proto::RegisterWorkerRequest {
                worker_id: self.config.worker_id.clone(),
                hostname: self.config.hostname.clone(),
                max_capacity: self.config.max_capacity,
                supported_task_types: self.registry.task_types(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                metadata: Some(proto::WorkerMetadata {
                    host: self.config.hostname.clone(),
                    port: bind_addr.port() as u32,
                    address: self.config.advertise_addr.clone(),
                }),
            }))
            .await?
            .into_inner();

        if !response.accepted {
            return Err(VajraError::RegistrationRejected(response.message));
        }

        let heartbeat_interval =
            Duration::from_secs(response.heartbeat_interval_seconds.max(1) as u64);
        let metrics_interval =
            Duration::from_secs(response.metrics_interval_seconds.max(1) as u64);

        info!(
            worker_id = %self.config.worker_id,
            controller = %self.config.controller_addr,
            heartbeat_secs = heartbeat_interval.as_secs(),
            "Registered with controller"
        );

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.clone(),
            client.clone(),
            heartbeat_interval,
            cancel.clone(),
        ));
        let metrics = tokio::spawn(metrics_loop(
            self.clone(),
            client,
            metrics_interval,
            cancel.clone(),
        ));

        cancel.cancelled().await;
        heartbeat.abort();
        metrics.abort();
        Ok(())
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Dial the controller until it answers, with exponential backoff capped
/// at 30 s.
async fn connect_with_backoff(
    controller_addr: &str,
    cancel: &CancellationToken,
) -> Result<ControllerClient<Channel>, VajraError> {
    let uri = if controller_addr.starts_with("http://") || controller_addr.starts_with("https://") {
        controller_addr.to_string()
    } else {
        format!("http://{}", controller_addr)
    };

    let endpoint = Endpoint::from_shared(uri)
        .map_err(|e| VajraError::Transport(format!("invalid controller address: {}", e)))?;

    let mut backoff = Duration::from_millis(200);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    loop {
        if cancel.is_cancelled() {
            return Err(VajraError::Cancelled);
        }
        match endpoint.connect().await {
            Ok(channel) => {
                info!(controller = %controller_addr, "Connected to controller");
                return Ok(ControllerClient::new(channel));
            }
            Err(e) => {
                warn!(
                    controller = %controller_addr,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "Failed to connect to controller, retrying"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.cancelled() => return Err(VajraError::Cancelled),
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn heartbeat_loop(
    agent: WorkerAgent,
    mut client: ControllerClient<Channel>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let request = proto::HeartbeatRequest {
            worker_id: agent.config.worker_id.clone(),
            current_load: agent.current_load(),
            timestamp_ms: epoch_millis() as i64,
            status: if agent.current_load() > 0 {
                "RUNNING".to_string()
            } else {
                "REGISTERED".to_string()
            },
        };

        match client.heartbeat(Request::new(request)).await {
            Ok(response) => {
                let inner = response.into_inner();
                if !inner.healthy {
                    // The controller no longer knows us (restart or
                    // eviction); registration must be re-established.
                    warn!(message = %inner.message, "Controller rejected heartbeat");
                }
            }
            Err(status) => {
                warn!(error = %status, "Heartbeat failed");
            }
        }
    }
}

/// Push metrics frames forever, reopening the stream when it breaks. The
/// first frames after a reopen carry the latest snapshots, which is all
/// the monotonic aggregation needs.
async fn metrics_loop(
    agent: WorkerAgent,
    mut client: ControllerClient<Channel>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<proto::WorkerMetrics>(16);

        let feeder = {
            let agent = agent.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {}
                        _ = cancel.cancelled() => break,
                    }
                    for frame in agent.build_frames() {
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
            })
        };

        match client
            .stream_metrics(Request::new(ReceiverStream::new(rx)))
            .await
        {
            Ok(response) => {
                let mut acks = response.into_inner();
                loop {
                    tokio::select! {
                        ack = acks.next() => match ack {
                            Some(Ok(_)) => {}
                            Some(Err(status)) => {
                                warn!(error = %status, "Metrics ack stream error, reopening");
                                break;
                            }
                            None => {
                                warn!("Metrics stream closed by controller, reopening");
                                break;
                            }
                        },
                        _ = cancel.cancelled() => break,
                    }
                }
            }
            Err(status) => {
                warn!(error = %status, "Failed to open metrics stream");
            }
        }

        feeder.abort();

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = cancel.cancelled() => break,
        }
    }
}

// ── Worker gRPC service ───────────────────────────────────────────────────────

/// Server-side implementation of the `Worker` service.
#[derive(Clone)]
pub struct WorkerAgentService {
    agent: WorkerAgent,
}

impl WorkerAgentService {
    pub fn new(agent: WorkerAgent) -> Self {
        Self { agent }
    }
}

#[tonic::async_trait]
impl Worker for WorkerAgentService {
    async fn assign_task(
        &self,
        request: Request<proto::TaskAssignment>,
    ) -> Result<Response<proto::TaskAssignmentResponse>, Status> {
        let assignment = request.into_inner();

        match self.agent.accept_assignment(&assignment) {
            Ok(estimated) => Ok(Response::new(proto::TaskAssignmentResponse {
                accepted: true,
                message: format!("test '{}' started", assignment.test_id),
                estimated_task_count: estimated,
            })),
            Err(e) => Ok(Response::new(proto::TaskAssignmentResponse {
                accepted: false,
                message: e.to_string(),
                estimated_task_count: 0,
            })),
        }
    }

    async fn stop_test(
        &self,
        request: Request<proto::StopTestRequest>,
    ) -> Result<Response<proto::StopTestResponse>, Status> {
        let req = request.into_inner();

        match self.agent.stop_local_test(&req.test_id, req.graceful).await {
            Some(interrupted) => Ok(Response::new(proto::StopTestResponse {
                stopped: true,
                message: format!("test '{}' stopped", req.test_id),
                tasks_interrupted: interrupted,
            })),
            None => Ok(Response::new(proto::StopTestResponse {
                stopped: false,
                message: format!("test '{}' is not running on this worker", req.test_id),
                tasks_interrupted: 0,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(capacity: u32) -> WorkerAgent {
        WorkerAgent::new(
            AgentConfig {
                worker_id: "w-test".to_string(),
                hostname: "localhost".to_string(),
                controller_addr: "127.0.0.1:7000".to_string(),
                bind_addr: "127.0.0.1:0".to_string(),
                advertise_addr: "127.0.0.1:7001".to_string(),
                max_capacity: capacity,
            },
            TaskRegistry::with_builtins(),
            SnapshotHub::new(),
        )
    }

    fn assignment(test_id: &str, concurrency: u32) -> proto::TaskAssignment {
        let mut parameters = HashMap::new();
        parameters.insert("durationMs".to_string(), "10".to_string());
        proto::TaskAssignment {
            test_id: test_id.to_string(),
            task_type: "sleep".to_string(),
            parameters,
            target_tps: 0.0,
            max_concurrency: concurrency,
            duration_seconds: 1,
            ramp_up_seconds: 0,
        }
    }

    #[tokio::test]
    async fn assignment_starts_local_test() {
        let agent = agent(100);
        let estimated = agent.accept_assignment(&assignment("t1", 10)).unwrap();
        assert!(estimated > 0);
        assert_eq!(agent.running_tests(), vec!["t1"]);
        assert_eq!(agent.current_load(), 10);

        // Let the 1 s test finish and unregister itself.
        tokio::time::sleep(Duration::from_millis(1_800)).await;
        assert!(agent.running_tests().is_empty());
        assert_eq!(agent.current_load(), 0);
    }

    #[tokio::test]
    async fn duplicate_test_id_rejected() {
        let agent = agent(100);
        agent.accept_assignment(&assignment("t1", 10)).unwrap();
        let err = agent.accept_assignment(&assignment("t1", 10)).unwrap_err();
        assert!(err.to_string().contains("already running"));
        agent.stop_local_test("t1", false).await;
    }

    #[tokio::test]
    async fn unsupported_task_type_rejected() {
        let agent = agent(100);
        let mut bad = assignment("t1", 10);
        bad.task_type = "quantum_flux".to_string();
        let err = agent.accept_assignment(&bad).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[tokio::test]
    async fn saturated_capacity_rejected() {
        let agent = agent(15);
        agent.accept_assignment(&assignment("t1", 10)).unwrap();
        let err = agent.accept_assignment(&assignment("t2", 10)).unwrap_err();
        assert!(matches!(err, VajraError::CapacityExceeded(_)));
        agent.stop_local_test("t1", false).await;
    }

    #[tokio::test]
    async fn stop_unknown_test_is_none() {
        let agent = agent(100);
        assert!(agent.stop_local_test("ghost", true).await.is_none());
    }

    #[tokio::test]
    async fn grpc_service_maps_rejection_in_band() {
        let agent = agent(5);
        let service = WorkerAgentService::new(agent);

        let resp = service
            .assign_task(Request::new(assignment("t1", 50)))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.accepted);
        assert!(resp.message.contains("capacity"));
    }

    #[tokio::test]
    async fn grpc_stop_reports_unknown_tests() {
        let agent = agent(100);
        let service = WorkerAgentService::new(agent);

        let resp = service
            .stop_test(Request::new(proto::StopTestRequest {
                test_id: "ghost".to_string(),
                graceful: true,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.stopped);
    }

    #[test]
    fn assignment_without_tps_is_concurrency_based() {
        let config = WorkerAgent::config_from_assignment(&assignment("t1", 20));
        assert_eq!(config.mode, TestMode::ConcurrencyBased);
        assert_eq!(config.max_concurrency, 20);
        assert_eq!(config.starting_concurrency, 20);
        assert!(config.max_tps_limit.is_none());
    }

    #[test]
    fn assignment_with_tps_is_rate_limited() {
        let mut wire = assignment("t1", 20);
        wire.target_tps = 150.0;
        wire.ramp_up_seconds = 10;

        let config = WorkerAgent::config_from_assignment(&wire);
        assert_eq!(config.mode, TestMode::RateLimited);
        assert_eq!(config.starting_concurrency, 1);
        assert_eq!(config.max_tps_limit, Some(150.0));
        assert_eq!(
            config.ramp_strategy,
            RampStrategy::Linear {
                duration_seconds: 10
            }
        );
    }
}
