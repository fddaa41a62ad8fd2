//! Process entry point: role dispatch and server wiring.
//!
//! One binary, three roles selected by `VAJRA_ROLE`:
//!
//! - `standalone` (default): REST API + local runner, no fleet.
//! - `controller`: REST API + worker registry + assignment plane + the
//!   controller gRPC service.
//! - `worker`: agent that dials `VAJRA_CONTROLLER_ADDR`, registers, and
//!   serves the worker gRPC.
//!
//! All roles expose Prometheus metrics on `VAJRA_METRICS_ADDR`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vajra_edge::agent::{AgentConfig, WorkerAgent};
use vajra_edge::api::{start_api_server, ApiState};
use vajra_edge::config::{Role, RuntimeConfig};
use vajra_edge::controller::ControllerPlane;
use vajra_edge::grpc::start_controller_server;
use vajra_edge::manager::{SuiteManager, TestManager};
use vajra_edge::prom;
use vajra_edge::registry::WorkerRegistry;
use vajra_edge::stream::SnapshotHub;
use vajra_edge::task::TaskRegistry;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let runtime = RuntimeConfig::from_env();
    info!(role = runtime.role.as_str(), "VajraEdge starting");

    if let Err(e) = prom::register_metrics() {
        eprintln!("failed to register metrics: {}", e);
        std::process::exit(1);
    }

    let registry_handle = Arc::new(Mutex::new(prometheus::default_registry().clone()));
    tokio::spawn(prom::start_metrics_server(
        runtime.metrics_addr.clone(),
        registry_handle,
    ));

    let tasks = TaskRegistry::with_builtins();
    let hub = SnapshotHub::new();
    let shutdown = CancellationToken::new();

    let exit_code = match runtime.role {
        Role::Standalone => run_standalone(runtime, tasks, hub, shutdown).await,
        Role::Controller => run_controller(runtime, tasks, hub, shutdown).await,
        Role::Worker => run_worker(runtime, tasks, hub, shutdown).await,
    };

    std::process::exit(exit_code);
}

async fn run_standalone(
    runtime: RuntimeConfig,
    tasks: TaskRegistry,
    hub: SnapshotHub,
    shutdown: CancellationToken,
) -> i32 {
    let manager = TestManager::new(
        tasks.clone(),
        hub.clone(),
        Duration::from_secs(runtime.test_retention_seconds),
    );
    manager.start_eviction_loop(shutdown.clone());

    let state = ApiState {
        manager,
        suites: SuiteManager::new(tasks, hub),
        plane: None,
    };

    tokio::spawn(start_api_server(state, runtime.api_addr.clone()));
    info!(api = %runtime.api_addr, "Standalone node ready");

    wait_for_shutdown(shutdown).await;
    0
}

async fn run_controller(
    runtime: RuntimeConfig,
    tasks: TaskRegistry,
    hub: SnapshotHub,
    shutdown: CancellationToken,
) -> i32 {
    let workers = WorkerRegistry::new();
    let plane = ControllerPlane::new(workers);
    plane.start_monitor(shutdown.clone());

    let manager = TestManager::new(
        tasks.clone(),
        hub.clone(),
        Duration::from_secs(runtime.test_retention_seconds),
    );
    manager.start_eviction_loop(shutdown.clone());

    let state = ApiState {
        manager,
        suites: SuiteManager::new(tasks, hub),
        plane: Some(plane.clone()),
    };

    tokio::spawn(start_api_server(state, runtime.api_addr.clone()));
    tokio::spawn(start_controller_server(plane, runtime.grpc_addr.clone()));
    info!(
        api = %runtime.api_addr,
        grpc = %runtime.grpc_addr,
        "Controller ready"
    );

    wait_for_shutdown(shutdown).await;
    0
}

async fn run_worker(
    runtime: RuntimeConfig,
    tasks: TaskRegistry,
    hub: SnapshotHub,
    shutdown: CancellationToken,
) -> i32 {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

    let agent = WorkerAgent::new(
        AgentConfig {
            worker_id: runtime.worker_id.clone(),
            hostname,
            controller_addr: runtime.controller_addr.clone(),
            bind_addr: runtime.grpc_addr.clone(),
            advertise_addr: runtime.advertise_addr.clone(),
            max_capacity: runtime.worker_capacity,
        },
        tasks,
        hub,
    );

    let agent_cancel = shutdown.clone();
    let agent_task = tokio::spawn(async move { agent.run(agent_cancel).await });

    tokio::select! {
        joined = agent_task => {
            match joined {
                Ok(Ok(())) => 0,
                Ok(Err(e)) => {
                    eprintln!("worker agent failed: {}", e);
                    e.exit_code()
                }
                Err(e) => {
                    eprintln!("worker agent panicked: {}", e);
                    1
                }
            }
        }
        _ = wait_for_shutdown(shutdown) => 0,
    }
}

/// Block until ctrl-c, then trip the shared shutdown token.
async fn wait_for_shutdown(shutdown: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
    shutdown.cancel();
}
