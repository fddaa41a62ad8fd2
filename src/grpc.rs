//! Controller↔worker gRPC protocol.
//!
//! Two services share one proto file: `Controller` (registration,
//! heartbeats, metrics streaming) served by the controller process, and
//! `Worker` (assignment, stop) served by each agent. Assignments carry
//! parameter references only — credential resolution happens on the worker.

use std::net::SocketAddr;

use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{error, info, warn};

use crate::controller::ControllerPlane;
use crate::registry::{HEARTBEAT_INTERVAL, METRICS_INTERVAL};

/// Generated protobuf types and gRPC service stubs.
///
/// Shared across the codebase:
/// - `proto::TaskAssignment` / `StopTestRequest` used by the controller
///   plane and the worker agent
/// - `proto::WorkerMetrics` frames used by the metrics aggregator
pub mod proto {
    tonic::include_proto!("vajra");
}

use proto::controller_server::{Controller, ControllerServer};

// ── Controller service ────────────────────────────────────────────────────────

/// Server-side implementation of the `Controller` service.
#[derive(Clone)]
pub struct ControllerService {
    plane: ControllerPlane,
}

impl ControllerService {
    pub fn new(plane: ControllerPlane) -> Self {
        Self { plane }
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn register_worker(
        &self,
        request: Request<proto::RegisterWorkerRequest>,
    ) -> Result<Response<proto::RegisterResponse>, Status> {
        let req = request.into_inner();

        if req.worker_id.trim().is_empty() {
            return Err(Status::invalid_argument("worker_id must not be empty"));
        }

        let address = req
            .metadata
            .as_ref()
            .map(|m| m.address.clone())
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Status::invalid_argument("metadata.address is required"))?;

        let capabilities = req.supported_task_types.iter().cloned().collect();

        match self.plane.registry().register(
            &req.worker_id,
            &req.hostname,
            &address,
            capabilities,
            req.max_capacity,
        ) {
            Ok(accept) => Ok(Response::new(proto::RegisterResponse {
                accepted: true,
                message: format!("worker '{}' registered", req.worker_id),
                heartbeat_interval_seconds: accept.heartbeat_interval.as_secs() as u32,
                metrics_interval_seconds: accept.metrics_interval.as_secs() as u32,
            })),
            // Registration conflicts are an application-level rejection,
            // not a transport error.
            Err(e) => Ok(Response::new(proto::RegisterResponse {
                accepted: false,
                message: e.to_string(),
                heartbeat_interval_seconds: HEARTBEAT_INTERVAL.as_secs() as u32,
                metrics_interval_seconds: METRICS_INTERVAL.as_secs() as u32,
            })),
        }
    }

    async fn heartbeat(
        &self,
        request: Request<proto::HeartbeatRequest>,
    ) -> Result<Response<proto::HeartbeatResponse>, Status> {
        let req = request.into_inner();

        match self.plane.registry().heartbeat(&req.worker_id, req.current_load) {
            Ok(()) => Ok(Response::new(proto::HeartbeatResponse {
                healthy: true,
                message: String::new(),
            })),
            Err(e) => Ok(Response::new(proto::HeartbeatResponse {
                healthy: false,
                message: e.to_string(),
            })),
        }
    }

    type StreamMetricsStream = ReceiverStream<Result<proto::MetricsAcknowledgment, Status>>;

    async fn stream_metrics(
        &self,
        request: Request<Streaming<proto::WorkerMetrics>>,
    ) -> Result<Response<Self::StreamMetricsStream>, Status> {
        let mut frames = request.into_inner();
        let plane = self.plane.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(16);

        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(frame) => {
                        plane.ingest_frame(&frame);
                        let ack = proto::MetricsAcknowledgment {
                            received: true,
                            message: String::new(),
                        };
                        if tx.send(Ok(ack)).await.is_err() {
                            // Worker hung up on the ack stream.
                            break;
                        }
                    }
                    Err(status) => {
                        warn!(error = %status, "Metrics stream broke");
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

// ── Server startup ────────────────────────────────────────────────────────────

/// Serve the controller service on `bind_addr`. Runs until the process
/// exits; the caller spawns this in a background task.
pub async fn start_controller_server(plane: ControllerPlane, bind_addr: String) {
    let addr: SocketAddr = match bind_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "Invalid controller gRPC bind address");
            return;
        }
    };

    info!(addr = %addr, "Controller gRPC server starting");

    if let Err(e) = Server::builder()
        .add_service(ControllerServer::new(ControllerService::new(plane)))
        .serve(addr)
        .await
    {
        error!(error = %e, "Controller gRPC server error");
    }
}
