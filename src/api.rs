//! REST surface.
//!
//! Thin JSON edges over the managers: submit/inspect/stop tests, run
//! pre-flight on its own, and drive suites. In controller mode the same
//! endpoints dispatch to the distributed plane instead of the local
//! runner. Error mapping follows the taxonomy: CONFIG_INVALID and
//! PREFLIGHT_FAILED are 400, unknown ids are 404, CAPACITY_EXCEEDED is
//! 503.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::{TestConfig, TestSuite};
use crate::controller::ControllerPlane;
use crate::error::VajraError;
use crate::manager::{SubmitRejection, SuiteManager, TestManager};

/// Everything the handlers need. Cheap to clone per connection.
#[derive(Clone)]
pub struct ApiState {
    pub manager: TestManager,
    pub suites: SuiteManager,
    /// Present in controller mode; routes tests to the fleet.
    pub plane: Option<ControllerPlane>,
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let encoded = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(encoded))
        .unwrap_or_default()
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response<Body> {
    json_response(status, &json!({ "error": code, "message": message }))
}

fn not_found() -> Response<Body> {
    error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "no such resource")
}

async fn read_body(req: Request<Body>) -> Result<Vec<u8>, Response<Body>> {
    match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => Ok(bytes.to_vec()),
        Err(e) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "CONFIG_INVALID",
            &format!("failed to read request body: {}", e),
        )),
    }
}

// ── Test endpoints ────────────────────────────────────────────────────────────

async fn submit_test(state: &ApiState, body: &[u8]) -> Response<Body> {
    let config = match TestConfig::from_json(body) {
        Ok(config) => config,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, "CONFIG_INVALID", &e.to_string())
        }
    };

    // Controller mode: pre-flight locally, then hand the test to the fleet.
    if let Some(plane) = &state.plane {
        let report = state.manager.validate(&config).await;
        if !report.can_proceed {
            return json_response(StatusCode::BAD_REQUEST, &report);
        }
        let test_id = format!("test-{}", nanoid_like());
        return match plane.start_test(&test_id, &config).await {
            Ok(shares) => json_response(
                StatusCode::CREATED,
                &json!({
                    "testId": test_id,
                    "status": "RUNNING",
                    "workers": shares.len(),
                }),
            ),
            Err(VajraError::CapacityExceeded(message)) => {
                error_response(StatusCode::SERVICE_UNAVAILABLE, "CAPACITY_EXCEEDED", &message)
            }
            Err(e) => {
                error!(error = %e, "Distributed test dispatch failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "DISPATCH_FAILED", &e.to_string())
            }
        };
    }

    match state.manager.submit(config).await {
        Ok(test_id) => {
            let status = state
                .manager
                .get(&test_id)
                .map(|v| v.status)
                .unwrap_or(crate::runner::TestPhase::Created);
            json_response(
                StatusCode::CREATED,
                &json!({ "testId": test_id, "status": status }),
            )
        }
        Err(SubmitRejection::Preflight(report)) => {
            json_response(StatusCode::BAD_REQUEST, &report)
        }
        Err(SubmitRejection::Invalid(message)) => {
            error_response(StatusCode::BAD_REQUEST, "CONFIG_INVALID", &message)
        }
        Err(SubmitRejection::Capacity(message)) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "CAPACITY_EXCEEDED", &message)
        }
    }
}

fn get_test(state: &ApiState, test_id: &str) -> Response<Body> {
    if let Some(view) = state.manager.get(test_id) {
        return json_response(StatusCode::OK, &view);
    }
    if let Some(plane) = &state.plane {
        if let Some(aggregate) = plane.aggregate(test_id) {
            return json_response(StatusCode::OK, &aggregate);
        }
    }
    not_found()
}

fn list_tests(state: &ApiState) -> Response<Body> {
    let mut active: std::collections::HashMap<String, crate::runner::TestPhase> =
        state.manager.list_active();
    if let Some(plane) = &state.plane {
        for (test_id, phase) in plane.list_tests() {
            if !phase.is_terminal() {
                active.insert(test_id, phase);
            }
        }
    }
    json_response(
        StatusCode::OK,
        &json!({ "activeTests": active, "count": active.len() }),
    )
}

async fn stop_test(state: &ApiState, test_id: &str) -> Response<Body> {
    if state.manager.stop(test_id) {
        return json_response(StatusCode::OK, &json!({ "stopped": true }));
    }
    if let Some(plane) = &state.plane {
        match plane.stop_test(test_id, true).await {
            Ok(interrupted) => {
                return json_response(
                    StatusCode::OK,
                    &json!({ "stopped": true, "tasksInterrupted": interrupted }),
                )
            }
            Err(VajraError::NotFound(_)) => {}
            Err(e) => {
                warn!(test_id = test_id, error = %e, "Distributed stop failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STOP_FAILED",
                    &e.to_string(),
                );
            }
        }
    }
    not_found()
}

async fn validate_only(state: &ApiState, body: &[u8]) -> Response<Body> {
    let config = match TestConfig::from_json(body) {
        Ok(config) => config,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, "CONFIG_INVALID", &e.to_string())
        }
    };
    let report = state.manager.validate(&config).await;
    json_response(StatusCode::OK, &report)
}

// ── Suite endpoints ───────────────────────────────────────────────────────────

fn start_suite(state: &ApiState, body: &[u8]) -> Response<Body> {
    let suite = match TestSuite::from_json(body) {
        Ok(suite) => suite,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, "CONFIG_INVALID", &e.to_string())
        }
    };

    match state.suites.start(suite) {
        Ok(suite_id) => json_response(
            StatusCode::CREATED,
            &json!({ "suiteId": suite_id, "status": "RUNNING" }),
        ),
        Err(VajraError::ConfigInvalid(message)) => {
            error_response(StatusCode::BAD_REQUEST, "CONFIG_INVALID", &message)
        }
        Err(VajraError::RegistrationRejected(message)) => {
            error_response(StatusCode::CONFLICT, "ALREADY_RUNNING", &message)
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "SUITE_START_FAILED",
            &e.to_string(),
        ),
    }
}

fn suite_status(state: &ApiState, suite_id: &str) -> Response<Body> {
    match state.suites.status(suite_id) {
        Some(status) => json_response(StatusCode::OK, &status),
        None => not_found(),
    }
}

fn suite_results(state: &ApiState, suite_id: &str) -> Response<Body> {
    match state.suites.results(suite_id) {
        Some(results) => json_response(StatusCode::OK, &json!({ "scenarios": results })),
        None => not_found(),
    }
}

fn stop_suite(state: &ApiState, suite_id: &str) -> Response<Body> {
    if state.suites.stop(suite_id) {
        json_response(StatusCode::OK, &json!({ "stopped": true }))
    } else {
        not_found()
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Route one request. Public so tests can drive the router without a
/// socket.
pub async fn handle_request(state: ApiState, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        (Method::POST, ["api", "tests"]) => match read_body(req).await {
            Ok(body) => submit_test(&state, &body).await,
            Err(response) => response,
        },
        (Method::GET, ["api", "tests"]) => list_tests(&state),
        (Method::GET, ["api", "tests", test_id]) => get_test(&state, test_id),
        (Method::DELETE, ["api", "tests", test_id]) => {
            let test_id = test_id.to_string();
            stop_test(&state, &test_id).await
        }
        (Method::POST, ["api", "validation"]) => match read_body(req).await {
            Ok(body) => validate_only(&state, &body).await,
            Err(response) => response,
        },
        (Method::POST, ["api", "suites", "start"]) => match read_body(req).await {
            Ok(body) => start_suite(&state, &body),
            Err(response) => response,
        },
        (Method::GET, ["api", "suites", suite_id, "status"]) => suite_status(&state, suite_id),
        (Method::GET, ["api", "suites", suite_id, "results"]) => suite_results(&state, suite_id),
        (Method::DELETE, ["api", "suites", suite_id, "stop"]) => stop_suite(&state, suite_id),
        _ => not_found(),
    }
}

/// A short unique suffix for distributed test ids.
fn nanoid_like() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{:x}", millis)
}

/// Serve the REST API. Runs until the process exits; spawn in a
/// background task.
pub async fn start_api_server(state: ApiState, bind_addr: String) {
    let addr: SocketAddr = match bind_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "Invalid API bind address");
            return;
        }
    };

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle_request(state, req).await) }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(addr = %addr, "REST API listening");

    if let Err(e) = server.await {
        error!(error = %e, "API server error");
    }
}
