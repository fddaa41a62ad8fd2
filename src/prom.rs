//! Process-level Prometheus metrics.
//!
//! Distinct from the per-test metrics engine: these are coarse fleet and
//! process gauges scraped over HTTP. The namespace is overridable with
//! `METRIC_NAMESPACE` so multiple deployments can share a Prometheus.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::env;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "vajra_edge".to_string());

    pub static ref TESTS_STARTED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("tests_started_total", "Total number of tests accepted and started")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref TESTS_BY_OUTCOME: IntCounterVec =
        IntCounterVec::new(
            Opts::new("tests_by_outcome_total", "Terminal tests by outcome phase")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["outcome"]
        ).unwrap();

    pub static ref ACTIVE_TESTS: Gauge =
        Gauge::with_opts(
            Opts::new("active_tests", "Tests currently in a non-terminal phase")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REGISTERED_WORKERS: Gauge =
        Gauge::with_opts(
            Opts::new("registered_workers", "Workers currently registered and healthy")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref SNAPSHOTS_PUBLISHED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("snapshots_published_total", "Metrics snapshots pushed to subscribers")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref METRICS_FRAMES_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("metrics_frames_total", "Worker metrics frames ingested by the aggregator")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    prometheus::default_registry().register(Box::new(TESTS_STARTED_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(TESTS_BY_OUTCOME.clone()))?;
    prometheus::default_registry().register(Box::new(ACTIVE_TESTS.clone()))?;
    prometheus::default_registry().register(Box::new(REGISTERED_WORKERS.clone()))?;
    prometheus::default_registry().register(Box::new(SNAPSHOTS_PUBLISHED_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(METRICS_FRAMES_TOTAL.clone()))?;
    Ok(())
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
    }

    let response = Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap_or_default();

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(bind_addr: String, registry: Arc<Mutex<Registry>>) {
    let addr: std::net::SocketAddr = match bind_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "Invalid metrics bind address");
            return;
        }
    };

    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(addr = %addr, "Metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let before = TESTS_STARTED_TOTAL.get();
        TESTS_STARTED_TOTAL.inc();
        assert_eq!(TESTS_STARTED_TOTAL.get(), before + 1);
    }

    #[test]
    fn outcome_labels_are_independent() {
        let completed = TESTS_BY_OUTCOME.with_label_values(&["COMPLETED"]).get();
        TESTS_BY_OUTCOME.with_label_values(&["COMPLETED"]).inc();
        TESTS_BY_OUTCOME.with_label_values(&["FAILED"]).inc();
        assert_eq!(
            TESTS_BY_OUTCOME.with_label_values(&["COMPLETED"]).get(),
            completed + 1
        );
    }

    #[tokio::test]
    async fn handler_serves_text_format() {
        let registry = Arc::new(Mutex::new(prometheus::Registry::new()));
        let response = metrics_handler(
            Request::builder().body(Body::empty()).unwrap(),
            registry,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), 200);
    }
}
