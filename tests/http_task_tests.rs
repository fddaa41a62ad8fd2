//! Built-in HTTP task against a wiremock server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vajra_edge::config::{RampStrategy, TestConfig, TestMode};
use vajra_edge::runner::{TestPhase, TestRunner};
use vajra_edge::stream::SnapshotHub;
use vajra_edge::task::TaskRegistry;

use tokio_util::sync::CancellationToken;

fn params(url: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("url".to_string(), url.to_string());
    map
}

#[tokio::test]
async fn http_get_task_succeeds_on_200() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&server)
        .await;

    let registry = TaskRegistry::with_builtins();
    let factory = registry.get("http_get").unwrap();
    let task = factory.create(&params(&format!("{}/ping", server.uri()))).unwrap();

    let result = task.execute().await;
    assert!(result.success, "error: {:?}", result.error_message);
    assert_eq!(result.response_size, Some(4));
    assert_eq!(result.metadata.get("status").map(String::as_str), Some("200"));
}

#[tokio::test]
async fn http_get_task_reports_status_on_5xx() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let registry = TaskRegistry::with_builtins();
    let factory = registry.get("http_get").unwrap();
    let task = factory
        .create(&params(&format!("{}/broken", server.uri())))
        .unwrap();

    let result = task.execute().await;
    assert!(!result.success);
    assert_eq!(result.error_message.as_deref(), Some("HTTP 503"));
}

#[tokio::test]
async fn http_get_task_categorizes_connection_failures() {
    // Nothing listens on this port.
    let registry = TaskRegistry::with_builtins();
    let factory = registry.get("http_get").unwrap();
    let task = factory.create(&params("http://127.0.0.1:9/unreachable")).unwrap();

    let result = task.execute().await;
    assert!(!result.success);
    let message = result.error_message.unwrap();
    assert!(
        message.starts_with("connect:") || message.starts_with("request:"),
        "message was '{}'",
        message
    );
}

#[tokio::test]
#[serial_test::serial]
async fn bearer_credential_resolved_from_environment() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/secure"))
        .and(header("authorization", "Bearer sekrit-token"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    // The parameter names the env var; the secret never rides the config.
    std::env::set_var("VAJRA_HTTP_TEST_TOKEN", "sekrit-token");
    let mut task_params = params(&format!("{}/secure", server.uri()));
    task_params.insert("bearerEnv".to_string(), "VAJRA_HTTP_TEST_TOKEN".to_string());

    let registry = TaskRegistry::with_builtins();
    let factory = registry.get("http_get").unwrap();
    let task = factory.create(&task_params).unwrap();

    let result = task.execute().await;
    assert!(result.success, "error: {:?}", result.error_message);
    std::env::remove_var("VAJRA_HTTP_TEST_TOKEN");
}

#[tokio::test]
async fn full_run_against_mock_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/load"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(5)))
        .mount(&server)
        .await;

    let config = TestConfig {
        mode: TestMode::ConcurrencyBased,
        starting_concurrency: 4,
        max_concurrency: 4,
        ramp_strategy: RampStrategy::Linear {
            duration_seconds: 0,
        },
        max_tps_limit: None,
        test_duration_seconds: 2,
        sustain_duration_seconds: 0,
        warmup_seconds: 0,
        task_type: "http_get".to_string(),
        task_parameters: params(&format!("{}/load", server.uri())),
    };

    let registry = TaskRegistry::with_builtins();
    let factory = registry.get("http_get").unwrap();
    let runner = TestRunner::new(
        "http-load",
        config,
        factory,
        SnapshotHub::new(),
        CancellationToken::new(),
    );
    let outcome = Arc::new(runner).run().await;

    assert_eq!(outcome.phase, TestPhase::Completed);
    assert!(outcome.final_snapshot.total > 10);
    assert_eq!(outcome.final_snapshot.failed, 0);
    assert!(outcome.final_snapshot.percentiles.p50 >= 4.0);
}
