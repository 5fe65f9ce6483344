//! HTTP services against a local mock server.

use std::time::{Duration, Instant};

use mcp_orchestrator::{McpOrchestrator, OrchestratorError, OrchestratorSettings, ServiceDefinition};
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        request_timeout_ms: 2_000,
        http_readiness_timeout_ms: 5_000,
        http_grace_ms: 50,
        http_poll_interval_ms: 100,
        shutdown_grace_ms: 2_000,
        ..OrchestratorSettings::default()
    }
}

/// 503 until `delay` has passed since creation, then 200.
struct ReadyAfter {
    since: Instant,
    delay: Duration,
}

impl Respond for ReadyAfter {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        if self.since.elapsed() >= self.delay {
            ResponseTemplate::new(200).set_body_json(json!({"status": "ok"}))
        } else {
            ResponseTemplate::new(503)
        }
    }
}

async fn orchestrator_for(server: &MockServer) -> McpOrchestrator {
    let orchestrator = McpOrchestrator::new(settings());
    orchestrator
        .add_service("web", ServiceDefinition::http_endpoint(&server.uri()))
        .unwrap();
    orchestrator
}

#[tokio::test]
async fn test_start_waits_for_health() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ReadyAfter {
            since: Instant::now(),
            delay: Duration::from_secs(2),
        })
        .mount(&server)
        .await;

    let orchestrator = orchestrator_for(&server).await;
    let started = Instant::now();
    let status = orchestrator.start("web").await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2), "{:?}", started.elapsed());
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(status.connected);
}

#[tokio::test]
async fn test_start_times_out_on_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let orchestrator = McpOrchestrator::new(OrchestratorSettings {
        http_readiness_timeout_ms: 600,
        ..settings()
    });
    orchestrator
        .add_service("web", ServiceDefinition::http_endpoint(&server.uri()))
        .unwrap();

    let err = orchestrator.start("web").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ReadinessTimeout { .. }), "{err:?}");
    assert!(orchestrator.status("web").is_none());
}

#[tokio::test]
async fn test_tools_list_maps_to_tools_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/tools"))
        .and(body_json(json!({})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tools": ["search"]})))
        .expect(1)
        .mount(&server)
        .await;

    let orchestrator = orchestrator_for(&server).await;
    let envelope = orchestrator
        .call("web", "tools/list", serde_json::Value::Null)
        .await
        .unwrap();

    assert!(envelope.real);
    assert_eq!(envelope.response, Some(json!({"tools": ["search"]})));
}

#[tokio::test]
async fn test_unmapped_method_uses_generic_path() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_json(json!({"prompt": "hi"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "hello"})))
        .expect(1)
        .mount(&server)
        .await;

    let orchestrator = orchestrator_for(&server).await;
    let envelope = orchestrator
        .call("web", "generate", json!({"prompt": "hi"}))
        .await
        .unwrap();
    assert_eq!(envelope.response, Some(json!({"text": "hello"})));

    let status = orchestrator.status("web").unwrap();
    assert_eq!(status.request_count, 1);
}

#[tokio::test]
async fn test_http_error_status_becomes_envelope_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/tools"))
        .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let orchestrator = orchestrator_for(&server).await;
    let envelope = orchestrator.call("web", "tools/list", json!({})).await.unwrap();

    assert!(!envelope.real);
    let error = envelope.error.unwrap();
    assert!(error.contains("HTTP 502"), "{error}");
    assert!(error.contains("upstream down"), "{error}");
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let orchestrator = McpOrchestrator::new(OrchestratorSettings {
        request_timeout_ms: 300,
        ..settings()
    });
    orchestrator
        .add_service("web", ServiceDefinition::http_endpoint(&server.uri()))
        .unwrap();

    let envelope = orchestrator.call("web", "slow", json!({})).await.unwrap();
    assert!(!envelope.real);
    assert!(envelope.error.unwrap().contains("timed out after 300ms"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_owned_process_is_killed_on_shutdown() {
    let server = MockServer::start().await;
    let orchestrator = McpOrchestrator::new(settings());

    // The process stands in for a server binding the mock's port.
    let mut definition = ServiceDefinition::http_endpoint(&server.uri());
    definition.command = Some("sleep".into());
    definition.args = vec!["30".into()];
    orchestrator.add_service("web", definition).unwrap();

    let status = orchestrator.start("web").await.unwrap();
    let pid = status.pid.unwrap();

    orchestrator.shutdown_all().await;

    let alive = std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    assert!(!alive);
    assert!(orchestrator.running().is_empty());
}
