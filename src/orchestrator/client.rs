//! Orchestrator facade: the one object callers hold.
//!
//! Starts services lazily on first use, shapes every call outcome into a
//! [`CallEnvelope`], and exposes status and runtime (re)configuration.

use chrono::Utc;

use super::config::{OrchestratorConfig, OrchestratorSettings};
use super::errors::OrchestratorError;
use super::registry::ServiceRegistry;
use super::types::{CallEnvelope, ServiceDefinition, ServiceStatus, ServiceSummary};

// ─── McpOrchestrator ─────────────────────────────────────────────────────────

/// Multi-transport service orchestrator.
///
/// Cloning shares the underlying registry, so independent tasks can hold
/// their own copy. Separate instances share nothing.
#[derive(Clone)]
pub struct McpOrchestrator {
    registry: ServiceRegistry,
}

impl McpOrchestrator {
    /// An orchestrator with no service definitions.
    pub fn new(settings: OrchestratorSettings) -> Self {
        Self {
            registry: ServiceRegistry::new(settings),
        }
    }

    /// Build from a loaded config, registering every effective service.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let services = config.effective_services();
        let orchestrator = Self::new(config.settings);
        for (name, definition) in services {
            orchestrator.registry.register_definition(&name, definition)?;
        }
        tracing::info!(
            services = orchestrator.registry.definitions().len(),
            "orchestrator configured"
        );
        Ok(orchestrator)
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start `name` if it is not already running and report its status.
    pub async fn start(&self, name: &str) -> Result<ServiceStatus, OrchestratorError> {
        let handle = self.registry.ensure_started(name).await?;
        Ok(handle.status())
    }

    /// Stop one running service. Returns `false` if it was not running.
    pub async fn shutdown_service(&self, name: &str) -> bool {
        self.registry.shutdown_service(name).await
    }

    /// Stop every running service. Definitions are kept, so a later call
    /// starts a fresh instance.
    pub async fn shutdown_all(&self) {
        self.registry.shutdown_all().await;
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Issue one logical call, starting the service first if needed.
    ///
    /// Start failures (unknown name, spawn failure, readiness timeout) are
    /// returned as `Err`. Once a handle exists, every outcome comes back as
    /// an envelope: failures carry `error` and `real: false`.
    pub async fn call(
        &self,
        name: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<CallEnvelope, OrchestratorError> {
        let handle = self.registry.ensure_started(name).await?;

        let outcome = handle.dispatch(method, params.clone()).await;
        let envelope = match outcome {
            Ok(response) => CallEnvelope {
                server: name.to_string(),
                method: method.to_string(),
                params,
                response: Some(response),
                error: None,
                timestamp: Utc::now(),
                real: true,
            },
            Err(e) => {
                tracing::warn!(server = name, method, error = %e, "call failed");
                if e.is_connection_lost() {
                    self.registry.on_exit_or_error(name, handle.instance_id());
                }
                CallEnvelope {
                    server: name.to_string(),
                    method: method.to_string(),
                    params,
                    response: None,
                    error: Some(e.to_string()),
                    timestamp: Utc::now(),
                    real: false,
                }
            }
        };
        Ok(envelope)
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Status of a running service, `None` if it is not running.
    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.registry.live_handle(name).map(|h| h.status())
    }

    /// Status of every running service, sorted by name.
    pub fn running(&self) -> Vec<(String, ServiceStatus)> {
        self.registry
            .live_handles()
            .into_iter()
            .map(|h| (h.name().to_string(), h.status()))
            .collect()
    }

    /// Every configured service with its connection state, sorted by name.
    pub fn services(&self) -> Vec<ServiceSummary> {
        self.registry
            .definitions()
            .into_iter()
            .map(|(name, definition)| {
                let connected = self
                    .registry
                    .live_handle(&name)
                    .is_some_and(|h| h.is_connected());
                ServiceSummary {
                    name,
                    description: definition.description,
                    capabilities: definition.capabilities,
                    connected,
                }
            })
            .collect()
    }

    /// Processes spawned plus connections opened so far.
    pub fn spawn_count(&self) -> u64 {
        self.registry.spawn_count()
    }

    // ─── Runtime configuration ───────────────────────────────────────────

    /// Add or overwrite a service definition.
    pub fn add_service(
        &self,
        name: &str,
        definition: ServiceDefinition,
    ) -> Result<(), OrchestratorError> {
        self.registry.register_definition(name, definition)
    }

    /// Remove a service definition. Returns `false` if it did not exist.
    pub fn remove_service(&self, name: &str) -> bool {
        self.registry.remove_definition(name)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_settings() -> OrchestratorSettings {
        OrchestratorSettings {
            request_timeout_ms: 1_000,
            http_readiness_timeout_ms: 500,
            http_grace_ms: 10,
            http_poll_interval_ms: 50,
            ..OrchestratorSettings::default()
        }
    }

    #[tokio::test]
    async fn test_call_unknown_service_is_err() {
        let orchestrator = McpOrchestrator::new(fast_settings());
        let err = orchestrator.call("ghost", "ping", json!({})).await.unwrap_err();
        assert_eq!(err, OrchestratorError::UnknownService { name: "ghost".into() });
        assert_eq!(orchestrator.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_call_wraps_success_in_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/search"))
            .and(body_json(json!({"q": "rust"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hits": 3})))
            .mount(&server)
            .await;

        let orchestrator = McpOrchestrator::new(fast_settings());
        orchestrator
            .add_service("web", ServiceDefinition::http_endpoint(&server.uri()))
            .unwrap();

        let envelope = orchestrator
            .call("web", "search", json!({"q": "rust"}))
            .await
            .unwrap();
        assert!(envelope.real);
        assert!(envelope.is_success());
        assert_eq!(envelope.server, "web");
        assert_eq!(envelope.method, "search");
        assert_eq!(envelope.params, json!({"q": "rust"}));
        assert_eq!(envelope.response, Some(json!({"hits": 3})));
    }

    #[tokio::test]
    async fn test_call_failure_is_envelope_not_err() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/explode"))
            .respond_with(ResponseTemplate::new(500).set_body_string("kaboom"))
            .mount(&server)
            .await;

        let orchestrator = McpOrchestrator::new(fast_settings());
        orchestrator
            .add_service("web", ServiceDefinition::http_endpoint(&server.uri()))
            .unwrap();

        let envelope = orchestrator.call("web", "explode", json!({})).await.unwrap();
        assert!(!envelope.real);
        assert!(envelope.response.is_none());
        let error = envelope.error.unwrap();
        assert!(error.contains("500"), "{error}");
        assert!(error.contains("kaboom"), "{error}");

        // The handle survives a plain HTTP error.
        assert!(orchestrator.status("web").is_some());
    }

    #[tokio::test]
    async fn test_services_reports_connection_state() {
        let server = MockServer::start().await;
        let orchestrator = McpOrchestrator::new(fast_settings());
        orchestrator
            .add_service(
                "web",
                ServiceDefinition::http_endpoint(&server.uri())
                    .with_description("Web search")
                    .with_capabilities(&["search"]),
            )
            .unwrap();
        orchestrator
            .add_service("idle", ServiceDefinition::stdio("never-started", &[]))
            .unwrap();

        orchestrator.start("web").await.unwrap();

        let services = orchestrator.services();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, "idle");
        assert!(!services[0].connected);
        assert_eq!(services[1].name, "web");
        assert!(services[1].connected);
        assert_eq!(services[1].description, "Web search");

        let running = orchestrator.running();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].0, "web");
    }

    #[tokio::test]
    async fn test_shutdown_service_keeps_definition() {
        let server = MockServer::start().await;
        let orchestrator = McpOrchestrator::new(fast_settings());
        orchestrator
            .add_service("web", ServiceDefinition::http_endpoint(&server.uri()))
            .unwrap();
        orchestrator.start("web").await.unwrap();

        assert!(orchestrator.shutdown_service("web").await);
        assert!(!orchestrator.shutdown_service("web").await);
        assert!(orchestrator.status("web").is_none());
        assert_eq!(orchestrator.services().len(), 1);

        orchestrator.start("web").await.unwrap();
        assert_eq!(orchestrator.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_from_config_without_builtins() {
        let config = OrchestratorConfig {
            include_builtin_services: false,
            services: [(
                "local".to_string(),
                ServiceDefinition::stdio("node", &["server.js"]),
            )]
            .into_iter()
            .collect(),
            ..OrchestratorConfig::default()
        };
        let orchestrator = McpOrchestrator::from_config(config).unwrap();
        let names: Vec<_> = orchestrator.services().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["local"]);
    }

    #[test]
    fn test_remove_service() {
        let orchestrator = McpOrchestrator::new(fast_settings());
        orchestrator
            .add_service("x", ServiceDefinition::stdio("x", &[]))
            .unwrap();
        assert!(orchestrator.remove_service("x"));
        assert!(!orchestrator.remove_service("x"));
    }
}
