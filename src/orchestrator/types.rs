//! Shared types for the orchestrator.
//!
//! JSON-RPC wire messages, service definitions, and the status/result shapes
//! handed back to callers.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::OrchestratorError;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
///
/// Field order matters on the wire: `jsonrpc`, `id`, `method`, `params`.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no reply expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// Servers in the wild omit `jsonrpc` and send `"result": null`, so both are
/// optional here.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Convert into the call outcome: the error object wins over any result.
    pub fn into_outcome(self, server: &str) -> Result<serde_json::Value, OrchestratorError> {
        if let Some(err) = self.error {
            return Err(OrchestratorError::ServerError {
                server: server.to_string(),
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(serde_json::Value::Null))
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

// ─── Service Definitions ─────────────────────────────────────────────────────

/// How a service is reached once launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Line-delimited JSON-RPC over the child's stdin/stdout.
    #[default]
    Stdio,
    /// JSON POSTs to a REST-ish HTTP endpoint.
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => f.write_str("stdio"),
            TransportKind::Http => f.write_str("http"),
        }
    }
}

/// How the prober decides a freshly started service can take requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadinessStrategy {
    /// Send `initialize` with the reserved id and wait for an error-free reply.
    Handshake,
    /// Ready as soon as the process writes anything (stdout or stderr).
    AssumeReadyOnOutput,
    /// Ready immediately after launch, no probing at all.
    AssumeReady,
    /// Poll the HTTP probe paths until one answers below 500.
    HttpPoll,
}

impl ReadinessStrategy {
    /// Whether this strategy can be applied to the given transport.
    pub fn supports(self, transport: TransportKind) -> bool {
        match self {
            ReadinessStrategy::Handshake | ReadinessStrategy::AssumeReadyOnOutput => {
                transport == TransportKind::Stdio
            }
            ReadinessStrategy::HttpPoll => transport == TransportKind::Http,
            ReadinessStrategy::AssumeReady => true,
        }
    }
}

/// Immutable configuration for one named service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Program to launch. Optional only for HTTP services that are already running.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overlay merged onto the orchestrator's own environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// HTTP only: port on localhost, used when `base_url` is absent.
    #[serde(default)]
    pub port: Option<u16>,
    /// HTTP only: explicit base URL (wins over `port`).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Overrides the transport's default readiness strategy.
    #[serde(default)]
    pub readiness: Option<ReadinessStrategy>,
    #[serde(default)]
    pub readiness_timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl ServiceDefinition {
    /// A stdio service launched as `command args…`.
    pub fn stdio(command: &str, args: &[&str]) -> Self {
        Self {
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    /// An HTTP service reached at `base_url`, not launched by the orchestrator.
    pub fn http_endpoint(base_url: &str) -> Self {
        Self {
            transport: TransportKind::Http,
            base_url: Some(base_url.to_string()),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_readiness(mut self, strategy: ReadinessStrategy) -> Self {
        self.readiness = Some(strategy);
        self
    }

    pub fn with_readiness_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.readiness_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = Some(timeout_ms);
        self
    }

    /// The readiness strategy in effect: explicit override or transport default.
    pub fn readiness_strategy(&self) -> ReadinessStrategy {
        self.readiness.unwrap_or(match self.transport {
            TransportKind::Stdio => ReadinessStrategy::Handshake,
            TransportKind::Http => ReadinessStrategy::HttpPoll,
        })
    }

    /// Resolved base URL for HTTP services, without a trailing slash.
    pub fn resolved_base_url(&self) -> Option<String> {
        match (&self.base_url, self.port) {
            (Some(url), _) => Some(url.trim_end_matches('/').to_string()),
            (None, Some(port)) => Some(format!("http://localhost:{port}")),
            (None, None) => None,
        }
    }

    /// Check the definition is launchable before it enters the registry.
    pub fn validate(&self, name: &str) -> Result<(), OrchestratorError> {
        if name.trim().is_empty() {
            return Err(OrchestratorError::ConfigError {
                reason: "service name must not be empty".into(),
            });
        }

        let has_command = self.command.as_deref().is_some_and(|c| !c.trim().is_empty());

        match self.transport {
            TransportKind::Stdio if !has_command => {
                return Err(OrchestratorError::ConfigError {
                    reason: format!("stdio service '{name}' has no command"),
                });
            }
            TransportKind::Http if self.resolved_base_url().is_none() => {
                return Err(OrchestratorError::ConfigError {
                    reason: format!("http service '{name}' needs a port or base_url"),
                });
            }
            _ => {}
        }

        let strategy = self.readiness_strategy();
        if !strategy.supports(self.transport) {
            return Err(OrchestratorError::ConfigError {
                reason: format!(
                    "readiness strategy {strategy:?} is not valid for {} service '{name}'",
                    self.transport
                ),
            });
        }

        Ok(())
    }
}

// ─── Caller-facing Shapes ────────────────────────────────────────────────────

/// Stable result envelope returned for every call on a reachable service.
#[derive(Debug, Clone, Serialize)]
pub struct CallEnvelope {
    pub server: String,
    pub method: String,
    pub params: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// `true` when the response came from the live service.
    pub real: bool,
}

impl CallEnvelope {
    pub fn is_success(&self) -> bool {
        self.real && self.error.is_none()
    }
}

/// Runtime status of one live service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub connected: bool,
    pub transport: TransportKind,
    pub started_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub request_count: u64,
    pub in_flight: usize,
    pub pid: Option<u32>,
    pub capabilities: BTreeSet<String>,
}

/// One configured service as listed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub name: String,
    pub description: String,
    pub capabilities: BTreeSet<String>,
    pub connected: bool,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
