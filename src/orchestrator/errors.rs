//! Orchestrator error types.
//!
//! Start-phase variants reach the caller as `Err`. Call-phase variants are
//! folded into the [`CallEnvelope`](super::types::CallEnvelope) by the facade.

use thiserror::Error;

/// Errors that can occur while starting or talking to a managed service.
///
/// `Clone` so one in-flight start can hand the same outcome to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// The service name has no registered definition.
    #[error("unknown service: '{name}'")]
    UnknownService {
        name: String,
    },

    /// The service was never confirmed live within its readiness window.
    #[error("service '{name}' not ready after {timeout_ms}ms{detail}")]
    ReadinessTimeout {
        name: String,
        timeout_ms: u64,
        /// Pre-formatted suffix (e.g. captured stderr), possibly empty.
        detail: String,
    },

    /// The OS refused to launch the service's command.
    #[error("failed to spawn service '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// Write to a dead or closed transport, or connection refused.
    #[error("transport unavailable for service '{server}': {reason}")]
    TransportUnavailable {
        server: String,
        reason: String,
    },

    /// HTTP service answered with a non-success status.
    #[error("service '{server}' returned HTTP {status}: {body}")]
    TransportError {
        server: String,
        status: u16,
        body: String,
    },

    /// No correlated reply arrived within the call window.
    #[error("request '{method}' to service '{server}' timed out after {timeout_ms}ms")]
    RequestTimeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The service replied with a JSON-RPC error object.
    #[error("service '{server}' error{}: {message}", .code.map(|c| format!(" [{c}]")).unwrap_or_default())]
    ServerError {
        server: String,
        code: Option<i64>,
        message: String,
    },

    /// Malformed response body or unserialisable payload.
    #[error("protocol error for service '{server}': {reason}")]
    Protocol {
        server: String,
        reason: String,
    },

    /// Invalid service definition or unreadable configuration.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl OrchestratorError {
    /// Whether the failure means the underlying process or connection is gone.
    ///
    /// The facade deregisters the handle on these so the next call respawns.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, OrchestratorError::TransportUnavailable { .. })
    }
}
