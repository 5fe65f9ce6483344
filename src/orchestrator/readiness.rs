//! Readiness probing for freshly started services.
//!
//! All probes run against one overall deadline. A stdio handshake that gets
//! no answer is re-sent every retry interval until the deadline passes; HTTP
//! services are polled on a fixed cadence after a grace delay.

use std::time::Duration;

use tokio::time::{sleep_until, timeout_at, Instant};

use super::config::OrchestratorSettings;
use super::dispatcher::{PendingRequests, HANDSHAKE_REQUEST_ID};
use super::errors::OrchestratorError;
use super::lifecycle::format_stderr_suffix;
use super::transport::{HttpTransport, StdioTransport};
use super::types::{JsonRpcNotification, JsonRpcRequest, ReadinessStrategy};

/// MCP protocol revision announced in the handshake.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Method of the handshake request.
pub const HANDSHAKE_METHOD: &str = "initialize";

/// Fire-and-forget notification sent once the handshake succeeds.
pub const READY_NOTIFICATION: &str = "notifications/initialized";

/// Timing for one readiness run.
#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub handshake_retry: Duration,
    pub http_grace: Duration,
    pub http_poll_interval: Duration,
    pub http_probe_paths: Vec<String>,
}

impl ReadinessPolicy {
    pub fn from_settings(settings: &OrchestratorSettings, timeout: Duration) -> Self {
        Self {
            timeout,
            handshake_retry: Duration::from_millis(settings.handshake_retry_ms),
            http_grace: Duration::from_millis(settings.http_grace_ms),
            http_poll_interval: Duration::from_millis(settings.http_poll_interval_ms),
            http_probe_paths: settings.http_probe_paths.clone(),
        }
    }

    fn timeout_error(&self, name: &str, detail: String) -> OrchestratorError {
        OrchestratorError::ReadinessTimeout {
            name: name.to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
            detail,
        }
    }
}

// ─── Stdio ───────────────────────────────────────────────────────────────────

/// Wait until a stdio service is ready to take requests.
///
/// `pending` must already be fed by the service's router.
pub async fn await_stdio_ready(
    transport: &StdioTransport,
    pending: &PendingRequests,
    strategy: ReadinessStrategy,
    policy: &ReadinessPolicy,
) -> Result<(), OrchestratorError> {
    let name = transport.server_name();
    let deadline = Instant::now() + policy.timeout;

    let outcome = match strategy {
        ReadinessStrategy::Handshake => handshake(transport, pending, policy, deadline).await,
        ReadinessStrategy::AssumeReadyOnOutput => first_output(transport, deadline).await,
        ReadinessStrategy::AssumeReady => Ok(()),
        ReadinessStrategy::HttpPoll => Err(ProbeFailure::Fatal(OrchestratorError::ConfigError {
            reason: format!("http-poll readiness cannot apply to stdio service '{name}'"),
        })),
    };

    match outcome {
        Ok(()) => {
            tracing::info!(server = name, ?strategy, "service ready");
            Ok(())
        }
        Err(ProbeFailure::TimedOut) => {
            let detail = format_stderr_suffix(&transport.stderr_tail());
            tracing::warn!(
                server = name,
                ?strategy,
                timeout_ms = policy.timeout.as_millis() as u64,
                "service never became ready"
            );
            Err(policy.timeout_error(name, detail))
        }
        Err(ProbeFailure::OutputClosed) => {
            let detail = format!(
                " (process closed its output){}",
                format_stderr_suffix(&transport.stderr_tail())
            );
            Err(policy.timeout_error(name, detail))
        }
        Err(ProbeFailure::Fatal(e)) => Err(e),
    }
}

enum ProbeFailure {
    TimedOut,
    OutputClosed,
    Fatal(OrchestratorError),
}

impl From<OrchestratorError> for ProbeFailure {
    fn from(e: OrchestratorError) -> Self {
        ProbeFailure::Fatal(e)
    }
}

/// Send `initialize` with the reserved id until an error-free reply arrives.
async fn handshake(
    transport: &StdioTransport,
    pending: &PendingRequests,
    policy: &ReadinessPolicy,
    deadline: Instant,
) -> Result<(), ProbeFailure> {
    let name = transport.server_name();
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let mut attempt = 0u32;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(ProbeFailure::TimedOut);
        }
        attempt += 1;
        let attempt_deadline = (now + policy.handshake_retry).min(deadline);

        let mut guard = pending.register(HANDSHAKE_REQUEST_ID);
        let request = JsonRpcRequest::new(guard.id(), HANDSHAKE_METHOD, Some(params.clone()));

        match transport.send(&request).await {
            Ok(()) => {
                let window = attempt_deadline.saturating_duration_since(Instant::now());
                match guard.wait(window).await? {
                    Some(Ok(_)) => {
                        tracing::debug!(server = name, attempt, "handshake acknowledged");
                        let ready = JsonRpcNotification::new(READY_NOTIFICATION, None);
                        if let Err(e) = transport.send(&ready).await {
                            tracing::debug!(server = name, error = %e, "ready notification not delivered");
                        }
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        tracing::debug!(server = name, attempt, error = %e, "handshake rejected");
                    }
                    None => {
                        tracing::debug!(server = name, attempt, "no handshake reply yet");
                    }
                }
            }
            Err(e) => {
                // Keep trying until the deadline; the process may be slow to open stdin.
                tracing::debug!(server = name, attempt, error = %e, "handshake send failed");
            }
        }

        drop(guard);
        sleep_until(attempt_deadline).await;
    }
}

/// Ready on the first chunk of output on either stream.
async fn first_output(transport: &StdioTransport, deadline: Instant) -> Result<(), ProbeFailure> {
    let mut activity = transport.activity();
    let seen = timeout_at(deadline, activity.wait_for(|count| *count > 0))
        .await
        .map(|waited| waited.is_ok());
    match seen {
        Ok(true) => Ok(()),
        Ok(false) => Err(ProbeFailure::OutputClosed),
        Err(_) => Err(ProbeFailure::TimedOut),
    }
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

/// Wait until an HTTP service answers any probe path below 500.
pub async fn await_http_ready(
    name: &str,
    transport: &HttpTransport,
    strategy: ReadinessStrategy,
    policy: &ReadinessPolicy,
) -> Result<(), OrchestratorError> {
    match strategy {
        ReadinessStrategy::AssumeReady => return Ok(()),
        ReadinessStrategy::HttpPoll => {}
        other => {
            return Err(OrchestratorError::ConfigError {
                reason: format!("{other:?} readiness cannot apply to http service '{name}'"),
            });
        }
    }

    let deadline = Instant::now() + policy.timeout;
    sleep_until((Instant::now() + policy.http_grace).min(deadline)).await;

    let mut attempt = 0u32;
    while Instant::now() < deadline {
        attempt += 1;
        for path in &policy.http_probe_paths {
            match timeout_at(deadline, transport.probe(path)).await {
                Ok(Ok(status)) if status < 500 => {
                    tracing::info!(
                        server = name,
                        base_url = transport.base_url(),
                        path = %path,
                        status,
                        attempt,
                        "service ready"
                    );
                    return Ok(());
                }
                Ok(Ok(status)) => {
                    tracing::debug!(server = name, path = %path, status, "probe answered with server error");
                }
                Ok(Err(e)) => {
                    tracing::debug!(server = name, path = %path, error = %e, "probe failed");
                }
                Err(_) => break,
            }
        }
        sleep_until((Instant::now() + policy.http_poll_interval).min(deadline)).await;
    }

    tracing::warn!(
        server = name,
        base_url = transport.base_url(),
        attempts = attempt,
        "service never became ready"
    );
    Err(policy.timeout_error(name, String::new()))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
