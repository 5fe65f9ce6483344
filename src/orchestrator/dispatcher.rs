//! Request dispatch and reply correlation.
//!
//! Every stdio service gets one router task, fed its output lines from
//! start-up on. The router parses each line and hands matching replies to the
//! waiting caller through a oneshot channel keyed by request id. Lines that
//! are not JSON-RPC replies, or carry an id nobody is waiting for, are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::errors::OrchestratorError;
use super::transport::{http_endpoint_for, HttpTransport, StdioTransport};
use super::types::{JsonRpcRequest, JsonRpcResponse};

/// Reserved id for the readiness handshake. Regular ids start at 1.
pub const HANDSHAKE_REQUEST_ID: u64 = 0;

type Outcome = Result<serde_json::Value, OrchestratorError>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── PendingRequests ─────────────────────────────────────────────────────────

/// One in-flight request awaiting its reply.
struct PendingRequest {
    issued_at: Instant,
    reply: oneshot::Sender<Outcome>,
}

/// Correlation table for a single service.
pub struct PendingRequests {
    server_name: String,
    next_id: AtomicU64,
    waiters: StdMutex<HashMap<u64, PendingRequest>>,
}

impl PendingRequests {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            next_id: AtomicU64::new(HANDSHAKE_REQUEST_ID + 1),
            waiters: StdMutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh request id (monotonic, never the handshake id).
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start waiting for `id`. The guard retires the entry when dropped.
    ///
    /// Registering an id that is already pending replaces the old waiter,
    /// whose receiver then sees a closed channel.
    pub fn register(&self, id: u64) -> PendingGuard<'_> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingRequest {
            issued_at: Instant::now(),
            reply: tx,
        };
        lock(&self.waiters).insert(id, entry);
        PendingGuard {
            pending: self,
            id,
            reply: rx,
        }
    }

    /// Drop the waiter for `id`, if any. Returns whether one existed.
    pub fn retire(&self, id: u64) -> bool {
        lock(&self.waiters).remove(&id).is_some()
    }

    /// Deliver a parsed reply. Returns `false` if nobody was waiting for it.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let id = response.id;
        let entry = lock(&self.waiters).remove(&id);

        match entry {
            Some(entry) => {
                tracing::trace!(
                    server = %self.server_name,
                    id,
                    elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
                    "reply correlated"
                );
                // The caller may have given up between lookup and send.
                let _ = entry.reply.send(response.into_outcome(&self.server_name));
                true
            }
            None => {
                tracing::debug!(server = %self.server_name, id, "discarding uncorrelated reply");
                false
            }
        }
    }

    /// Number of requests currently awaiting a reply.
    pub fn in_flight(&self) -> usize {
        lock(&self.waiters).len()
    }
}

/// An in-flight registration. Retires its id on drop, whatever the outcome.
pub struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: u64,
    reply: oneshot::Receiver<Outcome>,
}

impl PendingGuard<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait up to `window` for the correlated reply.
    ///
    /// `Ok(None)` means the window elapsed.
    pub async fn wait(&mut self, window: Duration) -> Result<Option<Outcome>, OrchestratorError> {
        match tokio::time::timeout(window, &mut self.reply).await {
            Ok(Ok(outcome)) => Ok(Some(outcome)),
            Ok(Err(_)) => Err(OrchestratorError::TransportUnavailable {
                server: self.pending.server_name.clone(),
                reason: format!("request {} was abandoned", self.id),
            }),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.retire(self.id);
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Route one output line. Returns whether it resolved a pending request.
pub fn route_line(pending: &PendingRequests, line: &str) -> bool {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        tracing::trace!(server = %pending.server_name, line = trimmed, "skipping non-JSON output");
        return false;
    }

    let message: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(message) => message,
        Err(_) => {
            tracing::trace!(server = %pending.server_name, line = trimmed, "skipping non-JSON output");
            return false;
        }
    };

    // Server-initiated requests carry an id too; only replies lack a method.
    if message.get("method").is_some() {
        tracing::trace!(server = %pending.server_name, line = trimmed, "skipping server message");
        return false;
    }

    match serde_json::from_value::<JsonRpcResponse>(message) {
        Ok(response) => pending.resolve(response),
        Err(_) => {
            tracing::trace!(server = %pending.server_name, line = trimmed, "skipping non-reply message");
            false
        }
    }
}

/// Spawn the per-service router. It ends when the service's stdout closes.
pub fn spawn_router(
    pending: std::sync::Arc<PendingRequests>,
    mut lines: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            route_line(&pending, &line);
        }
        tracing::debug!(
            server = %pending.server_name,
            in_flight = pending.in_flight(),
            "output closed, router stopping"
        );
    })
}

// ─── Calls ───────────────────────────────────────────────────────────────────

/// Send a request over stdio and wait for its correlated reply.
pub async fn call_stdio(
    transport: &StdioTransport,
    pending: &PendingRequests,
    method: &str,
    params: serde_json::Value,
    timeout: Duration,
) -> Result<serde_json::Value, OrchestratorError> {
    let id = pending.next_id();
    let mut guard = pending.register(id);

    transport
        .send(&JsonRpcRequest::new(id, method, Some(normalize_params(params))))
        .await?;

    match guard.wait(timeout).await? {
        Some(outcome) => outcome,
        None => {
            tracing::warn!(
                server = transport.server_name(),
                id,
                method,
                timeout_ms = timeout.as_millis() as u64,
                "request timed out"
            );
            Err(OrchestratorError::RequestTimeout {
                server: transport.server_name().to_string(),
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

/// POST a call to an HTTP service's mapped endpoint.
pub async fn call_http(
    transport: &HttpTransport,
    server_name: &str,
    method: &str,
    params: serde_json::Value,
    timeout: Duration,
) -> Result<serde_json::Value, OrchestratorError> {
    let endpoint = http_endpoint_for(method);
    let body = normalize_params(params);

    match tokio::time::timeout(timeout, transport.post_json(&endpoint, &body)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                server = server_name,
                endpoint = %endpoint,
                timeout_ms = timeout.as_millis() as u64,
                "HTTP request timed out"
            );
            Err(OrchestratorError::RequestTimeout {
                server: server_name.to_string(),
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

/// Requests always carry an object; `null` becomes `{}`.
fn normalize_params(params: serde_json::Value) -> serde_json::Value {
    if params.is_null() {
        serde_json::json!({})
    } else {
        params
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
