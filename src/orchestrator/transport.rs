//! Transport adapters: stdio and HTTP.
//!
//! Stdio services speak newline-delimited JSON on their standard streams.
//! Output is read in raw chunks, framed into lines, and queued for the
//! service's router. A chunk may hold zero, one, or many lines, and a line
//! may straddle chunks. The queue is unbounded, so a burst of log output can
//! never push a reply out. HTTP services are plain JSON POSTs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch, Mutex};

use super::errors::OrchestratorError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Size of one raw stdout read.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Stderr lines retained for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// TCP connection timeout for HTTP services.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest HTTP error body kept in an error message.
const MAX_ERROR_BODY: usize = 500;

/// REST-ish endpoints for methods HTTP services expose under their own path.
/// Anything else goes to `/api/<method>`.
const HTTP_METHOD_ENDPOINTS: &[(&str, &str)] = &[
    ("tools/list", "/api/tools"),
    ("resources/list", "/api/resources"),
    ("prompts/list", "/api/prompts"),
    ("initialize", "/api/initialize"),
];

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Line Framing ────────────────────────────────────────────────────────────

/// Reassembles newline-delimited text from arbitrarily split byte chunks.
///
/// Blank lines are dropped. Invalid UTF-8 is replaced rather than rejected,
/// since a stray log line must not stall the stream.
#[derive(Debug, Default)]
pub struct LineFramer {
    partial: Vec<u8>,
}

impl LineFramer {
    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let scan_from = self.partial.len();
        self.partial.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        for (offset, byte) in self.partial[scan_from..].iter().enumerate() {
            if *byte == b'\n' {
                let end = scan_from + offset;
                if let Some(line) = Self::decode(&self.partial[start..end]) {
                    lines.push(line);
                }
                start = end + 1;
            }
        }
        self.partial.drain(..start);
        lines
    }

    /// Flush an unterminated trailing line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        Self::decode(&rest)
    }

    fn decode(raw: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(raw);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

// ─── Stdio ───────────────────────────────────────────────────────────────────

/// JSON-lines transport over a child process's standard streams.
///
/// Writes go straight to stdin. Reads happen on background tasks; callers
/// consume stdout through the line receiver handed out by [`attach`].
///
/// [`attach`]: StdioTransport::attach
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<BoxedWriter>,
    activity: watch::Receiver<u64>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
}

impl StdioTransport {
    /// Wire up a transport and start pumping its output.
    ///
    /// The returned receiver exists before the pumps start, so no line
    /// written by the process can be missed. It closes when stdout does.
    pub fn attach(
        server_name: &str,
        stdin: impl AsyncWrite + Send + Unpin + 'static,
        stdout: impl AsyncRead + Send + Unpin + 'static,
        stderr: Option<BoxedReader>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (activity_tx, activity_rx) = watch::channel(0u64);
        let activity_tx = Arc::new(activity_tx);
        let stderr_tail = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        tokio::spawn(pump_stdout(
            server_name.to_string(),
            stdout,
            lines_tx,
            Arc::clone(&activity_tx),
        ));

        if let Some(stderr) = stderr {
            tokio::spawn(pump_stderr(
                server_name.to_string(),
                stderr,
                Arc::clone(&stderr_tail),
                activity_tx,
            ));
        }

        let transport = Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Box::new(stdin)),
            activity: activity_rx,
            stderr_tail,
        };
        (transport, lines_rx)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Serialize `message` as one line on the process's stdin.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<(), OrchestratorError> {
        let mut json = serde_json::to_string(message).map_err(|e| OrchestratorError::Protocol {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| OrchestratorError::TransportUnavailable {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| OrchestratorError::TransportUnavailable {
                server: self.server_name.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })?;

        Ok(())
    }

    /// Counter of output chunks seen on stdout and stderr.
    ///
    /// The sender side drops once both streams have closed.
    pub fn activity(&self) -> watch::Receiver<u64> {
        self.activity.clone()
    }

    /// The most recent stderr lines, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

async fn pump_stdout(
    server: String,
    mut stdout: impl AsyncRead + Unpin,
    lines: mpsc::UnboundedSender<String>,
    activity: Arc<watch::Sender<u64>>,
) {
    let mut framer = LineFramer::default();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "stdout read failed");
                break;
            }
        };

        activity.send_modify(|count| *count += 1);
        for line in framer.push(&chunk[..n]) {
            // A closed receiver means nobody is correlating; drop the line.
            let _ = lines.send(line);
        }
    }

    if let Some(rest) = framer.finish() {
        let _ = lines.send(rest);
    }
    tracing::debug!(server = %server, "stdout closed");
}

async fn pump_stderr(
    server: String,
    stderr: BoxedReader,
    tail: Arc<StdMutex<VecDeque<String>>>,
    activity: Arc<watch::Sender<u64>>,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "stderr read failed");
                break;
            }
        }

        activity.send_modify(|count| *count += 1);
        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        tracing::debug!(server = %server, line = %line, "service stderr");

        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

/// Stateless JSON-over-HTTP transport.
pub struct HttpTransport {
    server_name: String,
    base_url: String,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(server_name: &str, base_url: &str) -> Result<Self, OrchestratorError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| OrchestratorError::TransportUnavailable {
                server: server_name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server_name: server_name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET `path` and report the status code, whatever it is.
    pub async fn probe(&self, path: &str) -> Result<u16, OrchestratorError> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        Ok(response.status().as_u16())
    }

    /// POST `body` as JSON to `path` and parse the JSON reply.
    ///
    /// An empty success body is treated as `null`.
    pub async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, OrchestratorError> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| OrchestratorError::Protocol {
            server: self.server_name.clone(),
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(OrchestratorError::TransportError {
                server: self.server_name.clone(),
                status: status.as_u16(),
                body: truncate_body(text),
            });
        }

        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }

        serde_json::from_str(&text).map_err(|e| OrchestratorError::Protocol {
            server: self.server_name.clone(),
            reason: format!("response is not valid JSON: {e}"),
        })
    }

    fn unavailable(&self, e: reqwest::Error) -> OrchestratorError {
        OrchestratorError::TransportUnavailable {
            server: self.server_name.clone(),
            reason: e.to_string(),
        }
    }
}

/// Map a logical method onto an HTTP service's path.
pub fn http_endpoint_for(method: &str) -> String {
    HTTP_METHOD_ENDPOINTS
        .iter()
        .find(|(m, _)| *m == method)
        .map(|(_, path)| (*path).to_string())
        .unwrap_or_else(|| format!("/api/{}", method.trim_start_matches('/')))
}

fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...(truncated)");
    }
    body
}

// ─── Tests ───────────────────────────────────────────────────────────────────
