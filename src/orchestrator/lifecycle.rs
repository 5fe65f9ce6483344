//! Service process lifecycle.
//!
//! Spawns service processes, watches them for unexpected exit, and tears
//! them down on request. Each process is owned by exactly one watcher task;
//! everything else talks to it through a [`ProcessGuard`].

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::OrchestratorError;
use super::types::ServiceDefinition;

/// Longest stderr excerpt appended to a start failure.
const MAX_STDERR_SUFFIX: usize = 2000;

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Launch the definition's command.
///
/// The environment overlay is merged onto the orchestrator's own environment.
/// stdout and stderr are always piped; stdin only when `interactive` (stdio
/// transport), otherwise it is closed.
pub fn spawn_process(
    name: &str,
    definition: &ServiceDefinition,
    interactive: bool,
) -> Result<Child, OrchestratorError> {
    let command = definition
        .command
        .as_deref()
        .ok_or_else(|| OrchestratorError::SpawnFailed {
            name: name.to_string(),
            reason: "definition has no command".into(),
        })?;

    let mut cmd = Command::new(command);
    cmd.args(&definition.args);
    cmd.envs(&definition.env);

    if let Some(dir) = &definition.cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(if interactive {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // Backstop for handles dropped without an explicit shutdown.
    cmd.kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| OrchestratorError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{command}: {e}"),
    })?;

    tracing::info!(
        server = name,
        command,
        args = ?definition.args,
        pid = child.id(),
        "spawned service process"
    );

    Ok(child)
}

/// Drain a stream into the log, one `debug` event per line.
///
/// Used for HTTP services, whose output carries no protocol traffic.
pub fn forward_output(name: &str, stream: &'static str, reader: impl AsyncRead + Send + Unpin + 'static) {
    let name = name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    tracing::debug!(server = %name, stream, line = %line, "service output");
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %name, stream, error = %e, "output read failed");
                    break;
                }
            }
        }
    });
}

/// Format a stderr excerpt as an error-message suffix (empty if nothing was captured).
pub fn format_stderr_suffix(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }

    let mut joined = lines.join(" / ");
    if joined.len() > MAX_STDERR_SUFFIX {
        let mut cut = MAX_STDERR_SUFFIX;
        while !joined.is_char_boundary(cut) {
            cut -= 1;
        }
        joined.truncate(cut);
        joined.push_str("...(truncated)");
    }
    format!(" | stderr: {joined}")
}

// ─── ProcessGuard ────────────────────────────────────────────────────────────

/// Owner-side view of a watched child process.
///
/// Dropping the guard without [`terminate`](ProcessGuard::terminate) still
/// kills the process, because the watcher treats a closed kill channel as
/// a kill request.
pub struct ProcessGuard {
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
    watcher: StdMutex<Option<JoinHandle<()>>>,
}

impl ProcessGuard {
    /// Hand `child` to a watcher task.
    ///
    /// `on_exit` runs only if the process dies on its own (crash, EOF-driven
    /// exit), never after a requested termination. [`has_exited`] turns true
    /// before `on_exit` runs.
    ///
    /// [`has_exited`]: ProcessGuard::has_exited
    pub fn watch(name: &str, mut child: Child, on_exit: impl FnOnce() + Send + 'static) -> Self {
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let name = name.to_string();
        let exited = Arc::new(AtomicBool::new(false));
        let exit_flag = Arc::clone(&exited);

        let watcher = tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };

            if outcome.is_some() {
                exit_flag.store(true, Ordering::SeqCst);
            }
            match outcome {
                Some(Ok(status)) => {
                    tracing::warn!(server = %name, pid, status = %status, "service process exited");
                    on_exit();
                }
                Some(Err(e)) => {
                    tracing::warn!(server = %name, pid, error = %e, "failed to wait on service process");
                    on_exit();
                }
                None => {
                    // Already-dead processes make start_kill fail; that's fine.
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(server = %name, pid, error = %e, "kill skipped");
                    }
                    let _ = child.wait().await;
                    tracing::info!(server = %name, pid, "service process terminated");
                }
            }
        });

        Self {
            pid,
            exited,
            kill_tx: StdMutex::new(Some(kill_tx)),
            watcher: StdMutex::new(Some(watcher)),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process died on its own.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Kill the process and wait up to `grace` for it to be reaped.
    ///
    /// Idempotent; later calls return immediately.
    pub async fn terminate(&self, grace: Duration) {
        let kill_tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = kill_tx {
            // The watcher may already be gone if the process exited.
            let _ = tx.send(());
        }

        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            if tokio::time::timeout(grace, watcher).await.is_err() {
                tracing::warn!(pid = self.pid, "service process not reaped within grace period");
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
