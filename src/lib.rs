pub mod orchestrator;

use std::path::{Path, PathBuf};

pub use orchestrator::{
    CallEnvelope, McpOrchestrator, OrchestratorConfig, OrchestratorError, OrchestratorSettings,
    ReadinessStrategy, ServiceDefinition, ServiceStatus, ServiceSummary, TransportKind,
};

/// Name of the log file inside the log directory.
pub const LOG_FILE_NAME: &str = "orchestrator.log";

/// Rotated log generations kept alongside the live file.
const LOG_KEEP: u32 = 3;

/// Return the platform-standard data directory for the orchestrator.
///
/// - macOS: `~/Library/Application Support/mcp-orchestrator/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-orchestrator\`
/// - Linux: `$XDG_DATA_HOME/mcp-orchestrator/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-orchestrator/` only if none of the above resolve.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-orchestrator");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-orchestrator")
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Initialize the tracing subscriber, writing to `orchestrator.log`.
///
/// On each startup:
/// 1. Rotates existing logs (orchestrator.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the log path for discoverability.
///
/// `log_dir` defaults to [`data_dir`]. Returns the log file path.
pub fn init_tracing(log_dir: Option<&Path>, format: LogFormat) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = log_dir.map(Path::to_path_buf).unwrap_or_else(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, LOG_KEEP);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let writer = FlushingWriter::new(log_file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_orchestrator=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = installed {
        return Err(std::io::Error::other(format!(
            "failed to install tracing subscriber: {e}"
        )));
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== mcp-orchestrator starting ==="
    );

    Ok(log_path)
}

/// Rotate log files: `orchestrator.log` → `.1` → `.2` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A file writer that flushes after every write, so log lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_log_file_shifts_generations() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&base, "current").unwrap();
        std::fs::write(dir.path().join("orchestrator.log.1"), "one").unwrap();
        std::fs::write(dir.path().join("orchestrator.log.3"), "three").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |suffix: &str| {
            std::fs::read_to_string(dir.path().join(format!("orchestrator.log.{suffix}"))).unwrap()
        };
        assert_eq!(read("1"), "current");
        assert_eq!(read("2"), "one");
        assert!(!dir.path().join("orchestrator.log.3").exists());
    }

    #[test]
    fn test_rotate_log_file_without_existing_logs() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        rotate_log_file(&base, 3);
        assert!(!base.exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn test_data_dir_is_namespaced() {
        assert!(data_dir().ends_with("mcp-orchestrator") || data_dir().ends_with(".mcp-orchestrator"));
    }
}
