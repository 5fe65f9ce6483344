//! Orchestrator configuration loading.
//!
//! Reads `mcp-services.yaml` (JSON is accepted too) and resolves environment
//! variables. Timeouts live here as the single source of truth; a service
//! definition may override its own readiness and request windows.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::OrchestratorError;
use super::types::{ServiceDefinition, TransportKind};

/// File name searched for when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "mcp-services.yaml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCP_ORCHESTRATOR_CONFIG";

// ─── Settings ────────────────────────────────────────────────────────────────

/// Global timing knobs. All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Window for a correlated reply to a single call.
    pub request_timeout_ms: u64,
    pub stdio_readiness_timeout_ms: u64,
    pub http_readiness_timeout_ms: u64,
    /// How long one handshake attempt waits before it is re-sent.
    pub handshake_retry_ms: u64,
    /// Delay before the first HTTP probe, to let the process bind its port.
    pub http_grace_ms: u64,
    pub http_poll_interval_ms: u64,
    /// Probed in order; any status below 500 means ready.
    pub http_probe_paths: Vec<String>,
    /// How long to wait for a killed process to be reaped.
    pub shutdown_grace_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            stdio_readiness_timeout_ms: 10_000,
            http_readiness_timeout_ms: 15_000,
            handshake_retry_ms: 1_000,
            http_grace_ms: 1_000,
            http_poll_interval_ms: 500,
            http_probe_paths: vec!["/health".into(), "/".into(), "/api".into()],
            shutdown_grace_ms: 5_000,
        }
    }
}

impl OrchestratorSettings {
    /// Request window for a service, honouring its override.
    pub fn request_timeout(&self, definition: &ServiceDefinition) -> Duration {
        Duration::from_millis(
            definition
                .request_timeout_ms
                .unwrap_or(self.request_timeout_ms),
        )
    }

    /// Readiness window for a service, honouring its override.
    pub fn readiness_timeout(&self, definition: &ServiceDefinition) -> Duration {
        let default = match definition.transport {
            TransportKind::Stdio => self.stdio_readiness_timeout_ms,
            TransportKind::Http => self.http_readiness_timeout_ms,
        };
        Duration::from_millis(definition.readiness_timeout_ms.unwrap_or(default))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// ─── Config File ─────────────────────────────────────────────────────────────

/// Top-level configuration file (mirrors `mcp-services.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub settings: OrchestratorSettings,
    #[serde(default)]
    pub services: HashMap<String, ServiceDefinition>,
    /// Register the built-in catalogue before `services`.
    #[serde(default = "default_include_builtin")]
    pub include_builtin_services: bool,
}

fn default_include_builtin() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            settings: OrchestratorSettings::default(),
            services: HashMap::new(),
            include_builtin_services: true,
        }
    }
}

impl OrchestratorConfig {
    /// Every definition to register at start-up: built-ins first, then the
    /// file's own services, which replace built-ins of the same name.
    pub fn effective_services(&self) -> HashMap<String, ServiceDefinition> {
        let mut merged = if self.include_builtin_services {
            builtin_services()
        } else {
            HashMap::new()
        };
        for (name, definition) in &self.services {
            merged.insert(name.clone(), definition.clone());
        }
        merged
    }
}

// ─── Built-in Catalogue ──────────────────────────────────────────────────────

/// Platform-correct npx command.
///
/// Windows requires `npx.cmd` because `npx` is a batch script.
fn default_npx_command() -> &'static str {
    if cfg!(target_os = "windows") {
        "npx.cmd"
    } else {
        "npx"
    }
}

/// The MCP servers known out of the box.
pub fn builtin_services() -> HashMap<String, ServiceDefinition> {
    let npx = default_npx_command();
    let entries = [
        (
            "context7",
            ServiceDefinition::stdio(npx, &["-y", "@upstash/context7-mcp@latest"])
                .with_description("Official library documentation and code examples")
                .with_capabilities(&["documentation", "library-lookup"]),
        ),
        (
            "sequential",
            ServiceDefinition::stdio(npx, &["-y", "@modelcontextprotocol/server-sequential-thinking"])
                .with_description("Multi-step reasoning and structured analysis")
                .with_capabilities(&["reasoning", "analysis"]),
        ),
        (
            "magic",
            ServiceDefinition::stdio(npx, &["-y", "@21st-dev/magic@latest"])
                .with_description("UI component generation")
                .with_capabilities(&["ui-generation", "components"]),
        ),
        (
            "playwright",
            ServiceDefinition::stdio(npx, &["-y", "@playwright/mcp@latest"])
                .with_description("Browser automation and end-to-end testing")
                .with_capabilities(&["browser", "e2e-testing"]),
        ),
    ];

    entries
        .into_iter()
        .map(|(name, def)| (name.to_string(), def))
        .collect()
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `MCP_ORCHESTRATOR_CONFIG` first, then walks upward from `start`
/// looking for `mcp-services.yaml`. Returns `None` when nothing is found;
/// running on the built-in catalogue alone is fine.
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.exists() {
            return Some(candidate);
        }
        tracing::warn!(
            path = %candidate.display(),
            "{CONFIG_ENV_VAR} points at a missing file, falling back to search"
        );
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Load and parse a configuration file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, OrchestratorError> {
    let raw = std::fs::read_to_string(path).map_err(|e| OrchestratorError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let config = parse_config(&raw)?;

    tracing::info!(
        path = %path.display(),
        services = config.services.len(),
        builtin = config.include_builtin_services,
        "loaded orchestrator config"
    );

    Ok(config)
}

/// Parse configuration text (YAML or JSON).
pub fn parse_config(raw: &str) -> Result<OrchestratorConfig, OrchestratorError> {
    let interpolated = interpolate_env_vars(raw);

    let config: OrchestratorConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| OrchestratorError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    for (name, definition) in &config.services {
        definition.validate(name)?;
    }

    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::types::{ReadinessStrategy, TransportKind};

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TEST_ORCH_NONEXISTENT__");
        let result = interpolate_env_vars("${__TEST_ORCH_NONEXISTENT__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TEST_ORCH_PORT__", "8931");
        let result = interpolate_env_vars("port: ${__TEST_ORCH_PORT__:-1}");
        assert_eq!(result, "port: 8931");
        std::env::remove_var("__TEST_ORCH_PORT__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain: text";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/servers");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/servers"));
    }

    #[test]
    fn test_settings_defaults() {
        let s = OrchestratorSettings::default();
        assert_eq!(s.request_timeout_ms, 30_000);
        assert_eq!(s.stdio_readiness_timeout_ms, 10_000);
        assert_eq!(s.http_readiness_timeout_ms, 15_000);
        assert_eq!(s.http_probe_paths, vec!["/health", "/", "/api"]);
    }

    #[test]
    fn test_per_service_timeout_overrides() {
        let s = OrchestratorSettings::default();
        let plain = ServiceDefinition::stdio("node", &[]);
        assert_eq!(s.request_timeout(&plain), Duration::from_secs(30));
        assert_eq!(s.readiness_timeout(&plain), Duration::from_secs(10));

        let tuned = plain
            .clone()
            .with_request_timeout_ms(1_500)
            .with_readiness_timeout_ms(60_000);
        assert_eq!(s.request_timeout(&tuned), Duration::from_millis(1_500));
        assert_eq!(s.readiness_timeout(&tuned), Duration::from_secs(60));

        let http = ServiceDefinition::http_endpoint("http://localhost:1");
        assert_eq!(s.readiness_timeout(&http), Duration::from_secs(15));
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
            settings:
              request_timeout_ms: 5000
            include_builtin_services: false
            services:
              docs:
                command: node
                args: [docs.js]
                capabilities: [documentation]
                readiness: assume-ready-on-output
              web:
                transport: http
                command: python3
                args: [-m, http.server, "8000"]
                port: 8000
        "#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.settings.request_timeout_ms, 5_000);
        assert_eq!(config.settings.stdio_readiness_timeout_ms, 10_000);
        assert!(!config.include_builtin_services);

        let docs = &config.services["docs"];
        assert_eq!(docs.readiness_strategy(), ReadinessStrategy::AssumeReadyOnOutput);
        assert!(docs.capabilities.contains("documentation"));

        let web = &config.services["web"];
        assert_eq!(web.transport, TransportKind::Http);
        assert_eq!(web.resolved_base_url().as_deref(), Some("http://localhost:8000"));

        assert_eq!(config.effective_services().len(), 2);
    }

    #[test]
    fn test_parse_json_config() {
        let json = r#"{"services": {"local": {"command": "./server", "env": {"DEBUG": "1"}}}}"#;
        let config = parse_config(json).unwrap();
        assert!(config.include_builtin_services);
        assert_eq!(config.services["local"].env["DEBUG"], "1");
    }

    #[test]
    fn test_parse_rejects_invalid_definition() {
        let yaml = "services:\n  broken:\n    transport: http\n";
        assert!(matches!(
            parse_config(yaml),
            Err(OrchestratorError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_effective_services_override_builtin() {
        let mut config = OrchestratorConfig::default();
        config.services.insert(
            "magic".into(),
            ServiceDefinition::stdio("node", &["local-magic.js"]),
        );
        let merged = config.effective_services();
        assert_eq!(merged["magic"].command.as_deref(), Some("node"));
        assert!(merged.contains_key("context7"));
        assert!(merged.contains_key("sequential"));
        assert!(merged.contains_key("playwright"));
    }

    #[test]
    fn test_builtin_services_are_valid() {
        for (name, def) in builtin_services() {
            def.validate(&name).unwrap();
            assert!(!def.capabilities.is_empty(), "{name} has no capabilities");
        }
    }

    #[test]
    fn test_find_config_path_walks_up() {
        let tmp = tempfile::TempDir::new().unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE_NAME), "services: {}\n").unwrap();

        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, tmp.path().join(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/mcp-services.yaml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
