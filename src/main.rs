//! `mcp-orchestrator` command-line entry point.
//!
//! Loads the service config, runs one command against a fresh orchestrator,
//! prints the result as JSON on stdout, and stops every service it started.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use mcp_orchestrator::orchestrator::config;
use mcp_orchestrator::{init_tracing, LogFormat, McpOrchestrator, OrchestratorConfig};

/// Start MCP services and call them from the command line.
#[derive(Parser, Debug)]
#[command(name = "mcp-orchestrator", version, about, disable_help_subcommand = true)]
struct Cli {
    /// Service config file. Defaults to `$MCP_ORCHESTRATOR_CONFIG`, then the
    /// nearest `mcp-services.yaml` above the working directory.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Directory for `orchestrator.log`. Defaults to the platform data dir.
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
    /// Log line format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Lists configured services and whether they are running.
    List,
    /// Starts services and prints their status.
    Start {
        /// Service names.
        #[arg(required = true, value_name = "SERVICE")]
        services: Vec<String>,
    },
    /// Calls a method on a service, starting it first if needed.
    Call {
        service: String,
        method: String,
        /// JSON params object.
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_dir.as_deref(), cli.log_format)
        .context("failed to initialise logging")?;

    let config = resolve_config(cli.config.as_deref())?;
    let orchestrator = McpOrchestrator::from_config(config)?;

    let outcome = run(&orchestrator, cli.command).await;
    orchestrator.shutdown_all().await;

    let output = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let cwd = std::env::current_dir().context("failed to read working directory")?;
            config::find_config_path(&cwd)
        }
    };

    match path {
        Some(path) => config::load_config(&path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            tracing::info!("no config file found, using built-in services");
            Ok(OrchestratorConfig::default())
        }
    }
}

async fn run(
    orchestrator: &McpOrchestrator,
    command: CliCommand,
) -> anyhow::Result<serde_json::Value> {
    match command {
        CliCommand::List => Ok(serde_json::to_value(orchestrator.services())?),
        CliCommand::Start { services } => {
            let mut started = serde_json::Map::new();
            for name in services {
                let status = orchestrator.start(&name).await?;
                started.insert(name, serde_json::to_value(status)?);
            }
            Ok(serde_json::Value::Object(started))
        }
        CliCommand::Call {
            service,
            method,
            params,
        } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("--params is not valid JSON")?;
            let envelope = orchestrator.call(&service, &method, params).await?;
            Ok(serde_json::to_value(envelope)?)
        }
    }
}
