//! Multi-transport service orchestrator.
//!
//! Spawns MCP-style services (stdio child processes or HTTP endpoints),
//! waits for them to become ready, and correlates JSON-RPC replies back to
//! concurrent callers.
//!
//! Layering, leaf to root:
//! - `transport`: stdio line framing and HTTP JSON POSTs
//! - `lifecycle`: process spawn, exit watching, termination
//! - `readiness`: handshake / output / HTTP-poll readiness probes
//! - `dispatcher`: request ids, pending replies, HTTP endpoint mapping
//! - `registry`: definitions, live handles, single-flight start
//! - `client`: the [`McpOrchestrator`] facade

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod lifecycle;
pub mod readiness;
pub mod registry;
pub mod transport;
pub mod types;

pub use client::McpOrchestrator;
pub use config::{OrchestratorConfig, OrchestratorSettings};
pub use errors::OrchestratorError;
pub use registry::{ServiceHandle, ServiceRegistry};
pub use types::{
    CallEnvelope, ReadinessStrategy, ServiceDefinition, ServiceStatus, ServiceSummary,
    TransportKind,
};
