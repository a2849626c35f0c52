//! Agent-side runtime for MCP Mesh.
//!
//! An agent registers the tools it exposes with a central registry,
//! declares the capabilities it consumes, and receives the endpoints of
//! live providers as the topology changes. This crate is the runtime that
//! makes that loop work:
//!
//! - [`config`]: ENV > param > default resolution into an agent descriptor
//! - [`runtime`] / [`handle`] / [`heartbeat`] / [`registry`]: the registry
//!   session, dual heartbeats, and the mesh-event stream
//! - [`table`] / [`proxy`]: the dependency table and the JSON-RPC proxies
//!   injected into tool handlers
//! - [`trace`] / [`span`] / [`tracing_publish`]: distributed trace context
//!   and span publication to a Redis stream
//! - [`agent`]: the tool-provider runtime (MCP server seam, DI wrapper,
//!   event dispatch)
//! - [`router`]: the API-consumer variant for HTTP applications
//! - [`llm`]: the LLM tool runtime (agentic loop, vendor handlers,
//!   structured output)

pub mod agent;
pub mod config;
pub mod events;
pub mod handle;
pub mod heartbeat;
pub mod llm;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod server;
pub mod span;
pub mod spec;
pub mod table;
pub mod trace;
pub mod tracing_publish;

pub use agent::{tool_handler, AgentError, MeshAgent, ToolDefinition};
pub use config::{AgentConfig, AgentDescriptor, ConfigError};
pub use events::MeshEvent;
pub use handle::RuntimeHandle;
pub use proxy::{MeshProxy, ProxyError};
pub use router::{route_handler, MeshRouter, RouteDeps};
pub use server::{McpServer, ToolError, ToolInvocation, ToolRegistration};
pub use spec::{AgentSpec, AgentType, DependencySpec, ProxyKwargs, ToolSpec};
pub use table::DependencyTable;
pub use trace::TraceContext;

/// Initialize tracing-subscriber logging from `RUST_LOG`, defaulting to
/// `info`. Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
