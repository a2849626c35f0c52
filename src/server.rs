//! MCP server seam.
//!
//! The transport server that accepts JSON-RPC `tools/call` requests is an
//! external collaborator. The agent runtime hands it wrapped tool handlers
//! (dependency injection and tracing already applied) and drives its
//! lifecycle; everything else is the server's business.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::proxy::ProxyError;

/// Error raised by a tool handler. The MCP server encodes it into the
/// JSON-RPC response.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ProxyError> for ToolError {
    fn from(e: ProxyError) -> Self {
        Self::new(e.to_string())
    }
}

/// One inbound tool call as the transport saw it.
#[derive(Debug, Clone, Default)]
pub struct ToolInvocation {
    /// The JSON-RPC `params.arguments` object
    pub arguments: Value,

    /// Transport-level request headers, when the server surfaces them
    pub headers: HashMap<String, String>,
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;

/// A tool handler with injection and tracing already applied.
pub type WrappedTool = Arc<dyn Fn(ToolInvocation) -> ToolFuture + Send + Sync>;

/// A tool as registered with the MCP server.
pub struct ToolRegistration {
    pub name: String,
    pub description: String,
    /// Input schema, already made permissive to trace fields
    pub input_schema: Value,
    pub handler: WrappedTool,
}

/// Errors from the MCP server lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    #[error("server error: {0}")]
    Serve(String),
}

/// The MCP transport server the agent runtime drives.
///
/// Implementations are expected to be stateless per request: one request,
/// one response, no session affinity.
#[async_trait]
pub trait McpServer: Send + Sync + 'static {
    /// Register a tool. Called only before [`serve`](McpServer::serve).
    fn register_tool(&mut self, tool: ToolRegistration);

    /// Bind and serve until [`stop`](McpServer::stop) is called.
    async fn serve(&self, host: &str, port: u16) -> Result<(), ServerError>;

    /// Stop serving and release the listening socket.
    async fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_from_proxy_error() {
        let err: ToolError = ProxyError::Remote("no such tool".to_string()).into();
        assert!(err.message.contains("no such tool"));
    }
}
