//! Registry client for communicating with the MCP Mesh registry.
//!
//! Handles:
//! - Fast heartbeat checks (HEAD requests)
//! - Full heartbeat/registration (POST requests)
//! - Response parsing for topology updates
//! - Deregistration on shutdown

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::spec::AgentSpec;

/// Errors that can occur during registry communication.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Registry returned error: {status} - {message}")]
    Registry { status: u16, message: String },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Result of a fast heartbeat check (HEAD request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastHeartbeatStatus {
    /// 200 OK - No topology changes
    NoChanges,
    /// 202 Accepted - Topology changed, need full heartbeat
    TopologyChanged,
    /// 410 Gone - Agent unknown, need to re-register
    AgentUnknown,
    /// 503 Service Unavailable - Registry error
    RegistryError,
    /// Network/connection error
    NetworkError,
}

impl FastHeartbeatStatus {
    /// Create status from HTTP status code.
    pub fn from_status_code(code: u16) -> Self {
        match code {
            200 => Self::NoChanges,
            202 => Self::TopologyChanged,
            410 => Self::AgentUnknown,
            503 => Self::RegistryError,
            _ => Self::NetworkError,
        }
    }

    /// Check if full heartbeat is required.
    pub fn requires_full_heartbeat(&self) -> bool {
        matches!(self, Self::TopologyChanged | Self::AgentUnknown)
    }

    /// Check if this is an error state (registry unreachable or failing).
    pub fn is_error(&self) -> bool {
        matches!(self, Self::RegistryError | Self::NetworkError)
    }
}

/// Resolved dependency information from a registry response.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedDependency {
    pub agent_id: String,
    pub endpoint: String,
    pub function_name: String,
    pub capability: String,
    pub status: String,
    #[serde(default)]
    pub ttl: u64,
}

impl ResolvedDependency {
    /// Providers that the dispatcher should act on.
    pub fn is_usable(&self) -> bool {
        self.status == "available" || self.status == "healthy"
    }
}

/// Tool information for LLM-backed tools.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryLlmTool {
    /// Registry returns "name" field for function name
    #[serde(rename = "name")]
    pub function_name: String,
    pub capability: String,
    pub endpoint: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Option<Value>,
}

/// Resolved LLM provider information.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedLlmProvider {
    pub agent_id: String,
    pub endpoint: String,
    /// Registry returns "name" field for function name
    #[serde(rename = "name")]
    pub function_name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Full heartbeat response from the registry.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    #[serde(default)]
    pub message: String,
    pub agent_id: String,
    /// Resolved providers, keyed by the requesting function
    #[serde(default)]
    pub dependencies_resolved: HashMap<String, Vec<ResolvedDependency>>,
    /// Tools visible to each LLM function, keyed by function id
    #[serde(default)]
    pub llm_tools: HashMap<String, Vec<RegistryLlmTool>>,
    /// Resolved LLM providers, keyed by function id
    #[serde(default)]
    pub llm_providers: HashMap<String, ResolvedLlmProvider>,
}

/// Tool registration for a heartbeat request.
#[derive(Debug, Clone, Serialize)]
pub struct ToolRegistration {
    pub function_name: String,
    pub capability: String,
    pub version: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyRegistration>,
    #[serde(rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_filter: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_provider: Option<Value>,
}

/// Dependency registration for a heartbeat request.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyRegistration {
    pub capability: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Full heartbeat request body.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub name: String,
    pub version: String,
    pub agent_type: String,
    pub http_host: String,
    pub http_port: u16,
    pub namespace: String,
    pub status: String,
    pub tools: Vec<ToolRegistration>,
}

impl HeartbeatRequest {
    /// Create a heartbeat request from an AgentSpec.
    pub fn from_spec(spec: &AgentSpec) -> Self {
        let tools: Vec<ToolRegistration> = spec
            .tools
            .iter()
            .map(|t| ToolRegistration {
                function_name: t.function_name.clone(),
                capability: t.capability.clone(),
                version: t.version.clone(),
                tags: t.tags.clone(),
                description: if t.description.is_empty() {
                    None
                } else {
                    Some(t.description.clone())
                },
                dependencies: t
                    .dependencies
                    .iter()
                    .map(|d| DependencyRegistration {
                        capability: d.capability.clone(),
                        tags: d.tags.clone(),
                        version: d.version.clone(),
                    })
                    .collect(),
                input_schema: t.input_schema.clone(),
                llm_filter: t.llm_filter.clone(),
                llm_provider: t.llm_provider.clone(),
            })
            .collect();

        Self {
            agent_id: spec.agent_id.clone(),
            name: spec.name.clone(),
            version: spec.version.clone(),
            agent_type: spec.agent_type.as_api_str().to_string(),
            http_host: spec.http_host.clone(),
            http_port: spec.http_port,
            namespace: spec.namespace.clone(),
            status: "healthy".to_string(),
            tools,
        }
    }
}

/// Client for communicating with the MCP Mesh registry.
pub struct RegistryClient {
    client: Client,
    base_url: String,
}

impl RegistryClient {
    /// Create a new registry client.
    pub fn new(registry_url: &str) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        // Normalize URL (remove trailing slash)
        let base_url = registry_url.trim_end_matches('/').to_string();

        Ok(Self { client, base_url })
    }

    /// Perform a fast heartbeat check (HEAD request).
    ///
    /// Returns the status indicating whether a full heartbeat is needed.
    pub async fn fast_heartbeat_check(&self, agent_id: &str) -> FastHeartbeatStatus {
        let url = format!("{}/heartbeat/{}", self.base_url, agent_id);

        trace!("Sending fast heartbeat HEAD request to {}", url);

        match self.client.head(&url).send().await {
            Ok(response) => {
                let status = FastHeartbeatStatus::from_status_code(response.status().as_u16());
                debug!(
                    "Fast heartbeat for agent '{}': HTTP {} -> {:?}",
                    agent_id,
                    response.status().as_u16(),
                    status
                );
                status
            }
            Err(e) => {
                warn!("Fast heartbeat failed for agent '{}': {}", agent_id, e);
                FastHeartbeatStatus::NetworkError
            }
        }
    }

    /// Send a full heartbeat (POST request).
    ///
    /// Returns the response with resolved dependencies and LLM topology.
    pub async fn send_heartbeat(
        &self,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, RegistryError> {
        let url = format!("{}/heartbeat", self.base_url);

        debug!("Sending full heartbeat for agent '{}'", request.agent_id);
        trace!("Heartbeat request: {:?}", request);

        let response = self.client.post(&url).json(request).send().await?;
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            let parsed: HeartbeatResponse = serde_json::from_str(&body)?;

            debug!(
                "Heartbeat successful for agent '{}': {} dependency groups, {} LLM tool sets, {} LLM providers",
                request.agent_id,
                parsed.dependencies_resolved.len(),
                parsed.llm_tools.len(),
                parsed.llm_providers.len()
            );

            Ok(parsed)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(RegistryError::Registry {
                status: status.as_u16(),
                message: body,
            })
        }
    }

    /// Send initial registration (same as heartbeat but first time).
    pub async fn register(&self, spec: &AgentSpec) -> Result<HeartbeatResponse, RegistryError> {
        let request = HeartbeatRequest::from_spec(spec);
        self.send_heartbeat(&request).await
    }

    /// Unregister an agent from the registry (DELETE request).
    ///
    /// Called during graceful shutdown so dependent agents see the topology
    /// change immediately instead of waiting for the heartbeat timeout.
    pub async fn unregister_agent(&self, agent_id: &str) -> Result<(), RegistryError> {
        let url = format!("{}/agents/{}", self.base_url, agent_id);

        info!("Unregistering agent '{}' from registry", agent_id);

        match self.client.delete(&url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.as_u16() == 404 {
                    // 200/204 = success, 404 = already gone (both are fine)
                    debug!(
                        "Agent '{}' unregistered (HTTP {})",
                        agent_id,
                        status.as_u16()
                    );
                    Ok(())
                } else {
                    let body = response.text().await.unwrap_or_default();
                    warn!(
                        "Failed to unregister agent '{}': HTTP {} - {}",
                        agent_id,
                        status.as_u16(),
                        body
                    );
                    Err(RegistryError::Registry {
                        status: status.as_u16(),
                        message: body,
                    })
                }
            }
            Err(e) => {
                warn!("Network error unregistering agent '{}': {}", agent_id, e);
                // Don't fail shutdown due to network error
                Err(RegistryError::Network(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentDescriptor;
    use crate::spec::{AgentType, DependencySpec, ToolSpec};
    use serde_json::json;

    fn descriptor() -> AgentDescriptor {
        AgentDescriptor {
            agent_id: "test-agent-0a1b2c3d".to_string(),
            name: "test-agent".to_string(),
            version: "1.0.0".to_string(),
            description: "Test".to_string(),
            http_host: "localhost".to_string(),
            http_port: 9000,
            namespace: "default".to_string(),
            registry_url: "http://localhost:8000".to_string(),
            heartbeat_interval: 5,
            agent_type: AgentType::McpAgent,
        }
    }

    #[test]
    fn test_fast_heartbeat_status_from_code() {
        assert_eq!(
            FastHeartbeatStatus::from_status_code(200),
            FastHeartbeatStatus::NoChanges
        );
        assert_eq!(
            FastHeartbeatStatus::from_status_code(202),
            FastHeartbeatStatus::TopologyChanged
        );
        assert_eq!(
            FastHeartbeatStatus::from_status_code(410),
            FastHeartbeatStatus::AgentUnknown
        );
        assert_eq!(
            FastHeartbeatStatus::from_status_code(503),
            FastHeartbeatStatus::RegistryError
        );
        assert_eq!(
            FastHeartbeatStatus::from_status_code(500),
            FastHeartbeatStatus::NetworkError
        );
    }

    #[test]
    fn test_fast_heartbeat_status_decisions() {
        assert!(!FastHeartbeatStatus::NoChanges.requires_full_heartbeat());
        assert!(FastHeartbeatStatus::TopologyChanged.requires_full_heartbeat());
        assert!(FastHeartbeatStatus::AgentUnknown.requires_full_heartbeat());
        assert!(FastHeartbeatStatus::NetworkError.is_error());
        assert!(FastHeartbeatStatus::RegistryError.is_error());
        assert!(!FastHeartbeatStatus::NoChanges.is_error());
    }

    #[test]
    fn test_heartbeat_request_from_spec() {
        let mut tool = ToolSpec::new("greet", "greeting");
        tool.description = "Greeting tool".to_string();
        tool.tags = vec!["utility".to_string()];
        tool.dependencies = vec![DependencySpec::new(
            "date-service",
            vec!["+fast".to_string()],
            None,
        )];
        tool.input_schema = Some(json!({"type": "object"}));

        let spec = AgentSpec::from_descriptor(&descriptor(), vec![tool]);
        let request = HeartbeatRequest::from_spec(&spec);

        assert_eq!(request.agent_id, "test-agent-0a1b2c3d");
        assert_eq!(request.agent_type, "mcp_agent");
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tools[0].function_name, "greet");
        assert_eq!(request.tools[0].capability, "greeting");
        assert_eq!(request.tools[0].dependencies[0].capability, "date-service");
        assert_eq!(request.tools[0].dependencies[0].tags, vec!["+fast"]);
    }

    #[tokio::test]
    async fn test_send_heartbeat_parses_resolved_dependencies() {
        let mut server = mockito::Server::new_async().await;
        let _m1 = server
            .mock("POST", "/heartbeat")
            .with_body(
                json!({
                    "status": "success",
                    "message": "ok",
                    "agent_id": "test-agent-0a1b2c3d",
                    "dependencies_resolved": {
                        "greet": [{
                            "agent_id": "beta-1",
                            "endpoint": "http://h:9100",
                            "function_name": "hello",
                            "capability": "greeting",
                            "status": "available"
                        }]
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = RegistryClient::new(&server.url()).unwrap();
        let spec = AgentSpec::from_descriptor(&descriptor(), Vec::new());
        let response = client.register(&spec).await.unwrap();

        assert_eq!(response.agent_id, "test-agent-0a1b2c3d");
        let providers = &response.dependencies_resolved["greet"];
        assert_eq!(providers.len(), 1);
        assert!(providers[0].is_usable());
        assert_eq!(providers[0].endpoint, "http://h:9100");
    }

    #[tokio::test]
    async fn test_send_heartbeat_surfaces_registry_error() {
        let mut server = mockito::Server::new_async().await;
        let _m2 = server
            .mock("POST", "/heartbeat")
            .with_status(500)
            .with_body("registry exploded")
            .create_async()
            .await;

        let client = RegistryClient::new(&server.url()).unwrap();
        let spec = AgentSpec::from_descriptor(&descriptor(), Vec::new());
        let err = client.register(&spec).await.unwrap_err();
        assert!(matches!(err, RegistryError::Registry { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_unregister_tolerates_404() {
        let mut server = mockito::Server::new_async().await;
        let _m3 = server
            .mock("DELETE", "/agents/test-agent-0a1b2c3d")
            .with_status(404)
            .create_async()
            .await;

        let client = RegistryClient::new(&server.url()).unwrap();
        client.unregister_agent("test-agent-0a1b2c3d").await.unwrap();
    }
}
