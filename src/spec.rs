//! Agent specification types for MCP Mesh.
//!
//! These types describe what an agent provides and consumes: tools with
//! capabilities, ordered dependency slots, and per-slot proxy configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Specification for a dependency required by a tool.
///
/// The position of a spec within a tool's dependency list is its identity:
/// resolution and injection are keyed by `(tool, slot index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Capability name to depend on
    pub capability: String,

    /// Tags for filtering (e.g., ["+fast", "-deprecated"])
    #[serde(default)]
    pub tags: Vec<String>,

    /// Version constraint (e.g., ">=2.0.0")
    #[serde(default)]
    pub version: Option<String>,
}

impl DependencySpec {
    pub fn new(capability: impl Into<String>, tags: Vec<String>, version: Option<String>) -> Self {
        Self {
            capability: capability.into(),
            tags,
            version,
        }
    }

    /// Canonicalize a raw dependency declaration.
    ///
    /// Accepts either a bare capability string or a full object with
    /// `capability`, `tags`, and `version` fields.
    pub fn normalize(raw: &Value) -> Option<Self> {
        match raw {
            Value::String(capability) => Some(Self::new(capability.clone(), Vec::new(), None)),
            Value::Object(_) => serde_json::from_value(raw.clone()).ok(),
            _ => None,
        }
    }
}

impl From<&str> for DependencySpec {
    fn from(capability: &str) -> Self {
        Self::new(capability, Vec::new(), None)
    }
}

/// Per-slot proxy configuration, attached to a dependency at declaration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyKwargs {
    /// Request deadline in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Attempts per call; retries apply to transport errors only
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,

    /// Whether the slot expects a streaming-capable endpoint
    #[serde(default)]
    pub streaming: bool,

    /// Whether calls must carry a session
    #[serde(default)]
    pub session_required: bool,
}

fn default_timeout() -> u64 {
    30
}

fn default_attempts() -> u32 {
    1
}

impl Default for ProxyKwargs {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            max_attempts: default_attempts(),
            streaming: false,
            session_required: false,
        }
    }
}

/// Specification for a tool/capability provided by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Function name in the code
    pub function_name: String,

    /// Capability name for discovery
    pub capability: String,

    /// Version of this capability
    pub version: String,

    /// Tags for filtering
    #[serde(default)]
    pub tags: Vec<String>,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Dependencies required by this tool, in slot order
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,

    /// Per-slot proxy configuration, aligned with `dependencies` by index.
    /// Missing entries take [`ProxyKwargs::default`].
    #[serde(default)]
    pub dependency_kwargs: Vec<ProxyKwargs>,

    /// JSON Schema for input parameters (MCP format)
    #[serde(default)]
    pub input_schema: Option<Value>,

    /// LLM tool filter (for LLM-backed tools)
    #[serde(default)]
    pub llm_filter: Option<Value>,

    /// LLM provider selector (for LLM-backed tools)
    #[serde(default)]
    pub llm_provider: Option<Value>,
}

impl ToolSpec {
    pub fn new(function_name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            capability: capability.into(),
            version: "1.0.0".to_string(),
            tags: Vec::new(),
            description: String::new(),
            dependencies: Vec::new(),
            dependency_kwargs: Vec::new(),
            input_schema: None,
            llm_filter: None,
            llm_provider: None,
        }
    }

    /// Proxy kwargs for a dependency slot, defaulted when not declared.
    pub fn kwargs_for_slot(&self, index: usize) -> ProxyKwargs {
        self.dependency_kwargs.get(index).cloned().unwrap_or_default()
    }
}

/// Agent type for registration with the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// MCP agent that provides capabilities (tools) to the mesh
    #[default]
    McpAgent,
    /// API service that only consumes capabilities (HTTP routes)
    Api,
}

impl AgentType {
    /// Convert to registry API string format.
    pub fn as_api_str(&self) -> &'static str {
        match self {
            Self::McpAgent => "mcp_agent",
            Self::Api => "api",
        }
    }
}

/// Complete specification submitted to the registry on heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Stable agent identifier (`{name}-{8 hex}`)
    pub agent_id: String,

    /// Agent name
    pub name: String,

    /// Agent version (semver)
    pub version: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Registry URL (e.g., "http://localhost:8000")
    pub registry_url: String,

    /// HTTP port for this agent (0 = not serving)
    pub http_port: u16,

    /// HTTP host announced to registry
    pub http_host: String,

    /// Namespace for isolation
    pub namespace: String,

    /// Agent type: provides capabilities or only consumes them
    #[serde(default)]
    pub agent_type: AgentType,

    /// Tools/capabilities provided by this agent
    #[serde(default)]
    pub tools: Vec<ToolSpec>,

    /// Heartbeat interval in seconds
    pub heartbeat_interval: u64,
}

impl AgentSpec {
    /// Build a spec from a resolved descriptor and tool list.
    pub fn from_descriptor(
        descriptor: &crate::config::AgentDescriptor,
        tools: Vec<ToolSpec>,
    ) -> Self {
        Self {
            agent_id: descriptor.agent_id.clone(),
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            description: descriptor.description.clone(),
            registry_url: descriptor.registry_url.clone(),
            http_port: descriptor.http_port,
            http_host: descriptor.http_host.clone(),
            namespace: descriptor.namespace.clone(),
            agent_type: descriptor.agent_type,
            tools,
            heartbeat_interval: descriptor.heartbeat_interval,
        }
    }

    /// All distinct dependency capabilities declared across tools.
    pub fn all_dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = self
            .tools
            .iter()
            .flat_map(|t| t.dependencies.iter().map(|d| d.capability.clone()))
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }
}

/// Content digest of a tool list, used for smart heartbeat diffing.
///
/// Two tool lists with the same digest carry the same registration content;
/// generated identifiers (agent id) are deliberately outside the digest.
pub fn tool_list_digest(tools: &[ToolSpec]) -> String {
    let canonical = serde_json::to_vec(tools).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}
