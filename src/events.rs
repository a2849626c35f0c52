//! Mesh events emitted by the registry event loop.
//!
//! Events are pushed from the runtime task to the agent dispatcher via an
//! async channel. The union is closed: consumers match on variants, never on
//! string tags.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool visible to an LLM-backed tool under its filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmToolInfo {
    /// Function name of the tool
    pub function_name: String,

    /// Capability name
    pub capability: String,

    /// Endpoint URL to call
    pub endpoint: String,

    /// Agent ID providing this tool
    #[serde(default)]
    pub agent_id: String,

    /// Human-readable description, shown to the model
    #[serde(default)]
    pub description: String,

    /// Input schema for the tool
    #[serde(default)]
    pub input_schema: Option<Value>,
}

/// A resolved LLM provider for a mesh-delegated LLM tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmProviderInfo {
    /// Function ID of the LLM tool that requested this provider
    pub function_id: String,

    /// Agent ID providing this capability
    pub agent_id: String,

    /// Endpoint URL to call
    pub endpoint: String,

    /// Function name to call (typically `process_chat`)
    pub function_name: String,

    /// Model name advertised by the provider
    #[serde(default)]
    pub model: Option<String>,
}

/// Events emitted by the registry event loop.
///
/// Dependency events carry `requesting_function` and `dep_index` when the
/// registry reported a position-precise resolution; consumers fall back to
/// capability matching when they are absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum MeshEvent {
    /// Agent successfully registered with the mesh registry
    AgentRegistered { agent_id: String },

    /// Agent registration failed; the agent keeps serving and retrying
    RegistrationFailed { error: String },

    /// A dependency became available
    DependencyAvailable {
        capability: String,
        endpoint: String,
        function_name: String,
        agent_id: String,
        #[serde(default)]
        requesting_function: Option<String>,
        #[serde(default)]
        dep_index: Option<usize>,
    },

    /// A dependency's endpoint or function changed
    DependencyChanged {
        capability: String,
        endpoint: String,
        function_name: String,
        agent_id: String,
        #[serde(default)]
        requesting_function: Option<String>,
        #[serde(default)]
        dep_index: Option<usize>,
    },

    /// A dependency became unavailable
    DependencyUnavailable {
        capability: String,
        #[serde(default)]
        requesting_function: Option<String>,
        #[serde(default)]
        dep_index: Option<usize>,
    },

    /// Connected (or reconnected) to the registry
    RegistryConnected,

    /// Disconnected from the registry; resolved dependencies are void
    RegistryDisconnected { reason: String },

    /// The set of tools visible to an LLM tool changed
    LlmToolsUpdated {
        function_id: String,
        tools: Vec<LlmToolInfo>,
    },

    /// An LLM provider was resolved for a mesh-delegated LLM tool
    LlmProviderAvailable { provider: LlmProviderInfo },

    /// A previously resolved LLM provider went away
    LlmProviderUnavailable { function_id: String },

    /// The runtime is shutting down; terminal event
    Shutdown,
}

impl MeshEvent {
    pub fn dependency_available(
        capability: impl Into<String>,
        endpoint: impl Into<String>,
        function_name: impl Into<String>,
        agent_id: impl Into<String>,
        requesting_function: Option<String>,
        dep_index: Option<usize>,
    ) -> Self {
        Self::DependencyAvailable {
            capability: capability.into(),
            endpoint: endpoint.into(),
            function_name: function_name.into(),
            agent_id: agent_id.into(),
            requesting_function,
            dep_index,
        }
    }

    pub fn dependency_changed(
        capability: impl Into<String>,
        endpoint: impl Into<String>,
        function_name: impl Into<String>,
        agent_id: impl Into<String>,
        requesting_function: Option<String>,
        dep_index: Option<usize>,
    ) -> Self {
        Self::DependencyChanged {
            capability: capability.into(),
            endpoint: endpoint.into(),
            function_name: function_name.into(),
            agent_id: agent_id.into(),
            requesting_function,
            dep_index,
        }
    }

    pub fn dependency_unavailable(
        capability: impl Into<String>,
        requesting_function: Option<String>,
        dep_index: Option<usize>,
    ) -> Self {
        Self::DependencyUnavailable {
            capability: capability.into(),
            requesting_function,
            dep_index,
        }
    }

    pub fn registry_disconnected(reason: impl Into<String>) -> Self {
        Self::RegistryDisconnected {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_available_event() {
        let event = MeshEvent::dependency_available(
            "date-service",
            "http://localhost:9001",
            "get_date",
            "date-service-abc123",
            Some("report".to_string()),
            Some(0),
        );

        match event {
            MeshEvent::DependencyAvailable {
                capability,
                endpoint,
                dep_index,
                ..
            } => {
                assert_eq!(capability, "date-service");
                assert_eq!(endpoint, "http://localhost:9001");
                assert_eq!(dep_index, Some(0));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_serializes_with_snake_case_tag() {
        let json = serde_json::to_value(MeshEvent::dependency_available(
            "cache", "http://h:1", "get", "a-1", None, None,
        ))
        .unwrap();
        assert_eq!(json["event_type"], "dependency_available");

        let json = serde_json::to_value(MeshEvent::Shutdown).unwrap();
        assert_eq!(json["event_type"], "shutdown");
    }

    #[test]
    fn test_event_deserializes_from_tag() {
        let event: MeshEvent = serde_json::from_str(
            r#"{"event_type":"registry_disconnected","reason":"network error"}"#,
        )
        .unwrap();
        assert_eq!(event, MeshEvent::registry_disconnected("network error"));

        let event: MeshEvent =
            serde_json::from_str(r#"{"event_type":"registry_connected"}"#).unwrap();
        assert_eq!(event, MeshEvent::RegistryConnected);
    }

    #[test]
    fn test_unavailable_without_position_hints() {
        let event: MeshEvent = serde_json::from_str(
            r#"{"event_type":"dependency_unavailable","capability":"cache"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            MeshEvent::dependency_unavailable("cache", None, None)
        );
    }
}
