//! Registry event loop - the background task that manages heartbeats and topology.
//!
//! The runtime:
//! - Runs in a background tokio task
//! - Manages the heartbeat state machine
//! - Diffs registry responses and emits position-precise dependency events
//! - Accepts commands (tool updates, port updates, shutdown) from the handle

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::events::{LlmProviderInfo, LlmToolInfo, MeshEvent};
use crate::handle::{HandleState, RuntimeHandle};
use crate::heartbeat::{
    HeartbeatAction, HeartbeatConfig, HeartbeatStateMachine, SessionTransition,
};
use crate::registry::{HeartbeatRequest, HeartbeatResponse, RegistryClient, RegistryError};
use crate::spec::{tool_list_digest, AgentSpec, ToolSpec};

/// Commands sent from the handle to the runtime task.
#[derive(Debug)]
pub enum RuntimeCommand {
    /// Replace the registered tool list; ignored when content is unchanged
    UpdateTools(Vec<ToolSpec>),
    /// Announce a different HTTP port (e.g., after binding port 0)
    UpdatePort(u16),
    /// Begin graceful shutdown
    Shutdown,
}

/// Configuration for the runtime task.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Heartbeat configuration
    pub heartbeat: HeartbeatConfig,
    /// Event channel buffer size
    pub event_buffer_size: usize,
    /// Command channel buffer size
    pub command_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            event_buffer_size: 100,
            command_buffer_size: 16,
        }
    }
}

/// A resolved provider as last reported to consumers.
#[derive(Debug, Clone, PartialEq)]
struct ResolvedTarget {
    endpoint: String,
    function_name: String,
    agent_id: String,
    /// Slot index within the requesting tool's dependency list, when known
    slot: Option<usize>,
}

/// Topology state - tracks what has been announced so far.
#[derive(Debug, Default)]
struct TopologyState {
    /// (requesting function, capability) -> last announced provider
    dependencies: HashMap<(String, String), ResolvedTarget>,
    /// LLM tools per function id
    llm_tools: HashMap<String, Vec<LlmToolInfo>>,
    /// LLM providers per function id
    llm_providers: HashMap<String, LlmProviderInfo>,
}

/// The registry event loop that runs in the background.
pub struct MeshRuntime {
    spec: AgentSpec,
    registry_client: RegistryClient,
    state_machine: HeartbeatStateMachine,
    topology: TopologyState,
    event_tx: mpsc::Sender<MeshEvent>,
    shared_state: Arc<RwLock<HandleState>>,
    command_rx: mpsc::Receiver<RuntimeCommand>,
    /// Digest of the last tool list sent to the registry (smart diffing)
    last_tool_digest: Option<String>,
    /// A command changed registration content; force a full heartbeat
    force_full: bool,
}

/// Start the registry event loop for an agent spec.
///
/// Spawns the background task and returns the handle used to consume events
/// and control the runtime.
pub fn start_runtime(
    spec: AgentSpec,
    config: RuntimeConfig,
) -> Result<RuntimeHandle, RegistryError> {
    let (event_tx, event_rx) = mpsc::channel(config.event_buffer_size);
    let (command_tx, command_rx) = mpsc::channel(config.command_buffer_size);
    let shared_state = Arc::new(RwLock::new(HandleState::default()));

    let runtime = MeshRuntime::new(spec, config, event_tx, shared_state.clone(), command_rx)?;
    tokio::spawn(runtime.run());

    Ok(RuntimeHandle::new(event_rx, shared_state, command_tx))
}

impl MeshRuntime {
    pub fn new(
        spec: AgentSpec,
        config: RuntimeConfig,
        event_tx: mpsc::Sender<MeshEvent>,
        shared_state: Arc<RwLock<HandleState>>,
        command_rx: mpsc::Receiver<RuntimeCommand>,
    ) -> Result<Self, RegistryError> {
        let registry_client = RegistryClient::new(&spec.registry_url)?;
        let heartbeat_config = HeartbeatConfig {
            interval: Duration::from_secs(spec.heartbeat_interval),
            ..config.heartbeat
        };
        let state_machine = HeartbeatStateMachine::new(heartbeat_config);

        Ok(Self {
            spec,
            registry_client,
            state_machine,
            topology: TopologyState::default(),
            event_tx,
            shared_state,
            command_rx,
            last_tool_digest: None,
            force_full: false,
        })
    }

    /// Run the event loop until shutdown.
    pub async fn run(mut self) {
        info!("Starting registry runtime for '{}'", self.spec.agent_id);

        loop {
            // Drain any pending commands before deciding the next action
            while let Ok(command) = self.command_rx.try_recv() {
                self.handle_command(command);
            }

            if self.state_machine.is_shutting_down() {
                self.unregister_from_registry().await;
                break;
            }

            let action = if self.force_full && !self.state_machine.is_shutting_down() {
                self.force_full = false;
                HeartbeatAction::SendFull
            } else {
                self.state_machine.next_action()
            };
            trace!("Next action: {:?}", action);

            match action {
                HeartbeatAction::SendFull => {
                    self.send_full_heartbeat().await;
                }
                HeartbeatAction::SendFast => {
                    self.send_fast_heartbeat().await;
                }
                HeartbeatAction::Wait(duration) => {
                    self.wait_or_command(duration).await;
                }
                HeartbeatAction::Retry { attempt, backoff } => {
                    warn!("Reconnect attempt {} with backoff {:?}", attempt, backoff);
                    self.wait_or_command(backoff).await;
                    if !self.state_machine.is_shutting_down() {
                        self.send_full_heartbeat().await;
                    }
                }
                HeartbeatAction::None => break,
            }
        }

        // Terminal event; after this the handle sees no further events
        let _ = self.event_tx.send(MeshEvent::Shutdown).await;
        info!("Registry runtime for '{}' stopped", self.spec.agent_id);
    }

    fn handle_command(&mut self, command: RuntimeCommand) {
        match command {
            RuntimeCommand::UpdateTools(tools) => {
                let digest = tool_list_digest(&tools);
                if self.last_tool_digest.as_deref() == Some(digest.as_str()) {
                    debug!("Tool list unchanged, skipping registry update");
                    return;
                }
                info!("Tool list changed ({} tools), scheduling full heartbeat", tools.len());
                self.spec.tools = tools;
                self.force_full = true;
            }
            RuntimeCommand::UpdatePort(port) => {
                if self.spec.http_port != port {
                    info!("Announced port changed to {}", port);
                    self.spec.http_port = port;
                    self.force_full = true;
                }
            }
            RuntimeCommand::Shutdown => {
                self.state_machine.shutdown();
            }
        }
    }

    /// Sleep for `duration`, waking early for commands.
    async fn wait_or_command(&mut self, duration: Duration) {
        tokio::select! {
            _ = sleep(duration) => {}
            command = self.command_rx.recv() => {
                match command {
                    Some(command) => self.handle_command(command),
                    // All handles dropped: shut down
                    None => self.state_machine.shutdown(),
                }
            }
        }
    }

    async fn unregister_from_registry(&self) {
        if let Err(e) = self
            .registry_client
            .unregister_agent(&self.spec.agent_id)
            .await
        {
            // Network issues must not block shutdown
            warn!(
                "Failed to unregister agent '{}' (continuing shutdown): {}",
                self.spec.agent_id, e
            );
        }
    }

    async fn send_fast_heartbeat(&mut self) {
        let status = self
            .registry_client
            .fast_heartbeat_check(&self.spec.agent_id)
            .await;

        let (action, transition) = self.state_machine.on_fast_heartbeat_result(status);
        self.emit_transition(transition).await;

        if action == HeartbeatAction::SendFull {
            self.send_full_heartbeat().await;
        }
    }

    async fn send_full_heartbeat(&mut self) {
        let request = HeartbeatRequest::from_spec(&self.spec);
        let first_registration = !self.state_machine.is_registered();

        match self.registry_client.send_heartbeat(&request).await {
            Ok(response) => {
                let transition = self.state_machine.on_full_heartbeat_success();
                self.last_tool_digest = Some(tool_list_digest(&self.spec.tools));

                {
                    let mut state = self.shared_state.write().await;
                    state.agent_id = Some(response.agent_id.clone());
                }

                // Session event precedes topology events from the same response
                self.emit_transition(transition).await;
                if first_registration {
                    let _ = self
                        .event_tx
                        .send(MeshEvent::AgentRegistered {
                            agent_id: self.spec.agent_id.clone(),
                        })
                        .await;
                }

                self.process_heartbeat_response(response).await;
            }
            Err(e) => {
                let transition = self.state_machine.on_full_heartbeat_failure(&e.to_string());
                let _ = self
                    .event_tx
                    .send(MeshEvent::RegistrationFailed {
                        error: e.to_string(),
                    })
                    .await;
                self.emit_transition(transition).await;
            }
        }
    }

    /// Emit session transition events and reset announced topology on loss:
    /// consumers cleared their tables, so recovery must re-announce.
    async fn emit_transition(&mut self, transition: SessionTransition) {
        match transition {
            SessionTransition::None => {}
            SessionTransition::Connected => {
                let _ = self.event_tx.send(MeshEvent::RegistryConnected).await;
            }
            SessionTransition::Lost => {
                self.topology.dependencies.clear();
                {
                    let mut state = self.shared_state.write().await;
                    state.dependencies.clear();
                }
                let _ = self
                    .event_tx
                    .send(MeshEvent::registry_disconnected("registry unreachable"))
                    .await;
            }
        }
    }

    async fn process_heartbeat_response(&mut self, response: HeartbeatResponse) {
        self.process_dependency_changes(&response).await;
        self.process_llm_tools_changes(&response).await;
        self.process_llm_providers_changes(&response).await;
    }

    /// Slot index of `capability` within `function`'s declared dependencies.
    fn slot_for(&self, function: &str, capability: &str) -> Option<usize> {
        self.spec
            .tools
            .iter()
            .find(|t| t.function_name == function)
            .and_then(|t| t.dependencies.iter().position(|d| d.capability == capability))
    }

    async fn process_dependency_changes(&mut self, response: &HeartbeatResponse) {
        // The registry keys providers by the function that NEEDS them; a
        // function may depend on several capabilities at once.
        let mut new_deps: HashMap<(String, String), ResolvedTarget> = HashMap::new();
        for (requesting_function, providers) in &response.dependencies_resolved {
            for provider in providers.iter().filter(|p| p.is_usable()) {
                let slot = self.slot_for(requesting_function, &provider.capability);
                new_deps.insert(
                    (requesting_function.clone(), provider.capability.clone()),
                    ResolvedTarget {
                        endpoint: provider.endpoint.clone(),
                        function_name: provider.function_name.clone(),
                        agent_id: provider.agent_id.clone(),
                        slot,
                    },
                );
            }
        }

        // Removed dependencies
        let removed: Vec<((String, String), ResolvedTarget)> = self
            .topology
            .dependencies
            .iter()
            .filter(|(key, _)| !new_deps.contains_key(*key))
            .map(|(key, target)| (key.clone(), target.clone()))
            .collect();

        // New or changed dependencies
        let mut announced: Vec<((String, String), ResolvedTarget, bool)> = Vec::new();
        for (key, target) in &new_deps {
            match self.topology.dependencies.get(key) {
                Some(old) if old.endpoint == target.endpoint
                    && old.function_name == target.function_name => {}
                Some(_) => announced.push((key.clone(), target.clone(), false)),
                None => announced.push((key.clone(), target.clone(), true)),
            }
        }

        // Batch shared-state update (single lock acquisition)
        if !removed.is_empty() || !announced.is_empty() {
            let mut state = self.shared_state.write().await;
            for ((_, capability), _) in &removed {
                state.dependencies.remove(capability);
            }
            for ((_, capability), target, _) in &announced {
                state
                    .dependencies
                    .insert(capability.clone(), target.endpoint.clone());
            }
        }

        for ((function, capability), target) in removed {
            info!("Dependency '{}' for '{}' removed", capability, function);
            let _ = self
                .event_tx
                .send(MeshEvent::dependency_unavailable(
                    capability.clone(),
                    Some(function.clone()),
                    target.slot,
                ))
                .await;
            self.topology.dependencies.remove(&(function, capability));
        }

        for ((function, capability), target, is_new) in announced {
            if is_new {
                info!(
                    "Dependency '{}' for '{}' available at {} ({})",
                    capability, function, target.endpoint, target.function_name
                );
            } else {
                info!(
                    "Dependency '{}' for '{}' changed to {} ({})",
                    capability, function, target.endpoint, target.function_name
                );
            }

            let event = if is_new {
                MeshEvent::dependency_available(
                    capability.clone(),
                    target.endpoint.clone(),
                    target.function_name.clone(),
                    target.agent_id.clone(),
                    Some(function.clone()),
                    target.slot,
                )
            } else {
                MeshEvent::dependency_changed(
                    capability.clone(),
                    target.endpoint.clone(),
                    target.function_name.clone(),
                    target.agent_id.clone(),
                    Some(function.clone()),
                    target.slot,
                )
            };
            let _ = self.event_tx.send(event).await;

            self.topology
                .dependencies
                .insert((function, capability), target);
        }
    }

    async fn process_llm_tools_changes(&mut self, response: &HeartbeatResponse) {
        for (function_id, tools) in &response.llm_tools {
            let tool_infos: Vec<LlmToolInfo> = tools
                .iter()
                .map(|t| LlmToolInfo {
                    function_name: t.function_name.clone(),
                    capability: t.capability.clone(),
                    endpoint: t.endpoint.clone(),
                    agent_id: t.agent_id.clone(),
                    description: t.description.clone(),
                    input_schema: t.input_schema.clone(),
                })
                .collect();

            let changed = self
                .topology
                .llm_tools
                .get(function_id)
                .map(|old| old != &tool_infos)
                .unwrap_or(true);

            if changed {
                info!(
                    "LLM tools updated for function '{}': {} tools",
                    function_id,
                    tool_infos.len()
                );

                let _ = self
                    .event_tx
                    .send(MeshEvent::LlmToolsUpdated {
                        function_id: function_id.clone(),
                        tools: tool_infos.clone(),
                    })
                    .await;

                self.topology
                    .llm_tools
                    .insert(function_id.clone(), tool_infos);
            }
        }
    }

    async fn process_llm_providers_changes(&mut self, response: &HeartbeatResponse) {
        // Providers that disappeared from the response are gone
        let vanished: Vec<String> = self
            .topology
            .llm_providers
            .keys()
            .filter(|id| !response.llm_providers.contains_key(*id))
            .cloned()
            .collect();
        for function_id in vanished {
            info!("LLM provider for function '{}' unavailable", function_id);
            self.topology.llm_providers.remove(&function_id);
            let _ = self
                .event_tx
                .send(MeshEvent::LlmProviderUnavailable { function_id })
                .await;
        }

        for (function_id, provider) in &response.llm_providers {
            let info = LlmProviderInfo {
                function_id: function_id.clone(),
                agent_id: provider.agent_id.clone(),
                endpoint: provider.endpoint.clone(),
                function_name: provider.function_name.clone(),
                model: provider.model.clone(),
            };

            let changed = self
                .topology
                .llm_providers
                .get(function_id)
                .map(|old| old.endpoint != info.endpoint || old.function_name != info.function_name)
                .unwrap_or(true);

            if changed {
                info!(
                    "LLM provider resolved for function '{}': {} at {}",
                    function_id, info.function_name, info.endpoint
                );

                self.topology
                    .llm_providers
                    .insert(function_id.clone(), info.clone());
                let _ = self
                    .event_tx
                    .send(MeshEvent::LlmProviderAvailable { provider: info })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentDescriptor;
    use crate::spec::AgentType;
    use serde_json::json;

    fn spec_with_tools(registry_url: &str, tools: Vec<ToolSpec>) -> AgentSpec {
        let descriptor = AgentDescriptor {
            agent_id: "alpha-0a1b2c3d".to_string(),
            name: "alpha".to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            http_host: "localhost".to_string(),
            http_port: 9001,
            namespace: "default".to_string(),
            registry_url: registry_url.to_string(),
            heartbeat_interval: 1,
            agent_type: AgentType::McpAgent,
        };
        AgentSpec::from_descriptor(&descriptor, tools)
    }

    fn echo_tool() -> ToolSpec {
        let mut tool = ToolSpec::new("echo", "echo");
        tool.dependencies = vec!["greet".into()];
        tool
    }

    async fn drain_until(
        handle: &RuntimeHandle,
        pred: impl Fn(&MeshEvent) -> bool,
    ) -> Option<MeshEvent> {
        for _ in 0..20 {
            match tokio::time::timeout(Duration::from_secs(2), handle.next_event()).await {
                Ok(Some(event)) => {
                    if pred(&event) {
                        return Some(event);
                    }
                }
                _ => break,
            }
        }
        None
    }

    fn heartbeat_body() -> String {
        json!({
            "status": "success",
            "agent_id": "alpha-0a1b2c3d",
            "dependencies_resolved": {
                "echo": [{
                    "agent_id": "beta-1",
                    "endpoint": "http://h:9100",
                    "function_name": "hello",
                    "capability": "greet",
                    "status": "available"
                }]
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_registration_emits_connected_then_available_with_position() {
        let mut server = mockito::Server::new_async().await;
        let _m1 = server
            .mock("POST", "/heartbeat")
            .with_body(heartbeat_body())
            .create_async()
            .await;
        let _m2 = server
            .mock("HEAD", mockito::Matcher::Regex("^/heartbeat/.*$".to_string()))
            .with_status(200)
            .create_async()
            .await;
        let _m3 = server
            .mock(
                "DELETE",
                mockito::Matcher::Regex("^/agents/.*$".to_string()),
            )
            .with_status(204)
            .create_async()
            .await;

        let spec = spec_with_tools(&server.url(), vec![echo_tool()]);
        let handle = start_runtime(spec, RuntimeConfig::default()).unwrap();

        let connected = handle.next_event().await.unwrap();
        assert_eq!(connected, MeshEvent::RegistryConnected);

        let registered = handle.next_event().await.unwrap();
        assert!(matches!(registered, MeshEvent::AgentRegistered { .. }));

        let available = handle.next_event().await.unwrap();
        assert_eq!(
            available,
            MeshEvent::dependency_available(
                "greet",
                "http://h:9100",
                "hello",
                "beta-1",
                Some("echo".to_string()),
                Some(0),
            )
        );

        handle.shutdown().await;
        assert!(drain_until(&handle, |e| *e == MeshEvent::Shutdown)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_registration_failure_emits_event_and_retries() {
        let mut server = mockito::Server::new_async().await;
        let _m4 = server
            .mock("POST", "/heartbeat")
            .with_status(503)
            .with_body("down")
            .create_async()
            .await;
        let _m5 = server
            .mock(
                "DELETE",
                mockito::Matcher::Regex("^/agents/.*$".to_string()),
            )
            .with_status(204)
            .create_async()
            .await;

        let spec = spec_with_tools(&server.url(), vec![echo_tool()]);
        let handle = start_runtime(spec, RuntimeConfig::default()).unwrap();

        let event = handle.next_event().await.unwrap();
        assert!(matches!(event, MeshEvent::RegistrationFailed { .. }));

        handle.shutdown().await;
        assert!(drain_until(&handle, |e| *e == MeshEvent::Shutdown)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_update_tools_with_same_content_skips_heartbeat() {
        let mut server = mockito::Server::new_async().await;
        // Exactly one full heartbeat despite the redundant update_tools call
        let full = server
            .mock("POST", "/heartbeat")
            .with_body(heartbeat_body())
            .expect(1)
            .create_async()
            .await;
        let _m6 = server
            .mock("HEAD", mockito::Matcher::Regex("^/heartbeat/.*$".to_string()))
            .with_status(200)
            .create_async()
            .await;
        let _m7 = server
            .mock(
                "DELETE",
                mockito::Matcher::Regex("^/agents/.*$".to_string()),
            )
            .with_status(204)
            .create_async()
            .await;

        let tools = vec![echo_tool()];
        let spec = spec_with_tools(&server.url(), tools.clone());
        let handle = start_runtime(spec, RuntimeConfig::default()).unwrap();

        // Wait for registration to complete
        assert!(
            drain_until(&handle, |e| matches!(e, MeshEvent::AgentRegistered { .. }))
                .await
                .is_some()
        );

        // Identical content: smart diffing suppresses the re-registration
        handle.update_tools(tools).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        handle.shutdown().await;
        assert!(drain_until(&handle, |e| *e == MeshEvent::Shutdown)
            .await
            .is_some());
        full.assert_async().await;
    }
}
