//! Agent runtime, tool-provider variant.
//!
//! Owns the MCP server seam, the registered tools, and the dependency
//! table. Wraps each tool's execute with positional dependency injection,
//! trace-context scoping, and span publication, and dispatches mesh events
//! into the dependency table.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{resolve_descriptor, AgentConfig, AgentDescriptor, ConfigError};
use crate::events::MeshEvent;
use crate::llm::LlmTopology;
use crate::proxy::MeshProxy;
use crate::registry::RegistryError;
use crate::runtime::{start_runtime, RuntimeConfig};
use crate::server::{
    McpServer, ServerError, ToolError, ToolFuture, ToolInvocation, ToolRegistration, WrappedTool,
};
use crate::span::{unix_now, AgentMetadata, SpanRecord};
use crate::spec::{AgentSpec, AgentType, DependencySpec, ProxyKwargs, ToolSpec};
use crate::table::DependencyTable;
use crate::trace::{
    collect_propagated_headers, generate_span_id, parse_trace_headers, with_propagated_headers,
    with_trace_context, TraceContext, MESH_HEADERS_FIELD, PARENT_SPAN_FIELD, TRACE_ID_FIELD,
};
use crate::tracing_publish::{init_trace_publisher, publish_span};

/// Errors from the agent lifecycle. Fatal at start.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("duplicate tool '{0}'")]
    DuplicateTool(String),

    #[error("dependency declaration {index} of tool '{tool}' is not a capability")]
    InvalidDependency { tool: String, index: usize },
}

/// User tool handler: cleaned arguments plus the positional dependency
/// array, one entry per declared slot, `None` for unresolved slots.
pub type ToolHandler =
    Arc<dyn Fn(Value, Vec<Option<Arc<MeshProxy>>>) -> ToolFuture + Send + Sync>;

/// Adapt an async closure into a [`ToolHandler`].
pub fn tool_handler<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(Value, Vec<Option<Arc<MeshProxy>>>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    Arc::new(move |args, deps| Box::pin(f(args, deps)))
}

/// A tool as declared by the caller.
pub struct ToolDefinition {
    pub function_name: String,
    pub capability: String,
    pub version: String,
    pub tags: Vec<String>,
    pub description: String,
    /// JSON Schema for the tool's parameters
    pub input_schema: Option<Value>,
    /// Raw dependency declarations: bare capability strings or full objects
    pub dependencies: Vec<Value>,
    /// Per-slot proxy configuration, aligned by index
    pub dependency_kwargs: Vec<ProxyKwargs>,
    /// LLM tool filter, registered for registry-side evaluation
    pub llm_filter: Option<Value>,
    /// LLM provider selector (see [`crate::llm::ProviderSpec::registration_value`])
    pub llm_provider: Option<Value>,
    pub handler: ToolHandler,
}

impl ToolDefinition {
    pub fn new(
        function_name: impl Into<String>,
        capability: impl Into<String>,
        handler: ToolHandler,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            capability: capability.into(),
            version: "1.0.0".to_string(),
            tags: Vec::new(),
            description: String::new(),
            input_schema: None,
            dependencies: Vec::new(),
            dependency_kwargs: Vec::new(),
            llm_filter: None,
            llm_provider: None,
            handler,
        }
    }
}

struct ToolEntry {
    spec: ToolSpec,
    handler: ToolHandler,
}

/// The tool-provider agent runtime.
///
/// Construction resolves the descriptor and allocates the agent id; tools
/// are added before [`run`](MeshAgent::run), which blocks until shutdown.
pub struct MeshAgent {
    descriptor: AgentDescriptor,
    tools: Vec<ToolEntry>,
    table: Arc<DependencyTable>,
    llm_topology: LlmTopology,
}

impl MeshAgent {
    /// Resolve config and allocate the agent identity.
    pub fn new(config: AgentConfig) -> Result<Self, ConfigError> {
        let descriptor = resolve_descriptor(&config, AgentType::McpAgent)?;
        info!(
            "Agent '{}' created (endpoint {})",
            descriptor.agent_id,
            descriptor.endpoint()
        );

        Ok(Self {
            descriptor,
            tools: Vec::new(),
            table: Arc::new(DependencyTable::new()),
            llm_topology: LlmTopology::new(),
        })
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// The live dependency table, shared with wrapped handlers.
    pub fn dependency_table(&self) -> Arc<DependencyTable> {
        self.table.clone()
    }

    /// Shared LLM topology (tool lists and providers per LLM function),
    /// updated by the event dispatcher.
    pub fn llm_topology(&self) -> LlmTopology {
        self.llm_topology.clone()
    }

    /// Register a tool.
    ///
    /// Normalizes dependency declarations and stores the spec; the wrapped
    /// execute is built at start. `run` consumes the agent, so tools cannot
    /// be added after start by construction.
    pub fn add_tool(&mut self, def: ToolDefinition) -> Result<(), AgentError> {
        if self
            .tools
            .iter()
            .any(|t| t.spec.function_name == def.function_name)
        {
            return Err(AgentError::DuplicateTool(def.function_name));
        }

        let mut dependencies = Vec::with_capacity(def.dependencies.len());
        for (index, raw) in def.dependencies.iter().enumerate() {
            let spec =
                DependencySpec::normalize(raw).ok_or_else(|| AgentError::InvalidDependency {
                    tool: def.function_name.clone(),
                    index,
                })?;
            dependencies.push(spec);
        }

        let spec = ToolSpec {
            function_name: def.function_name,
            capability: def.capability,
            version: def.version,
            tags: def.tags,
            description: def.description,
            dependencies,
            dependency_kwargs: def.dependency_kwargs,
            input_schema: def.input_schema,
            llm_filter: def.llm_filter,
            llm_provider: def.llm_provider,
        };

        debug!(
            "Tool '{}' registered with {} dependency slots",
            spec.function_name,
            spec.dependencies.len()
        );
        self.tools.push(ToolEntry {
            spec,
            handler: def.handler,
        });
        Ok(())
    }

    /// Start everything and block until shutdown.
    ///
    /// In order: initialize tracing, start the MCP server, start the
    /// registry runtime, install signal handlers, then drive the event
    /// dispatcher until the terminal shutdown event.
    pub async fn run<S: McpServer>(self, mut server: S) -> Result<(), AgentError> {
        let metadata = AgentMetadata::from_descriptor(&self.descriptor);
        init_trace_publisher(metadata.clone()).await;

        for entry in &self.tools {
            server.register_tool(build_registration(
                entry,
                self.table.clone(),
                metadata.clone(),
            ));
        }

        let server = Arc::new(server);
        let serve_task = if self.descriptor.http_port > 0 {
            let server = server.clone();
            let port = self.descriptor.http_port;
            Some(tokio::spawn(async move {
                // Stateless mode, all interfaces
                if let Err(e) = server.serve("0.0.0.0", port).await {
                    error!("MCP server failed: {}", e);
                }
            }))
        } else {
            debug!("Port 0 configured: not serving");
            None
        };

        let tool_specs: Vec<ToolSpec> = self.tools.iter().map(|t| t.spec.clone()).collect();
        let spec = AgentSpec::from_descriptor(&self.descriptor, tool_specs.clone());
        let handle = Arc::new(start_runtime(spec, RuntimeConfig::default())?);

        install_signal_handlers(handle.clone());

        while let Some(event) = handle.next_event().await {
            if event == MeshEvent::Shutdown {
                info!("Shutdown event received, stopping agent");
                break;
            }
            dispatch_event(&self.table, &tool_specs, &self.llm_topology, event);
        }

        server.stop().await;
        if let Some(task) = serve_task {
            task.abort();
        }

        Ok(())
    }
}

/// Shut down the runtime on SIGINT/SIGTERM, once.
pub(crate) fn install_signal_handlers(handle: Arc<crate::handle::RuntimeHandle>) {
    tokio::spawn(async move {
        let interrupted = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            {
                Ok(term) => term,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    interrupted.await;
                    handle.shutdown().await;
                    return;
                }
            };
            tokio::select! {
                _ = interrupted => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        interrupted.await;

        info!("Termination signal received, shutting down");
        handle.shutdown().await;
    });
}

/// Apply one mesh event to the dependency table and LLM topology.
///
/// Errors here are logged, never fatal: the dispatcher outlives bad events.
pub(crate) fn dispatch_event(
    table: &DependencyTable,
    tools: &[ToolSpec],
    llm_topology: &LlmTopology,
    event: MeshEvent,
) {
    match event {
        MeshEvent::DependencyAvailable {
            capability,
            endpoint,
            function_name,
            agent_id: _,
            requesting_function,
            dep_index,
        }
        | MeshEvent::DependencyChanged {
            capability,
            endpoint,
            function_name,
            agent_id: _,
            requesting_function,
            dep_index,
        } => {
            for (tool, slot) in matching_slots(tools, &capability, &requesting_function, dep_index)
            {
                let kwargs = tool.kwargs_for_slot(slot);
                let proxy = Arc::new(MeshProxy::new(
                    endpoint.clone(),
                    capability.clone(),
                    function_name.clone(),
                    &kwargs,
                ));
                debug!(
                    "Injecting '{}' into ({}, {}) -> {}",
                    capability, tool.function_name, slot, endpoint
                );
                table.set(&tool.function_name, slot, proxy);
            }
        }
        MeshEvent::DependencyUnavailable {
            capability,
            requesting_function,
            dep_index,
        } => {
            for (tool, slot) in matching_slots(tools, &capability, &requesting_function, dep_index)
            {
                debug!(
                    "Removing '{}' from ({}, {})",
                    capability, tool.function_name, slot
                );
                table.remove(&tool.function_name, slot);
            }
        }
        MeshEvent::RegistryDisconnected { reason } => {
            warn!("Registry disconnected ({}), clearing dependency table", reason);
            table.clear_all();
        }
        MeshEvent::RegistryConnected => {
            info!("Registry connected");
        }
        MeshEvent::AgentRegistered { agent_id } => {
            info!("Agent registered as '{}'", agent_id);
        }
        MeshEvent::RegistrationFailed { error } => {
            // Keep serving; the runtime keeps retrying
            warn!("Registration failed: {}", error);
        }
        MeshEvent::LlmToolsUpdated { function_id, tools } => {
            llm_topology.set_tools(&function_id, tools);
        }
        MeshEvent::LlmProviderAvailable { provider } => {
            llm_topology.set_provider(provider);
        }
        MeshEvent::LlmProviderUnavailable { function_id } => {
            llm_topology.remove_provider(&function_id);
        }
        MeshEvent::Shutdown => {}
    }
}

/// Slots an event applies to: the exact `(function, index)` when provided
/// and valid, otherwise every slot whose declared capability matches.
fn matching_slots<'a>(
    tools: &'a [ToolSpec],
    capability: &str,
    requesting_function: &Option<String>,
    dep_index: Option<usize>,
) -> Vec<(&'a ToolSpec, usize)> {
    if let (Some(function), Some(index)) = (requesting_function, dep_index) {
        if let Some(tool) = tools.iter().find(|t| &t.function_name == function) {
            if tool
                .dependencies
                .get(index)
                .map(|d| d.capability == capability)
                .unwrap_or(false)
            {
                return vec![(tool, index)];
            }
            warn!(
                "Position-precise event ({}, {}) does not match declared slot; falling back",
                function, index
            );
        }
    }

    tools
        .iter()
        .flat_map(|tool| {
            tool.dependencies
                .iter()
                .enumerate()
                .filter(|(_, dep)| dep.capability == capability)
                .map(move |(slot, _)| (tool, slot))
        })
        .collect()
}

/// Make a schema permissive to the trace fields the wrapper strips before
/// the user handler sees the arguments.
fn permissive_schema(schema: Option<Value>) -> Value {
    let mut schema = schema.unwrap_or_else(|| json!({"type": "object"}));
    if let Some(object) = schema.as_object_mut() {
        let properties = object
            .entry("properties")
            .or_insert_with(|| json!({}));
        if let Some(properties) = properties.as_object_mut() {
            properties
                .entry(TRACE_ID_FIELD)
                .or_insert_with(|| json!({"type": "string"}));
            properties
                .entry(PARENT_SPAN_FIELD)
                .or_insert_with(|| json!({"type": "string"}));
            properties
                .entry(MESH_HEADERS_FIELD)
                .or_insert_with(|| json!({"type": "object"}));
        }
    }
    schema
}

/// Build the wrapped execute handed to the MCP server.
fn build_registration(
    entry: &ToolEntry,
    table: Arc<DependencyTable>,
    metadata: AgentMetadata,
) -> ToolRegistration {
    let handler = entry.handler.clone();
    let tool_name = entry.spec.function_name.clone();
    let dep_count = entry.spec.dependencies.len();

    let wrapped: WrappedTool = Arc::new(move |invocation: ToolInvocation| {
        let handler = handler.clone();
        let table = table.clone();
        let metadata = metadata.clone();
        let tool_name = tool_name.clone();
        Box::pin(execute_wrapped(
            tool_name, dep_count, handler, table, metadata, invocation,
        ))
    });

    ToolRegistration {
        name: entry.spec.function_name.clone(),
        description: entry.spec.description.clone(),
        input_schema: permissive_schema(entry.spec.input_schema.clone()),
        handler: wrapped,
    }
}

async fn execute_wrapped(
    tool_name: String,
    dep_count: usize,
    handler: ToolHandler,
    table: Arc<DependencyTable>,
    metadata: AgentMetadata,
    invocation: ToolInvocation,
) -> Result<Value, ToolError> {
    let mut args = match invocation.arguments {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };

    // Trace fields come out of the arguments before the user code sees them;
    // transport headers are the fallback channel.
    let arg_trace_id = take_string(&mut args, TRACE_ID_FIELD);
    let arg_parent_span = take_string(&mut args, PARENT_SPAN_FIELD);
    let mesh_headers_field = args.remove(MESH_HEADERS_FIELD);

    let inherited = match arg_trace_id {
        Some(trace_id) => Some(TraceContext::new(trace_id, arg_parent_span)),
        None => parse_trace_headers(&invocation.headers),
    };
    let ctx = inherited.unwrap_or_else(TraceContext::root);
    let span_id = generate_span_id();

    let mut propagated = collect_propagated_headers(&invocation.headers);
    if let Some(Value::Object(headers)) = mesh_headers_field {
        for (name, value) in headers {
            if let Value::String(value) = value {
                propagated.insert(name.to_lowercase(), value);
            }
        }
    }

    let slots = table.resolve_slots(&tool_name, dep_count);
    let mesh_positions: Vec<usize> = slots
        .iter()
        .enumerate()
        .filter_map(|(slot, proxy)| proxy.is_some().then_some(slot))
        .collect();
    let dependencies: Vec<String> = slots
        .iter()
        .flatten()
        .map(|proxy| proxy.endpoint.clone())
        .collect();
    let kwargs_count = args.len();

    // Child proxy calls parent off this invocation's span
    let child_ctx = TraceContext::new(ctx.trace_id.clone(), Some(span_id.clone()));

    let start_time = unix_now();
    let result = with_propagated_headers(
        propagated,
        with_trace_context(child_ctx, handler(Value::Object(args), slots)),
    )
    .await;
    let end_time = unix_now();

    publish_span(SpanRecord {
        trace_id: ctx.trace_id,
        span_id,
        parent_span: ctx.parent_span_id,
        function_name: tool_name,
        start_time,
        end_time,
        success: result.is_ok(),
        error: result.as_ref().err().map(|e| e.to_string()),
        result_type: "string".to_string(),
        args_count: 0,
        kwargs_count,
        dependencies,
        injected_dependencies: mesh_positions.len(),
        mesh_positions,
        agent: metadata,
    });

    result
}

fn take_string(args: &mut Map<String, Value>, key: &str) -> Option<String> {
    match args.remove(key) {
        Some(Value::String(value)) => Some(value),
        Some(_) | None => None,
    }
}
