//! LLM tool runtime.
//!
//! Presents a single LLM-backed tool whose body is an agentic loop: the
//! model may call other mesh-resolved tools any number of times before
//! producing a final answer, which is optionally validated against a
//! return schema.

pub mod mesh;
pub mod parser;
pub mod prompt;
pub mod provider;
pub mod schema;
pub mod vendors;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{resolve_config, resolve_config_int, timeout_ms, ConfigKey};
use crate::events::{LlmProviderInfo, LlmToolInfo};
use crate::proxy::{MeshProxy, ProxyError};
use crate::spec::{DependencySpec, ProxyKwargs};

use mesh::MeshChatProvider;
use parser::{parse_response, ResponseParseError};
use prompt::{render_system_prompt, DEFAULT_SYSTEM_PROMPT};
use provider::{
    qualify_model, ChatMessage, ChatProvider, ChatRequest, GenerationParams, HandlerRegistry,
    TokenUsage, ToolDefinition,
};
use vendors::direct_provider;

/// Errors raised by the LLM tool runtime.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The configured provider could not be resolved or constructed.
    #[error("LLM provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Non-2xx from the LLM provider, or a request-level failure with a
    /// status attached.
    #[error("LLM API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The agentic loop exhausted its iteration budget without a terminal
    /// assistant message.
    #[error("agentic loop exhausted after {iterations} iterations")]
    MaxIterations {
        iterations: u32,
        last_assistant: Option<String>,
        history: Vec<ChatMessage>,
    },

    /// Structured-output validation failure.
    #[error(transparent)]
    Parse(#[from] ResponseParseError),

    /// Failure calling a mesh-delegated provider.
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// System prompt template failure.
    #[error("prompt template error: {0}")]
    Template(String),

    /// Request-level failure before any HTTP status was available.
    #[error("request error: {0}")]
    Request(String),
}

/// How the LLM tool reaches its model.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderSpec {
    /// A vendor tag resolved to a direct API client ("claude", "openai", ...)
    Direct(String),
    /// A mesh capability to delegate completions to
    Mesh(DependencySpec),
}

impl ProviderSpec {
    /// Registration form submitted to the registry.
    pub fn registration_value(&self) -> Value {
        match self {
            ProviderSpec::Direct(vendor) => json!({"vendor": vendor}),
            ProviderSpec::Mesh(spec) => json!({
                "capability": spec.capability,
                "tags": spec.tags,
                "version": spec.version,
            }),
        }
    }
}

/// Enforcement level for structured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Native schema-constrained decoding
    Strict,
    /// Prompt-based JSON instruction
    #[default]
    Hint,
    /// Unconstrained text
    Text,
}

/// Tool-visibility filter entry, evaluated registry-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityFilter {
    pub capability: String,
    pub mode: FilterMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    Include,
    Exclude,
}

/// Configuration of one LLM-backed tool.
#[derive(Debug, Clone)]
pub struct LlmToolConfig {
    pub provider: ProviderSpec,
    pub model: Option<String>,
    /// Inline template text or a `file://` path
    pub system_prompt: Option<String>,
    /// Caller argument whose value becomes template context
    pub context_param: Option<String>,
    /// Capability filters, evaluated registry-side
    pub filter: Vec<CapabilityFilter>,
    pub max_iterations: u32,
    pub params: GenerationParams,
    pub return_schema: Option<Value>,
    pub output_mode: OutputMode,
}

impl LlmToolConfig {
    pub fn new(provider: ProviderSpec) -> Self {
        Self {
            provider,
            model: None,
            system_prompt: None,
            context_param: None,
            filter: Vec::new(),
            max_iterations: 10,
            params: GenerationParams::default(),
            return_schema: None,
            output_mode: OutputMode::Hint,
        }
    }

    /// Filter registration form, when any filters are declared.
    pub fn registration_filter(&self) -> Option<Value> {
        if self.filter.is_empty() {
            return None;
        }
        serde_json::to_value(&self.filter).ok()
    }

    /// Template context extracted from caller arguments via `context_param`.
    pub fn extract_context(&self, args: &Value) -> Option<Value> {
        let param = self.context_param.as_deref()?;
        args.get(param).cloned()
    }
}

/// Shared LLM topology: the tool lists and providers the event dispatcher
/// maintains for each LLM function.
#[derive(Debug, Clone, Default)]
pub struct LlmTopology {
    tools: Arc<RwLock<HashMap<String, Vec<LlmToolInfo>>>>,
    providers: Arc<RwLock<HashMap<String, LlmProviderInfo>>>,
}

impl LlmTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tools(&self, function_id: &str, tools: Vec<LlmToolInfo>) {
        debug!("LLM tools for '{}': {} entries", function_id, tools.len());
        let mut map = self.tools.write().unwrap_or_else(|e| e.into_inner());
        map.insert(function_id.to_string(), tools);
    }

    pub fn tools_for(&self, function_id: &str) -> Vec<LlmToolInfo> {
        let map = self.tools.read().unwrap_or_else(|e| e.into_inner());
        map.get(function_id).cloned().unwrap_or_default()
    }

    pub fn set_provider(&self, info: LlmProviderInfo) {
        let mut map = self.providers.write().unwrap_or_else(|e| e.into_inner());
        map.insert(info.function_id.clone(), info);
    }

    pub fn remove_provider(&self, function_id: &str) {
        let mut map = self.providers.write().unwrap_or_else(|e| e.into_inner());
        map.remove(function_id);
    }

    pub fn provider_for(&self, function_id: &str) -> Option<LlmProviderInfo> {
        let map = self.providers.read().unwrap_or_else(|e| e.into_inner());
        map.get(function_id).cloned()
    }
}

/// One tool call as recorded in call metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: Value,
    pub success: bool,
    pub error: Option<String>,
}

/// Metadata describing one LLM tool call.
#[derive(Debug, Clone, Serialize)]
pub struct LlmCallMetadata {
    pub provider: String,
    pub model: String,
    pub iterations: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: f64,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// Parsed value plus metadata for one LLM tool call.
#[derive(Debug, Clone)]
pub struct LlmOutcome {
    pub value: Value,
    pub metadata: LlmCallMetadata,
}

#[derive(Debug)]
struct LoopStats {
    iterations: u32,
    usage: TokenUsage,
    tool_calls: Vec<ToolCallRecord>,
}

/// An LLM-backed tool, bound to its mesh topology by function id.
pub struct LlmTool {
    function_id: String,
    config: LlmToolConfig,
    topology: LlmTopology,
}

impl LlmTool {
    pub fn new(
        function_id: impl Into<String>,
        config: LlmToolConfig,
        topology: LlmTopology,
    ) -> Self {
        Self {
            function_id: function_id.into(),
            config,
            topology,
        }
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    /// Execute one call: provider resolution, prompt assembly, the agentic
    /// loop, and structured-output parsing.
    pub async fn call(
        &self,
        user_messages: Vec<ChatMessage>,
        context: Option<Value>,
    ) -> Result<LlmOutcome, LlmError> {
        let started = Instant::now();

        // Environment overrides take priority over declared configuration
        let provider_spec = match resolve_config(ConfigKey::LlmProvider, None) {
            Some(vendor) => ProviderSpec::Direct(vendor),
            None => self.config.provider.clone(),
        };
        let is_mesh = matches!(provider_spec, ProviderSpec::Mesh(_));
        let model_override =
            resolve_config(ConfigKey::LlmModel, None).or_else(|| self.config.model.clone());
        let max_iterations = resolve_config_int(ConfigKey::LlmMaxIterations, None)
            .ok()
            .flatten()
            .filter(|v| *v >= 1)
            .map(|v| v as u32)
            .unwrap_or(self.config.max_iterations)
            .max(1);

        // Tools visible under this function's filter (events arrive
        // pre-filtered from the registry)
        let infos = self.topology.tools_for(&self.function_id);
        let tools: Vec<ToolDefinition> = infos
            .iter()
            .map(|info| ToolDefinition {
                name: info.function_name.clone(),
                description: info.description.clone(),
                parameters: info
                    .input_schema
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object"})),
            })
            .collect();
        let proxies = tool_proxies(&infos);

        let (chat_provider, vendor, model): (Box<dyn ChatProvider>, String, String) =
            match &provider_spec {
                ProviderSpec::Direct(vendor) => {
                    let provider = direct_provider(vendor)?;
                    let model = qualify_model(vendor, model_override.as_deref());
                    (provider, vendor.clone(), model)
                }
                ProviderSpec::Mesh(spec) => {
                    let info = self.topology.provider_for(&self.function_id).ok_or_else(|| {
                        LlmError::ProviderUnavailable(format!(
                            "no provider resolved for capability '{}'",
                            spec.capability
                        ))
                    })?;
                    let model = model_override
                        .or_else(|| info.model.clone())
                        .unwrap_or_default();
                    (
                        Box::new(MeshChatProvider::from_info(&info)),
                        "mesh".to_string(),
                        model,
                    )
                }
            };

        let handler = HandlerRegistry::global().handler_for(&vendor);

        let template = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let base = render_system_prompt(template, &context.unwrap_or(Value::Null))?;

        let mut messages = Vec::with_capacity(user_messages.len() + 1);
        messages.push(ChatMessage::system(base));
        messages.extend(user_messages);

        // Delegated providers do their own schema handling; the schema is
        // kept out of the prompt and sent through model_params instead.
        let prompt_schema = if is_mesh {
            None
        } else {
            self.config.return_schema.clone()
        };
        let prepared = handler.prepare_request(&ChatRequest {
            messages,
            tools,
            model: model.clone(),
            params: self.config.params.clone(),
            output_schema: prompt_schema,
            output_mode: self.config.output_mode,
        });

        let (loop_schema, loop_mode) = if is_mesh {
            let schema = self.config.return_schema.clone();
            let mode = match (&schema, self.config.output_mode) {
                (None, _) | (_, OutputMode::Text) => OutputMode::Text,
                (Some(_), mode) => mode,
            };
            (schema, mode)
        } else {
            (prepared.output_schema.clone(), prepared.output_mode)
        };

        info!(
            "LLM call '{}': provider {} model {} ({} tools, max {} iterations)",
            self.function_id,
            vendor,
            model,
            prepared.tools.len(),
            max_iterations
        );

        let (content, stats) = run_agentic_loop(
            chat_provider.as_ref(),
            prepared.messages,
            prepared.tools,
            &proxies,
            model.clone(),
            self.config.params.clone(),
            loop_schema,
            loop_mode,
            max_iterations,
        )
        .await?;

        let parse_schema = match loop_mode {
            OutputMode::Text => None,
            _ => self.config.return_schema.as_ref(),
        };
        let value = parse_response(&content, parse_schema)?;

        Ok(LlmOutcome {
            value,
            metadata: LlmCallMetadata {
                provider: vendor,
                model,
                iterations: stats.iterations,
                input_tokens: stats.usage.input_tokens,
                output_tokens: stats.usage.output_tokens,
                duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                tool_calls: stats.tool_calls,
            },
        })
    }
}

/// Proxies for the tools visible to the model, keyed by tool name.
fn tool_proxies(infos: &[LlmToolInfo]) -> HashMap<String, Arc<MeshProxy>> {
    let kwargs = ProxyKwargs {
        timeout_seconds: timeout_ms(ConfigKey::ToolTimeoutMs, None).div_ceil(1000),
        ..Default::default()
    };
    infos
        .iter()
        .map(|info| {
            (
                info.function_name.clone(),
                Arc::new(MeshProxy::new(
                    info.endpoint.clone(),
                    info.capability.clone(),
                    info.function_name.clone(),
                    &kwargs,
                )),
            )
        })
        .collect()
}

/// The agentic loop: call the model, execute any requested tools, feed the
/// results back, repeat until a terminal assistant message or exhaustion.
#[allow(clippy::too_many_arguments)]
async fn run_agentic_loop(
    provider: &dyn ChatProvider,
    mut messages: Vec<ChatMessage>,
    tools: Vec<ToolDefinition>,
    proxies: &HashMap<String, Arc<MeshProxy>>,
    model: String,
    params: GenerationParams,
    output_schema: Option<Value>,
    output_mode: OutputMode,
    max_iterations: u32,
) -> Result<(String, LoopStats), LlmError> {
    let mut usage = TokenUsage::default();
    let mut tool_records: Vec<ToolCallRecord> = Vec::new();

    for iteration in 1..=max_iterations {
        let request = ChatRequest {
            messages: messages.clone(),
            tools: tools.clone(),
            model: model.clone(),
            params: params.clone(),
            output_schema: output_schema.clone(),
            output_mode,
        };
        let response = provider.chat(&request).await?;
        usage.add(response.usage);

        let assistant = ChatMessage::assistant(
            response.content.clone().unwrap_or_default(),
            response.has_tool_calls().then(|| response.tool_calls.clone()),
        );
        messages.push(assistant);

        if !response.has_tool_calls() {
            let content = response.content.unwrap_or_default();
            debug!(
                "Agentic loop finished in {} iteration(s), {} tool call(s)",
                iteration,
                tool_records.len()
            );
            return Ok((
                content,
                LoopStats {
                    iterations: iteration,
                    usage,
                    tool_calls: tool_records,
                },
            ));
        }

        for call in &response.tool_calls {
            let arguments = match &call.arguments {
                // Some providers hand arguments through as a JSON string
                Value::String(raw) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| call.arguments.clone())
                }
                other => other.clone(),
            };

            let outcome = match proxies.get(&call.name) {
                Some(proxy) => proxy.call(arguments.clone()).await.map_err(|e| e.to_string()),
                None => Err(format!("unknown tool '{}'", call.name)),
            };

            let (content, success, error) = match outcome {
                Ok(Value::String(text)) => (text, true, None),
                Ok(other) => (other.to_string(), true, None),
                Err(message) => {
                    warn!("Tool call '{}' failed: {}", call.name, message);
                    // A JSON error object lets the model recover
                    (
                        json!({"error": message}).to_string(),
                        false,
                        Some(message),
                    )
                }
            };

            tool_records.push(ToolCallRecord {
                name: call.name.clone(),
                arguments,
                success,
                error,
            });
            messages.push(ChatMessage::tool_result(call.id.clone(), content));
        }
    }

    let last_assistant = messages
        .iter()
        .rev()
        .find(|m| m.role == "assistant")
        .map(|m| m.content.clone());

    Err(LlmError::MaxIterations {
        iterations: max_iterations,
        last_assistant,
        history: messages,
    })
}
