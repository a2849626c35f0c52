//! Chat provider abstraction and vendor handler registry.
//!
//! A [`ChatProvider`] issues one completion; a [`VendorHandler`] applies
//! vendor-specific request policy (system prompt shape, output mode,
//! schema strictness) before any completion is issued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::prompt::{output_format_section, tools_section};
use super::schema::enforce_strict;
use super::{LlmError, OutputMode};

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Arguments, already decoded from the vendor's JSON string
    pub arguments: Value,
}

/// One message in the conversation history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCallRequest>>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls,
            ..Default::default()
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            ..Default::default()
        }
    }
}

/// A tool definition as shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters
    pub parameters: Value,
}

/// Token accounting, accumulated across loop iterations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One completion from a provider.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: TokenUsage,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Generation parameters forwarded to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

/// A completion request, vendor-agnostic.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub model: String,
    pub params: GenerationParams,
    pub output_schema: Option<Value>,
    pub output_mode: OutputMode,
}

/// A provider that can issue one completion.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Provider name for metadata ("claude", "openai", "gemini", "mesh", ...)
    fn name(&self) -> &str;
}

/// What a vendor natively supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub native_tool_calling: bool,
    pub structured_output: bool,
    pub streaming: bool,
    pub vision: bool,
    pub json_mode: bool,
    pub prompt_caching: bool,
}

/// A request after vendor policy has been applied.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    /// Schema to pass natively, present only in strict mode
    pub output_schema: Option<Value>,
    pub output_mode: OutputMode,
}

/// Vendor-specific request policy.
pub trait VendorHandler: Send + Sync {
    /// Apply vendor policy: pick the output mode, format the system
    /// message, and prepare the schema for native decoding when strict.
    fn prepare_request(&self, request: &ChatRequest) -> PreparedRequest {
        let mode =
            self.determine_output_mode(request.output_schema.as_ref(), request.output_mode,
                !request.tools.is_empty());

        let mut messages = request.messages.clone();
        let base = messages
            .first()
            .filter(|m| m.role == "system")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let formatted = self.format_system_prompt(
            &base,
            &request.tools,
            request.output_schema.as_ref(),
            mode,
        );
        match messages.first_mut() {
            Some(first) if first.role == "system" => first.content = formatted,
            _ => messages.insert(0, ChatMessage::system(formatted)),
        }

        let output_schema = match mode {
            OutputMode::Strict => request.output_schema.as_ref().map(enforce_strict),
            OutputMode::Hint | OutputMode::Text => None,
        };

        PreparedRequest {
            messages,
            tools: request.tools.clone(),
            output_schema,
            output_mode: mode,
        }
    }

    /// System prompt assembly: base text, then tools, then output format
    /// when the schema is enforced through the prompt.
    fn format_system_prompt(
        &self,
        base: &str,
        tools: &[ToolDefinition],
        schema: Option<&Value>,
        mode: OutputMode,
    ) -> String {
        let mut prompt = base.to_string();
        if !tools.is_empty() {
            prompt.push_str(&tools_section(tools));
        }
        if let (Some(schema), OutputMode::Hint) = (schema, mode) {
            prompt.push_str(&output_format_section(schema));
        }
        prompt
    }

    /// Resolve the effective output mode for a schema/override combination.
    fn determine_output_mode(
        &self,
        schema: Option<&Value>,
        requested: OutputMode,
        has_tools: bool,
    ) -> OutputMode;

    fn capabilities(&self) -> ProviderCapabilities;
}

/// Claude: prompt-based JSON always; the native structured-output path is
/// not used.
struct ClaudeHandler;

impl VendorHandler for ClaudeHandler {
    fn determine_output_mode(
        &self,
        schema: Option<&Value>,
        requested: OutputMode,
        _has_tools: bool,
    ) -> OutputMode {
        match (schema, requested) {
            (_, OutputMode::Text) | (None, _) => OutputMode::Text,
            (Some(_), _) => OutputMode::Hint,
        }
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            native_tool_calling: true,
            structured_output: false,
            streaming: true,
            vision: true,
            json_mode: false,
            prompt_caching: true,
        }
    }
}

/// OpenAI: strict when a schema is present and no tools are active
/// (tool calls preclude the native structured-output path).
struct OpenAiHandler;

impl VendorHandler for OpenAiHandler {
    fn determine_output_mode(
        &self,
        schema: Option<&Value>,
        requested: OutputMode,
        has_tools: bool,
    ) -> OutputMode {
        match (schema, requested) {
            (_, OutputMode::Text) | (None, _) => OutputMode::Text,
            (Some(_), OutputMode::Strict) if !has_tools => OutputMode::Strict,
            (Some(_), OutputMode::Hint) if !has_tools => OutputMode::Strict,
            (Some(_), _) => OutputMode::Hint,
        }
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            native_tool_calling: true,
            structured_output: true,
            streaming: true,
            vision: true,
            json_mode: true,
            prompt_caching: true,
        }
    }
}

struct GeminiHandler;

impl VendorHandler for GeminiHandler {
    fn determine_output_mode(
        &self,
        schema: Option<&Value>,
        requested: OutputMode,
        _has_tools: bool,
    ) -> OutputMode {
        match (schema, requested) {
            (_, OutputMode::Text) | (None, _) => OutputMode::Text,
            (Some(_), _) => OutputMode::Hint,
        }
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            native_tool_calling: true,
            structured_output: false,
            streaming: true,
            vision: true,
            json_mode: true,
            prompt_caching: false,
        }
    }
}

/// Fallback for unknown vendors: prompt-based everything.
struct GenericHandler;

impl VendorHandler for GenericHandler {
    fn determine_output_mode(
        &self,
        schema: Option<&Value>,
        requested: OutputMode,
        _has_tools: bool,
    ) -> OutputMode {
        match (schema, requested) {
            (_, OutputMode::Text) | (None, _) => OutputMode::Text,
            (Some(_), _) => OutputMode::Hint,
        }
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }
}

/// Registry of vendor handlers, one cached instance per vendor.
pub struct HandlerRegistry {
    cache: Mutex<HashMap<String, Arc<dyn VendorHandler>>>,
}

impl HandlerRegistry {
    fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide registry.
    pub fn global() -> &'static HandlerRegistry {
        static REGISTRY: OnceLock<HandlerRegistry> = OnceLock::new();
        REGISTRY.get_or_init(HandlerRegistry::new)
    }

    /// Handler for a vendor; unknown vendors get the generic handler.
    pub fn handler_for(&self, vendor: &str) -> Arc<dyn VendorHandler> {
        let key = vendor.to_lowercase();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(key.clone())
            .or_insert_with(|| match key.as_str() {
                "claude" | "anthropic" => Arc::new(ClaudeHandler),
                "openai" => Arc::new(OpenAiHandler),
                "gemini" | "google" => Arc::new(GeminiHandler),
                _ => Arc::new(GenericHandler),
            })
            .clone()
    }
}

/// Fixed vendor -> default model table.
pub fn default_model_for(vendor: &str) -> &'static str {
    match vendor.to_lowercase().as_str() {
        "claude" | "anthropic" => "claude-sonnet-4-20250514",
        "openai" => "gpt-4o",
        "gemini" | "google" => "gemini-2.0-flash",
        _ => "gpt-4o",
    }
}

/// Qualify a model name with its vendor prefix.
///
/// An explicit model without a vendor prefix is prefixed; a missing model
/// takes the vendor default.
pub fn qualify_model(vendor: &str, model: Option<&str>) -> String {
    match model {
        Some(model) if model.contains('/') => model.to_string(),
        Some(model) => format!("{}/{}", vendor, model),
        None => format!("{}/{}", vendor, default_model_for(vendor)),
    }
}

/// Strip the vendor prefix for the wire ("openai/gpt-4o" -> "gpt-4o").
pub fn wire_model(model: &str) -> &str {
    model.split_once('/').map(|(_, m)| m).unwrap_or(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(schema: Option<Value>, tools: usize, mode: OutputMode) -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::system("base"), ChatMessage::user("go")],
            tools: (0..tools)
                .map(|i| ToolDefinition {
                    name: format!("tool{}", i),
                    description: String::new(),
                    parameters: json!({"type": "object"}),
                })
                .collect(),
            model: "openai/gpt-4o".to_string(),
            params: GenerationParams::default(),
            output_schema: schema,
            output_mode: mode,
        }
    }

    #[test]
    fn test_claude_always_hint_with_schema() {
        let handler = HandlerRegistry::global().handler_for("claude");
        assert_eq!(
            handler.determine_output_mode(Some(&json!({})), OutputMode::Strict, false),
            OutputMode::Hint
        );
        assert_eq!(
            handler.determine_output_mode(None, OutputMode::Hint, false),
            OutputMode::Text
        );
    }

    #[test]
    fn test_openai_strict_only_without_tools() {
        let handler = HandlerRegistry::global().handler_for("openai");
        let schema = json!({"type": "object"});

        assert_eq!(
            handler.determine_output_mode(Some(&schema), OutputMode::Hint, false),
            OutputMode::Strict
        );
        assert_eq!(
            handler.determine_output_mode(Some(&schema), OutputMode::Hint, true),
            OutputMode::Hint
        );
    }

    #[test]
    fn test_unknown_vendor_falls_back_to_generic() {
        let handler = HandlerRegistry::global().handler_for("acme-llm");
        assert_eq!(handler.capabilities(), ProviderCapabilities::default());
        assert_eq!(
            handler.determine_output_mode(Some(&json!({})), OutputMode::Strict, false),
            OutputMode::Hint
        );
    }

    #[test]
    fn test_registry_caches_instances() {
        let registry = HandlerRegistry::global();
        let a = registry.handler_for("openai");
        let b = registry.handler_for("OPENAI");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_prepare_request_formats_system_and_strictifies() {
        let handler = HandlerRegistry::global().handler_for("openai");
        let schema = json!({"type": "object", "properties": {"answer": {"type": "string"}}});
        let prepared = handler.prepare_request(&request(Some(schema), 0, OutputMode::Hint));

        assert_eq!(prepared.output_mode, OutputMode::Strict);
        // Strict mode: schema goes native (recursively closed), not in the prompt
        let native = prepared.output_schema.unwrap();
        assert_eq!(native["additionalProperties"], json!(false));
        assert!(prepared.messages[0].content.starts_with("base"));
        assert!(!prepared.messages[0].content.contains("Output Format"));
    }

    #[test]
    fn test_prepare_request_hint_mode_embeds_schema_in_prompt() {
        let handler = HandlerRegistry::global().handler_for("claude");
        let schema = json!({"type": "object"});
        let prepared = handler.prepare_request(&request(Some(schema), 2, OutputMode::Hint));

        assert_eq!(prepared.output_mode, OutputMode::Hint);
        assert!(prepared.output_schema.is_none());
        let system = &prepared.messages[0].content;
        assert!(system.contains("Available Tools"));
        assert!(system.contains("tool0"));
        assert!(system.contains("Output Format"));
    }

    #[test]
    fn test_prepare_request_inserts_system_when_missing() {
        let handler = HandlerRegistry::global().handler_for("generic");
        let mut req = request(None, 1, OutputMode::Hint);
        req.messages = vec![ChatMessage::user("hi")];

        let prepared = handler.prepare_request(&req);
        assert_eq!(prepared.messages[0].role, "system");
        assert!(prepared.messages[0].content.contains("Available Tools"));
        assert_eq!(prepared.messages[1].role, "user");
    }

    #[test]
    fn test_model_qualification() {
        assert_eq!(qualify_model("openai", None), "openai/gpt-4o");
        assert_eq!(qualify_model("openai", Some("gpt-4.1")), "openai/gpt-4.1");
        assert_eq!(
            qualify_model("claude", Some("openai/gpt-4o")),
            "openai/gpt-4o"
        );
        assert_eq!(wire_model("openai/gpt-4o"), "gpt-4o");
        assert_eq!(wire_model("gpt-4o"), "gpt-4o");
    }
}
