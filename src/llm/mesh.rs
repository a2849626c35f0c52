//! Mesh-delegated chat provider.
//!
//! Wraps a resolved provider proxy: completions are serialized into the
//! provider agent's `process_chat` tool. Trace propagation and the
//! `proxy_call_wrapper` span come from the proxy call path; vendor-specific
//! schema handling happens provider-side.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::{timeout_ms, ConfigKey};
use crate::events::LlmProviderInfo;
use crate::proxy::MeshProxy;
use crate::spec::ProxyKwargs;

use super::provider::{
    wire_model, ChatProvider, ChatRequest, ChatResponse, TokenUsage, ToolCallRequest,
};
use super::{LlmError, OutputMode};

pub struct MeshChatProvider {
    proxy: Arc<MeshProxy>,
    /// Model advertised by the provider agent, used when the tool names none
    advertised_model: Option<String>,
}

impl MeshChatProvider {
    /// Build from a resolved provider announcement.
    pub fn from_info(info: &LlmProviderInfo) -> Self {
        let kwargs = ProxyKwargs {
            timeout_seconds: timeout_ms(ConfigKey::ProviderTimeoutMs, None).div_ceil(1000),
            ..Default::default()
        };
        let proxy = Arc::new(MeshProxy::new(
            info.endpoint.clone(),
            "llm-provider",
            info.function_name.clone(),
            &kwargs,
        ));

        Self {
            proxy,
            advertised_model: info.model.clone(),
        }
    }

    #[cfg(test)]
    pub fn from_proxy(proxy: Arc<MeshProxy>, advertised_model: Option<String>) -> Self {
        Self {
            proxy,
            advertised_model,
        }
    }

    fn build_payload(&self, request: &ChatRequest) -> Value {
        let model = if request.model.is_empty() {
            self.advertised_model.clone()
        } else {
            Some(wire_model(&request.model).to_string())
        };

        json!({
            "messages": request.messages,
            "tools": request.tools,
            "model_params": {
                "model": model,
                "max_tokens": request.params.max_tokens,
                "temperature": request.params.temperature,
                "top_p": request.params.top_p,
                "stop": request.params.stop,
                "output_schema": request.output_schema,
                "output_type_name": request
                    .output_schema
                    .as_ref()
                    .and_then(|s| s.get("title"))
                    .cloned()
                    .unwrap_or(Value::Null),
            },
        })
    }

    fn parse_result(&self, value: Value) -> ChatResponse {
        // Provider agents return either a structured chat result or bare text
        match value {
            Value::Object(object) => {
                let content = object
                    .get("content")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let tool_calls = object
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .map(|calls| {
                        calls
                            .iter()
                            .filter_map(|call| {
                                serde_json::from_value::<ToolCallRequest>(call.clone()).ok()
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                let usage = TokenUsage {
                    input_tokens: object
                        .get("usage")
                        .and_then(|u| u.get("input_tokens"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                    output_tokens: object
                        .get("usage")
                        .and_then(|u| u.get("output_tokens"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                };

                ChatResponse {
                    content,
                    tool_calls,
                    usage,
                }
            }
            Value::String(text) => ChatResponse {
                content: Some(text),
                ..Default::default()
            },
            other => ChatResponse {
                content: Some(other.to_string()),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl ChatProvider for MeshChatProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        // Schema enforcement is provider-side for delegated completions
        let mut request = request.clone();
        if request.output_mode == OutputMode::Text {
            request.output_schema = None;
        }

        let payload = self.build_payload(&request);
        let value = self.proxy.call(payload).await?;
        Ok(self.parse_result(value))
    }

    fn name(&self) -> &str {
        "mesh"
    }
}
