//! Callable proxies over remote mesh tools.
//!
//! A [`MeshProxy`] translates a local call into a JSON-RPC 2.0 `tools/call`
//! against a remote agent's `/mcp` endpoint, carrying trace context through
//! both HTTP headers and argument-level fallbacks.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::span::{unix_now, SpanRecord};
use crate::spec::ProxyKwargs;
use crate::trace::{
    current_propagated_headers, current_trace_context, generate_span_id, MESH_HEADERS_FIELD,
    PARENT_SPAN_FIELD, PARENT_SPAN_HEADER, TRACE_ID_FIELD, TRACE_ID_HEADER,
};
use crate::tracing_publish::{publish_span, publisher_metadata};

/// Base backoff between retry attempts; grows linearly with the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Span name recorded for every outbound proxy attempt.
const PROXY_SPAN_NAME: &str = "proxy_call_wrapper";

/// Errors raised by proxy calls, surfaced to the tool handler that issued
/// the call.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Network-level failure or non-2xx response. The only retryable class.
    #[error("transport error calling {endpoint}: {message}")]
    Transport {
        endpoint: String,
        message: String,
        status: Option<u16>,
    },

    /// The call exceeded its deadline. Never retried.
    #[error("call to {endpoint} timed out after {seconds}s")]
    Timeout { endpoint: String, seconds: u64 },

    /// The remote tool reported an error. Never retried.
    #[error("remote error: {0}")]
    Remote(String),

    /// The response body was not a recognizable JSON-RPC envelope.
    #[error("invalid response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },
}

impl ProxyError {
    fn is_retryable(&self) -> bool {
        matches!(self, ProxyError::Transport { .. })
    }
}

/// A callable handle over a remote tool endpoint.
///
/// Immutable; topology changes replace the proxy rather than mutating it.
#[derive(Debug, Clone)]
pub struct MeshProxy {
    pub endpoint: String,
    pub capability: String,
    pub function_name: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    client: Client,
}

impl MeshProxy {
    /// Build a proxy for a resolved dependency with the slot's kwargs.
    pub fn new(
        endpoint: impl Into<String>,
        capability: impl Into<String>,
        function_name: impl Into<String>,
        kwargs: &ProxyKwargs,
    ) -> Self {
        let timeout = Duration::from_secs(kwargs.timeout_seconds.max(1));
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            endpoint: endpoint.into(),
            capability: capability.into(),
            function_name: function_name.into(),
            timeout,
            max_attempts: kwargs.max_attempts.max(1),
            client,
        }
    }

    /// Invoke the remote tool.
    ///
    /// `args` is the tool's argument object. Trace context and propagated
    /// headers from the current async scope are injected automatically.
    /// Retries apply to transport errors only, with linear backoff.
    pub async fn call(&self, args: Value) -> Result<Value, ProxyError> {
        let base_args = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                warn!(
                    "Proxy call to '{}' with non-object arguments; wrapping",
                    self.function_name
                );
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let mut attempt = 1;
        loop {
            match self.call_once(base_args.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    debug!(
                        "Proxy call to '{}' failed (attempt {}/{}): {}",
                        self.function_name, attempt, self.max_attempts, e
                    );
                    sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt: inject trace context, POST, parse, and record a span.
    async fn call_once(&self, mut arguments: Map<String, Value>) -> Result<Value, ProxyError> {
        let ctx = current_trace_context();
        let span_id = generate_span_id();

        let mut request = self
            .client
            .post(format!("{}/mcp", self.endpoint))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");

        // Dual-channel trace propagation: headers for transports that
        // surface them, argument fields for those that don't.
        if let Some(ctx) = &ctx {
            request = request
                .header(TRACE_ID_HEADER, &ctx.trace_id)
                .header(PARENT_SPAN_HEADER, &span_id);
            arguments.insert(TRACE_ID_FIELD.to_string(), json!(ctx.trace_id));
            arguments.insert(PARENT_SPAN_FIELD.to_string(), json!(span_id));
        }

        let propagated = current_propagated_headers();
        if !propagated.is_empty() {
            for (name, value) in &propagated {
                request = request.header(name, value);
            }
            arguments.insert(MESH_HEADERS_FIELD.to_string(), json!(propagated));
        }

        let body = json!({
            "jsonrpc": "2.0",
            "id": Uuid::new_v4().to_string(),
            "method": "tools/call",
            "params": {
                "name": self.function_name,
                "arguments": Value::Object(arguments),
            },
        });

        let start_time = unix_now();
        let outcome = self.send(request, &body).await;
        let end_time = unix_now();

        if let Some(ctx) = &ctx {
            publish_span(SpanRecord {
                trace_id: ctx.trace_id.clone(),
                span_id,
                parent_span: ctx.parent_span_id.clone(),
                function_name: PROXY_SPAN_NAME.to_string(),
                start_time,
                end_time,
                success: outcome.is_ok(),
                error: outcome.as_ref().err().map(|e| e.to_string()),
                result_type: "proxy".to_string(),
                args_count: 0,
                kwargs_count: 0,
                dependencies: vec![self.endpoint.clone()],
                injected_dependencies: 0,
                mesh_positions: Vec::new(),
                agent: publisher_metadata(),
            });
        }

        outcome
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        body: &Value,
    ) -> Result<Value, ProxyError> {
        let response = request.json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::Timeout {
                    endpoint: self.endpoint.clone(),
                    seconds: self.timeout.as_secs(),
                }
            } else {
                ProxyError::Transport {
                    endpoint: self.endpoint.clone(),
                    message: e.to_string(),
                    status: None,
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::Transport {
                endpoint: self.endpoint.clone(),
                message: format!("HTTP {}", status.as_u16()),
                status: Some(status.as_u16()),
            });
        }

        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/event-stream"))
            .unwrap_or(false);

        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::Timeout {
                    endpoint: self.endpoint.clone(),
                    seconds: self.timeout.as_secs(),
                }
            } else {
                ProxyError::Transport {
                    endpoint: self.endpoint.clone(),
                    message: e.to_string(),
                    status: None,
                }
            }
        })?;

        let envelope = if is_sse {
            self.last_sse_data(&text)?
        } else {
            serde_json::from_str(&text).map_err(|e| ProxyError::InvalidResponse {
                endpoint: self.endpoint.clone(),
                message: format!("invalid JSON body: {}", e),
            })?
        };

        self.unwrap_envelope(envelope)
    }

    /// The last `data:` line of an SSE body is authoritative.
    fn last_sse_data(&self, body: &str) -> Result<Value, ProxyError> {
        let last = body
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .filter(|data| !data.is_empty())
            .last()
            .ok_or_else(|| ProxyError::InvalidResponse {
                endpoint: self.endpoint.clone(),
                message: "SSE body without data records".to_string(),
            })?;

        serde_json::from_str(last).map_err(|e| ProxyError::InvalidResponse {
            endpoint: self.endpoint.clone(),
            message: format!("invalid SSE data payload: {}", e),
        })
    }

    /// Unwrap a JSON-RPC envelope into the tool's return value.
    fn unwrap_envelope(&self, envelope: Value) -> Result<Value, ProxyError> {
        if let Some(error) = envelope.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(ProxyError::Remote(message));
        }

        let result = envelope
            .get("result")
            .ok_or_else(|| ProxyError::InvalidResponse {
                endpoint: self.endpoint.clone(),
                message: "envelope without result or error".to_string(),
            })?;

        let first_text = result
            .get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| {
                blocks.iter().find_map(|block| {
                    (block.get("type").and_then(Value::as_str) == Some("text"))
                        .then(|| block.get("text").and_then(Value::as_str))
                        .flatten()
                })
            });

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(ProxyError::Remote(
                first_text.unwrap_or("remote tool reported an error").to_string(),
            ));
        }

        match first_text {
            Some(text) => Ok(serde_json::from_str(text)
                .unwrap_or_else(|_| Value::String(text.to_string()))),
            None => Ok(result.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{with_propagated_headers, with_trace_context, TraceContext};
    use mockito::Matcher;

    fn proxy_for(server: &mockito::ServerGuard, kwargs: &ProxyKwargs) -> MeshProxy {
        MeshProxy::new(server.url(), "greet", "hello", kwargs)
    }

    fn text_envelope(text: &str) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"content": [{"type": "text", "text": text}]},
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_call_posts_jsonrpc_and_returns_text() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/mcp")
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJson(json!({
                "jsonrpc": "2.0",
                "method": "tools/call",
                "params": {"name": "hello", "arguments": {"who": "x"}},
            })))
            .with_header("content-type", "application/json")
            .with_body(text_envelope("hi there"))
            .create_async()
            .await;

        let proxy = proxy_for(&server, &ProxyKwargs::default());
        let value = proxy.call(json!({"who": "x"})).await.unwrap();
        assert_eq!(value, json!("hi there"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_text_that_parses_as_json_is_decoded() {
        let mut server = mockito::Server::new_async().await;
        let _m1 = server
            .mock("POST", "/mcp")
            .with_body(text_envelope(r#"{"sum": 5}"#))
            .create_async()
            .await;

        let proxy = proxy_for(&server, &ProxyKwargs::default());
        let value = proxy.call(json!({})).await.unwrap();
        assert_eq!(value, json!({"sum": 5}));
    }

    #[tokio::test]
    async fn test_sse_last_data_is_authoritative() {
        let mut server = mockito::Server::new_async().await;
        let body = format!(
            "event: message\ndata: {}\n\nevent: message\ndata: {}\n\n",
            json!({"jsonrpc":"2.0","id":1,"result":{"content":[{"type":"text","text":"1"}]}}),
            json!({"jsonrpc":"2.0","id":1,"result":{"content":[{"type":"text","text":"42"}]}}),
        );
        let _m2 = server
            .mock("POST", "/mcp")
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let proxy = proxy_for(&server, &ProxyKwargs::default());
        let value = proxy.call(json!({})).await.unwrap();
        assert_eq!(value, json!(42));
    }

    #[tokio::test]
    async fn test_jsonrpc_error_is_remote_and_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/mcp")
            .with_body(
                json!({"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"no such tool"}})
                    .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let kwargs = ProxyKwargs {
            max_attempts: 3,
            ..Default::default()
        };
        let proxy = proxy_for(&server, &kwargs);
        let err = proxy.call(json!({})).await.unwrap_err();
        assert!(matches!(err, ProxyError::Remote(ref m) if m == "no such tool"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_is_error_result_maps_to_remote() {
        let mut server = mockito::Server::new_async().await;
        let _m3 = server
            .mock("POST", "/mcp")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {"isError": true, "content": [{"type": "text", "text": "boom"}]},
                })
                .to_string(),
            )
            .create_async()
            .await;

        let proxy = proxy_for(&server, &ProxyKwargs::default());
        let err = proxy.call(json!({})).await.unwrap_err();
        assert!(matches!(err, ProxyError::Remote(ref m) if m == "boom"));
    }

    #[tokio::test]
    async fn test_transport_error_retries_up_to_max_attempts() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/mcp")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let kwargs = ProxyKwargs {
            max_attempts: 2,
            ..Default::default()
        };
        let proxy = proxy_for(&server, &kwargs);
        let err = proxy.call(json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Transport {
                status: Some(503),
                ..
            }
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_trace_context_injected_into_headers_and_arguments() {
        let mut server = mockito::Server::new_async().await;
        let trace_id = "a".repeat(32);
        let mock = server
            .mock("POST", "/mcp")
            .match_header("x-trace-id", trace_id.as_str())
            .match_header("x-parent-span", Matcher::Regex("^[0-9a-f]{16}$".to_string()))
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({
                    "params": {"arguments": {"who": "x", "_trace_id": trace_id.clone()}},
                })),
                Matcher::Regex(r#""_parent_span":"[0-9a-f]{16}""#.to_string()),
            ]))
            .with_body(text_envelope("ok"))
            .create_async()
            .await;

        let proxy = proxy_for(&server, &ProxyKwargs::default());
        let ctx = TraceContext::new(trace_id.clone(), Some("b".repeat(16)));
        let value = with_trace_context(ctx, proxy.call(json!({"who": "x"}))).await.unwrap();
        assert_eq!(value, json!("ok"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_propagated_headers_ride_both_channels() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/mcp")
            .match_header("x-tenant-id", "t1")
            .match_body(Matcher::PartialJson(json!({
                "params": {"arguments": {"_mesh_headers": {"x-tenant-id": "t1"}}},
            })))
            .with_body(text_envelope("ok"))
            .create_async()
            .await;

        let proxy = proxy_for(&server, &ProxyKwargs::default());
        let headers = HashMap::from([("x-tenant-id".to_string(), "t1".to_string())]);
        let value = with_propagated_headers(headers, proxy.call(json!({})))
            .await
            .unwrap();
        assert_eq!(value, json!("ok"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_no_trace_scope_means_no_trace_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/mcp")
            .match_header("x-trace-id", Matcher::Missing)
            .match_header("x-parent-span", Matcher::Missing)
            .with_body(text_envelope("ok"))
            .create_async()
            .await;

        let proxy = proxy_for(&server, &ProxyKwargs::default());
        proxy.call(json!({"who": "x"})).await.unwrap();
        mock.assert_async().await;
    }
}
