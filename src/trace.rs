//! Trace context propagation for MCP Mesh.
//!
//! Trace context and propagated headers ride on task-local storage: a scope
//! installed by the tool wrapper is observable by everything the handler
//! awaits, while concurrent invocations stay isolated.

use std::collections::HashMap;
use std::future::Future;

use uuid::Uuid;

use crate::config::propagate_header_allowlist;

/// HTTP header carrying the 128-bit trace ID (32 hex chars).
pub const TRACE_ID_HEADER: &str = "X-Trace-ID";

/// HTTP header carrying the 64-bit parent span ID (16 hex chars).
pub const PARENT_SPAN_HEADER: &str = "X-Parent-Span";

/// Argument-level fallback for the trace ID.
pub const TRACE_ID_FIELD: &str = "_trace_id";

/// Argument-level fallback for the parent span ID.
pub const PARENT_SPAN_FIELD: &str = "_parent_span";

/// Argument-level carrier for propagated headers.
pub const MESH_HEADERS_FIELD: &str = "_mesh_headers";

tokio::task_local! {
    static TRACE_CONTEXT: TraceContext;
    static PROPAGATED_HEADERS: HashMap<String, String>;
}

/// The pair propagated across agents to correlate distributed work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 128-bit trace ID, 32 lowercase hex chars
    pub trace_id: String,

    /// 64-bit span ID of the parent, 16 lowercase hex chars
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    pub fn new(trace_id: impl Into<String>, parent_span_id: Option<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            parent_span_id,
        }
    }

    /// Mint a fresh root context.
    pub fn root() -> Self {
        Self {
            trace_id: generate_trace_id(),
            parent_span_id: None,
        }
    }
}

/// Generate a 128-bit trace ID (32 hex chars, OpenTelemetry-sized).
pub fn generate_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a 64-bit span ID (16 hex chars).
pub fn generate_span_id() -> String {
    let full = Uuid::new_v4().simple().to_string();
    full[..16].to_string()
}

/// Read trace context from a header map, case-insensitively.
///
/// Returns None when no trace ID header is present.
pub fn parse_trace_headers(headers: &HashMap<String, String>) -> Option<TraceContext> {
    let mut trace_id = None;
    let mut parent_span = None;

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(TRACE_ID_HEADER) {
            trace_id = Some(value.clone());
        } else if name.eq_ignore_ascii_case(PARENT_SPAN_HEADER) {
            parent_span = Some(value.clone());
        }
    }

    trace_id.map(|id| TraceContext::new(id, parent_span))
}

/// Emit the header pair for an outbound call.
pub fn trace_headers(trace_id: &str, span_id: &str) -> Vec<(&'static str, String)> {
    vec![
        (TRACE_ID_HEADER, trace_id.to_string()),
        (PARENT_SPAN_HEADER, span_id.to_string()),
    ]
}

/// Run `fut` with `ctx` installed as the current trace context.
///
/// Scopes nest; the innermost wins. Two concurrent scoped futures never
/// observe each other's context.
pub async fn with_trace_context<F>(ctx: TraceContext, fut: F) -> F::Output
where
    F: Future,
{
    TRACE_CONTEXT.scope(ctx, fut).await
}

/// The trace context installed by the nearest enclosing scope, if any.
pub fn current_trace_context() -> Option<TraceContext> {
    TRACE_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Run `fut` with the given propagated headers installed.
pub async fn with_propagated_headers<F>(headers: HashMap<String, String>, fut: F) -> F::Output
where
    F: Future,
{
    PROPAGATED_HEADERS.scope(headers, fut).await
}

/// Headers carried from the inbound call into outbound proxy calls within
/// the current scope. Empty outside any scope.
pub fn current_propagated_headers() -> HashMap<String, String> {
    PROPAGATED_HEADERS
        .try_with(|headers| headers.clone())
        .unwrap_or_default()
}

/// Filter an inbound header map down to the configured allow-list,
/// lowercasing names.
pub fn collect_propagated_headers(incoming: &HashMap<String, String>) -> HashMap<String, String> {
    let allowlist = propagate_header_allowlist();
    if allowlist.is_empty() {
        return HashMap::new();
    }

    incoming
        .iter()
        .filter_map(|(name, value)| {
            let lower = name.to_lowercase();
            allowlist.contains(&lower).then(|| (lower, value.clone()))
        })
        .collect()
}

/// Spawn a task that inherits the current trace context and propagated
/// headers at spawn time.
pub fn spawn_traced<F>(fut: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let ctx = current_trace_context();
    let headers = current_propagated_headers();
    tokio::spawn(async move {
        let inner = async move {
            match ctx {
                Some(ctx) => with_trace_context(ctx, fut).await,
                None => fut.await,
            }
        };
        with_propagated_headers(headers, inner).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_lengths() {
        let trace_id = generate_trace_id();
        assert_eq!(trace_id.len(), 32);
        assert!(trace_id.chars().all(|c| c.is_ascii_hexdigit()));

        let span_id = generate_span_id();
        assert_eq!(span_id.len(), 16);
        assert!(span_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(generate_trace_id(), generate_trace_id());
        assert_ne!(generate_span_id(), generate_span_id());
    }

    #[test]
    fn test_parse_trace_headers_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("x-trace-id".to_string(), "a".repeat(32));
        headers.insert("X-PARENT-SPAN".to_string(), "b".repeat(16));

        let ctx = parse_trace_headers(&headers).unwrap();
        assert_eq!(ctx.trace_id, "a".repeat(32));
        assert_eq!(ctx.parent_span_id, Some("b".repeat(16)));
    }

    #[test]
    fn test_parse_trace_headers_absent() {
        let headers = HashMap::from([("content-type".to_string(), "application/json".to_string())]);
        assert!(parse_trace_headers(&headers).is_none());

        // A parent span alone is not a context
        let headers = HashMap::from([("X-Parent-Span".to_string(), "b".repeat(16))]);
        assert!(parse_trace_headers(&headers).is_none());
    }

    #[test]
    fn test_trace_headers_roundtrip() {
        let emitted: HashMap<String, String> = trace_headers(&"a".repeat(32), &"b".repeat(16))
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let ctx = parse_trace_headers(&emitted).unwrap();
        assert_eq!(ctx.trace_id, "a".repeat(32));
        assert_eq!(ctx.parent_span_id, Some("b".repeat(16)));
    }

    #[tokio::test]
    async fn test_context_scope_visibility() {
        assert!(current_trace_context().is_none());

        let ctx = TraceContext::new("c".repeat(32), Some("d".repeat(16)));
        let observed = with_trace_context(ctx.clone(), async {
            // Visible across await points
            tokio::task::yield_now().await;
            current_trace_context()
        })
        .await;

        assert_eq!(observed, Some(ctx));
        assert!(current_trace_context().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_scopes_are_isolated() {
        let ctx_a = TraceContext::new("a".repeat(32), None);
        let ctx_b = TraceContext::new("b".repeat(32), None);

        let task_a = tokio::spawn(with_trace_context(ctx_a.clone(), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            current_trace_context()
        }));
        let task_b = tokio::spawn(with_trace_context(ctx_b.clone(), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            current_trace_context()
        }));

        assert_eq!(task_a.await.unwrap(), Some(ctx_a));
        assert_eq!(task_b.await.unwrap(), Some(ctx_b));
    }

    #[tokio::test]
    async fn test_nested_scopes_shadow() {
        let outer = TraceContext::new("a".repeat(32), None);
        let inner = TraceContext::new("f".repeat(32), Some("1".repeat(16)));

        let (inside, after) = with_trace_context(outer.clone(), async {
            let inside = with_trace_context(inner.clone(), async { current_trace_context() }).await;
            (inside, current_trace_context())
        })
        .await;

        assert_eq!(inside, Some(inner));
        assert_eq!(after, Some(outer));
    }

    #[tokio::test]
    async fn test_spawn_traced_inherits_context() {
        let ctx = TraceContext::new("e".repeat(32), Some("2".repeat(16)));
        let observed = with_trace_context(ctx.clone(), async {
            spawn_traced(async { current_trace_context() }).await.unwrap()
        })
        .await;
        assert_eq!(observed, Some(ctx));
    }

    #[tokio::test]
    async fn test_propagated_headers_scope() {
        let headers = HashMap::from([("x-tenant-id".to_string(), "t1".to_string())]);
        let observed = with_propagated_headers(headers.clone(), async {
            current_propagated_headers()
        })
        .await;
        assert_eq!(observed, headers);
        assert!(current_propagated_headers().is_empty());
    }
}
