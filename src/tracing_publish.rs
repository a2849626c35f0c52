//! Distributed tracing publisher for MCP Mesh.
//!
//! Spans are enqueued on a channel and drained by a background task that
//! XADDs them to a Redis stream. Publishing never blocks the hot path and
//! never surfaces failures to callers.

use std::collections::HashMap;
use std::sync::OnceLock;

use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{is_tracing_enabled, redis_url};
use crate::span::{unix_now, AgentMetadata, SpanRecord};

/// Redis stream name for trace data.
const TRACE_STREAM_NAME: &str = "mesh:trace";

/// Queue depth between the hot path and the Redis writer.
const SPAN_QUEUE_SIZE: usize = 1024;

struct TracePublisher {
    tx: mpsc::Sender<HashMap<String, String>>,
    metadata: AgentMetadata,
}

/// Global publisher singleton, set once at agent start.
static PUBLISHER: OnceLock<TracePublisher> = OnceLock::new();

/// Initialize the trace publisher.
///
/// Consults `MCP_MESH_DISTRIBUTED_TRACING_ENABLED`; when disabled, returns
/// false and spans become no-ops. When enabled, verifies the Redis
/// connection and spawns the writer task. Idempotent.
pub async fn init_trace_publisher(metadata: AgentMetadata) -> bool {
    if PUBLISHER.get().is_some() {
        return true;
    }

    if !is_tracing_enabled() {
        debug!("Distributed tracing: disabled");
        return false;
    }

    info!("Distributed tracing: enabled for agent '{}'", metadata.agent_id);

    let url = redis_url();
    let client = match redis::Client::open(url.as_str()) {
        Ok(client) => client,
        Err(e) => {
            warn!("Failed to create Redis client: {}", e);
            return false;
        }
    };

    // Verify connectivity up front so failures land in the start log
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("Failed to connect to Redis: {}", e);
            return false;
        }
    };
    let ping: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
    if let Err(e) = ping {
        warn!("Redis ping failed: {}", e);
        return false;
    }

    let (tx, mut rx) = mpsc::channel::<HashMap<String, String>>(SPAN_QUEUE_SIZE);

    tokio::spawn(async move {
        while let Some(mut fields) = rx.recv().await {
            if !fields.contains_key("published_at") {
                fields.insert("published_at".to_string(), unix_now().to_string());
            }

            let items: Vec<(&str, &str)> = fields
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();

            let result: Result<String, redis::RedisError> =
                conn.xadd(TRACE_STREAM_NAME, "*", &items).await;
            if let Err(e) = result {
                // Never fail agent operations over trace transport
                debug!("Failed to publish trace span: {}", e);
            }
        }
    });

    let _ = PUBLISHER.set(TracePublisher { tx, metadata });
    true
}

/// Enqueue a span for publication. Best-effort: a full queue or an
/// uninitialized publisher drops the span.
pub fn publish_span(record: SpanRecord) -> bool {
    let Some(publisher) = PUBLISHER.get() else {
        return false;
    };

    match publisher.tx.try_send(record.into_fields()) {
        Ok(()) => true,
        Err(e) => {
            debug!("Span queue full or closed, dropping span: {}", e);
            false
        }
    }
}

/// Check if trace publishing is available.
pub fn is_trace_publisher_available() -> bool {
    PUBLISHER.get().is_some()
}

/// The agent identity spans from this process carry.
///
/// Returns a default (empty) identity before initialization so span
/// construction never fails.
pub fn publisher_metadata() -> AgentMetadata {
    PUBLISHER
        .get()
        .map(|p| p.metadata.clone())
        .unwrap_or_default()
}
