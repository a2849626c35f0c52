//! Route runtime, API-consumer variant.
//!
//! Serves HTTP applications whose routes declare mesh dependencies but
//! expose no MCP tools. Routes are registered in a single pass that already
//! knows method and path, so their ids are `"METHOD:/path"` from the start.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use axum::routing::{any, on, MethodFilter};
use axum::Router;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::agent::{dispatch_event, install_signal_handlers, AgentError};
use crate::config::{resolve_descriptor, AgentConfig, AgentDescriptor, ConfigError};
use crate::events::MeshEvent;
use crate::llm::LlmTopology;
use crate::proxy::MeshProxy;
use crate::runtime::{start_runtime, RuntimeConfig};
use crate::span::{unix_now, AgentMetadata, SpanRecord};
use crate::spec::{AgentSpec, AgentType, DependencySpec, ProxyKwargs, ToolSpec};
use crate::table::DependencyTable;
use crate::trace::{
    collect_propagated_headers, generate_span_id, parse_trace_headers, with_propagated_headers,
    with_trace_context, TraceContext,
};
use crate::tracing_publish::{init_trace_publisher, publish_span};

/// The dependency view handed to a route handler: one entry per declared
/// slot, in declaration order.
#[derive(Clone, Default)]
pub struct RouteDeps {
    entries: Vec<(String, Option<Arc<MeshProxy>>)>,
}

impl RouteDeps {
    /// Proxy for a capability, if resolved.
    pub fn get(&self, capability: &str) -> Option<Arc<MeshProxy>> {
        self.entries
            .iter()
            .find(|(name, _)| name == capability)
            .and_then(|(_, proxy)| proxy.clone())
    }

    /// Declared capabilities, in order, with resolution state.
    pub fn entries(&self) -> &[(String, Option<Arc<MeshProxy>>)] {
        &self.entries
    }
}

pub type RouteFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A route handler: the request plus the current dependency snapshot.
pub type RouteHandler = Arc<dyn Fn(Request, RouteDeps) -> RouteFuture + Send + Sync>;

/// Adapt an async closure into a [`RouteHandler`].
pub fn route_handler<F, Fut>(f: F) -> RouteHandler
where
    F: Fn(Request, RouteDeps) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |request, deps| Box::pin(f(request, deps)))
}

struct RouteEntry {
    method: String,
    path: String,
    spec: ToolSpec,
    handler: RouteHandler,
}

/// The API-consumer runtime: same dependency machinery as the agent
/// runtime, no provider surface.
pub struct MeshRouter {
    descriptor: AgentDescriptor,
    routes: Vec<RouteEntry>,
    table: Arc<DependencyTable>,
    llm_topology: LlmTopology,
}

impl MeshRouter {
    pub fn new(config: AgentConfig) -> Result<Self, ConfigError> {
        let descriptor = resolve_descriptor(&config, AgentType::Api)?;
        info!("Route runtime '{}' created", descriptor.agent_id);

        Ok(Self {
            descriptor,
            routes: Vec::new(),
            table: Arc::new(DependencyTable::new()),
            llm_topology: LlmTopology::new(),
        })
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub fn dependency_table(&self) -> Arc<DependencyTable> {
        self.table.clone()
    }

    /// Register a route with its dependency declarations.
    ///
    /// The route id is `"METHOD:/path"`; it doubles as the consumer id in
    /// the dependency table and the function name announced to the
    /// registry.
    pub fn route(
        &mut self,
        method: &str,
        path: &str,
        dependencies: Vec<Value>,
        handler: RouteHandler,
    ) -> Result<(), AgentError> {
        let method = method.to_uppercase();
        let route_id = format!("{}:{}", method, path);

        if self.routes.iter().any(|r| r.spec.function_name == route_id) {
            return Err(AgentError::DuplicateTool(route_id));
        }

        let mut specs = Vec::with_capacity(dependencies.len());
        for (index, raw) in dependencies.iter().enumerate() {
            let spec =
                DependencySpec::normalize(raw).ok_or_else(|| AgentError::InvalidDependency {
                    tool: route_id.clone(),
                    index,
                })?;
            specs.push(spec);
        }

        let mut spec = ToolSpec::new(route_id.clone(), route_id.clone());
        spec.dependencies = specs;

        debug!(
            "Route '{}' registered with {} dependency slots",
            route_id,
            spec.dependencies.len()
        );
        self.routes.push(RouteEntry {
            method,
            path: path.to_string(),
            spec,
            handler,
        });
        Ok(())
    }

    /// Build the axum router with DI and tracing middleware applied.
    pub fn into_axum_router(&self) -> Router {
        let metadata = AgentMetadata::from_descriptor(&self.descriptor);
        let mut router = Router::new();

        for entry in &self.routes {
            let route_id = entry.spec.function_name.clone();
            let specs = entry.spec.dependencies.clone();
            let handler = entry.handler.clone();
            let table = self.table.clone();
            let metadata = metadata.clone();

            let wrapped = move |request: Request| {
                let route_id = route_id.clone();
                let specs = specs.clone();
                let handler = handler.clone();
                let table = table.clone();
                let metadata = metadata.clone();
                async move {
                    execute_route(route_id, specs, handler, table, metadata, request).await
                }
            };

            router = match method_filter(&entry.method) {
                Some(filter) => router.route(&entry.path, on(filter, wrapped)),
                None => router.route(&entry.path, any(wrapped)),
            };
        }

        router
    }

    /// Start everything and block until shutdown.
    ///
    /// Mirrors the agent runtime without an MCP server: tracing, the HTTP
    /// listener (when a port is configured), the registry runtime, signal
    /// handlers, then the event dispatcher.
    pub async fn run(self) -> Result<(), AgentError> {
        let metadata = AgentMetadata::from_descriptor(&self.descriptor);
        init_trace_publisher(metadata).await;

        let axum_router = self.into_axum_router();
        let serve_task = if self.descriptor.http_port > 0 {
            let addr = format!("0.0.0.0:{}", self.descriptor.http_port);
            let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
                AgentError::Server(crate::server::ServerError::Bind {
                    addr,
                    message: e.to_string(),
                })
            })?;
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, axum_router).await {
                    error!("HTTP server failed: {}", e);
                }
            }))
        } else {
            debug!("Port 0 configured: not serving");
            None
        };

        let route_specs: Vec<ToolSpec> = self.routes.iter().map(|r| r.spec.clone()).collect();
        let spec = AgentSpec::from_descriptor(&self.descriptor, route_specs.clone());
        let handle = Arc::new(start_runtime(spec, RuntimeConfig::default())?);

        install_signal_handlers(handle.clone());

        while let Some(event) = handle.next_event().await {
            if event == MeshEvent::Shutdown {
                info!("Shutdown event received, stopping route runtime");
                break;
            }
            dispatch_event(&self.table, &route_specs, &self.llm_topology, event);
        }

        if let Some(task) = serve_task {
            task.abort();
        }

        Ok(())
    }
}

fn method_filter(method: &str) -> Option<MethodFilter> {
    match method {
        "GET" => Some(MethodFilter::GET),
        "POST" => Some(MethodFilter::POST),
        "PUT" => Some(MethodFilter::PUT),
        "DELETE" => Some(MethodFilter::DELETE),
        "PATCH" => Some(MethodFilter::PATCH),
        "HEAD" => Some(MethodFilter::HEAD),
        "OPTIONS" => Some(MethodFilter::OPTIONS),
        _ => None,
    }
}

/// Per-request middleware: trace extraction, propagated headers, the
/// dependency snapshot, and span publication around the handler.
async fn execute_route(
    route_id: String,
    specs: Vec<DependencySpec>,
    handler: RouteHandler,
    table: Arc<DependencyTable>,
    metadata: AgentMetadata,
    request: Request<Body>,
) -> Response {
    let headers: HashMap<String, String> = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let incoming = parse_trace_headers(&headers);
    let ctx = incoming.unwrap_or_else(TraceContext::root);
    let span_id = generate_span_id();
    let propagated = collect_propagated_headers(&headers);

    let deps = RouteDeps {
        entries: table.snapshot(&route_id, &specs),
    };
    let mesh_positions: Vec<usize> = deps
        .entries
        .iter()
        .enumerate()
        .filter_map(|(slot, (_, proxy))| proxy.is_some().then_some(slot))
        .collect();
    let dependencies: Vec<String> = deps
        .entries
        .iter()
        .filter_map(|(_, proxy)| proxy.as_ref().map(|p| p.endpoint.clone()))
        .collect();

    let child_ctx = TraceContext::new(ctx.trace_id.clone(), Some(span_id.clone()));

    let start_time = unix_now();
    let response = with_propagated_headers(
        propagated,
        with_trace_context(child_ctx, handler(request, deps)),
    )
    .await;
    let end_time = unix_now();

    let status = response.status();
    publish_span(SpanRecord {
        trace_id: ctx.trace_id,
        span_id,
        parent_span: ctx.parent_span_id,
        function_name: route_id,
        start_time,
        end_time,
        success: !status.is_server_error(),
        error: status
            .is_server_error()
            .then(|| format!("HTTP {}", status.as_u16())),
        result_type: "response".to_string(),
        args_count: 0,
        kwargs_count: 0,
        dependencies,
        injected_dependencies: mesh_positions.len(),
        mesh_positions,
        agent: metadata,
    });

    response
}
