//! Trace span records.
//!
//! One record per unit of work (tool execution or outbound proxy call),
//! write-once, serialized to a flat string map for the trace stream.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::AgentDescriptor;

/// Agent identity attached to every span this process publishes.
#[derive(Debug, Clone, Default)]
pub struct AgentMetadata {
    pub agent_id: String,
    pub agent_name: String,
    pub namespace: String,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub endpoint: String,
}

impl AgentMetadata {
    pub fn from_descriptor(descriptor: &AgentDescriptor) -> Self {
        Self {
            agent_id: descriptor.agent_id.clone(),
            agent_name: descriptor.name.clone(),
            namespace: descriptor.namespace.clone(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| descriptor.http_host.clone()),
            ip: descriptor.http_host.clone(),
            port: descriptor.http_port,
            endpoint: descriptor.endpoint(),
        }
    }
}

/// Record of one unit of work, published to the trace stream.
#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span: Option<String>,
    pub function_name: String,
    /// Unix seconds
    pub start_time: f64,
    /// Unix seconds
    pub end_time: f64,
    pub success: bool,
    pub error: Option<String>,
    pub result_type: String,
    pub args_count: usize,
    pub kwargs_count: usize,
    /// Endpoints touched by this unit of work
    pub dependencies: Vec<String>,
    /// Number of dependency slots that resolved to a proxy
    pub injected_dependencies: usize,
    /// Slot indices that resolved to a proxy
    pub mesh_positions: Vec<usize>,
    pub agent: AgentMetadata,
}

/// Current wall-clock time as fractional Unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl SpanRecord {
    /// Flatten into the trace stream wire format: all-string fields with a
    /// fixed key set, `"null"` standing in for absent parent/error.
    pub fn into_fields(self) -> HashMap<String, String> {
        let duration_ms = (self.end_time - self.start_time).max(0.0) * 1000.0;

        let mut fields = HashMap::new();
        fields.insert("trace_id".to_string(), self.trace_id);
        fields.insert("span_id".to_string(), self.span_id);
        fields.insert(
            "parent_span".to_string(),
            self.parent_span.unwrap_or_else(|| "null".to_string()),
        );
        fields.insert("function_name".to_string(), self.function_name);
        fields.insert("start_time".to_string(), self.start_time.to_string());
        fields.insert("end_time".to_string(), self.end_time.to_string());
        fields.insert("duration_ms".to_string(), format!("{:.2}", duration_ms));
        fields.insert("success".to_string(), self.success.to_string());
        fields.insert(
            "error".to_string(),
            self.error.unwrap_or_else(|| "null".to_string()),
        );
        fields.insert("result_type".to_string(), self.result_type);
        fields.insert("args_count".to_string(), self.args_count.to_string());
        fields.insert("kwargs_count".to_string(), self.kwargs_count.to_string());
        fields.insert(
            "dependencies".to_string(),
            serde_json::to_string(&self.dependencies).unwrap_or_else(|_| "[]".to_string()),
        );
        fields.insert(
            "injected_dependencies".to_string(),
            self.injected_dependencies.to_string(),
        );
        fields.insert(
            "mesh_positions".to_string(),
            serde_json::to_string(&self.mesh_positions).unwrap_or_else(|_| "[]".to_string()),
        );
        fields.insert("agent_id".to_string(), self.agent.agent_id);
        fields.insert("agent_name".to_string(), self.agent.agent_name);
        fields.insert("agent_namespace".to_string(), self.agent.namespace);
        fields.insert("agent_hostname".to_string(), self.agent.hostname);
        fields.insert("agent_ip".to_string(), self.agent.ip);
        fields.insert("agent_port".to_string(), self.agent.port.to_string());
        fields.insert("agent_endpoint".to_string(), self.agent.endpoint);
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SpanRecord {
        SpanRecord {
            trace_id: "a".repeat(32),
            span_id: "b".repeat(16),
            parent_span: None,
            function_name: "greet".to_string(),
            start_time: 1000.0,
            end_time: 1000.1234,
            success: true,
            error: None,
            result_type: "string".to_string(),
            args_count: 0,
            kwargs_count: 2,
            dependencies: vec!["http://h:9100".to_string()],
            injected_dependencies: 1,
            mesh_positions: vec![0],
            agent: AgentMetadata {
                agent_id: "alpha-12345678".to_string(),
                agent_name: "alpha".to_string(),
                namespace: "default".to_string(),
                hostname: "host-1".to_string(),
                ip: "10.0.0.5".to_string(),
                port: 9001,
                endpoint: "http://10.0.0.5:9001".to_string(),
            },
        }
    }

    #[test]
    fn test_fields_exact_key_set() {
        let fields = sample_record().into_fields();
        let mut keys: Vec<&str> = fields.keys().map(String::as_str).collect();
        keys.sort_unstable();

        let mut expected = vec![
            "trace_id",
            "span_id",
            "parent_span",
            "function_name",
            "start_time",
            "end_time",
            "duration_ms",
            "success",
            "error",
            "result_type",
            "args_count",
            "kwargs_count",
            "dependencies",
            "injected_dependencies",
            "mesh_positions",
            "agent_id",
            "agent_name",
            "agent_namespace",
            "agent_hostname",
            "agent_ip",
            "agent_port",
            "agent_endpoint",
        ];
        expected.sort_unstable();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_null_placeholders_and_duration_format() {
        let fields = sample_record().into_fields();
        assert_eq!(fields["parent_span"], "null");
        assert_eq!(fields["error"], "null");
        assert_eq!(fields["success"], "true");
        // 0.1234 s -> 123.40 ms, two decimals
        assert_eq!(fields["duration_ms"], "123.40");
        assert_eq!(fields["dependencies"], r#"["http://h:9100"]"#);
        assert_eq!(fields["mesh_positions"], "[0]");
    }

    #[test]
    fn test_error_span_fields() {
        let mut record = sample_record();
        record.success = false;
        record.error = Some("boom".to_string());
        record.parent_span = Some("c".repeat(16));

        let fields = record.into_fields();
        assert_eq!(fields["success"], "false");
        assert_eq!(fields["error"], "boom");
        assert_eq!(fields["parent_span"], "c".repeat(16));
    }
}
