//! System prompt assembly for LLM tools.
//!
//! Prompts are handlebars templates, inline or behind a `file://` path,
//! rendered with caller-supplied context. Tool and output-format sections
//! are appended by the vendor handler.

use handlebars::Handlebars;
use serde_json::Value;

use super::provider::ToolDefinition;
use super::schema::schema_description;
use super::LlmError;

/// Fallback system prompt when a tool declares none.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Render a system prompt template with the given context.
///
/// `source` is either inline template text or a `file://` path to one.
pub fn render_system_prompt(source: &str, context: &Value) -> Result<String, LlmError> {
    let template = match source.strip_prefix("file://") {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| LlmError::Template(format!("failed to read '{}': {}", path, e)))?,
        None => source.to_string(),
    };

    let handlebars = Handlebars::new();
    handlebars
        .render_template(&template, context)
        .map_err(|e| LlmError::Template(e.to_string()))
}

/// The "Available Tools" section appended to the system message when the
/// tool list is non-empty.
pub fn tools_section(tools: &[ToolDefinition]) -> String {
    let mut section = String::from("\n\n## Available Tools\n");
    for tool in tools {
        section.push_str(&format!("\n### {}\n", tool.name));
        if !tool.description.is_empty() {
            section.push_str(&format!("{}\n", tool.description));
        }
        section.push_str(&format!(
            "Input schema:\n```json\n{}\n```\n",
            serde_json::to_string_pretty(&tool.parameters)
                .unwrap_or_else(|_| tool.parameters.to_string())
        ));
    }
    section
}

/// The "Output Format" section appended when a return schema applies.
pub fn output_format_section(schema: &Value) -> String {
    format!(
        "\n\n## Output Format\n\nRespond only with JSON matching this schema, \
         with no surrounding prose:\n```json\n{}\n```\n",
        schema_description(schema)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_render_inline_template() {
        let rendered = render_system_prompt(
            "You help {{user}} with {{topic}}.",
            &json!({"user": "ada", "topic": "math"}),
        )
        .unwrap();
        assert_eq!(rendered, "You help ada with math.");
    }

    #[test]
    fn test_render_missing_context_is_empty() {
        // Non-strict rendering: unknown variables render as empty
        let rendered = render_system_prompt("Hello {{missing}}!", &json!({})).unwrap();
        assert_eq!(rendered, "Hello !");
    }

    #[test]
    fn test_render_file_template() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "Agent for {{{{domain}}}}").unwrap();

        let source = format!("file://{}", file.path().display());
        let rendered = render_system_prompt(&source, &json!({"domain": "billing"})).unwrap();
        assert_eq!(rendered, "Agent for billing");
    }

    #[test]
    fn test_render_missing_file_is_error() {
        let err = render_system_prompt("file:///nonexistent/prompt.hbs", &json!({})).unwrap_err();
        assert!(matches!(err, LlmError::Template(_)));
    }

    #[test]
    fn test_tools_section_lists_name_description_schema() {
        let tools = vec![ToolDefinition {
            name: "add".to_string(),
            description: "Add two numbers".to_string(),
            parameters: json!({"type": "object", "properties": {"a": {"type": "number"}}}),
        }];

        let section = tools_section(&tools);
        assert!(section.contains("## Available Tools"));
        assert!(section.contains("### add"));
        assert!(section.contains("Add two numbers"));
        assert!(section.contains("\"a\""));
    }

    #[test]
    fn test_output_format_section_embeds_schema() {
        let section = output_format_section(&json!({"type": "object"}));
        assert!(section.contains("## Output Format"));
        assert!(section.contains("Respond only with JSON"));
        assert!(section.contains("\"object\""));
    }
}
