//! Schema helpers for structured output.

use serde_json::{json, Value};

/// Prepare a schema for native structured-output decoding.
///
/// Vendors that enforce schemas server-side reject open object schemas, so
/// every object schema reachable from the root gets
/// `additionalProperties: false`, including `$defs`/`definitions`, array
/// `items`, and combinator branches.
pub fn enforce_strict(schema: &Value) -> Value {
    let mut strict = schema.clone();
    strictify(&mut strict);
    strict
}

fn strictify(schema: &mut Value) {
    let Some(object) = schema.as_object_mut() else {
        return;
    };

    let is_object_schema = object.get("type").and_then(Value::as_str) == Some("object")
        || object.contains_key("properties");
    if is_object_schema {
        object.insert("additionalProperties".to_string(), json!(false));
    }

    if let Some(properties) = object.get_mut("properties").and_then(Value::as_object_mut) {
        for property in properties.values_mut() {
            strictify(property);
        }
    }

    for defs_key in ["$defs", "definitions"] {
        if let Some(defs) = object.get_mut(defs_key).and_then(Value::as_object_mut) {
            for def in defs.values_mut() {
                strictify(def);
            }
        }
    }

    if let Some(items) = object.get_mut("items") {
        match items {
            Value::Array(entries) => {
                for entry in entries {
                    strictify(entry);
                }
            }
            other => strictify(other),
        }
    }

    for combinator in ["anyOf", "oneOf", "allOf"] {
        if let Some(branches) = object.get_mut(combinator).and_then(Value::as_array_mut) {
            for branch in branches {
                strictify(branch);
            }
        }
    }
}

/// Render a schema as the prompt-facing description used in the
/// "Output Format" section.
pub fn schema_description(schema: &Value) -> String {
    serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every reachable object schema must carry additionalProperties: false.
    fn assert_strict_everywhere(schema: &Value) {
        if let Some(object) = schema.as_object() {
            let is_object_schema = object.get("type").and_then(Value::as_str) == Some("object")
                || object.contains_key("properties");
            if is_object_schema {
                assert_eq!(
                    object.get("additionalProperties"),
                    Some(&json!(false)),
                    "object schema missing additionalProperties: false: {}",
                    schema
                );
            }
            for value in object.values() {
                assert_strict_everywhere(value);
            }
        } else if let Some(entries) = schema.as_array() {
            for entry in entries {
                assert_strict_everywhere(entry);
            }
        }
    }

    #[test]
    fn test_enforce_strict_top_level() {
        let schema = json!({
            "type": "object",
            "properties": {"answer": {"type": "string"}}
        });
        let strict = enforce_strict(&schema);
        assert_eq!(strict["additionalProperties"], json!(false));
    }

    #[test]
    fn test_enforce_strict_recurses_through_defs_and_items() {
        let schema = json!({
            "type": "object",
            "properties": {
                "entries": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {"name": {"type": "string"}}
                    }
                },
                "nested": {"$ref": "#/$defs/inner"}
            },
            "$defs": {
                "inner": {
                    "type": "object",
                    "properties": {
                        "deep": {
                            "type": "object",
                            "properties": {"leaf": {"type": "number"}}
                        }
                    }
                }
            },
            "anyOf": [
                {"type": "object", "properties": {"variant": {"type": "string"}}}
            ]
        });

        let strict = enforce_strict(&schema);
        assert_strict_everywhere(&strict);
    }

    #[test]
    fn test_enforce_strict_leaves_scalars_alone() {
        let schema = json!({"type": "string"});
        let strict = enforce_strict(&schema);
        assert_eq!(strict, schema);
    }

    #[test]
    fn test_schema_description_is_pretty_json() {
        let schema = json!({"type": "object", "properties": {"a": {"type": "string"}}});
        let description = schema_description(&schema);
        assert!(description.contains("\"type\": \"object\""));
        assert!(description.contains('\n'));
    }
}
