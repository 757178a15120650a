//! `ProtocolTranslator` (C6): bidirectional Anthropic/OpenAI/Gemini message
//! and tool conversion, grounded on the teacher's per-provider
//! `api.rs`/`factory.rs` split (`providers/openai/src/api.rs`,
//! `providers/anthropic/src/factory.rs`) for how request/response DTOs are
//! declared separately from the canonical model.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod tool_id;
pub mod tool_schema;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Canonical tool definition, independent of wire dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub parameters: Value,
}

/// Accepts the three inbound tool shapes spec §4.6 names:
/// `{type: function, function: {...}}`, `{type: custom, custom: {...}}`,
/// and flat `{name, parameters|input_schema}`.
pub fn normalize_tool_definition(raw: &Value) -> Option<ToolDefinition> {
    let obj = raw.as_object()?;

    let inner = match obj.get("type").and_then(Value::as_str) {
        Some("function") => obj.get("function"),
        Some("custom") => obj.get("custom"),
        _ => None,
    };
    let source = inner.and_then(Value::as_object).unwrap_or(obj);

    let name = source.get("name")?.as_str()?.to_string();
    let description = source
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string);
    let parameters = source
        .get("parameters")
        .or_else(|| source.get("input_schema"))
        .cloned()
        .unwrap_or_else(|| json!({"type": "object", "properties": {}}));

    Some(ToolDefinition {
        name,
        description,
        parameters: tool_schema::clean_json_schema(&parameters),
    })
}

/// Emits the canonical OpenAI-style `{type: function, function: {...}}`
/// shape.
pub fn tool_definition_to_openai(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description.clone().unwrap_or_default(),
            "parameters": tool.parameters,
        }
    })
}

/// Anthropic-shaped tool declaration (`input_schema` instead of
/// `parameters`, no `type`/`function` wrapper).
pub fn tool_definition_to_anthropic(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description.clone().unwrap_or_default(),
        "input_schema": tool.parameters,
    })
}

/// Normalizes `tool_choice` to one of `"auto" | "none" | "required"` or
/// `{type: function, function: {name}}`. Anything unrecognized falls back
/// to `"auto"`.
pub fn normalize_tool_choice(raw: &Value) -> Value {
    match raw {
        Value::String(s) if matches!(s.as_str(), "auto" | "none" | "required") => raw.clone(),
        Value::Object(obj) => {
            if let Some(name) = obj
                .get("function")
                .and_then(Value::as_object)
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .or_else(|| obj.get("name").and_then(Value::as_str))
            {
                return json!({"type": "function", "function": {"name": name}});
            }
            tracing::warn!(choice = %raw, "unrecognized tool_choice shape, defaulting to auto");
            json!("auto")
        }
        _ => {
            tracing::warn!(choice = %raw, "unrecognized tool_choice shape, defaulting to auto");
            json!("auto")
        }
    }
}
