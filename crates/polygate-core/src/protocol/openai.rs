//! Canonical `Message` ⇄ OpenAI chat-completions message conversion (spec
//! §4.6). OpenAI messages are flat: a single `content` string (or `null`
//! when all content is tool calls), a top-level `tool_calls` array, and
//! tool results arrive as `role: "tool"` messages keyed by `tool_call_id`.

use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::model::{Content, ContentBlock, Message, Role, ToolCall, ToolCallFunction};

/// Anthropic/canonical `tool_use`/`thinking` blocks have no OpenAI wire
/// shape; they are folded into `tool_calls` or dropped (thinking has no
/// OpenAI equivalent, matching upstream's "OpenAI clients never see
/// thinking blocks" behavior).
pub fn message_to_openai(msg: &Message) -> Value {
    let blocks = msg.content.as_blocks();
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut tool_result: Option<(&str, &Value)> = None;

    for block in &blocks {
        match block {
            ContentBlock::Text { text: t } => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(t);
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": input.to_string(),
                    }
                }));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => {
                tool_result = Some((tool_use_id, content));
            }
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
            ContentBlock::Image { .. } | ContentBlock::Unknown(_) => {}
        }
    }

    if let Some((tool_use_id, content)) = tool_result {
        return json!({
            "role": "tool",
            "tool_call_id": tool_use_id,
            "content": stringify_tool_result(content),
        });
    }

    let mut out = serde_json::Map::new();
    out.insert("role".to_string(), json!(msg.role.as_str()));
    if !text.is_empty() || tool_calls.is_empty() {
        out.insert("content".to_string(), json!(text));
    } else {
        out.insert("content".to_string(), Value::Null);
    }
    if !tool_calls.is_empty() {
        out.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    Value::Object(out)
}

fn stringify_tool_result(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses a single OpenAI chat message back into the canonical model.
pub fn message_from_openai(value: &Value) -> Result<Message, GatewayError> {
    let obj = value
        .as_object()
        .ok_or_else(|| GatewayError::Protocol("openai message must be an object".into()))?;

    let role_str = obj
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Protocol("openai message missing role".into()))?;

    if role_str == "tool" {
        let tool_call_id = obj
            .get("tool_call_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let content = obj.get("content").cloned().unwrap_or(Value::Null);
        let mut msg = Message::new(
            Role::Tool,
            Content::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: tool_call_id.clone(),
                content,
            }]),
        );
        msg.tool_call_id = Some(tool_call_id);
        return Ok(msg);
    }

    let role = match role_str {
        "system" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        other => {
            return Err(GatewayError::Protocol(format!(
                "unrecognized openai role: {other}"
            )))
        }
    };

    let mut blocks = Vec::new();
    match obj.get("content") {
        Some(Value::String(s)) if !s.is_empty() => blocks.push(ContentBlock::Text { text: s.clone() }),
        Some(Value::Array(parts)) => {
            for part in parts {
                if let Some(p) = part.as_object() {
                    match p.get("type").and_then(Value::as_str) {
                        Some("text") => blocks.push(ContentBlock::Text {
                            text: p.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
                        }),
                        Some("image_url") => blocks.push(ContentBlock::Image {
                            source: p.get("image_url").cloned().unwrap_or(Value::Null),
                        }),
                        _ => {}
                    }
                }
            }
        }
        _ => {}
    }

    let mut tool_calls = None;
    if let Some(Value::Array(calls)) = obj.get("tool_calls") {
        let parsed: Vec<ToolCall> = calls
            .iter()
            .filter_map(|c| {
                let id = c.get("id")?.as_str()?.to_string();
                let func = c.get("function")?.as_object()?;
                let name = func.get("name")?.as_str()?.to_string();
                let arguments = func
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}")
                    .to_string();
                Some(ToolCall {
                    id,
                    kind: "function".to_string(),
                    function: ToolCallFunction { name, arguments },
                })
            })
            .collect();
        if !parsed.is_empty() {
            tool_calls = Some(parsed);
        }
    }

    let mut msg = Message::new(
        role,
        if blocks.is_empty() {
            Content::Text(String::new())
        } else {
            Content::Blocks(blocks)
        },
    );
    msg.tool_calls = tool_calls;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_text_round_trips() {
        let msg = Message::new(Role::Assistant, Content::Text("hello".into()));
        let wire = message_to_openai(&msg);
        assert_eq!(wire["content"], json!("hello"));
        let back = message_from_openai(&wire).unwrap();
        assert_eq!(back.content.as_blocks()[0].thinking_text(), None);
    }

    #[test]
    fn tool_use_becomes_tool_calls_array() {
        let msg = Message::new(
            Role::Assistant,
            Content::Blocks(vec![ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "get_weather".into(),
                input: json!({"city": "nyc"}),
            }]),
        );
        let wire = message_to_openai(&msg);
        assert_eq!(wire["tool_calls"][0]["function"]["name"], json!("get_weather"));
        assert_eq!(wire["content"], Value::Null);
    }

    #[test]
    fn tool_result_becomes_tool_role_message() {
        let msg = Message::new(
            Role::Tool,
            Content::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "call_1".into(),
                content: json!("72F"),
            }]),
        );
        let wire = message_to_openai(&msg);
        assert_eq!(wire["role"], json!("tool"));
        assert_eq!(wire["tool_call_id"], json!("call_1"));
    }

    #[test]
    fn parses_openai_tool_calls_back_to_canonical() {
        let wire = json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "get_weather", "arguments": "{\"city\":\"nyc\"}"}
            }]
        });
        let msg = message_from_openai(&wire).unwrap();
        assert_eq!(msg.tool_calls.unwrap()[0].function.name, "get_weather");
    }
}
