//! Canonical `Message` ⇄ Gemini `contents[]` conversion. Gemini
//! uses `{user, model}` roles instead of `{user, assistant}`, and represents
//! tool calls/results as `functionCall`/`functionResponse` parts rather than
//! dedicated content-block types.

use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::model::{Content, ContentBlock, Message, Role};

/// Gemini has no `system` role; like Anthropic it carries a top-level
/// `system_instruction` field instead.
pub fn split_system_instruction(messages: &[Message]) -> (Option<String>, Vec<Message>) {
    let mut system = String::new();
    let mut rest = Vec::with_capacity(messages.len());
    for msg in messages {
        if msg.role == Role::System {
            for block in msg.content.as_blocks() {
                if let ContentBlock::Text { text } = block {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&text);
                }
            }
        } else {
            rest.push(msg.clone());
        }
    }
    (if system.is_empty() { None } else { Some(system) }, rest)
}

/// Encodes one canonical message as a Gemini `Content` object.
pub fn message_to_gemini(msg: &Message) -> Value {
    let role = match msg.role {
        Role::Assistant => "model",
        Role::User | Role::Tool | Role::System => "user",
    };

    let parts: Vec<Value> = msg
        .content
        .as_blocks()
        .iter()
        .map(content_block_to_gemini)
        .collect();

    json!({
        "role": role,
        "parts": parts,
    })
}

fn content_block_to_gemini(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"text": text}),
        ContentBlock::Thinking { thinking, signature } => {
            let mut part = json!({"text": thinking, "thought": true});
            if let Some(sig) = signature {
                part["thoughtSignature"] = json!(sig);
            }
            part
        }
        ContentBlock::RedactedThinking { data } => {
            json!({"text": "", "thought": true, "thoughtSignature": data})
        }
        ContentBlock::ToolUse { name, input, .. } => {
            json!({"functionCall": {"name": name, "args": input}})
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => {
            json!({"functionResponse": {"name": tool_use_id, "response": function_response_body(content)}})
        }
        ContentBlock::Image { source } => json!({"inlineData": source}),
        ContentBlock::Unknown(value) => value.clone(),
    }
}

fn function_response_body(content: &Value) -> Value {
    if content.is_object() {
        content.clone()
    } else {
        json!({"result": content})
    }
}

/// Parses a single Gemini `Content` object back into the canonical model.
pub fn message_from_gemini(value: &Value) -> Result<Message, GatewayError> {
    let obj = value
        .as_object()
        .ok_or_else(|| GatewayError::Protocol("gemini content must be an object".into()))?;

    let role_str = obj
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("user");

    let parts = obj
        .get("parts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let blocks: Vec<ContentBlock> = parts.iter().map(content_block_from_gemini).collect();

    let all_function_responses = !blocks.is_empty()
        && blocks
            .iter()
            .all(|b| matches!(b, ContentBlock::ToolResult { .. }));

    let role = match (role_str, all_function_responses) {
        (_, true) => Role::Tool,
        ("model", _) => Role::Assistant,
        _ => Role::User,
    };

    let mut msg = Message::new(role, Content::Blocks(blocks));
    if role == Role::Tool {
        if let Some(ContentBlock::ToolResult { tool_use_id, .. }) =
            msg.content.as_blocks().first()
        {
            msg.tool_call_id = Some(tool_use_id.clone());
        }
    }
    Ok(msg)
}

fn content_block_from_gemini(part: &Value) -> ContentBlock {
    let obj = match part.as_object() {
        Some(o) => o,
        None => return ContentBlock::Unknown(part.clone()),
    };

    if let Some(func) = obj.get("functionCall").and_then(Value::as_object) {
        let name = func.get("name").and_then(Value::as_str).unwrap_or_default();
        let args = func.get("args").cloned().unwrap_or_else(|| json!({}));
        return ContentBlock::ToolUse {
            id: crate::protocol::tool_id::generate_tool_call_id(name, &args),
            name: name.to_string(),
            input: args,
        };
    }
    if let Some(func) = obj.get("functionResponse").and_then(Value::as_object) {
        let name = func.get("name").and_then(Value::as_str).unwrap_or_default();
        return ContentBlock::ToolResult {
            tool_use_id: name.to_string(),
            content: func.get("response").cloned().unwrap_or(Value::Null),
        };
    }
    if obj.get("thought").and_then(Value::as_bool) == Some(true) {
        return ContentBlock::Thinking {
            thinking: obj.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
            signature: obj
                .get("thoughtSignature")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
    }
    if let Some(inline) = obj.get("inlineData") {
        return ContentBlock::Image {
            source: inline.clone(),
        };
    }
    if let Some(text) = obj.get("text").and_then(Value::as_str) {
        return ContentBlock::Text {
            text: text.to_string(),
        };
    }
    ContentBlock::Unknown(part.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_role_maps_to_model() {
        let msg = Message::new(Role::Assistant, Content::Text("hi".into()));
        let wire = message_to_gemini(&msg);
        assert_eq!(wire["role"], json!("model"));
    }

    #[test]
    fn tool_use_becomes_function_call_part() {
        let msg = Message::new(
            Role::Assistant,
            Content::Blocks(vec![ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "get_weather".into(),
                input: json!({"city": "nyc"}),
            }]),
        );
        let wire = message_to_gemini(&msg);
        assert_eq!(wire["parts"][0]["functionCall"]["name"], json!("get_weather"));
    }

    #[test]
    fn function_response_round_trips_to_tool_role() {
        let wire = json!({
            "role": "user",
            "parts": [{"functionResponse": {"name": "get_weather", "response": {"temp": "72F"}}}]
        });
        let msg = message_from_gemini(&wire).unwrap();
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.unwrap(), "get_weather");
    }

    #[test]
    fn thought_part_becomes_thinking_block() {
        let wire = json!({"role": "model", "parts": [{"text": "pondering", "thought": true, "thoughtSignature": "sig"}]});
        let msg = message_from_gemini(&wire).unwrap();
        let blocks = msg.content.as_blocks();
        assert_eq!(blocks[0].thinking_text(), Some("pondering"));
        assert_eq!(blocks[0].signature(), Some("sig"));
    }

    #[test]
    fn unrecognized_part_shape_passes_through_untouched() {
        let part = json!({"executableCode": {"language": "PYTHON", "code": "print(1)"}});
        let block = content_block_from_gemini(&part);
        assert!(matches!(block, ContentBlock::Unknown(_)));
        assert_eq!(content_block_to_gemini(&block), part);
    }
}
