//! Canonical `Message` ⇄ Anthropic Messages API conversion.
//! Anthropic's wire shape is the closest of the three dialects to the
//! canonical model (nested content blocks, `thinking`/`tool_use`/
//! `tool_result` already first-class) so this module is mostly a thin
//! encode/decode layer plus the tool-id signature splice.

use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::model::{Content, ContentBlock, Message, Role};

use super::tool_id::encode_tool_id_with_signature;

/// Anthropic has no `system` role; the system prompt is a top-level
/// request field. Splits it off so the remaining messages can be
/// round-tripped message-by-message.
pub fn split_system_prompt(messages: &[Message]) -> (Option<String>, Vec<Message>) {
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

/// Encodes one canonical message as an Anthropic wire message. Canonical
/// `Role::Tool` messages (tool results) are emitted as `role: "user"` with
/// a `tool_result` block, matching Anthropic's convention that tool
/// results are user turns.
pub fn message_to_anthropic(msg: &Message) -> Value {
    let role = match msg.role {
        Role::Tool | Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "user",
    };

    let blocks: Vec<Value> = msg
        .content
        .as_blocks()
        .iter()
        .map(content_block_to_anthropic)
        .collect();

    json!({
        "role": role,
        "content": blocks,
    })
}

fn content_block_to_anthropic(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::Thinking { thinking, signature } => {
            let mut obj = json!({"type": "thinking", "thinking": thinking});
            if let Some(sig) = signature {
                obj["signature"] = json!(sig);
            }
            obj
        }
        ContentBlock::RedactedThinking { data } => {
            json!({"type": "redacted_thinking", "data": data})
        }
        ContentBlock::ToolUse { id, name, input } => {
            json!({"type": "tool_use", "id": id, "name": name, "input": input})
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => json!({"type": "tool_result", "tool_use_id": tool_use_id, "content": content}),
        ContentBlock::Image { source } => json!({"type": "image", "source": source}),
        ContentBlock::Unknown(value) => value.clone(),
    }
}

/// Splices a known signature onto a `tool_use` block's id in place, so it
/// survives an IDE round-trip.
pub fn apply_tool_use_signature(block: &mut ContentBlock, signature: Option<&str>) {
    if let ContentBlock::ToolUse { id, .. } = block {
        *id = encode_tool_id_with_signature(id, signature);
    }
}

/// Parses a single Anthropic wire message back into the canonical model.
/// A `user` message whose content is entirely `tool_result` blocks is
/// remapped to canonical `Role::Tool` for symmetry with the OpenAI
/// dialect's explicit `tool` role.
pub fn message_from_anthropic(value: &Value) -> Result<Message, GatewayError> {
    let obj = value
        .as_object()
        .ok_or_else(|| GatewayError::Protocol("anthropic message must be an object".into()))?;

    let role_str = obj
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Protocol("anthropic message missing role".into()))?;

    let raw_blocks: Vec<Value> = match obj.get("content") {
        Some(Value::Array(blocks)) => blocks.clone(),
        Some(Value::String(s)) => vec![json!({"type": "text", "text": s})],
        _ => Vec::new(),
    };

    let blocks: Vec<ContentBlock> = raw_blocks
        .iter()
        .map(content_block_from_anthropic)
        .collect::<Result<_, _>>()?;

    let all_tool_results = !blocks.is_empty()
        && blocks
            .iter()
            .all(|b| matches!(b, ContentBlock::ToolResult { .. }));

    let role = match (role_str, all_tool_results) {
        (_, true) => Role::Tool,
        ("user", _) => Role::User,
        ("assistant", _) => Role::Assistant,
        (other, _) => {
            return Err(GatewayError::Protocol(format!(
                "unrecognized anthropic role: {other}"
            )))
        }
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

fn content_block_from_anthropic(value: &Value) -> Result<ContentBlock, GatewayError> {
    serde_json::from_value(value.clone())
        .map_err(|e| GatewayError::Protocol(format!("invalid anthropic content block: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_system_prompt_out_of_message_list() {
        let messages = vec![
            Message::new(Role::System, Content::Text("be terse".into())),
            Message::new(Role::User, Content::Text("hi".into())),
        ];
        let (system, rest) = split_system_prompt(&messages);
        assert_eq!(system.unwrap(), "be terse");
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn tool_result_message_round_trips_to_tool_role() {
        let wire = json!({
            "role": "user",
            "content": [{"type": "tool_result", "tool_use_id": "call_1", "content": "72F"}]
        });
        let msg = message_from_anthropic(&wire).unwrap();
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.unwrap(), "call_1");
    }

    #[test]
    fn tool_use_signature_is_spliced_into_id() {
        let mut block = ContentBlock::ToolUse {
            id: "call_1".into(),
            name: "get_weather".into(),
            input: json!({}),
        };
        let sig = "A".repeat(60);
        apply_tool_use_signature(&mut block, Some(&sig));
        if let ContentBlock::ToolUse { id, .. } = &block {
            assert!(id.starts_with("call_1"));
            assert_ne!(id, "call_1");
        } else {
            panic!("expected tool_use");
        }
    }

    #[test]
    fn assistant_thinking_block_round_trips() {
        let msg = Message::new(
            Role::Assistant,
            Content::Blocks(vec![ContentBlock::Thinking {
                thinking: "let me think".into(),
                signature: Some("sig".into()),
            }]),
        );
        let wire = message_to_anthropic(&msg);
        assert_eq!(wire["content"][0]["type"], json!("thinking"));
        assert_eq!(wire["content"][0]["signature"], json!("sig"));
    }

    #[test]
    fn unrecognized_block_type_passes_through_untouched() {
        let wire = json!({
            "role": "assistant",
            "content": [{"type": "server_tool_use", "id": "srvtoolu_1", "name": "web_search", "input": {}}]
        });
        let msg = message_from_anthropic(&wire).unwrap();
        let round_tripped = message_to_anthropic(&msg);
        assert_eq!(round_tripped["content"][0], wire["content"][0]);
    }
}
