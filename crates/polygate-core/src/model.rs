//! The canonical internal message model shared by every protocol translator,
//! the stream transformer, and the conversation state machine.
//!
//! Content blocks are modeled as a tagged enum with an `Unknown` catch-all so
//! that fields no provider/client documents yet still round-trip instead of
//! being dropped (design note: "dynamic typing / duck-typing of messages").

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Either a bare string or a sequence of content blocks — both shapes are
/// legal on the wire for OpenAI/Anthropic `content` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Content {
    pub fn as_blocks(&self) -> Vec<ContentBlock> {
        match self {
            Content::Text(t) => vec![ContentBlock::Text { text: t.clone() }],
            Content::Blocks(b) => b.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(t) => t.is_empty(),
            Content::Blocks(b) => b.is_empty(),
        }
    }
}

/// The subset of `ContentBlock` serde derives a tag-dispatched shape for.
/// Kept private: `ContentBlock` wraps this with a hand-written `Unknown`
/// fallback so an unrecognized block keeps its original JSON instead of
/// being discarded (`#[serde(other)]` on a unit variant only picks the tag
/// and drops the rest of the object).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KnownBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
    },
    Image {
        source: serde_json::Value,
    },
}

#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
    },
    Image {
        source: serde_json::Value,
    },
    /// Anything this model doesn't recognize yet, kept as the raw JSON it
    /// arrived as so the sanitizer and translators can pass it through
    /// untouched instead of dropping its fields.
    Unknown(serde_json::Value),
}

impl From<KnownBlock> for ContentBlock {
    fn from(block: KnownBlock) -> Self {
        match block {
            KnownBlock::Text { text } => ContentBlock::Text { text },
            KnownBlock::Thinking { thinking, signature } => ContentBlock::Thinking { thinking, signature },
            KnownBlock::RedactedThinking { data } => ContentBlock::RedactedThinking { data },
            KnownBlock::ToolUse { id, name, input } => ContentBlock::ToolUse { id, name, input },
            KnownBlock::ToolResult { tool_use_id, content } => ContentBlock::ToolResult { tool_use_id, content },
            KnownBlock::Image { source } => ContentBlock::Image { source },
        }
    }
}

impl Serialize for ContentBlock {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            ContentBlock::Unknown(value) => value.serialize(serializer),
            ContentBlock::Text { text } => KnownBlock::Text { text: text.clone() }.serialize(serializer),
            ContentBlock::Thinking { thinking, signature } => KnownBlock::Thinking {
                thinking: thinking.clone(),
                signature: signature.clone(),
            }
            .serialize(serializer),
            ContentBlock::RedactedThinking { data } => KnownBlock::RedactedThinking { data: data.clone() }.serialize(serializer),
            ContentBlock::ToolUse { id, name, input } => KnownBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }
            .serialize(serializer),
            ContentBlock::ToolResult { tool_use_id, content } => KnownBlock::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: content.clone(),
            }
            .serialize(serializer),
            ContentBlock::Image { source } => KnownBlock::Image { source: source.clone() }.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match serde_json::from_value::<KnownBlock>(value.clone()) {
            Ok(known) => Ok(known.into()),
            Err(_) => Ok(ContentBlock::Unknown(value)),
        }
    }
}

impl ContentBlock {
    pub fn is_thinking(&self) -> bool {
        matches!(
            self,
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. }
        )
    }

    pub fn thinking_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Thinking { thinking, .. } => Some(thinking),
            _ => None,
        }
    }

    pub fn signature(&self) -> Option<&str> {
        match self {
            ContentBlock::Thinking { signature, .. } => signature.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_function")]
    pub kind: String,
    pub function: ToolCallFunction,
}

fn default_function() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: Content) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Structural hash over `{role, content, tool_calls?, tool_call_id?}`,
    /// used by the conversation state machine to suppress duplicate appends
    /// (spec §3 `ConversationState` invariant).
    pub fn structural_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.role.as_str().as_bytes());
        if let Ok(content_json) = serde_json::to_string(&self.content) {
            hasher.update(content_json.as_bytes());
        }
        if let Some(calls) = &self.tool_calls {
            if let Ok(calls_json) = serde_json::to_string(calls) {
                hasher.update(calls_json.as_bytes());
            }
        }
        if let Some(id) = &self.tool_call_id {
            hasher.update(id.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Canonicalized JSON for deterministic id generation (C6): stable key
/// ordering so `H(name + canonical_json(args))` is reproducible regardless
/// of the original field order on the wire.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sorted(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), sorted(v));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(sorted).collect())
            }
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// SHA-256 hex digest, the hash primitive reused across thinking-hash
/// normalization and deterministic tool-call ids.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalizes thinking text before hashing: trims and collapses internal
/// whitespace runs, so that cosmetic IDE re-wrapping does not defeat the
/// signature cache.
pub fn normalize_thinking_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_hash_stable_for_equal_messages() {
        let a = Message::new(Role::User, Content::Text("hi".into()));
        let b = Message::new(Role::User, Content::Text("hi".into()));
        assert_eq!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn structural_hash_differs_on_content() {
        let a = Message::new(Role::User, Content::Text("hi".into()));
        let b = Message::new(Role::User, Content::Text("bye".into()));
        assert_ne!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn canonical_json_ignores_key_order() {
        let a: serde_json::Value = serde_json::json!({"b": 1, "a": 2});
        let b: serde_json::Value = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_thinking_text("a   b\n\tc"), "a b c");
    }

    #[test]
    fn unrecognized_block_round_trips_verbatim() {
        let wire = serde_json::json!({"type": "server_tool_use", "id": "srvtoolu_1", "name": "web_search", "input": {"query": "rust"}});
        let block: ContentBlock = serde_json::from_value(wire.clone()).unwrap();
        assert!(matches!(block, ContentBlock::Unknown(_)));
        assert_eq!(serde_json::to_value(&block).unwrap(), wire);
    }
}
