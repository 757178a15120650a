//! Tool-loop recovery: detects a broken tool loop caused by an IDE
//! stripping `thinking` blocks out of history, and repairs it in place by
//! injecting a signature-bearing `thinking` block into the last assistant
//! message — grounded on
//! `original_source/src/converters/tool_loop_recovery.py`
//! (`analyze_conversation_state`, `detect_thinking_stripped`,
//! `close_tool_loop_for_thinking`).
//!
//! No synthetic `[Proceed]` message is appended: an earlier revision of
//! the original did this and it made Claude Code mistake the repair for a
//! fresh conversation turn, so only the in-place thinking-block injection
//! survived (mirrored here, not re-introduced).

use crate::model::{Content, ContentBlock, Message, Role};
use crate::signature::SignatureStore;

#[derive(Debug, Default, Clone)]
struct ConversationState {
    in_tool_loop: bool,
    has_thinking: bool,
    last_assistant_index: Option<usize>,
}

fn analyze(messages: &[Message]) -> ConversationState {
    let mut state = ConversationState::default();
    if messages.is_empty() {
        return state;
    }

    for (idx, msg) in messages.iter().enumerate() {
        if msg.role == Role::Assistant {
            state.last_assistant_index = Some(idx);
            state.has_thinking = matches!(&msg.content, Content::Blocks(blocks) if blocks.iter().any(|b| matches!(b, ContentBlock::Thinking { .. })));
        }
    }

    if let Some(last) = messages.last() {
        if last.role == Role::User {
            if let Content::Blocks(blocks) = &last.content {
                state.in_tool_loop = blocks.iter().any(|b| matches!(b, ContentBlock::ToolResult { .. }));
            }
        }
    }

    state
}

/// True when the last assistant message has a `tool_use` block but no
/// `thinking` block — the IDE-stripped-thinking signature.
fn thinking_stripped(messages: &[Message]) -> bool {
    let Some(last_assistant) = messages.iter().rev().find(|m| m.role == Role::Assistant) else {
        return false;
    };
    let Content::Blocks(blocks) = &last_assistant.content else {
        return false;
    };
    let has_tool_use = blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. }));
    let has_thinking = blocks.iter().any(|b| matches!(b, ContentBlock::Thinking { .. }));
    has_tool_use && !has_thinking
}

/// Repairs a broken tool loop in place: if the conversation is mid tool
/// loop and the last assistant message's thinking block was stripped,
/// pulls the most recently cached signature and splices a `thinking`
/// block in front of that message's content. Returns `true` if a repair
/// was made.
pub async fn recover_if_needed(store: &SignatureStore, messages: &mut [Message]) -> bool {
    let state = analyze(messages);
    let Some(last_assistant_index) = state.last_assistant_index else {
        return false;
    };
    if !state.in_tool_loop || state.has_thinking {
        return false;
    }
    if !thinking_stripped(messages) {
        return false;
    }

    let Some(entry) = store.get_most_recent().await else {
        tracing::warn!("tool loop recovery: no cached signature available, relying on later recovery layers");
        return false;
    };

    let assistant_msg = &mut messages[last_assistant_index];
    let Content::Blocks(blocks) = &mut assistant_msg.content else {
        return false;
    };

    blocks.insert(
        0,
        ContentBlock::Thinking {
            thinking: entry.thinking_prefix.clone(),
            signature: Some(entry.signature.clone()),
        },
    );

    tracing::info!(sig_len = entry.signature.len(), "tool loop recovery: injected thinking block ahead of stripped tool_use");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::signature::sqlite::SqliteSignatureStore;
    use crate::signature::types::SignatureEntry;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    async fn store() -> SignatureStore {
        let l2 = Arc::new(SqliteSignatureStore::new("sqlite::memory:").await.unwrap());
        SignatureStore::new(l2, &CacheConfig::default(), None)
    }

    fn tool_use_only_assistant() -> Message {
        Message::new(
            Role::Assistant,
            Content::Blocks(vec![ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "search".into(),
                input: json!({}),
            }]),
        )
    }

    fn tool_result_user() -> Message {
        Message::new(
            Role::User,
            Content::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "call_1".into(),
                content: json!("ok"),
            }]),
        )
    }

    #[tokio::test]
    async fn no_recovery_without_cached_signature() {
        let store = store().await;
        let mut messages = vec![tool_use_only_assistant(), tool_result_user()];
        assert!(!recover_if_needed(&store, &mut messages).await);
    }

    #[tokio::test]
    async fn injects_thinking_block_when_loop_broken() {
        let store = store().await;
        let now = Utc::now();
        store
            .set(SignatureEntry {
                signature: "A".repeat(60),
                thinking_hash: "h".into(),
                thinking_prefix: "earlier reasoning".into(),
                model: "gemini-2.5-pro".into(),
                namespace: "stream".into(),
                conversation_id: None,
                created_at: now,
                expires_at: now + chrono::Duration::hours(1),
                last_accessed_at: now,
                access_count: 0,
            })
            .await;

        let mut messages = vec![tool_use_only_assistant(), tool_result_user()];
        assert!(recover_if_needed(&store, &mut messages).await);

        let Content::Blocks(blocks) = &messages[0].content else {
            panic!("expected blocks");
        };
        assert!(matches!(blocks[0], ContentBlock::Thinking { .. }));
    }

    #[tokio::test]
    async fn no_recovery_when_thinking_already_present() {
        let store = store().await;
        let mut messages = vec![
            Message::new(
                Role::Assistant,
                Content::Blocks(vec![
                    ContentBlock::Thinking { thinking: "already here".into(), signature: Some("A".repeat(60)) },
                    ContentBlock::ToolUse { id: "call_1".into(), name: "search".into(), input: json!({}) },
                ]),
            ),
            tool_result_user(),
        ];
        assert!(!recover_if_needed(&store, &mut messages).await);
    }

    #[tokio::test]
    async fn no_recovery_outside_tool_loop() {
        let store = store().await;
        let mut messages = vec![tool_use_only_assistant(), Message::new(Role::User, Content::Text("continue".into()))];
        assert!(!recover_if_needed(&store, &mut messages).await);
    }
}
