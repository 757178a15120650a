//! `Sanitizer` (C5): the IDE-compatibility fallback layer, grounded on
//! `original_source/src/ide_compat/sanitizer.py`. Validates and repairs
//! `thinking`/`tool_use` signatures block-by-block, checks (without
//! repairing) tool-chain integrity, and reconciles `thinking_enabled` with
//! what actually survived. Never throws: any failure degrades to returning
//! the input unchanged.

use std::collections::HashSet;

use crate::model::{Content, ContentBlock, Message, Role};
use crate::signature::{recovery, is_valid_signature, SignatureStore};

pub mod tool_loop;

#[derive(Debug, Default, Clone, Copy)]
pub struct SanitizeStats {
    pub thinking_blocks_validated: u64,
    pub thinking_blocks_recovered: u64,
    pub thinking_blocks_downgraded: u64,
    pub tool_use_blocks_recovered: u64,
    pub broken_tool_chains: u64,
}

pub struct SanitizeOutcome {
    pub messages: Vec<Message>,
    pub thinking_enabled: bool,
    pub stats: SanitizeStats,
}

/// Entry point. Mirrors `AnthropicSanitizer.sanitize_messages`: validates
/// thinking/tool_use signatures, checks tool-chain integrity (log-only),
/// then reconciles `thinking_enabled`. Catches nothing because every step
/// below is infallible by construction — the contract is enforced by
/// never letting a step panic or return `Result`, not by a top-level
/// catch-all.
pub async fn sanitize(
    store: &SignatureStore,
    messages: &[Message],
    thinking_enabled: bool,
    session_id: Option<&str>,
    last_context_signature: Option<&str>,
) -> SanitizeOutcome {
    if messages.is_empty() {
        return SanitizeOutcome {
            messages: messages.to_vec(),
            thinking_enabled,
            stats: SanitizeStats::default(),
        };
    }

    let mut stats = SanitizeStats::default();
    let mut sanitized = if thinking_enabled {
        validate_and_recover_thinking_blocks(
            store,
            messages,
            session_id,
            last_context_signature,
            &mut stats,
        )
        .await
    } else {
        messages.to_vec()
    };

    if thinking_enabled {
        tool_loop::recover_if_needed(store, &mut sanitized).await;
    }

    check_tool_chain_integrity(&sanitized, &mut stats);
    let final_thinking_enabled = sync_thinking_config(&sanitized, thinking_enabled);

    SanitizeOutcome {
        messages: sanitized,
        thinking_enabled: final_thinking_enabled,
        stats,
    }
}

async fn validate_and_recover_thinking_blocks(
    store: &SignatureStore,
    messages: &[Message],
    session_id: Option<&str>,
    last_context_signature: Option<&str>,
    stats: &mut SanitizeStats,
) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut context_signature = last_context_signature.map(str::to_string);

    for msg in messages {
        if msg.role != Role::Assistant {
            out.push(msg.clone());
            continue;
        }
        let blocks = msg.content.as_blocks();
        let mut new_blocks = Vec::with_capacity(blocks.len());

        for block in blocks {
            match &block {
                ContentBlock::Thinking { thinking, signature } => {
                    stats.thinking_blocks_validated += 1;
                    if valid_signature(signature.as_deref()) {
                        context_signature = signature.clone();
                        new_blocks.push(block);
                        continue;
                    }

                    let hash = crate::model::sha256_hex(&crate::model::normalize_thinking_text(thinking));
                    let result = recovery::recover_for_thinking(
                        store,
                        &hash,
                        "sanitizer",
                        None,
                        None,
                        context_signature.as_deref(),
                        session_id,
                        false,
                    )
                    .await;

                    if let Some(sig) = result.signature.filter(|s| is_valid_signature(s)) {
                        stats.thinking_blocks_recovered += 1;
                        context_signature = Some(sig.clone());
                        new_blocks.push(ContentBlock::Thinking {
                            thinking: thinking.clone(),
                            signature: Some(sig),
                        });
                    } else if let Some(downgraded) = downgrade_thinking_to_text(thinking) {
                        stats.thinking_blocks_downgraded += 1;
                        new_blocks.push(downgraded);
                    } else {
                        stats.thinking_blocks_downgraded += 1;
                    }
                }
                ContentBlock::RedactedThinking { .. } => {
                    // Redacted blocks carry no recoverable text; pass through.
                    new_blocks.push(block);
                }
                ContentBlock::ToolUse { id, name, input } => {
                    let result = recovery::recover_for_tool_use(
                        store,
                        id,
                        None,
                        context_signature.as_deref(),
                        session_id,
                        true,
                    )
                    .await;
                    if result.success() && !result.is_placeholder() {
                        stats.tool_use_blocks_recovered += 1;
                    }
                    let encoded_id = result
                        .signature
                        .as_deref()
                        .map(|sig| crate::protocol::tool_id::encode_tool_id_with_signature(id, Some(sig)))
                        .unwrap_or_else(|| id.clone());
                    new_blocks.push(ContentBlock::ToolUse {
                        id: encoded_id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                }
                _ => new_blocks.push(block),
            }
        }

        let mut sanitized_msg = msg.clone();
        sanitized_msg.content = Content::Blocks(new_blocks);
        out.push(sanitized_msg);
    }

    out
}

fn valid_signature(sig: Option<&str>) -> bool {
    sig.map(is_valid_signature).unwrap_or(false)
}

fn downgrade_thinking_to_text(thinking: &str) -> Option<ContentBlock> {
    if thinking.trim().is_empty() {
        None
    } else {
        Some(ContentBlock::Text {
            text: thinking.to_string(),
        })
    }
}

/// Walks the message list verifying every `tool_use.id` has a later
/// `tool_result.tool_use_id`. Broken chains are counted and logged, never
/// repaired here — repair is tool-loop recovery's job.
fn check_tool_chain_integrity(messages: &[Message], stats: &mut SanitizeStats) {
    let mut tool_uses: HashSet<String> = HashSet::new();
    let mut tool_results: HashSet<String> = HashSet::new();

    for msg in messages {
        for block in msg.content.as_blocks() {
            match block {
                ContentBlock::ToolUse { id, .. } => {
                    tool_uses.insert(id);
                }
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    tool_results.insert(tool_use_id);
                }
                _ => {}
            }
        }
    }

    let broken: Vec<&String> = tool_uses.iter().filter(|id| !tool_results.contains(*id)).collect();
    if !broken.is_empty() {
        stats.broken_tool_chains += broken.len() as u64;
        tracing::warn!(
            broken_count = broken.len(),
            "detected tool_use blocks with no matching tool_result"
        );
    }
}

/// If no valid `thinking` block survived sanitization, `thinking_enabled`
/// is forced false; it is never forced true.
fn sync_thinking_config(messages: &[Message], thinking_enabled: bool) -> bool {
    if !thinking_enabled {
        return false;
    }
    let has_valid_thinking = messages.iter().any(|msg| {
        msg.content.as_blocks().iter().any(|block| match block {
            ContentBlock::Thinking { signature, .. } => valid_signature(signature.as_deref()),
            _ => false,
        })
    });
    has_valid_thinking
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::signature::sqlite::SqliteSignatureStore;
    use serde_json::json;
    use std::sync::Arc;

    async fn store() -> SignatureStore {
        let l2 = Arc::new(SqliteSignatureStore::new("sqlite::memory:").await.unwrap());
        SignatureStore::new(l2, &CacheConfig::default(), None)
    }

    #[tokio::test]
    async fn downgrades_thinking_without_recoverable_signature() {
        let store = store().await;
        let msg = Message::new(
            Role::Assistant,
            Content::Blocks(vec![ContentBlock::Thinking {
                thinking: "pondering deeply".into(),
                signature: None,
            }]),
        );
        let outcome = sanitize(&store, &[msg], true, None, None).await;
        let blocks = outcome.messages[0].content.as_blocks();
        assert!(matches!(blocks[0], ContentBlock::Text { .. }));
        assert_eq!(outcome.stats.thinking_blocks_downgraded, 1);
        assert!(!outcome.thinking_enabled);
    }

    #[tokio::test]
    async fn keeps_already_valid_thinking_block() {
        let store = store().await;
        let sig = "A".repeat(60);
        let msg = Message::new(
            Role::Assistant,
            Content::Blocks(vec![ContentBlock::Thinking {
                thinking: "pondering".into(),
                signature: Some(sig.clone()),
            }]),
        );
        let outcome = sanitize(&store, &[msg], true, None, None).await;
        let blocks = outcome.messages[0].content.as_blocks();
        assert_eq!(blocks[0].signature().unwrap(), sig);
        assert!(outcome.thinking_enabled);
    }

    #[tokio::test]
    async fn tool_use_gets_placeholder_when_unrecoverable() {
        let store = store().await;
        let msg = Message::new(
            Role::Assistant,
            Content::Blocks(vec![ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "get_weather".into(),
                input: json!({}),
            }]),
        );
        let outcome = sanitize(&store, &[msg], true, None, None).await;
        let blocks = outcome.messages[0].content.as_blocks();
        if let ContentBlock::ToolUse { id, .. } = &blocks[0] {
            assert!(id.starts_with("call_1"));
        } else {
            panic!("expected tool_use");
        }
    }

    #[tokio::test]
    async fn empty_thinking_text_is_dropped_not_downgraded() {
        let store = store().await;
        let msg = Message::new(
            Role::Assistant,
            Content::Blocks(vec![ContentBlock::Thinking {
                thinking: "   ".into(),
                signature: None,
            }]),
        );
        let outcome = sanitize(&store, &[msg], true, None, None).await;
        assert!(outcome.messages[0].content.as_blocks().is_empty());
    }

    #[tokio::test]
    async fn detects_broken_tool_chain() {
        let store = store().await;
        let msg = Message::new(
            Role::Assistant,
            Content::Blocks(vec![ContentBlock::ToolUse {
                id: "call_orphan".into(),
                name: "f".into(),
                input: json!({}),
            }]),
        );
        let outcome = sanitize(&store, &[msg], false, None, None).await;
        assert_eq!(outcome.stats.broken_tool_chains, 1);
    }
}
