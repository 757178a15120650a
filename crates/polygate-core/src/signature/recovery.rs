//! `SignatureRecovery` (C2): the 6/7-layer fallback pipeline that produces a
//! valid signature (or a sentinel) for a thinking block or a tool-use block,
//! grounded 1:1 on `original_source/src/converters/signature_recovery.py`.

use super::store::SignatureStore;
use super::types::{is_valid_signature, SENTINEL_SIGNATURE};
use crate::protocol::tool_id::decode_tool_id_and_signature;

/// Which layer of the pipeline produced a recovered signature. Callers use
/// this to decide whether the result should be cached — layers 1-4 cache,
/// 5-6 do not (avoids polluting the cache with guesses).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    Client,
    Context,
    EncodedToolId,
    Cache,
    SessionCache,
    ToolCache,
    LastSignature,
    Placeholder,
    None,
}

impl RecoverySource {
    /// Layers 1-4 are grounded content; caching them is safe. Layers 5-6
    /// (most-recent fallback, placeholder) must not be cached.
    pub fn should_cache(self) -> bool {
        matches!(
            self,
            RecoverySource::Client
                | RecoverySource::Context
                | RecoverySource::EncodedToolId
                | RecoverySource::Cache
                | RecoverySource::SessionCache
                | RecoverySource::ToolCache
        )
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub signature: Option<String>,
    pub source: RecoverySource,
}

impl RecoveryResult {
    pub fn success(&self) -> bool {
        self.signature.is_some() && self.source != RecoverySource::None
    }

    pub fn is_placeholder(&self) -> bool {
        self.source == RecoverySource::Placeholder
    }

    fn none() -> Self {
        Self {
            signature: None,
            source: RecoverySource::None,
        }
    }

    fn placeholder() -> Self {
        Self {
            signature: Some(SENTINEL_SIGNATURE.to_string()),
            source: RecoverySource::Placeholder,
        }
    }
}

fn valid(sig: Option<&str>) -> bool {
    sig.map(is_valid_signature).unwrap_or(false)
}

/// Thinking-block recovery, strict order, first valid wins:
/// 1. client-supplied, 2. contextual, 3. hash cache, 4. session cache,
/// 5. most-recent-any-namespace, 6. sentinel (if enabled) else fail.
pub async fn recover_for_thinking(
    store: &SignatureStore,
    thinking_hash: &str,
    namespace: &str,
    conversation_id: Option<&str>,
    client_signature: Option<&str>,
    context_signature: Option<&str>,
    session_id: Option<&str>,
    use_placeholder_fallback: bool,
) -> RecoveryResult {
    if valid(client_signature) {
        return RecoveryResult {
            signature: Some(client_signature.unwrap().to_string()),
            source: RecoverySource::Client,
        };
    }
    if valid(context_signature) {
        return RecoveryResult {
            signature: Some(context_signature.unwrap().to_string()),
            source: RecoverySource::Context,
        };
    }
    if let Some(entry) = store.get(thinking_hash, namespace, conversation_id).await {
        if is_valid_signature(&entry.signature) {
            return RecoveryResult {
                signature: Some(entry.signature),
                source: RecoverySource::Cache,
            };
        }
    }
    if let Some(entry) = store
        .get_by_hash_fallback(thinking_hash, namespace, conversation_id)
        .await
    {
        if is_valid_signature(&entry.signature) {
            return RecoveryResult {
                signature: Some(entry.signature),
                source: RecoverySource::Cache,
            };
        }
    }
    if let Some(sid) = session_id {
        if let Some(entry) = store.session_get(sid).await {
            if is_valid_signature(&entry.signature) {
                return RecoveryResult {
                    signature: Some(entry.signature),
                    source: RecoverySource::SessionCache,
                };
            }
        }
    }
    if let Some(entry) = store.get_most_recent().await {
        if is_valid_signature(&entry.signature) {
            return RecoveryResult {
                signature: Some(entry.signature),
                source: RecoverySource::LastSignature,
            };
        }
    }
    if use_placeholder_fallback {
        return RecoveryResult::placeholder();
    }
    RecoveryResult::none()
}

/// Tool-use recovery, strict order:
/// 1. client-supplied, 2. contextual, 3. decode-from-tool-id (the system's
/// key durability trick — IDEs strip custom fields but preserve ids),
/// 4. session cache, 5. tool-id cache, 6. most-recent fallback, 7. sentinel.
pub async fn recover_for_tool_use(
    store: &SignatureStore,
    encoded_tool_id: &str,
    client_signature: Option<&str>,
    context_signature: Option<&str>,
    session_id: Option<&str>,
    use_placeholder_fallback: bool,
) -> RecoveryResult {
    if valid(client_signature) {
        return RecoveryResult {
            signature: Some(client_signature.unwrap().to_string()),
            source: RecoverySource::Client,
        };
    }
    if valid(context_signature) {
        return RecoveryResult {
            signature: Some(context_signature.unwrap().to_string()),
            source: RecoverySource::Context,
        };
    }
    let (original_id, decoded_sig) = decode_tool_id_and_signature(encoded_tool_id);
    if valid(decoded_sig.as_deref()) {
        return RecoveryResult {
            signature: decoded_sig,
            source: RecoverySource::EncodedToolId,
        };
    }
    if let Some(sid) = session_id {
        if let Some(entry) = store.session_get(sid).await {
            if is_valid_signature(&entry.signature) {
                return RecoveryResult {
                    signature: Some(entry.signature),
                    source: RecoverySource::SessionCache,
                };
            }
        }
    }
    if let Some(entry) = store.tool_get(&original_id).await {
        if is_valid_signature(&entry.signature) {
            return RecoveryResult {
                signature: Some(entry.signature),
                source: RecoverySource::ToolCache,
            };
        }
    }
    if let Some(entry) = store.get_most_recent().await {
        if is_valid_signature(&entry.signature) {
            return RecoveryResult {
                signature: Some(entry.signature),
                source: RecoverySource::LastSignature,
            };
        }
    }
    if use_placeholder_fallback {
        return RecoveryResult::placeholder();
    }
    RecoveryResult::none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::signature::sqlite::SqliteSignatureStore;
    use std::sync::Arc;

    async fn new_store() -> SignatureStore {
        let l2 = Arc::new(SqliteSignatureStore::new("sqlite::memory:").await.unwrap());
        SignatureStore::new(l2, &CacheConfig::default(), None)
    }

    #[tokio::test]
    async fn client_signature_wins_first() {
        let store = new_store().await;
        let sig = "A".repeat(60);
        let result = recover_for_thinking(
            &store,
            "hash",
            "ns",
            None,
            Some(&sig),
            None,
            None,
            true,
        )
        .await;
        assert_eq!(result.source, RecoverySource::Client);
        assert_eq!(result.signature.unwrap(), sig);
    }

    #[tokio::test]
    async fn falls_through_to_placeholder_when_nothing_found() {
        let store = new_store().await;
        let result = recover_for_thinking(&store, "hash", "ns", None, None, None, None, true).await;
        assert!(result.is_placeholder());
        assert_eq!(result.signature.unwrap(), SENTINEL_SIGNATURE);
    }

    #[tokio::test]
    async fn no_placeholder_returns_none_source() {
        let store = new_store().await;
        let result = recover_for_thinking(&store, "hash", "ns", None, None, None, None, false).await;
        assert!(!result.success());
        assert_eq!(result.source, RecoverySource::None);
    }

    #[tokio::test]
    async fn tool_use_decodes_signature_from_encoded_id() {
        use crate::protocol::tool_id::encode_tool_id_with_signature;
        let store = new_store().await;
        let sig = "B".repeat(60);
        let encoded = encode_tool_id_with_signature("call_abc", Some(&sig));
        let result = recover_for_tool_use(&store, &encoded, None, None, None, true).await;
        assert_eq!(result.source, RecoverySource::EncodedToolId);
        assert_eq!(result.signature.unwrap(), sig);
    }
}
