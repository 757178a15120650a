//! Data types shared across the layered signature store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder signature emitted when no real one could be recovered and
/// the caller opted into the placeholder fallback (spec §4.2 layer 6/7).
pub const SENTINEL_SIGNATURE: &str = "SKIP_VALIDATOR";

/// Minimum length a real (non-sentinel) signature must have to be
/// considered valid.
pub const MIN_SIGNATURE_LENGTH: usize = 50;

/// Separator spliced between a tool-call id and its base64url-encoded
/// signature on the wire. Chosen to be illegal in ordinary tool-call ids.
pub const TOOL_ID_SEPARATOR: &str = "::sig::";

/// `string, length >= MIN_SIGNATURE_LENGTH, alphabet [A-Za-z0-9+/=_-]`,
/// and not the sentinel.
pub fn is_valid_signature(sig: &str) -> bool {
    if sig == SENTINEL_SIGNATURE {
        return false;
    }
    if sig.len() < MIN_SIGNATURE_LENGTH {
        return false;
    }
    sig.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'_' | b'-'))
}

/// `namespace ":" (conversation_id | "_") ":" thinking_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: String,
    pub conversation_id: Option<String>,
    pub thinking_hash: String,
}

impl CacheKey {
    pub fn new(
        namespace: impl Into<String>,
        conversation_id: Option<String>,
        thinking_hash: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            conversation_id,
            thinking_hash: thinking_hash.into(),
        }
    }

    pub fn as_string(&self) -> String {
        format!(
            "{}:{}:{}",
            self.namespace,
            self.conversation_id.as_deref().unwrap_or("_"),
            self.thinking_hash
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub signature: String,
    pub thinking_hash: String,
    pub thinking_prefix: String,
    pub model: String,
    pub namespace: String,
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
}

impl SignatureEntry {
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(
            self.namespace.clone(),
            self.conversation_id.clone(),
            self.thinking_hash.clone(),
        )
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSignatureEntry {
    pub tool_id: String,
    pub signature: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ToolSignatureEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSignatureEntry {
    pub session_id: String,
    pub signature: String,
    pub thinking_text: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionSignatureEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Stats surfaced by the store for `/gateway/health` and diagnostics; L2
/// errors degrade the store instead of failing calls, so these counters are
/// the only visible trace of that degradation.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub total_failed: u64,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_never_valid() {
        assert!(!is_valid_signature(SENTINEL_SIGNATURE));
    }

    #[test]
    fn short_signature_invalid() {
        assert!(!is_valid_signature("abc"));
    }

    #[test]
    fn well_formed_signature_valid() {
        let sig = "A".repeat(60);
        assert!(is_valid_signature(&sig));
    }

    #[test]
    fn invalid_alphabet_rejected() {
        let sig = format!("{}!", "A".repeat(60));
        assert!(!is_valid_signature(&sig));
    }

    #[test]
    fn cache_key_format() {
        let key = CacheKey::new("ns", Some("conv1".into()), "hash1");
        assert_eq!(key.as_string(), "ns:conv1:hash1");
        let key2 = CacheKey::new("ns", None, "hash1");
        assert_eq!(key2.as_string(), "ns:_:hash1");
    }
}
