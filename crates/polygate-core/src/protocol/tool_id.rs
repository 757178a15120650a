//! Deterministic tool-call id generation and signature encoding (spec §4.6,
//! §6 "Tool-id wire format"). The encoding is the system's key durability
//! trick: IDEs strip custom JSON fields but faithfully echo back opaque ids,
//! so splicing the signature into the id survives round-trips that would
//! otherwise lose it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::model::{canonical_json, sha256_hex};
use crate::signature::TOOL_ID_SEPARATOR;

/// `"call_" + hex(H(name + canonical_json(args)))[:24]`. Shared by the
/// protocol translator (native tool-call ids) and the SSOP scanner
/// (synthetic tool-call ids), so the two agree on identical calls and one
/// suppresses the other.
pub fn generate_tool_call_id(name: &str, args: &serde_json::Value) -> String {
    let digest = sha256_hex(&format!("{name}{}", canonical_json(args)));
    format!("call_{}", &digest[..24])
}

/// Splices `SEPARATOR + base64url(signature)` onto a tool-call id. A no-op
/// if no signature is known.
pub fn encode_tool_id_with_signature(tool_id: &str, signature: Option<&str>) -> String {
    match signature {
        Some(sig) if !sig.is_empty() => {
            format!("{tool_id}{TOOL_ID_SEPARATOR}{}", URL_SAFE_NO_PAD.encode(sig))
        }
        _ => tool_id.to_string(),
    }
}

/// Inverts [`encode_tool_id_with_signature`]. Returns the original id
/// unchanged and `None` if the id carries no encoded signature, or if the
/// trailing segment doesn't decode as base64 (tolerates ids that happen to
/// contain the separator for unrelated reasons).
pub fn decode_tool_id_and_signature(encoded: &str) -> (String, Option<String>) {
    match encoded.rsplit_once(TOOL_ID_SEPARATOR) {
        Some((original_id, b64_sig)) => match URL_SAFE_NO_PAD.decode(b64_sig) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(sig) => (original_id.to_string(), Some(sig)),
                Err(_) => (encoded.to_string(), None),
            },
            Err(_) => (encoded.to_string(), None),
        },
        None => (encoded.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_encodes_and_decodes() {
        let sig = "A".repeat(60);
        let encoded = encode_tool_id_with_signature("call_abc", Some(&sig));
        let (id, decoded) = decode_tool_id_and_signature(&encoded);
        assert_eq!(id, "call_abc");
        assert_eq!(decoded.unwrap(), sig);
    }

    #[test]
    fn no_signature_is_passthrough() {
        let encoded = encode_tool_id_with_signature("call_abc", None);
        assert_eq!(encoded, "call_abc");
        let (id, decoded) = decode_tool_id_and_signature(&encoded);
        assert_eq!(id, "call_abc");
        assert!(decoded.is_none());
    }

    #[test]
    fn deterministic_id_is_stable_under_key_reordering() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(generate_tool_call_id("write_file", &a), generate_tool_call_id("write_file", &b));
    }

    #[test]
    fn different_args_give_different_ids() {
        let a = serde_json::json!({"path": "a"});
        let b = serde_json::json!({"path": "b"});
        assert_ne!(generate_tool_call_id("write_file", &a), generate_tool_call_id("write_file", &b));
    }
}
