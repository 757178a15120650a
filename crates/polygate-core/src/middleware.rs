//! `IDECompatMiddleware` (C11): the request-path glue wiring
//! [`crate::client`] detection into [`crate::sanitize`], grounded on
//! `original_source/src/ide_compat/middleware.py`. Transport-agnostic by
//! design — `polygate-service` wraps [`process_request`] in an axum
//! middleware layer; this module owns only the detect-sanitize-rewrite
//! logic and its path allowlist.
//!
//! Never fails the request: any parse or sanitize error degrades to
//! passing the original body through unchanged.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value;

use crate::client::{self, ClientInfo};
use crate::model::Message;
use crate::protocol::{anthropic, openai};
use crate::sanitize::{self, SanitizeStats};
use crate::signature::SignatureStore;

/// Paths the middleware applies to; matched by exact equality or a
/// `/antigravity`-prefixed variant.
const TARGET_PATHS: &[&str] = &["/v1/messages", "/v1/chat/completions"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFormat {
    Anthropic,
    Openai,
}

fn target_format(path: &str) -> Option<BodyFormat> {
    for target in TARGET_PATHS {
        if path == *target || path.ends_with(target) {
            return Some(if target.contains("chat/completions") { BodyFormat::Openai } else { BodyFormat::Anthropic });
        }
    }
    None
}

pub fn applies_to(method: &str, path: &str) -> bool {
    method.eq_ignore_ascii_case("POST") && target_format(path).is_some()
}

pub struct MiddlewareOutcome {
    pub body: Bytes,
    pub client_info: ClientInfo,
    pub sanitized: bool,
    pub stats: SanitizeStats,
}

impl MiddlewareOutcome {
    fn passthrough(body: Bytes, client_info: ClientInfo) -> Self {
        Self {
            body,
            client_info,
            sanitized: false,
            stats: SanitizeStats::default(),
        }
    }
}

/// Runs the detect -> sanitize -> rewrite pipeline for one request. Returns
/// the original body verbatim whenever the path isn't targeted, the client
/// doesn't need sanitization, the body doesn't parse, or sanitization
/// itself errors — the caller always gets something to forward.
pub async fn process_request(store: &SignatureStore, method: &str, path: &str, headers: &HashMap<String, String>, body: Bytes) -> MiddlewareOutcome {
    let Some(format) = (if method.eq_ignore_ascii_case("POST") { target_format(path) } else { None }) else {
        return MiddlewareOutcome::passthrough(body, client::detect(headers));
    };

    let client_info = client::detect(headers);
    if !client_info.needs_sanitization {
        return MiddlewareOutcome::passthrough(body, client_info);
    }

    let Ok(raw) = serde_json::from_slice::<Value>(&body) else {
        tracing::warn!(path, "IDE-compat middleware: failed to parse JSON body, skipping");
        return MiddlewareOutcome::passthrough(body, client_info);
    };

    match sanitize_body(store, &raw, format, &client_info).await {
        Some((sanitized_body, stats)) => {
            let rewritten = match serde_json::to_vec(&sanitized_body) {
                Ok(bytes) => Bytes::from(bytes),
                Err(err) => {
                    tracing::error!(error = %err, "IDE-compat middleware: failed to re-serialize sanitized body");
                    return MiddlewareOutcome::passthrough(body, client_info);
                }
            };
            MiddlewareOutcome {
                body: rewritten,
                client_info,
                sanitized: true,
                stats,
            }
        }
        None => MiddlewareOutcome::passthrough(body, client_info),
    }
}

async fn sanitize_body(store: &SignatureStore, raw: &Value, format: BodyFormat, client_info: &ClientInfo) -> Option<(Value, SanitizeStats)> {
    let raw_messages = raw.get("messages")?.as_array()?;
    let messages = parse_messages(raw_messages, format);

    let thinking_enabled = raw.get("thinking").map(|v| !v.is_null()).unwrap_or(false);
    let session_id = client_info
        .scid
        .clone()
        .or_else(|| raw.get("conversation_id").and_then(Value::as_str).map(str::to_string))
        .or_else(|| raw.get("session_id").and_then(Value::as_str).map(str::to_string));

    let outcome = sanitize::sanitize(store, &messages, thinking_enabled, session_id.as_deref(), None).await;

    let mut body = raw.clone();
    let sanitized_json: Vec<Value> = outcome.messages.iter().map(|msg| encode_message(msg, format)).collect();
    body["messages"] = Value::Array(sanitized_json);

    if !outcome.thinking_enabled && body.get("thinking").is_some() {
        tracing::info!("IDE-compat middleware: dropping thinking config after sanitization");
        if let Some(obj) = body.as_object_mut() {
            obj.remove("thinking");
        }
    }

    Some((body, outcome.stats))
}

fn parse_messages(raw_messages: &[Value], format: BodyFormat) -> Vec<Message> {
    raw_messages
        .iter()
        .filter_map(|value| match format {
            BodyFormat::Anthropic => anthropic::message_from_anthropic(value).ok(),
            BodyFormat::Openai => openai::message_from_openai(value).ok(),
        })
        .collect()
}

fn encode_message(msg: &Message, format: BodyFormat) -> Value {
    match format {
        BodyFormat::Anthropic => anthropic::message_to_anthropic(msg),
        BodyFormat::Openai => openai::message_to_openai(msg),
    }
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

    fn cursor_headers() -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("user-agent".to_string(), "cursor/1.2.3".to_string());
        headers
    }

    #[test]
    fn only_applies_to_post_on_targeted_paths() {
        assert!(applies_to("POST", "/v1/messages"));
        assert!(applies_to("POST", "/antigravity/v1/messages"));
        assert!(applies_to("POST", "/v1/chat/completions"));
        assert!(!applies_to("GET", "/v1/messages"));
        assert!(!applies_to("POST", "/v1/models"));
    }

    #[tokio::test]
    async fn claude_code_client_passes_through_untouched() {
        let store = store().await;
        let mut headers = HashMap::new();
        headers.insert("user-agent".to_string(), "claude-code/1.0".to_string());
        let body = Bytes::from_static(br#"{"messages":[{"role":"user","content":"hi"}]}"#);
        let outcome = process_request(&store, "POST", "/v1/messages", &headers, body.clone()).await;
        assert!(!outcome.sanitized);
        assert_eq!(outcome.body, body);
    }

    #[tokio::test]
    async fn malformed_json_passes_through_unchanged() {
        let store = store().await;
        let body = Bytes::from_static(b"not json");
        let outcome = process_request(&store, "POST", "/v1/messages", &cursor_headers(), body.clone()).await;
        assert!(!outcome.sanitized);
        assert_eq!(outcome.body, body);
    }

    #[tokio::test]
    async fn sanitizes_cursor_thinking_block_and_drops_config() {
        let store = store().await;
        let body = Bytes::from(
            json!({
                "messages": [
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": [{"type": "thinking", "thinking": "pondering", "signature": null}]},
                ],
                "thinking": {"type": "enabled"},
            })
            .to_string(),
        );
        let outcome = process_request(&store, "POST", "/v1/messages", &cursor_headers(), body).await;
        assert!(outcome.sanitized);
        let rewritten: Value = serde_json::from_slice(&outcome.body).unwrap();
        assert!(rewritten.get("thinking").is_none());
        assert_eq!(outcome.stats.thinking_blocks_downgraded, 1);
    }

    #[tokio::test]
    async fn unrelated_path_is_untouched() {
        let store = store().await;
        let body = Bytes::from_static(b"whatever");
        let outcome = process_request(&store, "GET", "/gateway/health", &cursor_headers(), body.clone()).await;
        assert!(!outcome.sanitized);
        assert_eq!(outcome.body, body);
    }
}
