//! `SseTransformer` (C7): the Gemini-style upstream SSE -> Anthropic
//! Messages SSE state machine, grounded line-for-line on
//! `original_source/src/anthropic_streaming.py`
//! (`antigravity_sse_to_anthropic_sse`/`_StreamingState`).
//!
//! `message_start` must always be the stream's first event (several IDE
//! clients hang otherwise), but the real input-token count only becomes
//! known once the first chunk with `usageMetadata` or content parts
//! arrives. Every event produced before that point is queued in
//! `pending_output` and flushed immediately after `message_start` goes out.

use std::collections::VecDeque;

use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};

use crate::model::{normalize_thinking_text, sha256_hex};
use crate::protocol::tool_id::{encode_tool_id_with_signature, generate_tool_call_id};
use crate::signature::{SignatureEntry, SignatureStore};

use super::ssop::SsopScanner;

const STREAM_NAMESPACE: &str = "stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
    Image,
}

fn sse_event(event: &str, data: &Value) -> Bytes {
    let payload = serde_json::to_string(data).unwrap_or_default();
    Bytes::from(format!("event: {event}\ndata: {payload}\n\n"))
}

pub struct SseTransformer {
    message_id: String,
    model: String,
    conversation_id: Option<String>,
    initial_input_tokens: u64,

    current_block: Option<BlockKind>,
    current_index: i64,
    current_thinking_signature: Option<String>,
    current_thinking_text: String,
    last_thinking_signature: Option<String>,

    has_tool_use: bool,
    input_tokens: u64,
    output_tokens: u64,
    has_input_tokens: bool,
    has_output_tokens: bool,
    finish_reason: Option<String>,

    ssop: SsopScanner,
    message_start_sent: bool,
    pending_output: VecDeque<Bytes>,
    line_buffer: String,
    done: bool,
}

impl SseTransformer {
    pub fn new(message_id: impl Into<String>, model: impl Into<String>, initial_input_tokens: u64, conversation_id: Option<String>) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            conversation_id,
            initial_input_tokens,
            current_block: None,
            current_index: -1,
            current_thinking_signature: None,
            current_thinking_text: String::new(),
            last_thinking_signature: None,
            has_tool_use: false,
            input_tokens: 0,
            output_tokens: 0,
            has_input_tokens: false,
            has_output_tokens: false,
            finish_reason: None,
            ssop: SsopScanner::new(),
            message_start_sent: false,
            pending_output: VecDeque::new(),
            line_buffer: String::new(),
            done: false,
        }
    }

    fn next_index(&mut self) -> i64 {
        self.current_index += 1;
        self.current_index
    }

    fn enqueue_or_emit(&mut self, out: &mut Vec<Bytes>, evt: Bytes) {
        if self.message_start_sent {
            out.push(evt);
        } else {
            self.pending_output.push_back(evt);
        }
    }

    fn send_message_start(&mut self, out: &mut Vec<Bytes>, input_tokens: u64) {
        if self.message_start_sent {
            return;
        }
        self.message_start_sent = true;
        out.push(sse_event(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": Value::Null,
                    "stop_sequence": Value::Null,
                    "usage": {"input_tokens": input_tokens, "output_tokens": 0},
                },
            }),
        ));
        out.extend(self.pending_output.drain(..));
    }

    /// Closes whatever block is open, caching an accumulated thinking
    /// signature before clearing it (spec §4.7, `close_block_if_open`).
    async fn close_block_if_open(&mut self, store: &SignatureStore) -> Option<Bytes> {
        let kind = self.current_block?;
        if kind == BlockKind::Thinking && !self.current_thinking_text.is_empty() {
            let effective_signature = match self.current_thinking_signature.clone() {
                Some(sig) => Some(sig),
                None => store.get_most_recent().await.map(|e| e.signature),
            };
            if let Some(sig) = effective_signature {
                self.last_thinking_signature = Some(sig.clone());
                let hash = sha256_hex(&normalize_thinking_text(&self.current_thinking_text));
                let now = Utc::now();
                store
                    .set(SignatureEntry {
                        signature: sig,
                        thinking_hash: hash,
                        thinking_prefix: self.current_thinking_text.chars().take(80).collect(),
                        model: self.model.clone(),
                        namespace: STREAM_NAMESPACE.to_string(),
                        conversation_id: self.conversation_id.clone(),
                        created_at: now,
                        expires_at: now + store.ttl(),
                        last_accessed_at: now,
                        access_count: 0,
                    })
                    .await;
            }
        }

        let evt = sse_event(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.current_index}),
        );
        self.current_block = None;
        self.current_thinking_signature = None;
        self.current_thinking_text.clear();
        Some(evt)
    }

    fn open_text_block(&mut self) -> Bytes {
        let idx = self.next_index();
        self.current_block = Some(BlockKind::Text);
        sse_event(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": idx,
                "content_block": {"type": "text", "text": ""},
            }),
        )
    }

    fn open_thinking_block(&mut self, signature: Option<&str>) -> Bytes {
        let idx = self.next_index();
        self.current_block = Some(BlockKind::Thinking);
        self.current_thinking_signature = signature.map(str::to_string);
        self.current_thinking_text.clear();
        let mut block = json!({"type": "thinking", "thinking": ""});
        if let Some(sig) = signature {
            block["signature"] = json!(sig);
        }
        sse_event(
            "content_block_start",
            &json!({"type": "content_block_start", "index": idx, "content_block": block}),
        )
    }

    /// Emits a three-event synthetic tool_use block for an SSOP-detected
    /// call, pre-announcing it before the native `functionCall` arrives.
    async fn emit_ssop_tool(&mut self, store: &SignatureStore, out: &mut Vec<Bytes>, call: super::ssop::DetectedToolCall) {
        if let Some(stop_evt) = self.close_block_if_open(store).await {
            self.enqueue_or_emit(out, stop_evt);
        }
        let idx = self.next_index();
        let args_str = serde_json::to_string(&call.arguments).unwrap_or_default();

        self.enqueue_or_emit(
            out,
            sse_event(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": idx,
                    "content_block": {"type": "tool_use", "id": call.id, "name": call.name, "input": {}},
                }),
            ),
        );
        self.enqueue_or_emit(
            out,
            sse_event(
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": idx,
                    "delta": {"type": "input_json_delta", "partial_json": args_str},
                }),
            ),
        );
        self.enqueue_or_emit(out, sse_event("content_block_stop", &json!({"type": "content_block_stop", "index": idx})));
        self.has_tool_use = true;
    }

    /// Appends upstream bytes, processes every complete `data: ...` line,
    /// and returns the Anthropic SSE events ready to forward. Call
    /// [`Self::finish`] once the upstream stream ends.
    pub async fn feed(&mut self, store: &SignatureStore, chunk: &[u8]) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        self.line_buffer.push_str(&String::from_utf8_lossy(chunk));

        loop {
            let Some(newline_pos) = self.line_buffer.find('\n') else {
                break;
            };
            let line: String = self.line_buffer.drain(..=newline_pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if self.process_line(store, line, &mut out).await {
                self.done = true;
                break;
            }
        }
        out
    }

    /// Returns `true` once the stream should stop (a `[DONE]` marker or a
    /// `finishReason` was observed).
    async fn process_line(&mut self, store: &SignatureStore, line: &str, out: &mut Vec<Bytes>) -> bool {
        if !line.starts_with("data: ") {
            return false;
        }
        let raw = line[6..].trim();
        if raw == "[DONE]" {
            return true;
        }

        let Ok(data) = serde_json::from_str::<Value>(raw) else {
            return false;
        };
        let response = data.get("response").cloned().unwrap_or(json!({}));
        let candidate = response
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .cloned()
            .unwrap_or(json!({}));
        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if let Some(usage) = pick_usage_metadata(&response, &candidate) {
            if let Some(n) = usage.get("promptTokenCount").and_then(Value::as_u64) {
                self.input_tokens = n;
                self.has_input_tokens = true;
            }
            if let Some(n) = usage.get("candidatesTokenCount").and_then(Value::as_u64) {
                self.output_tokens = n;
                self.has_output_tokens = true;
            }
        }

        if self.has_input_tokens && !self.message_start_sent {
            let tokens = self.input_tokens;
            self.send_message_start(out, tokens);
        }
        if !parts.is_empty() && !self.message_start_sent {
            let tokens = self.initial_input_tokens;
            self.send_message_start(out, tokens);
        }

        for part in &parts {
            self.process_part(store, part, out).await;
        }

        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
            return true;
        }
        false
    }

    async fn process_part(&mut self, store: &SignatureStore, part: &Value, out: &mut Vec<Bytes>) {
        let Some(obj) = part.as_object() else {
            return;
        };

        let signature = obj.get("thoughtSignature").and_then(Value::as_str);
        if let Some(sig) = signature {
            if self.current_block == Some(BlockKind::Thinking) && self.current_thinking_signature.is_none() {
                self.current_thinking_signature = Some(sig.to_string());
                let idx = self.current_index;
                self.enqueue_or_emit(
                    out,
                    sse_event(
                        "content_block_delta",
                        &json!({"type": "content_block_delta", "index": idx, "delta": {"type": "signature_delta", "signature": sig}}),
                    ),
                );
            }
        }

        if obj.get("thought").and_then(Value::as_bool) == Some(true) {
            let thinking_text = obj.get("text").and_then(Value::as_str).unwrap_or("");
            if !thinking_text.is_empty() {
                if let Some(call) = self.ssop.scan(thinking_text) {
                    self.emit_ssop_tool(store, out, call).await;
                }
            }

            if self.current_block != Some(BlockKind::Thinking) {
                if let Some(stop_evt) = self.close_block_if_open(store).await {
                    self.enqueue_or_emit(out, stop_evt);
                }
                let evt = self.open_thinking_block(signature);
                self.enqueue_or_emit(out, evt);
            }

            if !thinking_text.is_empty() {
                self.current_thinking_text.push_str(thinking_text);
                let idx = self.current_index;
                self.enqueue_or_emit(
                    out,
                    sse_event(
                        "content_block_delta",
                        &json!({"type": "content_block_delta", "index": idx, "delta": {"type": "thinking_delta", "thinking": thinking_text}}),
                    ),
                );
            }
            return;
        }

        if let Some(text) = obj.get("text").and_then(Value::as_str) {
            if text.trim().is_empty() {
                return;
            }
            if let Some(call) = self.ssop.scan(text) {
                self.emit_ssop_tool(store, out, call).await;
            }

            if self.current_block != Some(BlockKind::Text) {
                if let Some(stop_evt) = self.close_block_if_open(store).await {
                    self.enqueue_or_emit(out, stop_evt);
                }
                let evt = self.open_text_block();
                self.enqueue_or_emit(out, evt);
            }
            let idx = self.current_index;
            self.enqueue_or_emit(
                out,
                sse_event(
                    "content_block_delta",
                    &json!({"type": "content_block_delta", "index": idx, "delta": {"type": "text_delta", "text": text}}),
                ),
            );
            return;
        }

        if let Some(inline) = obj.get("inlineData") {
            if let Some(stop_evt) = self.close_block_if_open(store).await {
                self.enqueue_or_emit(out, stop_evt);
            }
            let idx = self.next_index();
            self.current_block = Some(BlockKind::Image);
            let block = json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": inline.get("mimeType").and_then(Value::as_str).unwrap_or("image/png"),
                    "data": inline.get("data").and_then(Value::as_str).unwrap_or(""),
                },
            });
            self.enqueue_or_emit(
                out,
                sse_event("content_block_start", &json!({"type": "content_block_start", "index": idx, "content_block": block})),
            );
            self.enqueue_or_emit(out, sse_event("content_block_stop", &json!({"type": "content_block_stop", "index": idx})));
            self.current_block = None;
            return;
        }

        if let Some(fc) = obj.get("functionCall").and_then(Value::as_object) {
            self.has_tool_use = true;
            let tool_name = fc.get("name").and_then(Value::as_str).unwrap_or("");
            let tool_args = remove_nulls(fc.get("args").cloned().unwrap_or(json!({})));
            let original_id = generate_tool_call_id(tool_name, &tool_args);

            if self.ssop.emitted_ids().contains(&original_id) {
                return;
            }

            let mut thought_signature = obj
                .get("thoughtSignature")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| self.current_thinking_signature.clone())
                .or_else(|| self.last_thinking_signature.clone());
            if thought_signature.is_none() {
                thought_signature = store.get_most_recent().await.map(|e| e.signature);
            }

            let encoded_id = encode_tool_id_with_signature(&original_id, thought_signature.as_deref());
            if let Some(sig) = &thought_signature {
                store
                    .tool_set(crate::signature::ToolSignatureEntry {
                        tool_id: original_id.clone(),
                        signature: sig.clone(),
                        created_at: Utc::now(),
                        expires_at: Utc::now() + store.ttl(),
                    })
                    .await;
            }

            if let Some(stop_evt) = self.close_block_if_open(store).await {
                self.enqueue_or_emit(out, stop_evt);
            }

            let idx = self.next_index();
            self.enqueue_or_emit(
                out,
                sse_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": idx,
                        "content_block": {"type": "tool_use", "id": encoded_id, "name": tool_name, "input": {}},
                    }),
                ),
            );
            let input_json = serde_json::to_string(&tool_args).unwrap_or_default();
            self.enqueue_or_emit(
                out,
                sse_event(
                    "content_block_delta",
                    &json!({"type": "content_block_delta", "index": idx, "delta": {"type": "input_json_delta", "partial_json": input_json}}),
                ),
            );
            self.enqueue_or_emit(out, sse_event("content_block_stop", &json!({"type": "content_block_stop", "index": idx})));
        }
    }

    /// Closes any open block and emits the terminal `message_delta`/
    /// `message_stop` pair. Idempotent after the first call.
    pub async fn finish(&mut self, store: &SignatureStore) -> Vec<Bytes> {
        let mut out = Vec::new();
        if let Some(stop_evt) = self.close_block_if_open(store).await {
            self.enqueue_or_emit(&mut out, stop_evt);
        }
        if !self.message_start_sent {
            let tokens = self.initial_input_tokens;
            self.send_message_start(&mut out, tokens);
        }

        let mut stop_reason = if self.has_tool_use { "tool_use" } else { "end_turn" };
        if self.finish_reason.as_deref() == Some("MAX_TOKENS") && !self.has_tool_use {
            stop_reason = "max_tokens";
        }

        out.push(sse_event(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": Value::Null},
                "usage": {
                    "input_tokens": if self.has_input_tokens { self.input_tokens } else { self.initial_input_tokens },
                    "output_tokens": if self.has_output_tokens { self.output_tokens } else { 0 },
                },
            }),
        ));
        out.push(sse_event("message_stop", &json!({"type": "message_stop"})));
        out
    }

    /// A client disconnect propagates here as cancellation: close whatever
    /// block is open and stop, with no error event and no terminal
    /// `message_delta`/`message_stop`.
    pub async fn cancel(&mut self, store: &SignatureStore) -> Vec<Bytes> {
        let mut out = Vec::new();
        if let Some(stop_evt) = self.close_block_if_open(store).await {
            out.push(stop_evt);
        }
        out
    }

    /// An upstream protocol failure: ensure `message_start` went out, then
    /// surface an `error` event instead of the terminal pair.
    pub fn fail(&mut self, message: &str) -> Vec<Bytes> {
        let mut out = Vec::new();
        if !self.message_start_sent {
            self.send_message_start(&mut out, self.initial_input_tokens);
        }
        out.push(sse_event("error", &json!({"type": "error", "error": {"type": "api_error", "message": message}})));
        out
    }
}

fn pick_usage_metadata<'a>(response: &'a Value, candidate: &'a Value) -> Option<Value> {
    let response_usage = response.get("usageMetadata").cloned().unwrap_or(json!({}));
    let candidate_usage = candidate.get("usageMetadata").cloned().unwrap_or(json!({}));

    fn score(v: &Value) -> usize {
        ["promptTokenCount", "candidatesTokenCount", "totalTokenCount"]
            .iter()
            .filter(|f| v.get(*f).map(|x| !x.is_null()).unwrap_or(false))
            .count()
    }

    if score(&candidate_usage) > score(&response_usage) {
        Some(candidate_usage)
    } else if response_usage.is_object() {
        Some(response_usage)
    } else {
        None
    }
}

fn remove_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(map.into_iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k, remove_nulls(v))).collect()),
        Value::Array(arr) => Value::Array(arr.into_iter().filter(|v| !v.is_null()).map(remove_nulls).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::signature::sqlite::SqliteSignatureStore;
    use std::sync::Arc;

    async fn store() -> SignatureStore {
        let l2 = Arc::new(SqliteSignatureStore::new("sqlite::memory:").await.unwrap());
        SignatureStore::new(l2, &CacheConfig::default(), None)
    }

    fn event_names(events: &[Bytes]) -> Vec<String> {
        events
            .iter()
            .map(|b| {
                let text = String::from_utf8_lossy(b);
                text.lines().next().unwrap_or("").trim_start_matches("event: ").to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn text_part_opens_and_closes_a_text_block() {
        let store = store().await;
        let mut t = SseTransformer::new("msg_1", "gemini-2.5-pro", 10, None);
        let chunk = br#"data: {"response":{"candidates":[{"content":{"parts":[{"text":"hello"}]}}]}}
"#;
        let events = t.feed(&store, chunk).await;
        let names = event_names(&events);
        assert_eq!(names, vec!["message_start", "content_block_start", "content_block_delta"]);
    }

    #[tokio::test]
    async fn finish_emits_message_delta_and_stop() {
        let store = store().await;
        let mut t = SseTransformer::new("msg_1", "gemini-2.5-pro", 10, None);
        t.feed(&store, b"data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hi\"}]}}]}}\n").await;
        let events = t.finish(&store).await;
        let names = event_names(&events);
        assert_eq!(names, vec!["content_block_stop", "message_delta", "message_stop"]);
    }

    #[tokio::test]
    async fn done_marker_stops_feeding_further_chunks() {
        let store = store().await;
        let mut t = SseTransformer::new("msg_1", "gemini-2.5-pro", 10, None);
        t.feed(&store, b"data: [DONE]\n").await;
        let events = t.feed(&store, b"data: {\"response\":{}}\n").await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn function_call_becomes_tool_use_block() {
        let store = store().await;
        let mut t = SseTransformer::new("msg_1", "gemini-2.5-pro", 10, None);
        let chunk = br#"data: {"response":{"candidates":[{"content":{"parts":[{"functionCall":{"name":"get_weather","args":{"city":"nyc"}}}]}}]}}
"#;
        let events = t.feed(&store, chunk).await;
        let names = event_names(&events);
        assert_eq!(names, vec!["message_start", "content_block_start", "content_block_delta", "content_block_stop"]);
        let finish = t.finish(&store).await;
        let finish_names = event_names(&finish);
        assert!(finish_names.contains(&"message_delta".to_string()));
    }

    #[tokio::test]
    async fn cancel_closes_open_block_with_no_terminal_events() {
        let store = store().await;
        let mut t = SseTransformer::new("msg_1", "gemini-2.5-pro", 10, None);
        t.feed(&store, b"data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hi\"}]}}]}}\n").await;
        let events = t.cancel(&store).await;
        let names = event_names(&events);
        assert_eq!(names, vec!["content_block_stop"]);
    }

    #[tokio::test]
    async fn ssop_detected_call_in_text_is_pre_announced() {
        let store = store().await;
        let mut t = SseTransformer::new("msg_1", "gemini-2.5-pro", 10, None);
        let chunk = br#"data: {"response":{"candidates":[{"content":{"parts":[{"text":"{\"name\": \"f\", \"arguments\": {}}"}]}}]}}
"#;
        let events = t.feed(&store, chunk).await;
        let names = event_names(&events);
        assert!(names.contains(&"content_block_start".to_string()));
        assert!(t.has_tool_use);
    }
}
