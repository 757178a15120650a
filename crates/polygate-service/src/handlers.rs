//! Wire-facing HTTP handlers implementing spec §6's endpoint table.
//! Every handler decodes its dialect into [`polygate_core::model::Message`],
//! runs the merge/sanitize/route/proxy pipeline, then re-encodes the
//! result back into whatever dialect the endpoint speaks, mirroring the
//! teacher's `handle_chat`/`handle_completion` shape in `querymt-service`.

use axum::extract::{Extension, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use http::Method;
use serde_json::{json, Value};
use uuid::Uuid;

use polygate_core::backend::Router;
use polygate_core::client::ClientInfo;
use polygate_core::config::ApiFormat;
use polygate_core::error::GatewayError;
use polygate_core::model::Message;
use polygate_core::protocol::{anthropic, openai};
use polygate_core::proxy::ProxyResponse;
use polygate_core::stream::SseTransformer;
use polygate_core::tokens::count_tokens;

use crate::state::AppState;

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(expected) = &state.auth_key else {
        return Ok(());
    };
    let provided = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(error_response(StatusCode::UNAUTHORIZED, "invalid or missing API key"))
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"error": {"message": message.into(), "type": "invalid_request_error"}})))
}

fn gateway_error_response(err: GatewayError) -> (StatusCode, Json<Value>) {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, err.to_string())
}

fn http_headers_to_axum(headers: &http::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }
    out
}

/// Picks a stable conversation id: the client-detected SCID, else falls
/// back to a body-carried session id, else a fresh one (spec §4.3's SCID
/// contract doesn't mandate persistence across a missing header — a new
/// scid just means a cold conversation state).
fn resolve_scid(client_scid: Option<String>, body_session_id: Option<&str>) -> String {
    client_scid
        .or_else(|| body_session_id.map(str::to_string))
        .unwrap_or_else(|| format!("anon-{}", Uuid::new_v4()))
}

fn encode_for_backend(messages: &[Message], system: Option<&str>, format: ApiFormat) -> (Value, Value) {
    match format {
        ApiFormat::Anthropic => {
            let wire: Vec<Value> = messages.iter().map(anthropic::message_to_anthropic).collect();
            (Value::Array(wire), system.map(|s| json!(s)).unwrap_or(Value::Null))
        }
        ApiFormat::Openai => {
            let mut wire: Vec<Value> = Vec::with_capacity(messages.len() + 1);
            if let Some(s) = system {
                wire.push(json!({"role": "system", "content": s}));
            }
            wire.extend(messages.iter().map(openai::message_to_openai));
            (Value::Array(wire), Value::Null)
        }
    }
}

fn decode_backend_message(value: &Value, format: ApiFormat) -> Result<Message, GatewayError> {
    match format {
        ApiFormat::Anthropic => anthropic::message_from_anthropic(value),
        ApiFormat::Openai => openai::message_from_openai(value),
    }
}

/// Runs the merge/sanitize/dispatch pipeline shared by both chat endpoints.
/// Returns the chosen backend's name, its `api_format`, and the raw
/// [`ProxyResponse`] so each handler can re-encode into its own dialect.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: &AppState,
    scid: &str,
    client_type: &str,
    model: &str,
    system: Option<&str>,
    mut messages: Vec<Message>,
    thinking_enabled: bool,
    stream: bool,
    headers: &HeaderMap,
) -> Result<(String, ApiFormat, ProxyResponse, Vec<Message>), GatewayError> {
    let conversation = state.conversations.get_or_create(scid, client_type).await?;
    messages = state.conversations.merge_with_client_history(scid, &messages);

    let outcome = polygate_core::sanitize::sanitize(&state.signatures, &messages, thinking_enabled, Some(scid), conversation.last_signature.as_deref()).await;
    let sanitized_messages = outcome.messages;

    let config = state.config.clone();
    let registry = state.registry.clone();
    let router = Router::new(&registry, &config);
    let chain = router.backend_chain_for(model);
    let Some(first_backend_name) = chain.first().cloned() else {
        return Err(GatewayError::AllBackendsFailed { model: model.to_string(), last: "no backend configured for model".to_string() });
    };
    let first_backend = state.registry.get(&first_backend_name).ok_or_else(|| GatewayError::Internal(format!("backend {first_backend_name} missing from registry")))?;

    let (wire_messages, wire_system) = encode_for_backend(&sanitized_messages, system, first_backend.api_format);
    let mut body_obj = serde_json::Map::new();
    body_obj.insert("model".to_string(), json!(model));
    body_obj.insert("messages".to_string(), wire_messages);
    if !wire_system.is_null() {
        body_obj.insert("system".to_string(), wire_system);
    }
    body_obj.insert("stream".to_string(), json!(stream));
    let body = Bytes::from(serde_json::to_vec(&Value::Object(body_obj))?);

    let credential = state.credentials.credential_for(&first_backend_name).await;
    let mut proxy_headers = http_headers_to_axum(&http::HeaderMap::new());
    for (k, v) in headers.iter() {
        proxy_headers.insert(k.clone(), v.clone());
    }
    if let Some(cred) = credential {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {cred}")) {
            proxy_headers.insert(http::header::AUTHORIZATION, value);
        }
    }
    let http_headers = to_http_header_map(&proxy_headers);

    let registry_ref = &*state.registry;
    let (backend_name, response) = state
        .proxy
        .route_with_fallback(&router, "/chat/completions", Method::POST, &http_headers, body, stream, model, None, |name| registry_ref.get(name).cloned())
        .await?;

    let backend = state.registry.get(&backend_name).unwrap_or(first_backend);
    state.rate_limits.clear_rate_limit(&backend_name, model).await;

    Ok((backend_name, backend.api_format, response, sanitized_messages))
}

fn to_http_header_map(headers: &HeaderMap) -> http::HeaderMap {
    let mut out = http::HeaderMap::new();
    for (name, value) in headers.iter() {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_str().as_bytes()),
            http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }
    out
}

/// `POST /v1/messages` — Anthropic Messages API.
pub async fn messages_handler(State(state): State<AppState>, Extension(client_info): Extension<ClientInfo>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let model = body.get("model").and_then(Value::as_str).unwrap_or("claude-sonnet-4.5").to_string();
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let thinking_enabled = body.get("thinking").and_then(|t| t.get("type")).and_then(Value::as_str) == Some("enabled");
    let system = body.get("system").and_then(Value::as_str).map(str::to_string);

    let raw_messages = body.get("messages").and_then(Value::as_array).cloned().unwrap_or_default();
    let mut messages = Vec::with_capacity(raw_messages.len());
    for m in &raw_messages {
        match anthropic::message_from_anthropic(m) {
            Ok(msg) => messages.push(msg),
            Err(e) => return gateway_error_response(e).into_response(),
        }
    }

    let scid = resolve_scid(client_info.scid.clone(), body.get("metadata").and_then(|m| m.get("user_id")).and_then(Value::as_str));

    let result = dispatch(&state, &scid, client_info.client_type.as_str(), &model, system.as_deref(), messages, thinking_enabled, stream, &headers).await;

    let (backend_name, backend_format, response, sent_messages) = match result {
        Ok(r) => r,
        Err(e) => return gateway_error_response(e).into_response(),
    };

    match response {
        ProxyResponse::Buffered { status, body, .. } => {
            if status >= 400 {
                return (StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY), body).into_response();
            }
            let Ok(value) = serde_json::from_slice::<Value>(&body) else {
                return gateway_error_response(GatewayError::Protocol(format!("{backend_name}: non-JSON response"))).into_response();
            };
            let Ok(assistant_msg) = decode_backend_message(&value, backend_format) else {
                return gateway_error_response(GatewayError::Protocol(format!("{backend_name}: unparseable message"))).into_response();
            };

            if let Some(block) = assistant_msg.content.as_blocks().iter().find_map(|b| b.signature().map(str::to_string)) {
                let _ = state.conversations.update(&scid, &sent_messages, &assistant_msg, Some(block)).await;
            } else {
                let _ = state.conversations.update(&scid, &sent_messages, &assistant_msg, None).await;
            }

            Json(anthropic::message_to_anthropic(&assistant_msg)).into_response()
        }
        ProxyResponse::Streaming { status, stream, .. } => {
            if status >= 400 {
                return gateway_error_response(GatewayError::Upstream(format!("{backend_name} returned {status}"))).into_response();
            }
            stream_anthropic_sse(state.clone(), backend_name, backend_format, stream, model.clone()).into_response()
        }
    }
}

fn stream_anthropic_sse(state: AppState, backend_name: String, backend_format: ApiFormat, mut upstream: BoxStream<'static, polygate_core::error::Result<Bytes>>, model: String) -> Sse<BoxStream<'static, Result<Event, std::convert::Infallible>>> {
    let out = async_stream::stream! {
        if backend_name == "antigravity" {
            let mut transformer = SseTransformer::new(format!("msg_{}", Uuid::new_v4()), model, 0, None);
            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for frame in transformer.feed(&state.signatures, &bytes).await {
                            if let Some(event) = bytes_to_sse_event(&frame) {
                                yield Ok(event);
                            }
                        }
                    }
                    Err(_) => {
                        for frame in transformer.fail("upstream stream error") {
                            if let Some(event) = bytes_to_sse_event(&frame) {
                                yield Ok(event);
                            }
                        }
                        return;
                    }
                }
            }
            for frame in transformer.finish(&state.signatures).await {
                if let Some(event) = bytes_to_sse_event(&frame) {
                    yield Ok(event);
                }
            }
        } else {
            // Anthropic-format backends already speak this dialect's SSE
            // natively; relay their bytes unchanged.
            let _ = backend_format;
            while let Some(chunk) = upstream.next().await {
                if let Ok(bytes) = chunk {
                    yield Ok(Event::default().data(String::from_utf8_lossy(&bytes).to_string()));
                }
            }
        }
    };

    Sse::new(Box::pin(out) as BoxStream<'static, Result<Event, std::convert::Infallible>>)
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)).text("keep-alive"))
}

fn bytes_to_sse_event(frame: &Bytes) -> Option<Event> {
    // Frames are already fully-formed `event: ..\ndata: ..\n\n` blocks;
    // axum's `Event` wants just the payload, so split the framing back out.
    let text = std::str::from_utf8(frame).ok()?;
    let mut event_name = None;
    let mut data = String::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("event: ") {
            event_name = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("data: ") {
            data.push_str(rest);
        }
    }
    let mut event = Event::default().data(data);
    if let Some(name) = event_name {
        event = event.event(name);
    }
    Some(event)
}

/// `POST /v1/chat/completions` — OpenAI Chat Completions API.
pub async fn chat_completions_handler(State(state): State<AppState>, Extension(client_info): Extension<ClientInfo>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let model = body.get("model").and_then(Value::as_str).unwrap_or("gpt-4o").to_string();
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let raw_messages = body.get("messages").and_then(Value::as_array).cloned().unwrap_or_default();
    let mut system = None;
    let mut messages = Vec::with_capacity(raw_messages.len());
    for m in &raw_messages {
        if m.get("role").and_then(Value::as_str) == Some("system") {
            system = m.get("content").and_then(Value::as_str).map(str::to_string);
            continue;
        }
        match openai::message_from_openai(m) {
            Ok(msg) => messages.push(msg),
            Err(e) => return gateway_error_response(e).into_response(),
        }
    }

    let scid = resolve_scid(client_info.scid.clone(), None);
    let result = dispatch(&state, &scid, client_info.client_type.as_str(), &model, system.as_deref(), messages, false, stream, &headers).await;

    let (backend_name, backend_format, response, sent_messages) = match result {
        Ok(r) => r,
        Err(e) => return gateway_error_response(e).into_response(),
    };

    match response {
        ProxyResponse::Buffered { status, body, .. } => {
            if status >= 400 {
                return (StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY), body).into_response();
            }
            let Ok(value) = serde_json::from_slice::<Value>(&body) else {
                return gateway_error_response(GatewayError::Protocol(format!("{backend_name}: non-JSON response"))).into_response();
            };
            let Ok(assistant_msg) = decode_backend_message(&value, backend_format) else {
                return gateway_error_response(GatewayError::Protocol(format!("{backend_name}: unparseable message"))).into_response();
            };
            let _ = state.conversations.update(&scid, &sent_messages, &assistant_msg, None).await;

            let id = format!("chatcmpl-{}", Uuid::new_v4());
            Json(json!({
                "id": id,
                "object": "chat.completion",
                "model": model,
                "choices": [{
                    "index": 0,
                    "message": openai::message_to_openai(&assistant_msg),
                    "finish_reason": "stop",
                }],
            })).into_response()
        }
        ProxyResponse::Streaming { status, .. } if status >= 400 => {
            gateway_error_response(GatewayError::Upstream(format!("{backend_name} returned {status}"))).into_response()
        }
        ProxyResponse::Streaming { .. } => {
            // Non-Anthropic streaming re-dialecting is out of scope for this
            // gateway (see DESIGN.md): SSOP/thought-signature recovery are
            // Anthropic-client features, so OpenAI-dialect clients are only
            // offered non-streaming responses for now.
            gateway_error_response(GatewayError::ClientFatal("streaming is only supported via /v1/messages".into())).into_response()
        }
    }
}

/// `POST /v1/messages/count_tokens`
pub async fn count_tokens_handler(State(_state): State<AppState>, Json(body): Json<Value>) -> Response {
    let system = body.get("system").and_then(Value::as_str);
    let raw_messages = body.get("messages").and_then(Value::as_array).cloned().unwrap_or_default();
    let mut messages = Vec::with_capacity(raw_messages.len());
    for m in &raw_messages {
        if let Ok(msg) = anthropic::message_from_anthropic(m) {
            messages.push(msg);
        }
    }
    let tokens = count_tokens(&messages, system);
    Json(json!({"input_tokens": tokens})).into_response()
}

/// `GET /v1/models` — merges every enabled backend's `supported_models`
/// into one deduplicated OpenAI-shaped model list.
pub async fn models_handler(State(state): State<AppState>) -> Response {
    let mut seen = std::collections::HashSet::new();
    let mut data = Vec::new();
    for backend in state.registry.sorted_backends() {
        if !backend.enabled {
            continue;
        }
        for model in &backend.supported_models {
            if model == "*" || !seen.insert(model.clone()) {
                continue;
            }
            data.push(json!({"id": model, "object": "model", "owned_by": backend.name}));
        }
    }
    Json(json!({"object": "list", "data": data})).into_response()
}

/// `GET /gateway/health` — per-backend cooldown/enabled snapshot, shaped
/// per spec §6: `{status, backends: {name: {url, priority, enabled,
/// healthy}}, timestamp}`.
pub async fn health_handler(State(state): State<AppState>) -> Response {
    let mut backends = serde_json::Map::new();
    let mut any_unhealthy = false;
    for backend in state.registry.sorted_backends() {
        let cooldown = state.rate_limits.get_state(&backend.name, "*").await;
        let rate_limited = cooldown.as_ref().map(polygate_core::ratelimit::RateLimitState::is_in_cooldown).unwrap_or(false);
        let healthy = backend.enabled && !rate_limited;
        any_unhealthy |= backend.enabled && !healthy;
        backends.insert(
            backend.name.clone(),
            json!({
                "url": backend.base_urls.first().cloned().unwrap_or_default(),
                "priority": backend.priority,
                "enabled": backend.enabled,
                "healthy": healthy,
            }),
        );
    }
    Json(json!({
        "status": if any_unhealthy { "degraded" } else { "healthy" },
        "backends": backends,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}
