//! Axum middleware wrapping [`polygate_core::middleware::process_request`]:
//! buffers the request body, runs the detect-sanitize-rewrite pipeline,
//! rewrites the body in place and stashes the detected [`ClientInfo`] as a
//! request extension for downstream handlers, mirroring how the teacher's
//! `querymt-service` reads headers once per request rather than per layer.

use std::collections::HashMap;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use crate::state::AppState;

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub async fn ide_compat_layer(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();

    if !polygate_core::middleware::applies_to(&method, &path) {
        return Ok(next.run(req).await);
    }

    let mut headers_map = HashMap::new();
    for (name, value) in req.headers().iter() {
        if let Ok(v) = value.to_str() {
            headers_map.insert(name.as_str().to_string(), v.to_string());
        }
    }

    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return Err(StatusCode::PAYLOAD_TOO_LARGE),
    };

    let outcome = polygate_core::middleware::process_request(&state.signatures, &method, &path, &headers_map, bytes).await;

    let mut req = Request::from_parts(parts, Body::from(outcome.body));
    req.extensions_mut().insert(outcome.client_info);
    Ok(next.run(req).await)
}
