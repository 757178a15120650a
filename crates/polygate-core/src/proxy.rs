//! `ProxyEngine` (C9): dispatches a request against a chosen backend over
//! HTTP, handling header allowlisting, retries and the streaming/
//! non-streaming split, grounded on `original_source/src/gateway/proxy.py`
//! and an HTTP-provider crate's header-forwarding-and-retry shape,
//! general-purposed here instead of tied to a single `HTTPChatProvider` impl.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use once_cell::sync::Lazy;
use reqwest::Client;

use crate::backend::Router;
use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};
use crate::ratelimit::{duration::parse_retry_delay, policy::determine_retry_strategy, registry::MarkRateLimited, RateLimitReason, RateLimitRegistry};

/// Header names/prefixes forwarded upstream; everything else
/// is dropped rather than blindly passed through.
const FORWARDED_HEADERS: &[&str] = &["user-agent", "x-forwarded-user-agent", "x-request-id"];
const FORWARDED_PREFIXES: &[&str] = &["x-augment-", "x-bugment-", "x-signature-"];

static DONE_MARKER: &[u8] = b"[DONE]";

fn is_forwarded_header(name: &str) -> bool {
    let lower = name.to_lowercase();
    FORWARDED_HEADERS.contains(&lower.as_str()) || FORWARDED_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Either a fully-buffered response or a byte stream passed through as-is
/// (already-framed SSE from the backend, or raw OpenAI SSE awaiting a
/// further transformer).
pub enum ProxyResponse {
    Buffered { status: u16, headers: HeaderMap, body: Bytes },
    Streaming { status: u16, headers: HeaderMap, stream: BoxStream<'static, Result<Bytes>> },
}

/// In-process escape hatch for the `antigravity` backend's `/chat/completions`
/// endpoint, avoiding a loopback HTTP round-trip to itself.
#[async_trait]
pub trait LocalHandler: Send + Sync {
    async fn handle(&self, headers: HeaderMap, body: Bytes, stream: bool) -> Result<ProxyResponse>;
}

pub struct ProxyEngine {
    client: Client,
    rate_limits: Arc<RateLimitRegistry>,
}

impl ProxyEngine {
    pub fn new(rate_limits: Arc<RateLimitRegistry>) -> Self {
        Self {
            client: Client::builder().build().expect("reqwest client builder never fails with default config"),
            rate_limits,
        }
    }

    /// Dispatches a single request against `backend`, retrying per policy
    /// up to `backend.max_retries` attempts.
    pub async fn proxy_request(
        &self,
        backend: &BackendConfig,
        endpoint: &str,
        method: Method,
        headers: &HeaderMap,
        body: Bytes,
        stream: bool,
        local_handler: Option<&dyn LocalHandler>,
    ) -> Result<ProxyResponse> {
        if backend.name == "antigravity" && endpoint == "/chat/completions" {
            if let Some(handler) = local_handler {
                return handler.handle(forward_headers(headers), body, stream).await;
            }
        }

        let url = format!("{}{endpoint}", backend.base_url());
        let timeout = Duration::from_secs(if stream { backend.stream_timeout_s } else { backend.timeout_s });
        let forwarded = forward_headers(headers);

        let mut attempt = 0u32;
        loop {
            let response = self
                .client
                .request(method.clone(), &url)
                .headers(forwarded.clone())
                .timeout(timeout)
                .body(body.clone())
                .send()
                .await;

            let response = match response {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt < backend.max_retries && (err.is_timeout() || err.is_connect()) {
                        let strategy = determine_retry_strategy(502, "", true);
                        let delay = strategy.compute_delay_ms(attempt, None);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(GatewayError::Upstream(err.to_string()));
                }
            };

            let status = response.status().as_u16();

            if status == 429 {
                let resp_headers = response.headers().clone();
                let error_body = response.text().await.unwrap_or_default();
                let retry_after_ms = retry_after_from_headers(&resp_headers).or_else(|| parse_retry_delay(&error_body));
                let reason = if error_body.contains("MODEL_CAPACITY_EXHAUSTED") {
                    RateLimitReason::QuotaExhausted
                } else {
                    RateLimitReason::RateLimit
                };
                self.rate_limits
                    .mark_rate_limited(
                        &backend.name,
                        "*",
                        MarkRateLimited {
                            status_code: status,
                            error_text: &error_body,
                            retry_after_ms,
                            cooldown_until: None,
                            reason,
                        },
                    )
                    .await;

                if attempt < backend.max_retries {
                    let strategy = determine_retry_strategy(status, &error_body, true);
                    let delay = strategy.compute_delay_ms(attempt, retry_after_ms);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                    continue;
                }
                return Err(rate_limit_error(reason, &error_body));
            }

            if matches!(status, 500 | 502 | 504) {
                if attempt < backend.max_retries {
                    let error_body = response.text().await.unwrap_or_default();
                    let strategy = determine_retry_strategy(status, &error_body, true);
                    let delay = strategy.compute_delay_ms(attempt, None);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                    continue;
                }
                let error_body = response.text().await.unwrap_or_default();
                return Err(GatewayError::Upstream(format!("{status}: {error_body}")));
            }

            self.rate_limits.clear_rate_limit(&backend.name, "*").await;

            let resp_headers = response.headers().clone();
            if stream {
                let byte_stream = response.bytes_stream();
                return Ok(ProxyResponse::Streaming {
                    status,
                    headers: resp_headers,
                    stream: benign_eof_stream(byte_stream).boxed(),
                });
            }

            let body = response.bytes().await?;
            return Ok(ProxyResponse::Buffered { status, headers: resp_headers, body });
        }
    }

    /// Drives the model's full backend chain, advancing on failure and
    /// stopping at the first success; raises `AllBackendsFailed` (503)
    /// when the chain is exhausted.
    #[allow(clippy::too_many_arguments)]
    pub async fn route_with_fallback(
        &self,
        router: &Router<'_>,
        endpoint: &str,
        method: Method,
        headers: &HeaderMap,
        body: Bytes,
        stream: bool,
        model: &str,
        local_handler: Option<&dyn LocalHandler>,
        backend_lookup: impl Fn(&str) -> Option<BackendConfig>,
    ) -> Result<(String, ProxyResponse)> {
        let mut visited: HashSet<String> = HashSet::new();
        let chain = router.backend_chain_for(model);
        let mut current = chain.first().cloned();
        let mut last_error = String::new();

        while let Some(backend_name) = current {
            visited.insert(backend_name.clone());
            let Some(backend) = backend_lookup(&backend_name) else {
                break;
            };

            match self.proxy_request(&backend, endpoint, method.clone(), headers, body.clone(), stream, local_handler).await {
                Ok(response) => return Ok((backend_name, response)),
                Err(err) => {
                    last_error = err.to_string();
                    let trigger = match &err {
                        GatewayError::QuotaExhausted(_) => Some("quota_exhausted"),
                        GatewayError::RateLimited(_) => Some("rate_limit"),
                        GatewayError::Upstream(_) => Some("server_error"),
                        _ => None,
                    };
                    current = router.get_fallback_backend(model, &backend_name, trigger, &visited);
                }
            }
        }

        Err(GatewayError::AllBackendsFailed { model: model.to_string(), last: last_error })
    }
}

fn rate_limit_error(reason: RateLimitReason, body: &str) -> GatewayError {
    match reason {
        RateLimitReason::QuotaExhausted => GatewayError::QuotaExhausted(body.to_string()),
        _ => GatewayError::RateLimited(body.to_string()),
    }
}

fn forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_forwarded_header(name.as_str()) {
            out.insert(name.clone(), value.clone());
        }
    }
    out
}

static RETRY_AFTER: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("retry-after"));

fn retry_after_from_headers(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(&*RETRY_AFTER)?.to_str().ok()?;
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds * 1000);
    }
    crate::ratelimit::duration::parse_duration_ms(value)
}

/// Wraps a reqwest byte stream, swallowing the benign mid-stream EOF some
/// upstream proxies produce after a `[DONE]` marker or after bytes have
/// already been yielded.
fn benign_eof_stream(inner: impl futures::Stream<Item = reqwest::Result<Bytes>> + Send + 'static) -> impl futures::Stream<Item = Result<Bytes>> + Send + 'static {
    async_stream::stream! {
        futures::pin_mut!(inner);
        let mut saw_bytes = false;
        let mut saw_done_marker = false;
        while let Some(item) = inner.next().await {
            match item {
                Ok(chunk) => {
                    if !chunk.is_empty() {
                        saw_bytes = true;
                        saw_done_marker = saw_done_marker || contains_done_marker(&chunk);
                    }
                    yield Ok(chunk);
                }
                Err(err) => {
                    let message = err.to_string();
                    let benign = (saw_done_marker || saw_bytes) && (message.contains("incomplete chunked read") || err.is_body() || err.is_decode());
                    if benign {
                        return;
                    }
                    yield Err(GatewayError::Upstream(message));
                    return;
                }
            }
        }
    }
}

fn contains_done_marker(buf: &[u8]) -> bool {
    buf.windows(DONE_MARKER.len()).any(|w| w == DONE_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_only_allowlisted_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("cursor/1.0"));
        headers.insert("x-augment-session", HeaderValue::from_static("abc"));
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("cookie", HeaderValue::from_static("nope"));

        let forwarded = forward_headers(&headers);
        assert!(forwarded.contains_key("user-agent"));
        assert!(forwarded.contains_key("x-augment-session"));
        assert!(!forwarded.contains_key("authorization"));
        assert!(!forwarded.contains_key("cookie"));
    }

    #[test]
    fn retry_after_header_in_seconds_converts_to_ms() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("2"));
        assert_eq!(retry_after_from_headers(&headers), Some(2000));
    }

    #[test]
    fn retry_after_header_accepts_duration_strings() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("1.5s"));
        assert_eq!(retry_after_from_headers(&headers), Some(1500));
    }

    #[test]
    fn done_marker_detection() {
        assert!(contains_done_marker(b"data: [DONE]\n\n"));
        assert!(!contains_done_marker(b"data: hello\n\n"));
    }

    fn backend(name: &str, base_url: String, priority: i32) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            base_urls: vec![base_url],
            priority,
            enabled: true,
            timeout_s: 5,
            stream_timeout_s: 5,
            max_retries: 2,
            supported_models: vec!["*".into()],
            api_format: crate::config::ApiFormat::Anthropic,
        }
    }

    #[tokio::test]
    async fn retries_a_5xx_then_succeeds() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
            .expect(1)
            .mount(&server)
            .await;

        let engine = ProxyEngine::new(Arc::new(RateLimitRegistry::new()));
        let backend = backend("copilot", server.uri(), 1);
        let result = engine
            .proxy_request(&backend, "/chat/completions", Method::POST, &HeaderMap::new(), Bytes::from_static(b"{}"), false, None)
            .await
            .unwrap();
        match result {
            ProxyResponse::Buffered { status, body, .. } => {
                assert_eq!(status, 200);
                assert_eq!(&body[..], b"{\"ok\":true}");
            }
            ProxyResponse::Streaming { .. } => panic!("expected buffered response"),
        }
    }

    #[tokio::test]
    async fn a_429_records_a_cooldown_and_surfaces_rate_limited() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("{\"error\":\"rate limited\"}").insert_header("retry-after", "1"))
            .mount(&server)
            .await;

        let rate_limits = Arc::new(RateLimitRegistry::new());
        let engine = ProxyEngine::new(rate_limits.clone());
        let mut backend = backend("copilot", server.uri(), 1);
        backend.max_retries = 0;

        let err = engine
            .proxy_request(&backend, "/chat/completions", Method::POST, &HeaderMap::new(), Bytes::from_static(b"{}"), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited(_)));
        assert!(rate_limits.is_rate_limited("copilot", "*").await);
    }

    #[tokio::test]
    async fn route_with_fallback_advances_the_chain_on_failure() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let failing = MockServer::start().await;
        Mock::given(method("POST")).and(path("/chat/completions")).respond_with(ResponseTemplate::new(500)).mount(&failing).await;
        let working = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
            .mount(&working)
            .await;

        let mut kiro = backend("kiro-gateway", failing.uri(), 1);
        kiro.max_retries = 0;
        let antigravity = backend("antigravity-fallback", working.uri(), 2);

        let config = crate::config::GatewayConfig {
            backends: vec![kiro.clone(), antigravity.clone()],
            model_routing: vec![crate::config::ModelRoutingRule {
                model_pattern: "claude-sonnet-4.5".into(),
                backends: vec!["kiro-gateway".into(), "antigravity-fallback".into()],
                fallback_on: ["server_error".to_string()].into_iter().collect(),
            }],
            ..Default::default()
        };
        let registry = crate::backend::BackendRegistry::new(config.backends.clone());
        let router = Router::new(&registry, &config);

        let engine = ProxyEngine::new(Arc::new(RateLimitRegistry::new()));
        let lookup = |name: &str| registry.get(name).cloned();
        let (backend_name, response) = engine
            .route_with_fallback(&router, "/chat/completions", Method::POST, &HeaderMap::new(), Bytes::from_static(b"{}"), false, "claude-sonnet-4.5", None, lookup)
            .await
            .unwrap();

        assert_eq!(backend_name, "antigravity-fallback");
        match response {
            ProxyResponse::Buffered { status, .. } => assert_eq!(status, 200),
            ProxyResponse::Streaming { .. } => panic!("expected buffered response"),
        }
    }
}
