//! Error taxonomy for the gateway core, grouped by how callers must react
//! rather than by origin — see spec §7.

use thiserror::Error;

/// The gateway's error type. Variants map onto the behavioral taxonomy
/// (retry / advance chain / surface unchanged) rather than onto individual
/// call sites.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network-level or 5xx failure against a backend; retryable per policy.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// 429 without quota exhaustion; retryable after the advised delay.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// 429 carrying a quota/capacity-exhaustion marker; long cooldown.
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    /// 401/403; never retried, surfaced for credential rotation.
    #[error("auth error: {0}")]
    Auth(String),

    /// 400/422; surfaced to the caller unchanged.
    #[error("client error: {0}")]
    ClientFatal(String),

    /// Malformed or unexpected wire shape from a backend or client.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Everything that reaches neither a backend nor a client, e.g. cache
    /// or persistence failures degraded-and-logged rather than propagated.
    #[error("internal error: {0}")]
    Internal(String),

    /// Every enabled backend in a chain was tried and failed.
    #[error("all backends failed for model {model}: {last}")]
    AllBackendsFailed { model: String, last: String },
}

impl GatewayError {
    /// Maps the error onto an HTTP status the way `querymt-service` does
    /// at its handler boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Upstream(_) => 502,
            GatewayError::RateLimited(_) => 429,
            GatewayError::QuotaExhausted(_) => 429,
            GatewayError::Auth(_) => 401,
            GatewayError::ClientFatal(_) => 400,
            GatewayError::Protocol(_) => 502,
            GatewayError::Internal(_) => 500,
            GatewayError::AllBackendsFailed { .. } => 503,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Upstream(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Protocol(format!(
            "{} at line {} column {}",
            err,
            err.line(),
            err.column()
        ))
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Internal(format!("sqlite error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
