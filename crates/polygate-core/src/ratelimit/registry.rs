//! `RateLimitRegistry` (C10): per-(credential, model) cooldown tracking,
//! grounded on `original_source/src/rate_limit_registry.py`. Keyed by
//! `(credential_name, model_name)` where `model_name == "*"` means a
//! credential-wide cooldown.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    RateLimit,
    QuotaExhausted,
    ServerError,
    AuthError,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub last_status: u16,
    pub last_error: String,
    pub cooldown_until: Option<Instant>,
    pub last_retry_after_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_updated: Instant,
    pub reason: RateLimitReason,
}

impl RateLimitState {
    pub fn is_in_cooldown(&self) -> bool {
        self.cooldown_until.map(|until| Instant::now() < until).unwrap_or(false)
    }

    pub fn remaining_cooldown_ms(&self) -> u64 {
        match self.cooldown_until {
            Some(until) => until.saturating_duration_since(Instant::now()).as_millis() as u64,
            None => 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarkRateLimited<'a> {
    pub status_code: u16,
    pub error_text: &'a str,
    pub retry_after_ms: Option<u64>,
    pub cooldown_until: Option<Instant>,
    pub reason: RateLimitReason,
}

impl Default for RateLimitReason {
    fn default() -> Self {
        RateLimitReason::Unknown
    }
}

pub struct RateLimitRegistry {
    entries: Mutex<HashMap<(String, String), RateLimitState>>,
}

impl Default for RateLimitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const EXPIRY_IDLE: Duration = Duration::from_secs(3600);

impl RateLimitRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Marks `(credential, model)` rate limited. If `cooldown_until` isn't
    /// given but `retry_after_ms` is, the cooldown is derived from it —
    /// mirrors `mark_rate_limited`'s "compute from retry_after when no
    /// explicit cooldown" fallback.
    pub async fn mark_rate_limited(&self, credential_name: &str, model_name: &str, mark: MarkRateLimited<'_>) {
        let now = Instant::now();
        let cooldown_until = mark.cooldown_until.or_else(|| {
            mark.retry_after_ms
                .filter(|&ms| ms > 0)
                .map(|ms| now + Duration::from_millis(ms))
        });
        let truncated_error: String = mark.error_text.chars().take(200).collect();

        let mut entries = self.entries.lock().await;
        let key = (credential_name.to_string(), model_name.to_string());
        entries
            .entry(key)
            .and_modify(|state| {
                state.last_status = mark.status_code;
                state.last_error = truncated_error.clone();
                state.cooldown_until = cooldown_until;
                state.last_retry_after_ms = mark.retry_after_ms;
                state.consecutive_failures += 1;
                state.last_updated = now;
                state.reason = mark.reason;
            })
            .or_insert(RateLimitState {
                last_status: mark.status_code,
                last_error: truncated_error,
                cooldown_until,
                last_retry_after_ms: mark.retry_after_ms,
                consecutive_failures: 1,
                last_updated: now,
                reason: mark.reason,
            });

        tracing::info!(
            credential = credential_name,
            model = model_name,
            status = mark.status_code,
            reason = ?mark.reason,
            "marked rate limited"
        );
    }

    /// Resets the cooldown on a successful request without dropping the
    /// historical entry (spec §4.10's "clear on success" rule).
    pub async fn clear_rate_limit(&self, credential_name: &str, model_name: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(state) = entries.get_mut(&(credential_name.to_string(), model_name.to_string())) {
            state.cooldown_until = None;
            state.consecutive_failures = 0;
            state.last_updated = Instant::now();
        }
    }

    pub async fn is_rate_limited(&self, credential_name: &str, model_name: &str) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(&(credential_name.to_string(), model_name.to_string()))
            .map(RateLimitState::is_in_cooldown)
            .unwrap_or(false)
    }

    pub async fn get_state(&self, credential_name: &str, model_name: &str) -> Option<RateLimitState> {
        let entries = self.entries.lock().await;
        entries.get(&(credential_name.to_string(), model_name.to_string())).cloned()
    }

    pub async fn cooldown_entries(&self) -> Vec<(String, String, RateLimitState)> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|(_, state)| state.is_in_cooldown())
            .map(|((cred, model), state)| (cred.clone(), model.clone(), state.clone()))
            .collect()
    }

    /// Drops entries that are both out of cooldown and stale for over an
    /// hour; returns the number removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, state| state.is_in_cooldown() || now.duration_since(state.last_updated) < EXPIRY_IDLE);
        before - entries.len()
    }

    /// Wipes every entry for a credential, used when a credential's
    /// project/id is rotated out from under an existing cooldown.
    pub async fn clear_rate_limit_for_credential(&self, credential_name: &str) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|(cred, _), _| cred != credential_name);
        before - entries.len()
    }
}

impl Clone for RateLimitState {
    fn clone(&self) -> Self {
        RateLimitState {
            last_status: self.last_status,
            last_error: self.last_error.clone(),
            cooldown_until: self.cooldown_until,
            last_retry_after_ms: self.last_retry_after_ms,
            consecutive_failures: self.consecutive_failures,
            last_updated: self.last_updated,
            reason: self.reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn marks_and_reports_cooldown() {
        let registry = RateLimitRegistry::new();
        registry
            .mark_rate_limited(
                "cred-a",
                "gemini-2.5-pro",
                MarkRateLimited {
                    status_code: 429,
                    error_text: "rate limited",
                    retry_after_ms: Some(5_000),
                    cooldown_until: None,
                    reason: RateLimitReason::RateLimit,
                },
            )
            .await;
        assert!(registry.is_rate_limited("cred-a", "gemini-2.5-pro").await);
    }

    #[tokio::test]
    async fn clear_resets_cooldown_but_keeps_entry() {
        let registry = RateLimitRegistry::new();
        registry
            .mark_rate_limited(
                "cred-a",
                "*",
                MarkRateLimited {
                    status_code: 429,
                    error_text: "",
                    retry_after_ms: Some(1_000),
                    cooldown_until: None,
                    reason: RateLimitReason::RateLimit,
                },
            )
            .await;
        registry.clear_rate_limit("cred-a", "*").await;
        assert!(!registry.is_rate_limited("cred-a", "*").await);
        assert!(registry.get_state("cred-a", "*").await.is_some());
    }

    #[tokio::test]
    async fn unknown_credential_model_is_not_rate_limited() {
        let registry = RateLimitRegistry::new();
        assert!(!registry.is_rate_limited("nope", "nope").await);
    }

    #[tokio::test]
    async fn clear_for_credential_removes_all_its_models() {
        let registry = RateLimitRegistry::new();
        for model in ["m1", "m2"] {
            registry
                .mark_rate_limited(
                    "cred-a",
                    model,
                    MarkRateLimited {
                        status_code: 429,
                        error_text: "",
                        retry_after_ms: Some(1_000),
                        cooldown_until: None,
                        reason: RateLimitReason::RateLimit,
                    },
                )
                .await;
        }
        let removed = registry.clear_rate_limit_for_credential("cred-a").await;
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn error_text_is_truncated_to_200_chars() {
        let registry = RateLimitRegistry::new();
        let long_error = "x".repeat(500);
        registry
            .mark_rate_limited(
                "cred-a",
                "*",
                MarkRateLimited {
                    status_code: 500,
                    error_text: &long_error,
                    retry_after_ms: None,
                    cooldown_until: None,
                    reason: RateLimitReason::ServerError,
                },
            )
            .await;
        let state = registry.get_state("cred-a", "*").await.unwrap();
        assert_eq!(state.last_error.len(), 200);
    }
}
