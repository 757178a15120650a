//! `RetryPolicy` (C10): status-code -> backoff-strategy decision table,
//! grounded on `original_source/src/antigravity_retry_policies.py`.

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    None,
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryStrategy {
    pub kind: RetryKind,
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ratio: f64,
}

impl RetryStrategy {
    pub const NONE: RetryStrategy = RetryStrategy {
        kind: RetryKind::None,
        base_ms: 0,
        max_ms: 0,
        jitter_ratio: 0.2,
    };

    /// Delay in milliseconds for the given zero-based `attempt`.
    /// `override_delay_ms` (a server-advised `Retry-After`/`retryDelay`)
    /// always wins over the strategy's own math when present and positive.
    pub fn compute_delay_ms(&self, attempt: u32, override_delay_ms: Option<u64>) -> u64 {
        if self.kind == RetryKind::None {
            return 0;
        }

        let mut delay_ms = match override_delay_ms {
            Some(ms) if ms > 0 => ms as f64,
            _ => match self.kind {
                RetryKind::Fixed => self.base_ms as f64,
                RetryKind::Linear => self.base_ms as f64 * (attempt as f64 + 1.0),
                RetryKind::Exponential => self.base_ms as f64 * 2f64.powi(attempt as i32),
                RetryKind::None => 0.0,
            },
        };

        if self.max_ms > 0 {
            delay_ms = delay_ms.min(self.max_ms as f64);
        }

        if self.jitter_ratio > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range((1.0 - self.jitter_ratio)..=(1.0 + self.jitter_ratio));
            delay_ms *= jitter;
        }

        delay_ms.max(0.0).round() as u64
    }
}

const EXHAUSTED_MARKER: &str = "MODEL_CAPACITY_EXHAUSTED";

/// Maps an HTTP status (plus error body) onto a retry strategy (spec
/// §4.10). A capacity-exhaustion 429 gets a much longer ceiling than a
/// plain rate-limit 429 so the caller can choose to fall back instead of
/// hammering the same backend.
pub fn determine_retry_strategy(status_code: u16, error_text: &str, retry_enabled: bool) -> RetryStrategy {
    if !retry_enabled {
        return RetryStrategy::NONE;
    }

    if status_code == 429 {
        if error_text.contains(EXHAUSTED_MARKER) {
            return RetryStrategy {
                kind: RetryKind::Exponential,
                base_ms: 5_000,
                max_ms: 3_600_000,
                jitter_ratio: 0.2,
            };
        }
        return RetryStrategy {
            kind: RetryKind::Exponential,
            base_ms: 1_000,
            max_ms: 1_800_000,
            jitter_ratio: 0.2,
        };
    }

    if matches!(status_code, 500 | 502 | 503 | 504 | 529) {
        return RetryStrategy {
            kind: RetryKind::Exponential,
            base_ms: 1_000,
            max_ms: 60_000,
            jitter_ratio: 0.2,
        };
    }

    RetryStrategy::NONE
}

/// Convenience wrapper combining [`crate::ratelimit::duration::parse_retry_delay`]
/// with [`determine_retry_strategy`], mirroring `get_retry_delay_from_error`.
pub fn retry_delay_ms(status_code: u16, error_text: &str, attempt: u32, retry_enabled: bool) -> u64 {
    let override_delay = super::duration::parse_retry_delay(error_text);
    let strategy = determine_retry_strategy(status_code, error_text, retry_enabled);
    strategy.compute_delay_ms(attempt, override_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_retry_when_disabled() {
        let strategy = determine_retry_strategy(500, "", false);
        assert_eq!(strategy.kind, RetryKind::None);
        assert_eq!(strategy.compute_delay_ms(0, None), 0);
    }

    #[test]
    fn client_errors_never_retry() {
        assert_eq!(determine_retry_strategy(400, "", true).kind, RetryKind::None);
        assert_eq!(determine_retry_strategy(401, "", true).kind, RetryKind::None);
        assert_eq!(determine_retry_strategy(403, "", true).kind, RetryKind::None);
    }

    #[test]
    fn capacity_exhausted_gets_longer_ceiling_than_plain_rate_limit() {
        let exhausted = determine_retry_strategy(429, "MODEL_CAPACITY_EXHAUSTED", true);
        let plain = determine_retry_strategy(429, "rate limited", true);
        assert!(exhausted.max_ms > plain.max_ms);
    }

    #[test]
    fn exponential_backoff_grows_with_attempt() {
        let strategy = RetryStrategy {
            kind: RetryKind::Exponential,
            base_ms: 1000,
            max_ms: 0,
            jitter_ratio: 0.0,
        };
        assert_eq!(strategy.compute_delay_ms(0, None), 1000);
        assert_eq!(strategy.compute_delay_ms(1, None), 2000);
        assert_eq!(strategy.compute_delay_ms(2, None), 4000);
    }

    #[test]
    fn max_ms_clamps_delay() {
        let strategy = RetryStrategy {
            kind: RetryKind::Exponential,
            base_ms: 1000,
            max_ms: 1500,
            jitter_ratio: 0.0,
        };
        assert_eq!(strategy.compute_delay_ms(5, None), 1500);
    }

    #[test]
    fn override_delay_wins_over_strategy_math() {
        let strategy = RetryStrategy {
            kind: RetryKind::Exponential,
            base_ms: 1000,
            max_ms: 0,
            jitter_ratio: 0.0,
        };
        assert_eq!(strategy.compute_delay_ms(3, Some(250)), 250);
    }

    #[test]
    fn server_errors_retry_with_short_ceiling() {
        let strategy = determine_retry_strategy(503, "", true);
        assert_eq!(strategy.kind, RetryKind::Exponential);
        assert_eq!(strategy.max_ms, 60_000);
    }
}
