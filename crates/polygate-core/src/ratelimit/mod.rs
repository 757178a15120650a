//! Rate-limit cooldown tracking and retry-backoff policy (C10), grounded on
//! `original_source/src/rate_limit_registry.py`,
//! `original_source/src/antigravity_retry_policies.py` and
//! `original_source/src/retry_utils.py`.

pub mod duration;
pub mod policy;
pub mod registry;

pub use duration::{parse_duration_ms, parse_retry_delay};
pub use policy::{determine_retry_strategy, retry_delay_ms, RetryKind, RetryStrategy};
pub use registry::{MarkRateLimited, RateLimitRegistry, RateLimitReason, RateLimitState};
