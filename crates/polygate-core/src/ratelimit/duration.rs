//! Duration-string parsing shared by the retry policy and the registry,
//! grounded 1:1 on `original_source/src/retry_utils.py`
//! (`parse_duration_ms`/`parse_retry_delay`).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static DURATION_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"([\d.]+)\s*(ms|s|m|h)").unwrap());

/// Parses a duration string made of concatenated `NNh`/`NNm`/`NNs`/`NNms`
/// components into milliseconds, e.g. `"1h16m0.667s"` -> `4560667`.
/// A monoid homomorphism on concatenation for well-formed inputs (spec §8
/// P10): `parse("1h") + parse("30m") == parse("1h30m")`.
pub fn parse_duration_ms(duration_str: &str) -> Option<u64> {
    let mut total_ms = 0.0f64;
    let mut matched = false;

    for caps in DURATION_PATTERN.captures_iter(duration_str) {
        let Ok(value) = caps[1].parse::<f64>() else {
            continue;
        };
        matched = true;
        total_ms += match &caps[2] {
            "ms" => value,
            "s" => value * 1000.0,
            "m" => value * 60.0 * 1000.0,
            "h" => value * 60.0 * 60.0 * 1000.0,
            _ => 0.0,
        };
    }

    if !matched {
        return None;
    }
    Some(total_ms.round() as u64)
}

/// Scans a 429 error body for a precise server-advised retry delay (ms).
/// Priority: `error.details[].retryDelay` (Google `RetryInfo`), then
/// `error.details[].metadata.quotaResetDelay`.
pub fn parse_retry_delay(error_text: &str) -> Option<u64> {
    let data: Value = serde_json::from_str(error_text).ok()?;
    let details = data.get("error")?.get("details")?.as_array()?;

    for detail in details {
        let type_str = detail.get("@type").and_then(Value::as_str).unwrap_or("");
        if type_str.contains("RetryInfo") {
            if let Some(delay) = detail.get("retryDelay").and_then(Value::as_str) {
                if let Some(ms) = parse_duration_ms(delay) {
                    return Some(ms);
                }
            }
        }
    }
    for detail in details {
        if let Some(quota_delay) = detail
            .get("metadata")
            .and_then(|m| m.get("quotaResetDelay"))
            .and_then(Value::as_str)
        {
            if let Some(ms) = parse_duration_ms(quota_delay) {
                return Some(ms);
            }
        }
    }
    None
}
