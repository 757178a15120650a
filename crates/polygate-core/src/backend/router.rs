//! `Router` (C8): model -> backend-chain resolution and fallback
//! advancement, grounded on `original_source/src/gateway/routing.py`
//! (`get_backend_for_model`, `is_kiro_gateway_supported`,
//! `is_anyrouter_supported`). `is_antigravity_supported` has no surviving
//! Python counterpart in the retrieved source — it is synthesized from
//! spec.md §4.8's prose description and recorded as an Open Question
//! decision in DESIGN.md.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{GatewayConfig, ModelRoutingRule};

use super::registry::BackendRegistry;

static DATE_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"-\d{8}$").unwrap());
static CLAUDE_45: Lazy<Regex> = Lazy::new(|| Regex::new(r"4[.\-]5").unwrap());
static CLAUDE_SONNET_4: Lazy<Regex> = Lazy::new(|| Regex::new(r"sonnet[.\-]?4(?![.\-]5)|4[.\-]?sonnet(?![.\-]5)").unwrap());
static GEMINI_FAMILY: Lazy<Regex> = Lazy::new(|| Regex::new(r"gemini-?(2\.5|3)").unwrap());
static GPT_OSS: Lazy<Regex> = Lazy::new(|| Regex::new(r"gpt-oss").unwrap());

const KIRO_GATEWAY_SUPPORTED_MODELS: &[&str] =
    &["claude-sonnet-4.5", "claude-opus-4.5", "claude-haiku-4.5", "claude-sonnet-4"];

/// Strips `-thinking`, `-preview` and 8-digit date suffixes, then
/// lowercases — the canonical form every routing pattern matches against.
pub fn normalize_model_name(model: &str) -> String {
    let mut name = model.to_lowercase();
    for suffix in ["-thinking", "-preview", "-latest"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            name = stripped.to_string();
        }
    }
    name = DATE_SUFFIX.replace(&name, "").to_string();
    name
}

/// Claude-4.5-family or bare Claude-Sonnet-4 models.
pub fn is_kiro_gateway_supported(model: &str) -> bool {
    if model.is_empty() {
        return false;
    }
    let model_lower = model.to_lowercase();
    if !model_lower.contains("claude") {
        return false;
    }
    let normalized = normalize_model_name(model);
    if KIRO_GATEWAY_SUPPORTED_MODELS.contains(&normalized.as_str()) {
        return true;
    }

    let has_45 = CLAUDE_45.is_match(&normalized);
    let has_sonnet = normalized.contains("sonnet");
    let has_opus = normalized.contains("opus");
    let has_haiku = normalized.contains("haiku");
    if has_45 && (has_sonnet || has_opus || has_haiku) {
        return true;
    }
    CLAUDE_SONNET_4.is_match(&normalized) && has_sonnet
}

/// Gemini-2.5/3, Claude-4.5 or GPT-OSS provider families.
pub fn is_antigravity_supported(model: &str) -> bool {
    if model.is_empty() {
        return false;
    }
    let normalized = normalize_model_name(model);
    GEMINI_FAMILY.is_match(&normalized) || CLAUDE_45.is_match(&normalized) && normalized.contains("claude") || GPT_OSS.is_match(&normalized)
}

pub struct Router<'a> {
    registry: &'a BackendRegistry,
    model_routing: &'a [ModelRoutingRule],
}

impl<'a> Router<'a> {
    pub fn new(registry: &'a BackendRegistry, config: &'a GatewayConfig) -> Self {
        Self {
            registry,
            model_routing: &config.model_routing,
        }
    }

    fn matching_rule(&self, model: &str) -> Option<&'a ModelRoutingRule> {
        let normalized = normalize_model_name(model);
        self.model_routing.iter().find(|rule| matches_pattern(&rule.model_pattern, model, &normalized))
    }

    /// Returns the ordered, enabled backend chain for `model` (spec §4.8
    /// S1-S4). A `ModelRoutingRule` match wins outright; otherwise Kiro,
    /// then Antigravity, then Copilot as the final catch-all.
    pub fn backend_chain_for(&self, model: &str) -> Vec<String> {
        if let Some(rule) = self.matching_rule(model) {
            let enabled: Vec<String> = rule
                .backends
                .iter()
                .filter(|name| self.registry.is_enabled(name))
                .cloned()
                .collect();
            if !enabled.is_empty() {
                return enabled;
            }
        }

        if is_kiro_gateway_supported(model) {
            return vec!["kiro-gateway".to_string()];
        }
        if is_antigravity_supported(model) {
            return vec!["antigravity".to_string()];
        }
        vec!["copilot".to_string()]
    }

    /// Advances to the next untried, enabled backend in `model`'s full
    /// (unfiltered-by-enabled) routing chain, honoring the rule's
    /// `fallback_on` set and the `visited` loop guard.
    /// Models with no matching rule have a single-element chain and never
    /// fall back.
    pub fn get_fallback_backend(&self, model: &str, current: &str, trigger: Option<&str>, visited: &HashSet<String>) -> Option<String> {
        let rule = self.matching_rule(model)?;
        if let Some(trigger) = trigger {
            if !rule.fallback_on.is_empty() && !rule.fallback_on.contains(trigger) {
                return None;
            }
        }

        let position = rule.backends.iter().position(|b| b == current)?;
        rule.backends[position + 1..]
            .iter()
            .find(|name| self.registry.is_enabled(name) && !visited.contains(name.as_str()))
            .cloned()
    }
}

fn matches_pattern(pattern: &str, model: &str, normalized_model: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return model.starts_with(prefix) || normalized_model.starts_with(prefix);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return model.ends_with(suffix) || normalized_model.ends_with(suffix);
    }
    pattern == model || pattern == normalized_model
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiFormat, BackendConfig};

    fn backend(name: &str, priority: i32) -> BackendConfig {
        BackendConfig {
            name: name.into(),
            base_urls: vec![format!("https://{name}.example/v1")],
            priority,
            enabled: true,
            timeout_s: 30,
            stream_timeout_s: 120,
            max_retries: 3,
            supported_models: vec!["*".into()],
            api_format: ApiFormat::Anthropic,
        }
    }

    #[test]
    fn strips_thinking_and_date_suffixes() {
        assert_eq!(normalize_model_name("Claude-Sonnet-4.5-thinking"), "claude-sonnet-4.5");
        assert_eq!(normalize_model_name("claude-3-5-sonnet-20241022"), "claude-3-5-sonnet");
    }

    #[test]
    fn kiro_matches_claude_45_family() {
        assert!(is_kiro_gateway_supported("claude-opus-4.5-thinking"));
        assert!(is_kiro_gateway_supported("claude-sonnet-4"));
        assert!(!is_kiro_gateway_supported("claude-sonnet-3.5"));
        assert!(!is_kiro_gateway_supported("gpt-4o"));
    }

    #[test]
    fn antigravity_matches_gemini_and_claude_45() {
        assert!(is_antigravity_supported("gemini-2.5-pro"));
        assert!(is_antigravity_supported("claude-opus-4.5"));
        assert!(is_antigravity_supported("gpt-oss-120b"));
        assert!(!is_antigravity_supported("gpt-4o"));
    }

    #[test]
    fn chain_falls_back_to_copilot_catch_all() {
        let registry = BackendRegistry::new(vec![backend("copilot", 1)]);
        let config = GatewayConfig::default();
        let router = Router::new(&registry, &config);
        assert_eq!(router.backend_chain_for("gpt-4o"), vec!["copilot".to_string()]);
    }

    #[test]
    fn model_routing_rule_takes_precedence() {
        let registry = BackendRegistry::new(vec![backend("kiro-gateway", 1), backend("antigravity", 2)]);
        let mut config = GatewayConfig::default();
        config.model_routing.push(ModelRoutingRule {
            model_pattern: "claude-sonnet-4.5".into(),
            backends: vec!["kiro-gateway".into(), "antigravity".into()],
            fallback_on: ["quota_exhausted".to_string()].into_iter().collect(),
        });
        let router = Router::new(&registry, &config);
        assert_eq!(router.backend_chain_for("claude-sonnet-4.5"), vec!["kiro-gateway".to_string(), "antigravity".to_string()]);
    }

    #[test]
    fn fallback_respects_visited_and_trigger() {
        let registry = BackendRegistry::new(vec![backend("kiro-gateway", 1), backend("antigravity", 2)]);
        let mut config = GatewayConfig::default();
        config.model_routing.push(ModelRoutingRule {
            model_pattern: "claude-sonnet-4.5".into(),
            backends: vec!["kiro-gateway".into(), "antigravity".into()],
            fallback_on: ["quota_exhausted".to_string()].into_iter().collect(),
        });
        let router = Router::new(&registry, &config);
        let visited = HashSet::new();

        assert_eq!(
            router.get_fallback_backend("claude-sonnet-4.5", "kiro-gateway", Some("quota_exhausted"), &visited),
            Some("antigravity".to_string())
        );
        assert_eq!(router.get_fallback_backend("claude-sonnet-4.5", "kiro-gateway", Some("auth_error"), &visited), None);

        let mut visited_both = HashSet::new();
        visited_both.insert("antigravity".to_string());
        assert_eq!(router.get_fallback_backend("claude-sonnet-4.5", "kiro-gateway", Some("quota_exhausted"), &visited_both), None);
    }

    #[test]
    fn unrouted_model_never_falls_back() {
        let registry = BackendRegistry::new(vec![backend("copilot", 1)]);
        let config = GatewayConfig::default();
        let router = Router::new(&registry, &config);
        assert_eq!(router.get_fallback_backend("gpt-4o", "copilot", None, &HashSet::new()), None);
    }
}
