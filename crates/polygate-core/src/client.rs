//! `ClientDetector` (C4): deterministic IDE/SDK fingerprinting from request
//! headers, grounded on
//! `original_source/src/ide_compat/client_detector.py`. Decides whether a
//! request needs the sanitizer (C5) and whether cross-pool fallback is
//! allowed, and extracts the server conversation id (SCID).

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientType {
    ClaudeCode,
    Cursor,
    Augment,
    Windsurf,
    Cline,
    ContinueDev,
    Aider,
    Zed,
    Copilot,
    OpenaiApi,
    Unknown,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::ClaudeCode => "claude_code",
            ClientType::Cursor => "cursor",
            ClientType::Augment => "augment",
            ClientType::Windsurf => "windsurf",
            ClientType::Cline => "cline",
            ClientType::ContinueDev => "continue_dev",
            ClientType::Aider => "aider",
            ClientType::Zed => "zed",
            ClientType::Copilot => "copilot",
            ClientType::OpenaiApi => "openai_api",
            ClientType::Unknown => "unknown",
        }
    }

    /// IDE clients reshape `thinking` text en route; Claude Code and raw
    /// OpenAI SDK clients don't, and Unknown is sanitized conservatively.
    fn needs_sanitization(self) -> bool {
        !matches!(self, ClientType::ClaudeCode | ClientType::OpenaiApi)
    }

    fn enable_cross_pool_fallback(self) -> bool {
        matches!(
            self,
            ClientType::ClaudeCode
                | ClientType::Cline
                | ClientType::ContinueDev
                | ClientType::Aider
                | ClientType::OpenaiApi
        )
    }
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_type: ClientType,
    pub user_agent: String,
    pub needs_sanitization: bool,
    pub enable_cross_pool_fallback: bool,
    pub scid: Option<String>,
    pub version: String,
    pub display_name: String,
}

struct UaPattern {
    client_type: ClientType,
    patterns: &'static [&'static str],
    version_regex: Option<&'static str>,
    display_name: &'static str,
}

/// Ordered by specificity: exact tool-name patterns first, then generic
/// keyword matches that could misfire on a substring, then SDK/HTTP-client
/// signatures last.
static UA_PATTERNS: &[UaPattern] = &[
    UaPattern { client_type: ClientType::Cursor, patterns: &["cursor/", "cursor-"], version_regex: Some(r"cursor[/-]?(\d+(?:\.\d+)*)"), display_name: "Cursor IDE" },
    UaPattern { client_type: ClientType::Cline, patterns: &["cline/", "cline-", "claude-dev", "claudedev"], version_regex: Some(r"cline[/-]?(\d+(?:\.\d+)*)"), display_name: "Cline" },
    UaPattern { client_type: ClientType::ClaudeCode, patterns: &["claude-code/", "claude-code-", "anthropic-claude"], version_regex: Some(r"claude-code[/-]?(\d+(?:\.\d+)*)"), display_name: "Claude Code" },
    UaPattern { client_type: ClientType::Windsurf, patterns: &["windsurf/", "windsurf-"], version_regex: Some(r"windsurf[/-]?(\d+(?:\.\d+)*)"), display_name: "Windsurf IDE" },
    UaPattern { client_type: ClientType::Aider, patterns: &["aider/", "aider-"], version_regex: Some(r"aider[/-]?(\d+(?:\.\d+)*)"), display_name: "Aider" },
    UaPattern { client_type: ClientType::ContinueDev, patterns: &["continue/", "continue-dev"], version_regex: Some(r"continue[/-]?(\d+(?:\.\d+)*)"), display_name: "Continue.dev" },
    UaPattern { client_type: ClientType::Zed, patterns: &["zed/", "zed-editor"], version_regex: Some(r"zed[/-]?(\d+(?:\.\d+)*)"), display_name: "Zed Editor" },
    UaPattern { client_type: ClientType::Copilot, patterns: &["github-copilot", "copilot/"], version_regex: Some(r"copilot[/-]?(\d+(?:\.\d+)*)"), display_name: "GitHub Copilot" },
    UaPattern { client_type: ClientType::Cursor, patterns: &["cursor"], version_regex: None, display_name: "Cursor IDE" },
    UaPattern { client_type: ClientType::ClaudeCode, patterns: &["claude", "anthropic"], version_regex: None, display_name: "Claude Code" },
    UaPattern { client_type: ClientType::Augment, patterns: &["augment", "bugment", "vscode"], version_regex: None, display_name: "Augment" },
    UaPattern { client_type: ClientType::OpenaiApi, patterns: &["openai-python/", "openai-node/", "openai/"], version_regex: Some(r"(?:openai-python|openai-node|openai)[/-](\d+(?:\.\d+)*)"), display_name: "OpenAI SDK" },
    UaPattern { client_type: ClientType::OpenaiApi, patterns: &["python-requests/", "httpx/", "aiohttp/"], version_regex: Some(r"(?:python-requests|httpx|aiohttp)[/-](\d+(?:\.\d+)*)"), display_name: "HTTP Client" },
    UaPattern { client_type: ClientType::OpenaiApi, patterns: &["node-fetch/", "axios/", "got/"], version_regex: Some(r"(?:node-fetch|axios|got)[/-](\d+(?:\.\d+)*)"), display_name: "Node.js Client" },
];

static COMPILED_PATTERNS: Lazy<Vec<(ClientType, Vec<Regex>, Option<Regex>, &'static str)>> =
    Lazy::new(|| {
        UA_PATTERNS
            .iter()
            .map(|p| {
                let patterns = p
                    .patterns
                    .iter()
                    .map(|pat| Regex::new(&format!("(?i){pat}")).expect("static UA pattern"))
                    .collect();
                let version_regex = p
                    .version_regex
                    .map(|r| Regex::new(&format!("(?i){r}")).expect("static version pattern"));
                (p.client_type, patterns, version_regex, p.display_name)
            })
            .collect()
    });

fn lower_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect()
}

fn extract_user_agent(headers_lower: &HashMap<String, String>) -> String {
    if let Some(forwarded) = headers_lower.get("x-forwarded-user-agent") {
        if !forwarded.is_empty() {
            return forwarded.clone();
        }
    }
    headers_lower.get("user-agent").cloned().unwrap_or_default()
}

fn match_user_agent(user_agent: &str) -> (ClientType, String, &'static str) {
    if user_agent.is_empty() {
        return (ClientType::Unknown, String::new(), "Unknown Client");
    }
    for (client_type, patterns, version_regex, display_name) in COMPILED_PATTERNS.iter() {
        if patterns.iter().any(|re| re.is_match(user_agent)) {
            let version = version_regex
                .as_ref()
                .and_then(|re| re.captures(user_agent))
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            return (*client_type, version, display_name);
        }
    }
    (ClientType::Unknown, String::new(), "Unknown Client")
}

fn extract_scid_from_headers(headers_lower: &HashMap<String, String>) -> Option<String> {
    for key in ["x-ag-conversation-id", "x-conversation-id"] {
        if let Some(v) = headers_lower.get(key) {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Detects a client from its headers. SCID extracted from body fields
/// (`conversation_id`/`session_id`) is applied by the caller as a fallback
/// when no header carried one — the body isn't available at this layer.
pub fn detect(headers: &HashMap<String, String>) -> ClientInfo {
    let headers_lower = lower_headers(headers);
    let user_agent = extract_user_agent(&headers_lower);
    let (client_type, version, display_name) = match_user_agent(&user_agent);
    let scid = extract_scid_from_headers(&headers_lower);

    ClientInfo {
        client_type,
        user_agent,
        needs_sanitization: client_type.needs_sanitization(),
        enable_cross_pool_fallback: client_type.enable_cross_pool_fallback(),
        scid,
        version,
        display_name: display_name.to_string(),
    }
}

/// Folds in a body-derived SCID (`conversation_id`/`session_id`) when no
/// header supplied one, per spec §4.4's extraction order.
pub fn with_body_scid(mut info: ClientInfo, body_scid: Option<&str>) -> ClientInfo {
    if info.scid.is_none() {
        info.scid = body_scid
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn detects_cursor_from_user_agent() {
        let info = detect(&headers(&[("User-Agent", "cursor/1.2.3")]));
        assert_eq!(info.client_type.as_str(), "cursor");
        assert_eq!(info.version, "1.2.3");
        assert!(info.needs_sanitization);
    }

    #[test]
    fn claude_code_does_not_need_sanitization() {
        let info = detect(&headers(&[("User-Agent", "claude-code/1.0")]));
        assert_eq!(info.client_type.as_str(), "claude_code");
        assert!(!info.needs_sanitization);
        assert!(info.enable_cross_pool_fallback);
    }

    #[test]
    fn unknown_client_defaults_to_conservative_sanitization() {
        let info = detect(&headers(&[]));
        assert_eq!(info.client_type.as_str(), "unknown");
        assert!(info.needs_sanitization);
        assert!(!info.enable_cross_pool_fallback);
    }

    #[test]
    fn forwarded_user_agent_takes_precedence() {
        let info = detect(&headers(&[
            ("User-Agent", "python-requests/2.31"),
            ("X-Forwarded-User-Agent", "cursor/1.0"),
        ]));
        assert_eq!(info.client_type.as_str(), "cursor");
    }

    #[test]
    fn scid_prefers_ag_conversation_id_header() {
        let info = detect(&headers(&[
            ("X-AG-Conversation-Id", "scid-1"),
            ("X-Conversation-Id", "scid-2"),
        ]));
        assert_eq!(info.scid.unwrap(), "scid-1");
    }

    #[test]
    fn body_scid_only_applied_when_headers_missing() {
        let info = detect(&headers(&[]));
        let info = with_body_scid(info, Some("body-scid"));
        assert_eq!(info.scid.unwrap(), "body-scid");
    }
}
