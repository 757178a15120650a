//! Server-Side Output Processing scanner: watches the concatenated
//! text/thinking buffer for embedded JSON tool-call signatures so they can
//! be "pre-announced" before the real `functionCall` part arrives (spec
//! §4.7 "SSOP"), grounded line-for-line on `original_source/src/ssop.py`.
//!
//! **[REDESIGN APPLIED]** candidate boundaries are still found by brace
//! depth (pinned by the tests below), but each candidate is parsed with
//! `serde_json::Deserializer::from_str(..).into_iter::<Value>()` instead of
//! a hand-rolled decoder, so a malformed trailing fragment can't wedge the
//! scanner the way a naive `json.loads` retry loop would.

use std::collections::HashSet;

use serde_json::Value;

use crate::protocol::tool_id::generate_tool_call_id;

#[derive(Debug, Clone)]
pub struct DetectedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

pub struct SsopScanner {
    buffer: String,
    emitted_ids: HashSet<String>,
}

impl Default for SsopScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl SsopScanner {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            emitted_ids: HashSet::new(),
        }
    }

    pub fn emitted_ids(&self) -> &HashSet<String> {
        &self.emitted_ids
    }

    /// Appends `new_text` to the buffer and returns the first not-yet-seen
    /// synthetic tool call found in a complete top-level JSON object,
    /// matching the Python scanner's "return on first new match" behavior.
    pub fn scan(&mut self, new_text: &str) -> Option<DetectedToolCall> {
        self.buffer.push_str(new_text);

        for candidate in complete_json_objects(&self.buffer) {
            let Ok(mut stream) = serde_json::Deserializer::from_str(&candidate)
                .into_iter::<Value>()
                .collect::<Result<Vec<_>, _>>()
            else {
                continue;
            };
            let Some(Value::Object(_)) = stream.first().cloned() else {
                continue;
            };
            let data = stream.remove(0);

            if let Some(detected) = detect_shell_command(&data)
                .or_else(|| detect_generic_tool_call(&data))
                .or_else(|| detect_implicit_write_file(&data))
            {
                let id = generate_tool_call_id(&detected.name, &detected.arguments);
                if self.emitted_ids.contains(&id) {
                    continue;
                }
                self.emitted_ids.insert(id.clone());
                return Some(DetectedToolCall {
                    id,
                    name: detected.name,
                    arguments: detected.arguments,
                });
            }
        }
        None
    }
}

struct RawDetection {
    name: String,
    arguments: Value,
}

/// Finds every substring between a `{` that opens a top-level object and
/// the `}` that closes it, by brace depth.
fn complete_json_objects(buffer: &str) -> Vec<String> {
    let chars: Vec<char> = buffer.chars().collect();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut out = Vec::new();

    for (i, &c) in chars.iter().enumerate() {
        match c {
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        out.push(chars[start..=i].iter().collect());
                    }
                }
            }
            _ => {}
        }
    }
    out
}

const SHELL_COMMANDS: &[&str] = &["shell", "powershell", "cmd", "ls", "git", "echo"];

fn detect_shell_command(data: &Value) -> Option<RawDetection> {
    let obj = data.as_object()?;
    let cmd_val = obj.get("command")?;

    if let Value::Array(items) = cmd_val {
        let first = items.first()?.as_str()?;
        if SHELL_COMMANDS.contains(&first) {
            let command = items.get(1).and_then(Value::as_str).unwrap_or("").to_string();
            return Some(RawDetection {
                name: "shell".to_string(),
                arguments: serde_json::json!({"command": command}),
            });
        }
        return None;
    }

    if let Value::String(s) = cmd_val {
        if s == "shell" || s == "local_shell" {
            let wrapper = obj
                .get("args")
                .or_else(|| obj.get("arguments"))
                .or_else(|| obj.get("params"));
            let command = match wrapper {
                Some(Value::Object(w)) => w
                    .get("command")
                    .or_else(|| w.get("code"))
                    .or_else(|| w.get("argument"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                Some(Value::Array(w)) => w.first().and_then(Value::as_str).unwrap_or("").to_string(),
                _ => String::new(),
            };
            return Some(RawDetection {
                name: "shell".to_string(),
                arguments: serde_json::json!({"command": command}),
            });
        }
    }
    None
}

fn detect_generic_tool_call(data: &Value) -> Option<RawDetection> {
    let obj = data.as_object()?;
    let name = obj
        .get("name")
        .or_else(|| obj.get("tool"))
        .or_else(|| obj.get("function"))
        .and_then(Value::as_str)?;
    let args = obj
        .get("arguments")
        .or_else(|| obj.get("args"))
        .or_else(|| obj.get("parameters"))
        .or_else(|| obj.get("input"))?;
    if !args.is_object() {
        return None;
    }
    Some(RawDetection {
        name: name.to_string(),
        arguments: args.clone(),
    })
}

fn detect_implicit_write_file(data: &Value) -> Option<RawDetection> {
    let obj = data.as_object()?;
    if obj.contains_key("path") && obj.contains_key("content") {
        return Some(RawDetection {
            name: "write_file".to_string(),
            arguments: serde_json::json!({"path": obj["path"], "content": obj["content"]}),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_generic_tool_call_shape() {
        let mut scanner = SsopScanner::new();
        let found = scanner
            .scan(r#"{"name": "get_weather", "arguments": {"city": "nyc"}}"#)
            .unwrap();
        assert_eq!(found.name, "get_weather");
        assert_eq!(found.arguments, json!({"city": "nyc"}));
    }

    #[test]
    fn detects_implicit_write_file_shape() {
        let mut scanner = SsopScanner::new();
        let found = scanner
            .scan(r#"{"path": "a.txt", "content": "hi"}"#)
            .unwrap();
        assert_eq!(found.name, "write_file");
    }

    #[test]
    fn detects_shell_command_array_shape() {
        let mut scanner = SsopScanner::new();
        let found = scanner.scan(r#"{"command": ["shell", "ls -la"]}"#).unwrap();
        assert_eq!(found.name, "shell");
        assert_eq!(found.arguments, json!({"command": "ls -la"}));
    }

    #[test]
    fn does_not_re_emit_same_call() {
        let mut scanner = SsopScanner::new();
        scanner.scan(r#"{"name": "f", "arguments": {}}"#);
        let second = scanner.scan(r#"{"name": "f", "arguments": {}}"#);
        assert!(second.is_none());
    }

    #[test]
    fn accumulates_text_across_calls_split_mid_object() {
        let mut scanner = SsopScanner::new();
        assert!(scanner.scan(r#"{"name": "f", "argum"#).is_none());
        let found = scanner.scan(r#"ents": {}}"#).unwrap();
        assert_eq!(found.name, "f");
    }

    #[test]
    fn ignores_malformed_json_fragment() {
        let mut scanner = SsopScanner::new();
        assert!(scanner.scan(r#"{not valid json}"#).is_none());
    }
}
