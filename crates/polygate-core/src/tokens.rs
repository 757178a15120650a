//! Crude token estimator backing `POST /v1/messages/count_tokens` (spec
//! §6): `max(1, total_chars / 4)`, with an image content block counted as
//! a flat 4000 characters regardless of its actual payload size. Good
//! enough for an IDE's context-usage indicator, not a real tokenizer
//! (DESIGN.md Open Question (c)).

use crate::model::{Content, ContentBlock, Message};

const IMAGE_CHAR_EQUIVALENT: usize = 4000;

pub fn count_tokens(messages: &[Message], system: Option<&str>) -> u64 {
    let mut chars = system.map(str::len).unwrap_or(0);

    for msg in messages {
        chars += match &msg.content {
            Content::Text(text) => text.len(),
            Content::Blocks(blocks) => blocks.iter().map(block_char_count).sum(),
        };
    }

    (chars / 4).max(1) as u64
}

fn block_char_count(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text } => text.len(),
        ContentBlock::Thinking { thinking, .. } => thinking.len(),
        ContentBlock::RedactedThinking { data } => data.len(),
        ContentBlock::ToolUse { input, .. } => input.to_string().len(),
        ContentBlock::ToolResult { content, .. } => content.to_string().len(),
        ContentBlock::Image { .. } => IMAGE_CHAR_EQUIVALENT,
        ContentBlock::Unknown(value) => value.to_string().len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use serde_json::json;

    #[test]
    fn never_returns_zero() {
        let messages = vec![Message::new(Role::User, Content::Text(String::new()))];
        assert_eq!(count_tokens(&messages, None), 1);
    }

    #[test]
    fn counts_chars_over_four() {
        let messages = vec![Message::new(Role::User, Content::Text("a".repeat(40)))];
        assert_eq!(count_tokens(&messages, None), 10);
    }

    #[test]
    fn image_block_counts_as_flat_4000_chars() {
        let messages = vec![Message::new(
            Role::User,
            Content::Blocks(vec![ContentBlock::Image { source: json!({"data": "x"}) }]),
        )];
        assert_eq!(count_tokens(&messages, None), 1000);
    }

    #[test]
    fn includes_system_prompt_length() {
        let messages = vec![Message::new(Role::User, Content::Text("hi".into()))];
        let without_system = count_tokens(&messages, None);
        let with_system = count_tokens(&messages, Some(&"s".repeat(400)));
        assert!(with_system > without_system);
    }
}
