//! Fallback parser for tool calls written inline in assistant text.
//!
//! Models that do not emit native tool calls write them as markup, where
//! the tool name is the outer tag and each parameter is a child tag:
//!
//! ```text
//! <attempt_completion>
//! <result>Done.</result>
//! </attempt_completion>
//! ```

use std::sync::LazyLock;

use regex::Regex;

use crate::llm::ToolCall;

static OPEN_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([a-z_][a-z0-9_]*)>").expect("open tag regex is valid"));

/// Assistant text split into prose and inline tool calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedAssistantText {
    /// Text outside any tool block, trimmed.
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Extract inline tool calls for any of `known_tools`.
///
/// Unknown tags are left in the text. A block with no closing tag is
/// treated as text.
pub fn parse_inline_tool_calls(text: &str, known_tools: &[String]) -> ParsedAssistantText {
    let mut prose = String::new();
    let mut tool_calls = Vec::new();
    let mut cursor = 0;

    while let Some(caps) = OPEN_TAG.captures_at(text, cursor) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let name = name.as_str();
        if !known_tools.iter().any(|t| t == name) {
            prose.push_str(&text[cursor..whole.end()]);
            cursor = whole.end();
            continue;
        }

        let closing = format!("</{name}>");
        let Some(rel_end) = text[whole.end()..].find(&closing) else {
            prose.push_str(&text[cursor..whole.end()]);
            cursor = whole.end();
            continue;
        };

        prose.push_str(&text[cursor..whole.start()]);
        let body = &text[whole.end()..whole.end() + rel_end];
        tool_calls.push(ToolCall {
            id: format!("inline_{}", uuid::Uuid::new_v4()),
            name: name.to_string(),
            arguments: parse_parameters(body),
        });
        cursor = whole.end() + rel_end + closing.len();
    }
    prose.push_str(&text[cursor..]);

    ParsedAssistantText {
        text: prose.trim().to_string(),
        tool_calls,
    }
}

/// Child tags of a tool block as a JSON object of strings. Nested markup
/// inside a parameter (such as `<suggest>` entries) is kept verbatim.
fn parse_parameters(body: &str) -> serde_json::Value {
    let mut params = serde_json::Map::new();
    let mut cursor = 0;

    while let Some(caps) = OPEN_TAG.captures_at(body, cursor) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let closing = format!("</{}>", name.as_str());
        let Some(rel_end) = body[whole.end()..].find(&closing) else {
            cursor = whole.end();
            continue;
        };
        let value = body[whole.end()..whole.end() + rel_end].trim();
        params.insert(
            name.as_str().to_string(),
            serde_json::Value::String(value.to_string()),
        );
        cursor = whole.end() + rel_end + closing.len();
    }

    serde_json::Value::Object(params)
}
