//! Extraction of tool invocations from LLM reply text.
//!
//! The wire protocol is pluggable behind [`ToolCallParser`]. The default
//! [`TaggedJsonParser`] scans for inline `<tool_call>` tags — a format
//! every engine can produce regardless of native function-calling:
//!
//! ```text
//! I'll check the repository status.
//! <tool_call>{"name": "git", "arguments": {"command": "status"}}</tool_call>
//! ```
//!
//! `arguments` may be a JSON object or an object encoded as a string
//! (some models stringify it); both are accepted.

use serde_json::Value;

const OPEN_TAG: &str = "<tool_call>";
const CLOSE_TAG: &str = "</tool_call>";

/// A tool invocation extracted from reply text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    /// Tool name as registered in the registry.
    pub name: String,
    /// Arguments object.
    pub arguments: Value,
}

/// Strategy for finding tool calls in reply text.
pub trait ToolCallParser: Send + Sync {
    /// Extract all tool calls, in order of appearance.
    fn parse(&self, content: &str) -> Vec<ParsedToolCall>;

    /// The reply text with tool-call markup removed (what the user sees).
    fn strip(&self, content: &str) -> String;
}

/// Default parser: inline `<tool_call>{json}</tool_call>` tags.
#[derive(Debug, Default)]
pub struct TaggedJsonParser;

impl TaggedJsonParser {
    pub fn new() -> Self {
        Self
    }
}

impl ToolCallParser for TaggedJsonParser {
    fn parse(&self, content: &str) -> Vec<ParsedToolCall> {
        let mut calls = Vec::new();
        let mut remaining = content;

        while let Some(start) = remaining.find(OPEN_TAG) {
            remaining = &remaining[start.saturating_add(OPEN_TAG.len())..];
            let Some(end) = remaining.find(CLOSE_TAG) else {
                break;
            };
            let body = remaining[..end].trim();
            remaining = &remaining[end.saturating_add(CLOSE_TAG.len())..];

            if let Some(call) = parse_body(body) {
                calls.push(call);
            }
        }
        calls
    }

    fn strip(&self, content: &str) -> String {
        let mut visible = String::with_capacity(content.len());
        let mut remaining = content;

        while let Some(start) = remaining.find(OPEN_TAG) {
            visible.push_str(&remaining[..start]);
            let after_open = &remaining[start.saturating_add(OPEN_TAG.len())..];
            match after_open.find(CLOSE_TAG) {
                Some(end) => {
                    remaining = &after_open[end.saturating_add(CLOSE_TAG.len())..];
                }
                None => {
                    // Unterminated tag: drop the rest.
                    remaining = "";
                }
            }
        }
        visible.push_str(remaining);
        visible.trim().to_owned()
    }
}

/// Parse one tag body: `{"name": …, "arguments": …}`.
fn parse_body(body: &str) -> Option<ParsedToolCall> {
    let value: Value = serde_json::from_str(body).ok()?;
    let name = value.get("name")?.as_str()?.to_owned();

    let arguments = match value.get("arguments") {
        // Some models stringify the arguments object.
        Some(Value::String(s)) => {
            serde_json::from_str(s).unwrap_or(Value::Object(Default::default()))
        }
        Some(v) => v.clone(),
        None => Value::Object(Default::default()),
    };

    Some(ParsedToolCall { name, arguments })
}
