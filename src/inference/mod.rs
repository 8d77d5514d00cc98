//! LLM inference lanes.
//!
//! A *lane* is a named back-end configuration (engine + model + URL +
//! credentials). The [`router::LaneRouter`] picks a lane per request —
//! explicitly or via a complexity heuristic — and drives the
//! engine-specific wire protocol:
//!
//! - [`ollama`] — `POST /api/generate`, NDJSON stream
//! - [`openai`] — `POST /v1/chat/completions`, SSE with `[DONE]` sentinel
//!   (also serves Groq via its OpenAI-compatible endpoint)
//! - [`anthropic`] — `POST /v1/messages`, single-shot

use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod router;

// ---------------------------------------------------------------------------
// Lanes
// ---------------------------------------------------------------------------

/// Wire protocol family of a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneEngine {
    Ollama,
    OpenAi,
    Anthropic,
    Groq,
}

impl std::fmt::Display for LaneEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ollama => f.write_str("ollama"),
            Self::OpenAi => f.write_str("openai"),
            Self::Anthropic => f.write_str("anthropic"),
            Self::Groq => f.write_str("groq"),
        }
    }
}

/// One configured LLM back-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lane {
    /// Lane name; populated from the config map key.
    #[serde(skip)]
    pub name: String,
    pub engine: LaneEngine,
    pub model: String,
    /// Engine base URL; engine-specific default when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// API key; a literal `"${NAME}"` resolves from the environment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Read-only lane view handed to UIs; never carries credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneInfo {
    pub name: String,
    pub engine: LaneEngine,
    pub model: String,
    /// Whether this is the currently selected lane.
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// Conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => f.write_str("System"),
            Self::User => f.write_str("User"),
            Self::Assistant => f.write_str("Assistant"),
        }
    }
}

/// One turn of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A single request for the assistant to think.
#[derive(Debug, Clone, Default)]
pub struct ThinkRequest {
    /// Conversation history, oldest first, ending with the user's message.
    pub messages: Vec<ChatTurn>,
    /// Persona system prompt.
    pub persona: Option<String>,
    /// Recalled memory lines, injected as `[Memory] …`.
    pub memories: Vec<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Hint that the caller will consume a chunk stream.
    pub stream: bool,
}

impl ThinkRequest {
    /// Content of the last user turn, used by the routing heuristic.
    pub fn last_user_text(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|turn| turn.role == ChatRole::User)
            .map(|turn| turn.content.as_str())
            .unwrap_or_default()
    }
}

/// A complete (non-streaming) reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkResponse {
    pub content: String,
    pub done: bool,
}

/// One element of a streamed reply.
///
/// Producers emit exactly one terminal chunk: either `done == true` or
/// `error != None`, never both streams of text after it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThinkChunk {
    pub content: String,
    pub done: bool,
    pub error: Option<String>,
}

impl ThinkChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Inference errors, engine-prefixed so the agent loop can report which
/// lane failed (and optionally retry elsewhere).
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    /// Neither an explicit lane nor a default is configured.
    #[error("no lane configured")]
    NoLane,
    /// A named lane does not exist.
    #[error("unknown lane: {0}")]
    UnknownLane(String),
    /// Network-level failure talking to the engine.
    #[error("{engine}: request failed: {source}")]
    Transport {
        engine: LaneEngine,
        #[source]
        source: reqwest::Error,
    },
    /// Engine answered with a non-success status.
    #[error("{engine}: status {status}: {body}")]
    Http {
        engine: LaneEngine,
        status: u16,
        body: String,
    },
    /// Engine response did not match the expected schema.
    #[error("{engine}: parse error: {detail}")]
    Parse {
        engine: LaneEngine,
        detail: String,
    },
}

/// Check an HTTP response and return its body text, or a structured error.
///
/// Error bodies are sanitized (secrets redacted, whitespace collapsed,
/// truncated) before they can reach logs or the user.
///
/// # Errors
///
/// [`InferenceError::Transport`] on read failure, [`InferenceError::Http`]
/// on non-2xx status.
pub(crate) async fn check_http_response(
    engine: LaneEngine,
    response: reqwest::Response,
) -> Result<String, InferenceError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|source| InferenceError::Transport { engine, source })?;
    if !status.is_success() {
        return Err(InferenceError::Http {
            engine,
            status: status.as_u16(),
            body: sanitize_error_body(&body),
        });
    }
    Ok(body)
}

/// Collapse whitespace, redact credential-shaped substrings, and truncate.
fn sanitize_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"gsk_[A-Za-z0-9]{20,}",
        r"Bearer [A-Za-z0-9._\-]{10,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

// ---------------------------------------------------------------------------
// Prompt assembly
// ---------------------------------------------------------------------------

/// Flatten a request into a single prompt string.
///
/// Persona system prompt first, then each memory as a `[Memory] …` line,
/// then the chat turns as `Role: content`, all joined by blank lines.
/// Used verbatim by the Ollama generate endpoint; the chat-shaped engines
/// use [`assemble_system`] plus the raw turns.
pub fn assemble_prompt(request: &ThinkRequest) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(persona) = &request.persona {
        if !persona.is_empty() {
            sections.push(persona.clone());
        }
    }
    for memory in &request.memories {
        sections.push(format!("[Memory] {memory}"));
    }
    for turn in &request.messages {
        sections.push(format!("{}: {}", turn.role, turn.content));
    }

    sections.join("\n\n")
}

/// System prompt for chat-shaped engines: persona plus memory lines.
pub fn assemble_system(request: &ThinkRequest) -> Option<String> {
    let mut sections: Vec<String> = Vec::new();
    if let Some(persona) = &request.persona {
        if !persona.is_empty() {
            sections.push(persona.clone());
        }
    }
    for memory in &request.memories {
        sections.push(format!("[Memory] {memory}"));
    }
    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_assembly_order() {
        let request = ThinkRequest {
            messages: vec![ChatTurn::user("hello"), ChatTurn::assistant("hi there")],
            persona: Some("You are Pinky.".to_owned()),
            memories: vec!["user prefers short answers".to_owned()],
            ..Default::default()
        };

        let prompt = assemble_prompt(&request);
        assert_eq!(
            prompt,
            "You are Pinky.\n\n[Memory] user prefers short answers\n\nUser: hello\n\nAssistant: hi there"
        );
    }

    #[test]
    fn prompt_without_persona_or_memories() {
        let request = ThinkRequest {
            messages: vec![ChatTurn::user("ping")],
            ..Default::default()
        };
        assert_eq!(assemble_prompt(&request), "User: ping");
        assert_eq!(assemble_system(&request), None);
    }

    #[test]
    fn last_user_text_skips_assistant_turns() {
        let request = ThinkRequest {
            messages: vec![
                ChatTurn::user("first"),
                ChatTurn::assistant("reply"),
                ChatTurn::user("second"),
                ChatTurn::assistant("reply2"),
            ],
            ..Default::default()
        };
        assert_eq!(request.last_user_text(), "second");
    }

    #[test]
    fn sanitizer_redacts_and_truncates() {
        let body = format!(
            "error sk-ant-{} and then {}",
            "a".repeat(24),
            "x".repeat(400)
        );
        let sanitized = sanitize_error_body(&body);
        assert!(sanitized.contains("[REDACTED]"));
        assert!(!sanitized.contains("sk-ant-aaaa"));
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn lane_engine_serde_names() {
        assert_eq!(
            serde_json::to_string(&LaneEngine::OpenAi).expect("serialize"),
            "\"openai\""
        );
        let engine: LaneEngine = serde_json::from_str("\"groq\"").expect("parse");
        assert_eq!(engine, LaneEngine::Groq);
    }
}
