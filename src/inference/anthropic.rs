//! Anthropic messages engine: `POST /v1/messages`.
//!
//! Authenticates with the `x-api-key` header and pins
//! `anthropic-version: 2023-06-01`. This engine is non-streaming; the lane
//! router wraps its reply into a single-chunk stream.

use serde_json::{json, Value};

use super::router::EngineTarget;
use super::{
    assemble_system, check_http_response, ChatRole, InferenceError, LaneEngine, ThinkRequest,
    ThinkResponse,
};

/// API version header value required by the messages endpoint.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Token ceiling when the request does not set one (the field is mandatory
/// on this endpoint).
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Build the messages-endpoint request body.
fn request_body(target: &EngineTarget, request: &ThinkRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .filter(|turn| turn.role != ChatRole::System)
        .map(|turn| {
            let role = match turn.role {
                ChatRole::Assistant => "assistant",
                _ => "user",
            };
            json!({"role": role, "content": turn.content})
        })
        .collect();

    let mut body = json!({
        "model": target.model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if let Some(system) = assemble_system(request) {
        body["system"] = json!(system);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    body
}

/// Single-shot completion.
///
/// # Errors
///
/// Returns [`InferenceError`] on transport, HTTP, or parse failure.
pub async fn think(
    client: &reqwest::Client,
    target: &EngineTarget,
    request: &ThinkRequest,
) -> Result<ThinkResponse, InferenceError> {
    let url = format!("{}/v1/messages", target.base_url);
    let response = client
        .post(&url)
        .header("x-api-key", &target.api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&request_body(target, request))
        .send()
        .await
        .map_err(|source| InferenceError::Transport {
            engine: LaneEngine::Anthropic,
            source,
        })?;

    let payload = check_http_response(LaneEngine::Anthropic, response).await?;
    let parsed: Value = serde_json::from_str(&payload).map_err(|e| InferenceError::Parse {
        engine: LaneEngine::Anthropic,
        detail: e.to_string(),
    })?;

    let content = parsed
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .filter(|text| !text.is_empty())
        .ok_or_else(|| InferenceError::Parse {
            engine: LaneEngine::Anthropic,
            detail: "missing content[].text".to_owned(),
        })?;

    Ok(ThinkResponse {
        content,
        done: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::ChatTurn;

    fn target() -> EngineTarget {
        EngineTarget {
            engine: LaneEngine::Anthropic,
            model: "claude-sonnet-4-20250514".to_owned(),
            base_url: "https://api.anthropic.com".to_owned(),
            api_key: "sk-ant-test".to_owned(),
        }
    }

    #[test]
    fn body_sets_mandatory_max_tokens() {
        let request = ThinkRequest {
            messages: vec![ChatTurn::user("hello")],
            ..Default::default()
        };
        let body = request_body(&target(), &request);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn body_moves_persona_into_system_field() {
        let request = ThinkRequest {
            messages: vec![ChatTurn::user("hello")],
            persona: Some("You are Pinky.".to_owned()),
            max_tokens: Some(256),
            ..Default::default()
        };
        let body = request_body(&target(), &request);
        assert_eq!(body["system"], "You are Pinky.");
        assert_eq!(body["max_tokens"], 256);
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }
}
