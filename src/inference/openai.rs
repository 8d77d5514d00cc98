//! OpenAI-compatible chat-completions engine.
//!
//! `POST {base}/v1/chat/completions` with bearer auth. Streaming uses
//! server-sent events: `data: …` lines, terminated by the literal
//! `data: [DONE]`; each event's delta text lives at
//! `choices[0].delta.content` and generation finishes when
//! `finish_reason == "stop"`.
//!
//! Groq shares this code path — its endpoint at
//! `https://api.groq.com/openai/v1/chat/completions` is wire-compatible.

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use super::router::EngineTarget;
use super::{
    assemble_system, check_http_response, ChatRole, InferenceError, ThinkChunk, ThinkRequest,
    ThinkResponse,
};

fn role_name(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

/// Build the chat-completions request body.
fn request_body(target: &EngineTarget, request: &ThinkRequest, stream: bool) -> Value {
    let mut messages: Vec<Value> = Vec::new();
    if let Some(system) = assemble_system(request) {
        messages.push(json!({"role": "system", "content": system}));
    }
    for turn in &request.messages {
        messages.push(json!({"role": role_name(turn.role), "content": turn.content}));
    }

    let mut body = json!({
        "model": target.model,
        "messages": messages,
        "stream": stream,
    });
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    body
}

fn endpoint(target: &EngineTarget) -> String {
    format!("{}/v1/chat/completions", target.base_url)
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
    let response = client
        .post(endpoint(target))
        .bearer_auth(&target.api_key)
        .json(&request_body(target, request, false))
        .send()
        .await
        .map_err(|source| InferenceError::Transport {
            engine: target.engine,
            source,
        })?;

    let payload = check_http_response(target.engine, response).await?;
    let parsed: Value = serde_json::from_str(&payload).map_err(|e| InferenceError::Parse {
        engine: target.engine,
        detail: e.to_string(),
    })?;

    let content = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| InferenceError::Parse {
            engine: target.engine,
            detail: "missing choices[0].message.content".to_owned(),
        })?
        .to_owned();

    Ok(ThinkResponse {
        content,
        done: true,
    })
}

/// Streaming completion over SSE.
///
/// Emits exactly one terminal chunk. Returns early when the receiver is
/// dropped, which drops the HTTP response stream and cancels the request.
pub async fn stream(
    client: &reqwest::Client,
    target: &EngineTarget,
    request: &ThinkRequest,
    tx: mpsc::Sender<ThinkChunk>,
) {
    let engine = target.engine;
    let response = match client
        .post(endpoint(target))
        .bearer_auth(&target.api_key)
        .json(&request_body(target, request, true))
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            let _ = tx.send(ThinkChunk::error(format!("{engine}: {e}"))).await;
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let _ = tx
            .send(ThinkChunk::error(format!("{engine}: status {status}")))
            .await;
        return;
    }

    let mut body = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(piece) = body.next().await {
        let bytes = match piece {
            Ok(b) => b,
            Err(e) => {
                let _ = tx.send(ThinkChunk::error(format!("{engine}: {e}"))).await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(newline) = buffer.find('\n') {
            let line: String = buffer.drain(..=newline).collect();
            let line = line.trim();

            let Some(data) = line.strip_prefix("data:") else {
                continue; // comments, event names, keep-alives
            };
            let data = data.trim();

            if data == "[DONE]" {
                let _ = tx.send(ThinkChunk::done()).await;
                return;
            }

            let parsed: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    let _ = tx
                        .send(ThinkChunk::error(format!("{engine}: bad SSE data: {e}")))
                        .await;
                    return;
                }
            };

            let choice = parsed.get("choices").and_then(|c| c.get(0));
            let delta = choice
                .and_then(|c| c.get("delta"))
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let finished = choice
                .and_then(|c| c.get("finish_reason"))
                .and_then(Value::as_str)
                == Some("stop");

            if !delta.is_empty() && tx.send(ThinkChunk::text(delta)).await.is_err() {
                return; // receiver closed the stream
            }
            if finished {
                let _ = tx.send(ThinkChunk::done()).await;
                return;
            }
        }
    }

    let _ = tx.send(ThinkChunk::done()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{ChatTurn, LaneEngine};

    fn target() -> EngineTarget {
        EngineTarget {
            engine: LaneEngine::Groq,
            model: "llama-3.1-70b".to_owned(),
            base_url: "https://api.groq.com/openai".to_owned(),
            api_key: "gsk_test".to_owned(),
        }
    }

    #[test]
    fn groq_endpoint_is_openai_compatible() {
        assert_eq!(
            endpoint(&target()),
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }

    #[test]
    fn body_injects_system_message_first() {
        let request = ThinkRequest {
            messages: vec![ChatTurn::user("hello")],
            persona: Some("You are Pinky.".to_owned()),
            memories: vec!["likes rust".to_owned()],
            ..Default::default()
        };
        let body = request_body(&target(), &request, false);
        let messages = body["messages"].as_array().expect("messages array");

        assert_eq!(messages[0]["role"], "system");
        let system = messages[0]["content"].as_str().expect("system text");
        assert!(system.starts_with("You are Pinky."));
        assert!(system.contains("[Memory] likes rust"));
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "hello");
    }

    #[test]
    fn body_omits_unset_sampling_params() {
        let request = ThinkRequest {
            messages: vec![ChatTurn::user("hello")],
            ..Default::default()
        };
        let body = request_body(&target(), &request, true);
        assert!(body.get("temperature").is_none());
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["stream"], true);
    }
}
