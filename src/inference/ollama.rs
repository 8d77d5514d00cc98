//! Ollama engine: `POST /api/generate` with a flattened prompt.
//!
//! Streaming responses are newline-delimited JSON objects, each carrying
//! `{response, done}`; the final object has `done == true`.

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use super::router::EngineTarget;
use super::{
    assemble_prompt, check_http_response, InferenceError, LaneEngine, ThinkChunk, ThinkRequest,
    ThinkResponse,
};

/// Build the generate-endpoint request body.
fn request_body(target: &EngineTarget, request: &ThinkRequest, stream: bool) -> Value {
    let mut options = json!({});
    if let Some(temperature) = request.temperature {
        options["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        options["num_predict"] = json!(max_tokens);
    }

    json!({
        "model": target.model,
        "prompt": assemble_prompt(request),
        "stream": stream,
        "options": options,
    })
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
    let url = format!("{}/api/generate", target.base_url);
    let response = client
        .post(&url)
        .json(&request_body(target, request, false))
        .send()
        .await
        .map_err(|source| InferenceError::Transport {
            engine: LaneEngine::Ollama,
            source,
        })?;

    let payload = check_http_response(LaneEngine::Ollama, response).await?;
    let parsed: Value = serde_json::from_str(&payload).map_err(|e| InferenceError::Parse {
        engine: LaneEngine::Ollama,
        detail: e.to_string(),
    })?;

    Ok(ThinkResponse {
        content: parsed
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        done: parsed.get("done").and_then(Value::as_bool).unwrap_or(true),
    })
}

/// Streaming completion: forwards NDJSON objects as chunks.
///
/// Emits exactly one terminal chunk (`done` or `error`). Returns early
/// without error when the receiver is dropped — dropping the HTTP response
/// stream cancels the request.
pub async fn stream(
    client: &reqwest::Client,
    target: &EngineTarget,
    request: &ThinkRequest,
    tx: mpsc::Sender<ThinkChunk>,
) {
    let url = format!("{}/api/generate", target.base_url);
    let response = match client
        .post(&url)
        .json(&request_body(target, request, true))
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            let _ = tx.send(ThinkChunk::error(format!("ollama: {e}"))).await;
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let _ = tx
            .send(ThinkChunk::error(format!("ollama: status {status}")))
            .await;
        return;
    }

    let mut body = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(piece) = body.next().await {
        let bytes = match piece {
            Ok(b) => b,
            Err(e) => {
                let _ = tx.send(ThinkChunk::error(format!("ollama: {e}"))).await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(newline) = buffer.find('\n') {
            let line: String = buffer.drain(..=newline).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let parsed: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    let _ = tx
                        .send(ThinkChunk::error(format!("ollama: bad stream line: {e}")))
                        .await;
                    return;
                }
            };

            let content = parsed
                .get("response")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let done = parsed.get("done").and_then(Value::as_bool).unwrap_or(false);

            if !content.is_empty() && tx.send(ThinkChunk::text(content)).await.is_err() {
                return; // receiver closed the stream
            }
            if done {
                let _ = tx.send(ThinkChunk::done()).await;
                return;
            }
        }
    }

    // Stream ended without a done marker; still terminate exactly once.
    let _ = tx.send(ThinkChunk::done()).await;
}
