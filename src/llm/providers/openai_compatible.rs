//! OpenAI-compatible chat completion provider (`/v1/chat/completions`).
//!
//! Groq, OpenAI and local servers (Ollama, LM Studio…) all speak this wire
//! format. All OpenAI wire types are private to this module.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, trace, warn};

use crate::llm::{CompletionRequest, LlmResponse, LlmUsage, ProviderError, TextStream};
use crate::relay::{LineBuffer, sse_payload};

// ── Public provider ───────────────────────────────────────────────────────────

/// Adapter for any HTTP endpoint implementing `/v1/chat/completions`.
///
/// Constructed once at startup, then cheaply cloned because
/// `reqwest::Client` is an `Arc` internally.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProvider {
    client: Client,
    api_base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    api_key: Option<String>,
}

impl OpenAiCompatibleProvider {
    /// `api_key` is `None` for keyless local models. When present it is sent
    /// as `Authorization: Bearer <key>` on every request.
    pub fn new(
        api_base_url: String,
        model: String,
        temperature: f32,
        max_tokens: u32,
        timeout_seconds: u64,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, api_base_url, model, temperature, max_tokens, api_key })
    }

    /// Lightweight reachability check.
    ///
    /// Any HTTP response (including 4xx) means the server is reachable. Only
    /// a transport failure counts as unreachable. Hard 5-second timeout.
    pub async fn ping(&self) -> Result<(), ProviderError> {
        let mut req = self.client.head(&self.api_base_url).timeout(Duration::from_secs(5));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req.send()
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::Request(format!("unreachable: {e}")))
    }

    fn payload(&self, request: &CompletionRequest, stream: bool) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(sys) = &request.system {
            messages.push(Message { role: "system", content: sys.clone() });
        }
        messages.push(Message { role: "user", content: request.user.clone() });

        // gpt-5 family models reject a temperature parameter.
        let temperature = if self.model.starts_with("gpt-5") {
            None
        } else {
            Some(request.temperature.unwrap_or(self.temperature))
        };

        ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature,
            max_tokens: Some(request.max_tokens.unwrap_or(self.max_tokens)),
            stream: stream.then_some(true),
        }
    }

    async fn send(&self, payload: &ChatCompletionRequest) -> Result<reqwest::Response, ProviderError> {
        debug!(
            model = %payload.model,
            temperature = ?payload.temperature,
            max_tokens = ?payload.max_tokens,
            stream = payload.stream.unwrap_or(false),
            "sending LLM request"
        );
        if tracing::enabled!(tracing::Level::TRACE) {
            let json = serde_json::to_string_pretty(payload)
                .unwrap_or_else(|e| format!("<serialization failed: {e}>"));
            trace!(payload = %json, "full LLM request payload");
        }

        let mut req = self.client.post(&self.api_base_url).json(payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            error!(url = %self.api_base_url, error = %e, timeout = e.is_timeout(), "LLM HTTP request failed (transport)");
            ProviderError::Request(e.to_string())
        })?;

        check_status(response).await
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<LlmResponse, ProviderError> {
        let payload = self.payload(request, false);
        let response = self.send(&payload).await?;

        let parsed = response.json::<ChatCompletionResponse>().await.map_err(|e| {
            error!(error = %e, "failed to deserialize LLM response");
            ProviderError::Request(format!("failed to parse response body: {e}"))
        })?;

        debug!(choices = parsed.choices.len(), "received LLM response");

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(ProviderError::Empty)?;

        let usage = parsed.usage.map(|u| LlmUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        });

        Ok(LlmResponse { text, usage })
    }

    /// Streamed completion (`"stream": true`, SSE framed).
    ///
    /// Deltas are forwarded through a bounded channel by a reader task. The
    /// task stops at `[DONE]`, at end of body, or as soon as the receiving
    /// side is dropped.
    pub async fn stream(&self, request: &CompletionRequest) -> Result<TextStream, ProviderError> {
        let payload = self.payload(request, true);
        let response = self.send(&payload).await?;

        let (tx, rx) = mpsc::channel::<Result<String, ProviderError>>(32);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut lines = LineBuffer::new();
            let mut deltas = 0usize;

            'read: while let Some(item) = body.next().await {
                let bytes = match item {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "LLM stream interrupted");
                        let _ = tx.send(Err(ProviderError::Request(e.to_string()))).await;
                        return;
                    }
                };
                for line in lines.push(&bytes) {
                    if line.trim().trim_start_matches("data:").trim() == "[DONE]" {
                        break 'read;
                    }
                    let Some(content) = delta_content(&line) else { continue };
                    deltas += 1;
                    if tx.send(Ok(content)).await.is_err() {
                        debug!("LLM stream receiver dropped, stopping reader");
                        return;
                    }
                }
            }
            if let Some(content) = lines.finish().as_deref().and_then(delta_content) {
                let _ = tx.send(Ok(content)).await;
            }
            debug!(deltas, "LLM stream finished");
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Text delta carried by one SSE line, if any.
fn delta_content(line: &str) -> Option<String> {
    let payload = sse_payload(line)?;
    let chunk: ChatCompletionChunk = serde_json::from_str(payload)
        .map_err(|e| trace!(error = %e, "ignoring non-JSON stream line"))
        .ok()?;
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty())
}

// ── Private wire types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageData>,
}

#[derive(Debug, Deserialize)]
struct UsageData {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

// Error envelope used by OpenAI and compatible APIs.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// Return the response if successful, or a structured error.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read error body>".to_string());

    let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(env) => {
            let code = env
                .error
                .code
                .map(|v| match v {
                    serde_json::Value::String(s) => format!(" [code={s}]"),
                    other => format!(" [code={other}]"),
                })
                .unwrap_or_default();
            format!("HTTP {status}{code}: {}", env.error.message)
        }
        Err(_) => format!("HTTP {status}: {body}"),
    };

    error!(%status, %message, "LLM request returned HTTP error");
    Err(ProviderError::Request(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(model: &str) -> OpenAiCompatibleProvider {
        OpenAiCompatibleProvider::new(
            "http://127.0.0.1:9/v1/chat/completions".into(),
            model.into(),
            0.2,
            1200,
            5,
            None,
        )
        .unwrap()
    }

    #[test]
    fn payload_uses_request_overrides() {
        let p = provider("llama-3.1-8b-instant");
        let req = CompletionRequest::new("sys", "hi").temperature(0.7).max_tokens(50);
        let json = serde_json::to_value(p.payload(&req, true)).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["max_tokens"], 50);
        assert_eq!(json["stream"], true);
        assert!((json["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn payload_omits_temperature_for_gpt5_and_stream_when_off() {
        let p = provider("gpt-5-mini");
        let json = serde_json::to_value(p.payload(&CompletionRequest::new("s", "u"), false)).unwrap();
        assert!(json.get("temperature").is_none());
        assert!(json.get("stream").is_none());
        assert_eq!(json["max_tokens"], 1200);
    }

    #[test]
    fn delta_content_reads_sse_chunks() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(delta_content(line).as_deref(), Some("Hel"));
        assert_eq!(delta_content(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#), None);
        assert_eq!(delta_content("data: [DONE]"), None);
        assert_eq!(delta_content(": ping"), None);
        assert_eq!(delta_content("data: not json"), None);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_request_error() {
        let p = provider("m");
        let err = p.complete(&CompletionRequest::new("s", "u")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Request(_)));
    }
}
