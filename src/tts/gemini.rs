//! Gemini `generateContent` speech synthesis (audio response modality).

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::llm::ProviderError;

#[derive(Debug, Clone)]
pub struct GeminiTts {
    client: Client,
    api_base_url: String,
    model: String,
    api_key: String,
}

impl GeminiTts {
    pub fn new(api_base_url: String, model: String, timeout_seconds: u64, api_key: String) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, api_base_url, model, api_key })
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", self.api_base_url.trim_end_matches('/'), self.model)
    }

    /// Returns raw 16-bit mono PCM at 24 kHz.
    pub async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, ProviderError> {
        debug!(model = %self.model, voice, text_len = text.len(), "sending TTS request");

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body(text, voice))
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "TTS HTTP request failed (transport)");
                ProviderError::Request(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, "TTS request returned HTTP error");
            return Err(ProviderError::Request(format!("HTTP {status}: {body}")));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Request(format!("failed to parse TTS response: {e}")))?;
        decode_audio(parsed)
    }
}

fn request_body(text: &str, voice: &str) -> GenerateRequest {
    GenerateRequest {
        contents: vec![Content { parts: vec![TextPart { text: text.to_string() }] }],
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO"],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig { voice_name: voice.to_string() },
                },
            },
        },
    }
}

fn decode_audio(parsed: GenerateResponse) -> Result<Vec<u8>, ProviderError> {
    let data = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content.parts.into_iter().find_map(|p| p.inline_data))
        .map(|d| d.data)
        .filter(|d| !d.is_empty())
        .ok_or(ProviderError::Empty)?;
    STANDARD
        .decode(data.as_bytes())
        .map_err(|e| ProviderError::Request(format!("failed to decode audio: {e}")))
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
}
