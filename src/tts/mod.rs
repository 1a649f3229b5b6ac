//! Text-to-speech: provider dispatch, WAV packaging and the `tts` cache.

pub mod gemini;
pub mod wav;

use axum::body::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cache::{CacheSnapshot, SharedCache};
use crate::config::{CacheLimits, TtsConfig};
use crate::error::AppError;
use crate::lesson::{SpeechMode, StructuredLesson};
use crate::llm::ProviderError;
use crate::validate::{ValidationError, validate_tts_text};

/// Length of the clip the dummy provider returns.
const DUMMY_CLIP_MS: u32 = 250;

#[derive(Debug, Clone)]
pub enum TtsProvider {
    /// Silence; for keyless runs and tests.
    Dummy,
    Gemini(gemini::GeminiTts),
}

impl TtsProvider {
    pub fn build(config: &TtsConfig, api_key: Option<String>) -> Result<Self, ProviderError> {
        match (config.provider.as_str(), api_key) {
            ("dummy", _) => Ok(TtsProvider::Dummy),
            ("gemini", Some(key)) => Ok(TtsProvider::Gemini(gemini::GeminiTts::new(
                config.api_base_url.clone(),
                config.model.clone(),
                config.timeout_seconds,
                key,
            )?)),
            ("gemini", None) => Err(ProviderError::Request("gemini TTS requires TTS_API_KEY".into())),
            (other, _) => Err(ProviderError::UnknownProvider(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TtsProvider::Dummy => "dummy",
            TtsProvider::Gemini(_) => "gemini",
        }
    }

    /// Raw PCM (16-bit, mono, 24 kHz).
    pub async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, ProviderError> {
        match self {
            TtsProvider::Dummy => Ok(wav::silence(DUMMY_CLIP_MS)),
            TtsProvider::Gemini(g) => g.synthesize(text, voice).await,
        }
    }
}

pub struct TtsService {
    provider: TtsProvider,
    voice: String,
    cache: SharedCache<Bytes>,
}

impl TtsService {
    pub fn new(provider: TtsProvider, voice: impl Into<String>, limits: CacheLimits) -> Self {
        Self { provider, voice: voice.into(), cache: SharedCache::new("tts", limits) }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn cache_snapshot(&self) -> CacheSnapshot {
        self.cache.snapshot()
    }

    fn cache_key(&self, text: &str) -> String {
        let digest = Sha256::digest(format!("{text}:{}", self.voice).as_bytes());
        format!("tts:{}", hex::encode(digest))
    }

    /// Validate `text` and return a complete WAV file.
    pub async fn speak(&self, text: &str) -> Result<Bytes, AppError> {
        let text = validate_tts_text(text)?;
        let key = self.cache_key(&text);
        if let Some(audio) = self.cache.get(&key) {
            debug!(key = &key[..16], "tts cache hit");
            return Ok(audio);
        }

        info!(provider = self.provider.name(), chars = text.chars().count(), "synthesizing speech");
        let pcm = self.provider.synthesize(&text, &self.voice).await?;
        let audio = Bytes::from(wav::pcm_to_wav(&pcm));
        self.cache.set(key, audio.clone());
        Ok(audio)
    }

    /// Speak part of a lesson. Quiz content is never read out.
    pub async fn speak_lesson(&self, lesson: &StructuredLesson, mode: SpeechMode) -> Result<Bytes, AppError> {
        let text = lesson.speech_text(mode);
        if text.is_empty() {
            return Err(ValidationError::Empty("lesson text").into());
        }
        self.speak(&text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lesson::Section;

    fn service() -> TtsService {
        let cfg = Config::test_default();
        TtsService::new(TtsProvider::Dummy, "Leda", cfg.cache.tts)
    }

    #[tokio::test]
    async fn speak_returns_wav_and_caches() {
        let svc = service();
        let audio = svc.speak("Hello there").await.unwrap();
        assert_eq!(&audio[..4], b"RIFF");
        assert_eq!(audio.len(), 44 + wav::silence(DUMMY_CLIP_MS).len());
        svc.speak("Hello there").await.unwrap();
        assert_eq!(svc.cache_snapshot().stats.hits, 1);
    }

    #[tokio::test]
    async fn empty_text_rejected() {
        let err = service().speak("   ").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn lesson_section_out_of_range_rejected() {
        let lesson = StructuredLesson {
            introduction: None,
            classifications: vec![],
            sections: vec![Section { title: "A".into(), content: "B".into() }],
            diagram: String::new(),
            quiz: vec![],
        };
        let svc = service();
        assert!(svc.speak_lesson(&lesson, SpeechMode::Section(0)).await.is_ok());
        assert!(matches!(
            svc.speak_lesson(&lesson, SpeechMode::Section(3)).await,
            Err(AppError::Validation(ValidationError::Empty(_)))
        ));
    }

    #[test]
    fn gemini_needs_key() {
        let mut cfg = Config::test_default();
        cfg.tts.provider = "gemini".into();
        assert!(TtsProvider::build(&cfg.tts, None).is_err());
        assert_eq!(TtsProvider::build(&cfg.tts, Some("k".into())).unwrap().name(), "gemini");
    }
}
