//! Lesson generation: validation, greeting short-circuit, cache, LLM call.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::StructuredLesson;
use super::parse::parse_lesson;
use super::prompt::{is_social_greeting, lesson_cache_key, lesson_system_prompt, lesson_user_prompt, social_lesson};
use crate::cache::{CacheSnapshot, SharedCache};
use crate::config::CacheLimits;
use crate::error::AppError;
use crate::llm::{CompletionRequest, LlmProvider};
use crate::relay::StreamEvent;
use crate::validate::{validate_age, validate_topic};

/// Buffered records between the generator task and the HTTP body.
const EVENT_BUFFER: usize = 64;

/// A topic + age pair that has passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonRequest {
    pub topic: String,
    pub age: Option<u32>,
}

impl LessonRequest {
    pub fn new(topic: &str, age: Option<u32>) -> Result<Self, AppError> {
        Ok(Self { topic: validate_topic(topic)?, age: validate_age(age)? })
    }

    fn cache_key(&self) -> String {
        lesson_cache_key(&self.topic, self.age)
    }

    fn completion(&self) -> CompletionRequest {
        CompletionRequest::new(lesson_system_prompt(self.age), lesson_user_prompt(&self.topic))
    }
}

pub struct LessonService {
    llm: LlmProvider,
    cache: SharedCache<StructuredLesson>,
}

impl LessonService {
    pub fn new(llm: LlmProvider, limits: CacheLimits) -> Self {
        Self { llm, cache: SharedCache::new("lessons", limits) }
    }

    pub fn cache_snapshot(&self) -> CacheSnapshot {
        self.cache.snapshot()
    }

    /// Answer without the model when possible: greetings and cache hits.
    fn ready_answer(&self, request: &LessonRequest) -> Option<StructuredLesson> {
        if is_social_greeting(&request.topic) {
            debug!(topic = %request.topic, "social greeting, skipping model");
            return Some(social_lesson());
        }
        self.cache.get(&request.cache_key())
    }

    /// Generate the whole lesson in one model round-trip.
    pub async fn generate(&self, request: &LessonRequest) -> Result<StructuredLesson, AppError> {
        if let Some(lesson) = self.ready_answer(request) {
            return Ok(lesson);
        }

        info!(topic = %request.topic, age = ?request.age, provider = self.llm.name(), "generating lesson");
        let reply = self.llm.complete(&request.completion()).await?;
        if let Some(usage) = reply.usage {
            debug!(input_tokens = usage.input_tokens, output_tokens = usage.output_tokens, "lesson token usage");
        }

        let lesson = parse_lesson(&reply.text, &request.topic);
        self.cache.set(request.cache_key(), lesson.clone());
        Ok(lesson)
    }

    /// Stream generation as relay records.
    ///
    /// The stream always ends with one terminal record. Dropping it (client
    /// disconnect) stops the generator at its next send.
    pub fn stream(self: &Arc<Self>, request: LessonRequest) -> ReceiverStream<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        if let Some(lesson) = self.ready_answer(&request) {
            // Capacity is non-zero and the channel is fresh, so this cannot fail.
            let _ = tx.try_send(StreamEvent::Done { lesson });
            return ReceiverStream::new(rx);
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let terminal = service.generate_streamed(&request, &tx).await;
            if let Some(event) = terminal {
                let _ = tx.send(event).await;
            }
        });
        ReceiverStream::new(rx)
    }

    /// Forwards chunks to `tx`; returns the terminal record, or `None` if the
    /// receiver went away mid-stream.
    async fn generate_streamed(
        &self,
        request: &LessonRequest,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Option<StreamEvent> {
        info!(topic = %request.topic, age = ?request.age, provider = self.llm.name(), "streaming lesson");

        let mut deltas = match self.llm.stream(&request.completion()).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "lesson stream could not start");
                return Some(StreamEvent::error(e.to_string()));
            }
        };

        let mut full = String::new();
        while let Some(delta) = deltas.next().await {
            match delta {
                Ok(text) => {
                    full.push_str(&text);
                    if tx.send(StreamEvent::chunk(text)).await.is_err() {
                        debug!(topic = %request.topic, "stream client disconnected");
                        return None;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "lesson stream interrupted");
                    return Some(StreamEvent::error(e.to_string()));
                }
            }
        }

        if full.trim().is_empty() {
            return Some(StreamEvent::error("Empty response"));
        }

        let lesson = parse_lesson(&full, &request.topic);
        self.cache.set(request.cache_key(), lesson.clone());
        Some(StreamEvent::Done { lesson })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lesson::parse::fallback_lesson;
    use crate::llm::providers::dummy::DummyProvider;

    fn service() -> Arc<LessonService> {
        let cfg = Config::test_default();
        Arc::new(LessonService::new(LlmProvider::Dummy(DummyProvider), cfg.cache.lessons))
    }

    #[test]
    fn request_validation() {
        assert!(LessonRequest::new("x", None).is_err());
        assert!(LessonRequest::new("photosynthesis", Some(3)).is_err());
        let r = LessonRequest::new("  photosynthesis ", Some(9)).unwrap();
        assert_eq!(r.topic, "photosynthesis");
    }

    #[tokio::test]
    async fn greeting_never_reaches_model() {
        let svc = service();
        let lesson = svc.generate(&LessonRequest::new("hello", None).unwrap()).await.unwrap();
        assert_eq!(lesson, social_lesson());
        assert_eq!(svc.cache_snapshot().size, 0);
    }

    #[tokio::test]
    async fn unparseable_reply_falls_back_and_is_cached() {
        let svc = service();
        let req = LessonRequest::new("volcanoes", None).unwrap();
        let lesson = svc.generate(&req).await.unwrap();
        assert_eq!(lesson, fallback_lesson("volcanoes"));
        assert_eq!(svc.cache_snapshot().size, 1);

        svc.generate(&req).await.unwrap();
        assert_eq!(svc.cache_snapshot().stats.hits, 1);
    }

    #[tokio::test]
    async fn stream_emits_chunks_then_one_done() {
        let svc = service();
        let events: Vec<StreamEvent> = svc.stream(LessonRequest::new("volcanoes", None).unwrap()).collect().await;
        let (last, chunks) = events.split_last().unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|e| !e.is_terminal()));
        assert_eq!(last, &StreamEvent::Done { lesson: fallback_lesson("volcanoes") });
    }

    #[tokio::test]
    async fn cached_stream_is_single_done() {
        let svc = service();
        let req = LessonRequest::new("volcanoes", None).unwrap();
        svc.generate(&req).await.unwrap();
        let events: Vec<StreamEvent> = svc.stream(req).collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());
    }
}
