//! Dummy LLM provider: echoes input back prefixed with `[echo]`.
//! Used for keyless runs and tests; never touches the network.

use futures_util::{StreamExt, stream};

use crate::llm::{CompletionRequest, LlmResponse, ProviderError, TextStream};

#[derive(Debug, Clone)]
pub struct DummyProvider;

impl DummyProvider {
    pub async fn complete(&self, request: &CompletionRequest) -> Result<LlmResponse, ProviderError> {
        Ok(LlmResponse { text: format!("[echo] {}", request.user), usage: None })
    }

    /// Streams the echo one word at a time (whitespace preserved).
    pub async fn stream(&self, request: &CompletionRequest) -> Result<TextStream, ProviderError> {
        let text = format!("[echo] {}", request.user);
        let pieces: Vec<Result<String, ProviderError>> =
            text.split_inclusive(' ').map(|s| Ok(s.to_string())).collect();
        Ok(stream::iter(pieces).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_prefixes_echo() {
        let p = DummyProvider;
        let r = p.complete(&CompletionRequest::new("sys", "hello")).await.unwrap();
        assert_eq!(r.text, "[echo] hello");
    }

    #[tokio::test]
    async fn stream_concatenates_to_complete_text() {
        let p = DummyProvider;
        let req = CompletionRequest::new("sys", "water cycle basics");
        let parts: Vec<String> = p.stream(&req).await.unwrap().map(|r| r.unwrap()).collect().await;
        assert!(parts.len() > 1);
        assert_eq!(parts.concat(), "[echo] water cycle basics");
    }
}
