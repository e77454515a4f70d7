//! Mock Model Provider
//!
//! A deterministic provider for tests and local runs. It cycles through
//! canned responses, streams them word by word, and can be told to fail
//! part-way through a stream.

use crate::agent::model::{
    ChatMessage, ChunkStream, GenerationConfig, ModelProvider, ModelResponse, ProviderKind,
    ProviderMetadata, TokenUsage,
};
use anyhow::{anyhow, Result};
use async_stream::stream;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Mock provider that returns predefined responses
#[derive(Debug, Clone)]
pub struct MockProvider {
    responses: Vec<String>,
    current_index: Arc<AtomicUsize>,
    model_name: String,
    chunk_delay: Duration,
    /// Emit an error after this many chunks instead of finishing.
    fail_after_chunks: Option<usize>,
}

impl MockProvider {
    /// Create a new mock provider with a single response
    pub fn new(response: impl Into<String>) -> Self {
        Self::with_responses(vec![response.into()])
    }

    /// Create a new mock provider with multiple responses
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses,
            current_index: Arc::new(AtomicUsize::new(0)),
            model_name: "mock-model".to_string(),
            chunk_delay: Duration::from_millis(10),
            fail_after_chunks: None,
        }
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    /// Pause between streamed chunks
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Make every stream fail after `chunks` chunks have been yielded
    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after_chunks = Some(chunks);
        self
    }

    /// Get the next response (cycles through available responses)
    fn next_response(&self) -> String {
        if self.responses.is_empty() {
            return String::new();
        }
        let index = self.current_index.fetch_add(1, Ordering::SeqCst);
        self.responses[index % self.responses.len()].clone()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new("This is a mock response from the test provider.")
    }
}

/// Split into chunks that concatenate back to the whitespace-normalised text.
fn word_chunks(content: &str) -> Vec<String> {
    content
        .split_whitespace()
        .enumerate()
        .map(|(i, word)| {
            if i == 0 {
                word.to_string()
            } else {
                format!(" {}", word)
            }
        })
        .collect()
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        _config: &GenerationConfig,
    ) -> Result<ModelResponse> {
        if self.fail_after_chunks.is_some() {
            return Err(anyhow!("mock provider configured to fail"));
        }
        let content = self.next_response();
        let prompt_tokens: u32 = messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u32)
            .sum();
        let completion_tokens = content.split_whitespace().count() as u32;

        Ok(ModelResponse {
            content,
            model: self.model_name.clone(),
            usage: Some(TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn stream(
        &self,
        _messages: &[ChatMessage],
        _config: &GenerationConfig,
    ) -> Result<ChunkStream> {
        let chunks = word_chunks(&self.next_response());
        let delay = self.chunk_delay;
        let fail_after = self.fail_after_chunks;

        let stream = stream! {
            for (i, chunk) in chunks.into_iter().enumerate() {
                if fail_after == Some(i) {
                    break;
                }
                yield Ok(chunk);
                // Simulate network delay
                tokio::time::sleep(delay).await;
            }
            if let Some(n) = fail_after {
                yield Err(anyhow!("mock provider failed after {} chunks", n));
            }
        };

        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: "Mock Provider".to_string(),
            supported_models: vec!["mock-model".to_string()],
            supports_streaming: true,
        }
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn prompt() -> Vec<ChatMessage> {
        vec![ChatMessage::user("test prompt")]
    }

    #[tokio::test]
    async fn test_mock_provider_generate() {
        let provider = MockProvider::new("Hello, world!");
        let config = GenerationConfig::default();

        let response = provider.generate(&prompt(), &config).await.unwrap();

        assert_eq!(response.content, "Hello, world!");
        assert_eq!(response.model, "mock-model");
        assert_eq!(response.usage.unwrap().prompt_tokens, 2);
        assert_eq!(response.finish_reason, Some("stop".to_string()));
    }

    #[tokio::test]
    async fn test_mock_provider_multiple_responses() {
        let provider = MockProvider::with_responses(vec![
            "First response".to_string(),
            "Second response".to_string(),
        ]);
        let config = GenerationConfig::default();

        let resp1 = provider.generate(&prompt(), &config).await.unwrap();
        assert_eq!(resp1.content, "First response");
        let resp2 = provider.generate(&prompt(), &config).await.unwrap();
        assert_eq!(resp2.content, "Second response");
        // Should cycle back to first
        let resp3 = provider.generate(&prompt(), &config).await.unwrap();
        assert_eq!(resp3.content, "First response");
    }

    #[tokio::test]
    async fn test_mock_provider_stream_concatenates_to_response() {
        let provider =
            MockProvider::new("Hello world test").with_chunk_delay(Duration::from_millis(0));
        let config = GenerationConfig::default();

        let mut stream = provider.stream(&prompt(), &config).await.unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }

        assert_eq!(chunks, vec!["Hello", " world", " test"]);
        assert_eq!(chunks.concat(), "Hello world test");
    }

    #[tokio::test]
    async fn test_mock_provider_injected_failure() {
        let provider = MockProvider::new("one two three")
            .with_chunk_delay(Duration::from_millis(0))
            .failing_after(1);
        let config = GenerationConfig::default();

        let results: Vec<_> = provider
            .stream(&prompt(), &config)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn test_mock_provider_custom_model_name() {
        let provider = MockProvider::new("test").with_model_name("custom-model");
        assert_eq!(provider.model_name(), "custom-model");
        assert_eq!(provider.kind(), ProviderKind::Mock);
    }
}
