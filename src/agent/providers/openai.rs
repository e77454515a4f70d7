//! OpenAI Model Provider
//!
//! Integration with OpenAI's API using the async-openai crate.

use crate::agent::model::{
    ChatMessage, ChatRole, ChunkStream, GenerationConfig, ModelProvider, ModelResponse,
    ProviderKind, ProviderMetadata, TokenUsage,
};
use anyhow::{anyhow, Result};
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_stream::stream;
use async_trait::async_trait;

const DEFAULT_MODEL: &str = "gpt-4.1-mini";

/// OpenAI provider that wraps the async-openai crate
#[derive(Debug, Clone)]
pub struct OpenAIProvider {
    client: Client<OpenAIConfig>,
    /// Model to use (e.g., "gpt-4.1", "gpt-4.1-mini")
    model: String,
    /// Optional system message prepended to every conversation
    system_message: Option<String>,
}

impl OpenAIProvider {
    /// Create a provider authenticated through the OPENAI_API_KEY environment variable
    pub fn new() -> Self {
        Self::with_config(OpenAIConfig::new())
    }

    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self::with_config(OpenAIConfig::new().with_api_key(api_key))
    }

    pub fn with_config(config: OpenAIConfig) -> Self {
        Self {
            client: Client::with_config(config),
            model: DEFAULT_MODEL.to_string(),
            system_message: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_message(mut self, message: impl Into<String>) -> Self {
        self.system_message = Some(message.into());
        self
    }

    /// Translate branch history into chat completion messages
    fn build_messages(
        &self,
        history: &[ChatMessage],
    ) -> Result<Vec<ChatCompletionRequestMessage>> {
        let mut messages = Vec::with_capacity(history.len() + 1);

        if let Some(system_msg) = &self.system_message {
            messages.push(system_message(system_msg)?);
        }

        for message in history {
            let built = match message.role {
                ChatRole::System => system_message(&message.content)?,
                ChatRole::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(message.content.clone())
                        .build()
                        .map_err(|e| anyhow!("Failed to build user message: {}", e))?,
                ),
                ChatRole::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(message.content.clone())
                        .build()
                        .map_err(|e| anyhow!("Failed to build assistant message: {}", e))?,
                ),
            };
            messages.push(built);
        }

        Ok(messages)
    }

    fn build_request(
        &self,
        history: &[ChatMessage],
        config: &GenerationConfig,
        streaming: bool,
    ) -> Result<CreateChatCompletionRequest> {
        let mut request_builder = CreateChatCompletionRequestArgs::default();
        request_builder
            .model(&self.model)
            .messages(self.build_messages(history)?);
        if streaming {
            request_builder.stream(true);
        }
        if let Some(temp) = config.temperature {
            request_builder.temperature(temp);
        }
        if let Some(max_tokens) = config.max_tokens {
            request_builder.max_tokens(max_tokens);
        }
        if let Some(top_p) = config.top_p {
            request_builder.top_p(top_p);
        }
        if let Some(stop) = &config.stop_sequences {
            request_builder.stop(stop.clone());
        }

        request_builder
            .build()
            .map_err(|e| anyhow!("Failed to build request: {}", e))
    }
}

fn system_message(content: &str) -> Result<ChatCompletionRequestMessage> {
    let message = ChatCompletionRequestSystemMessageArgs::default()
        .content(content.to_string())
        .build()
        .map_err(|e| anyhow!("Failed to build system message: {}", e))?;
    Ok(ChatCompletionRequestMessage::System(message))
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> Result<ModelResponse> {
        let request = self.build_request(messages, config, false)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| anyhow!("OpenAI API error: {}", e))?;

        let choice = response
            .choices
            .first()
            .ok_or_else(|| anyhow!("No response choices returned"))?;

        let content = choice
            .message
            .content
            .clone()
            .ok_or_else(|| anyhow!("No content in response"))?;

        let usage = response.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(ModelResponse {
            content,
            model: response.model,
            usage,
            finish_reason: choice.finish_reason.as_ref().map(|r| format!("{:?}", r)),
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> Result<ChunkStream> {
        let request = self.build_request(messages, config, true)?;

        let mut response_stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| anyhow!("OpenAI streaming API error: {}", e))?;

        let stream = stream! {
            use futures::StreamExt;

            while let Some(result) = response_stream.next().await {
                match result {
                    Ok(response) => {
                        if let Some(choice) = response.choices.first() {
                            if let Some(content) = &choice.delta.content {
                                yield Ok(content.clone());
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(anyhow!("Stream error: {}", e));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: "OpenAI".to_string(),
            supported_models: vec!["gpt-4.1".to_string(), "gpt-4.1-mini".to_string()],
            supports_streaming: true,
        }
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }
}
