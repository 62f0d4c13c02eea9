use async_trait::async_trait;

use super::chat_completions::ChatCompletionsClient;
use super::{ChunkStream, ProviderClient};
use crate::error::ProviderApiError;
use crate::models::{AICallConfig, AIResponse, Message, ProviderName};

/**
 * \brief Groq 适配器（OpenAI 兼容端点，同时承担免费默认 Provider）。
 */
pub struct GroqClient {
    inner: ChatCompletionsClient,
}

impl GroqClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            inner: ChatCompletionsClient::new(ProviderName::Groq, api_key, base_url, model),
        }
    }
}

#[async_trait]
impl ProviderClient for GroqClient {
    fn provider(&self) -> ProviderName {
        ProviderName::Groq
    }

    async fn generate_content(
        &self,
        messages: &[Message],
        config: &AICallConfig,
    ) -> Result<AIResponse, ProviderApiError> {
        self.inner.complete(messages, config).await
    }

    async fn generate_content_stream(
        &self,
        messages: &[Message],
        config: &AICallConfig,
    ) -> Result<ChunkStream, ProviderApiError> {
        self.inner.stream(messages, config).await
    }
}
