pub mod anthropic;
pub mod chat_completions;
pub mod gemini;
pub mod groq;
pub mod openai;
pub mod sse;
pub(crate) mod stream;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};

use crate::config::Endpoints;
use crate::error::ProviderApiError;
use crate::models::{AICallConfig, AIResponse, AIStreamChunk, ConnectionStatus, Message, ProviderName};

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use groq::GroqClient;
pub use openai::OpenAIClient;

/// 连通性探测使用的最小提示词。
const CONNECTION_PROBE_PROMPT: &str = "Responda apenas com a palavra: OK";

/**
 * \brief 统一的流式增量序列：单消费者、按序、有限，以 done=true 的块结束。
 */
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<AIStreamChunk, ProviderApiError>> + Send>>;

/**
 * \brief 单一厂商适配器的统一接口。
 */
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> ProviderName;

    /// 阻塞式调用，返回完整回复。
    async fn generate_content(
        &self,
        messages: &[Message],
        config: &AICallConfig,
    ) -> Result<AIResponse, ProviderApiError>;

    /// 流式调用。
    async fn generate_content_stream(
        &self,
        messages: &[Message],
        config: &AICallConfig,
    ) -> Result<ChunkStream, ProviderApiError>;

    /**
     * \brief 凭证探测：发送极短提示词，任何失败都落入 success=false，不抛错。
     */
    async fn test_connection(&self) -> ConnectionStatus {
        let messages = [Message::user(CONNECTION_PROBE_PROMPT)];
        let config = AICallConfig {
            temperature: Some(0.0),
            max_tokens: Some(16),
            ..Default::default()
        };
        match self.generate_content(&messages, &config).await {
            Ok(resp) if !resp.content.trim().is_empty() => ConnectionStatus {
                success: true,
                message: format!("{} connection OK", self.provider()),
            },
            Ok(_) => ConnectionStatus {
                success: false,
                message: format!("{} returned an empty response", self.provider()),
            },
            Err(err) => ConnectionStatus {
                success: false,
                message: err.to_string(),
            },
        }
    }
}

/**
 * \brief 按厂商创建适配器；API Key 缺失或为空时失败。
 * \param model 该 Provider 的默认模型，调用时 config.model 优先
 */
pub fn create_client(
    provider: ProviderName,
    api_key: Option<String>,
    model: Option<String>,
    endpoints: &Endpoints,
) -> Result<Box<dyn ProviderClient>, ProviderApiError> {
    let key = api_key
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ProviderApiError::new(provider, "API key is not configured"))?;
    let model = model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| provider.default_model().to_string());
    let base = endpoints.base_for(provider).to_string();
    let client: Box<dyn ProviderClient> = match provider {
        ProviderName::Groq => Box::new(GroqClient::new(key, base, model)),
        ProviderName::OpenAI => Box::new(OpenAIClient::new(key, base, model)),
        ProviderName::Anthropic => Box::new(AnthropicClient::new(key, base, model)),
        ProviderName::Gemini => Box::new(GeminiClient::new(key, base, model)),
    };
    Ok(client)
}

/**
 * \brief 把 system 消息从数组中抽出（多条以空行拼接），其余按序返回。
 */
pub(crate) fn split_system(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
    let mut system_parts = Vec::new();
    let mut rest = Vec::new();
    for msg in messages {
        match msg.role {
            crate::models::Role::System => system_parts.push(msg.content.as_str()),
            _ => rest.push(msg),
        }
    }
    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, rest)
}

/**
 * \brief 非 2xx 响应转为 ProviderApiError，并写入 `llm.<vendor>` 日志。
 */
pub(crate) async fn check_status(
    provider: ProviderName,
    resp: reqwest::Response,
) -> Result<reqwest::Response, ProviderApiError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    let err = ProviderApiError::from_body(provider, status, &text);
    crate::telemetry::log_error(
        &format!("llm.{}", provider),
        &format!("status={} {}", status, err.message),
    );
    Err(err)
}

/**
 * \brief 响应体字节流；传输错误去掉 URL 后再交给归一化层。
 */
pub(crate) fn body_stream(
    resp: reqwest::Response,
) -> impl Stream<Item = Result<impl AsRef<[u8]> + Send + 'static, reqwest::Error>> + Send + 'static {
    resp.bytes_stream().map(|item| item.map_err(reqwest::Error::without_url))
}

pub(crate) fn trim_base(base: &str) -> &str {
    base.trim_end_matches('/')
}
