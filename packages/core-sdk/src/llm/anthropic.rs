use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client,
};
use serde::{Deserialize, Serialize};

use super::stream::{normalize, StreamSignal};
use super::{body_stream, check_status, split_system, trim_base, ChunkStream, ProviderClient};
use crate::error::ProviderApiError;
use crate::models::{AICallConfig, AIResponse, Message, ProviderName, Role, TokenUsage};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
    /** \brief system 指令必须作为顶层字段，不能出现在 messages 中 */
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    temperature: f32,
    top_p: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

/**
 * \brief 流事件，以 type 字段区分。
 */
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: BlockDelta },
    MessageStop,
    Error { error: ErrorDetail },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/**
 * \brief Anthropic 适配器。
 */
pub struct AnthropicClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            model,
        }
    }

    fn headers(&self) -> Result<HeaderMap, ProviderApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| ProviderApiError::new(ProviderName::Anthropic, e.to_string()))?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        Ok(headers)
    }

    async fn send(&self, body: &MessagesRequest<'_>) -> Result<reqwest::Response, ProviderApiError> {
        let url = format!("{}/messages", trim_base(&self.base_url));
        let resp = self
            .client
            .post(url)
            .headers(self.headers()?)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderApiError::transport(ProviderName::Anthropic, e))?;
        check_status(ProviderName::Anthropic, resp).await
    }

    fn request_body<'a>(
        &self,
        messages: &'a [Message],
        config: &AICallConfig,
        stream: bool,
    ) -> MessagesRequest<'a> {
        let (system, rest) = split_system(messages);
        MessagesRequest {
            model: config
                .model
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| self.model.clone()),
            max_tokens: config.max_tokens(),
            messages: rest
                .into_iter()
                .map(|m| WireMessage {
                    role: match m.role {
                        Role::Assistant => "assistant",
                        _ => "user",
                    },
                    content: &m.content,
                })
                .collect(),
            system,
            temperature: config.temperature(),
            top_p: config.top_p(),
            stream,
        }
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn provider(&self) -> ProviderName {
        ProviderName::Anthropic
    }

    async fn generate_content(
        &self,
        messages: &[Message],
        config: &AICallConfig,
    ) -> Result<AIResponse, ProviderApiError> {
        let body = self.request_body(messages, config, false);
        let resp = self.send(&body).await?;
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderApiError::transport(ProviderName::Anthropic, e))?;
        parse_response(&text)
    }

    async fn generate_content_stream(
        &self,
        messages: &[Message],
        config: &AICallConfig,
    ) -> Result<ChunkStream, ProviderApiError> {
        let body = self.request_body(messages, config, true);
        let resp = self.send(&body).await?;
        Ok(normalize(
            ProviderName::Anthropic,
            body_stream(resp),
            decode_stream_event,
        ))
    }
}

fn parse_response(body: &str) -> Result<AIResponse, ProviderApiError> {
    let parsed: MessagesResponse = serde_json::from_str(body).map_err(|e| {
        ProviderApiError::new(ProviderName::Anthropic, format!("invalid response body: {}", e))
    })?;
    let content = parsed
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("");
    let usage = parsed
        .usage
        .map(|u| TokenUsage::new(u.input_tokens.unwrap_or(0), u.output_tokens.unwrap_or(0)))
        .unwrap_or_default();
    Ok(AIResponse {
        content,
        finish_reason: parsed.stop_reason.unwrap_or_else(|| "end_turn".to_string()),
        usage,
    })
}

/**
 * \brief 只有 text_delta 携带文本；message_stop 事件表示结束。
 */
fn decode_stream_event(payload: &str) -> Result<Vec<StreamSignal>, ProviderApiError> {
    let event: StreamEvent = serde_json::from_str(payload).map_err(|e| {
        ProviderApiError::new(ProviderName::Anthropic, format!("invalid stream event: {}", e))
    })?;
    Ok(match event {
        StreamEvent::ContentBlockDelta {
            delta: BlockDelta::TextDelta { text },
        } => vec![StreamSignal::Delta(text)],
        StreamEvent::ContentBlockDelta { .. } => Vec::new(),
        StreamEvent::MessageStop => vec![StreamSignal::Finished],
        StreamEvent::Error { error } => {
            return Err(ProviderApiError::new(ProviderName::Anthropic, error.message));
        }
        StreamEvent::Other => Vec::new(),
    })
}
