//! OpenAI 兼容的 `/chat/completions` 协议，OpenAI 与 Groq 共用。

use reqwest::{header::CONTENT_TYPE, Client};
use serde::{Deserialize, Serialize};

use super::stream::{normalize, StreamSignal};
use super::{body_stream, check_status, trim_base, ChunkStream};
use crate::error::ProviderApiError;
use crate::models::{AICallConfig, AIResponse, Message, ProviderName, TokenUsage};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: String,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/**
 * \brief OpenAI 兼容协议的 HTTP 客户端，按厂商标记错误来源。
 */
pub(crate) struct ChatCompletionsClient {
    provider: ProviderName,
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ChatCompletionsClient {
    pub(crate) fn new(provider: ProviderName, api_key: String, base_url: String, model: String) -> Self {
        Self {
            provider,
            client: Client::new(),
            base_url,
            api_key,
            model,
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", trim_base(&self.base_url))
    }

    fn request_body<'a>(
        &self,
        messages: &'a [Message],
        config: &AICallConfig,
        stream: bool,
    ) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: config.model.clone().filter(|m| !m.trim().is_empty()).unwrap_or_else(|| self.model.clone()),
            messages,
            temperature: config.temperature(),
            max_tokens: config.max_tokens(),
            top_p: config.top_p(),
            stream,
        }
    }

    async fn send(&self, body: &ChatCompletionRequest<'_>) -> Result<reqwest::Response, ProviderApiError> {
        let provider = self.provider;
        let resp = self
            .client
            .post(self.url())
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderApiError::transport(provider, e))?;

        check_status(provider, resp).await
    }

    pub(crate) async fn complete(
        &self,
        messages: &[Message],
        config: &AICallConfig,
    ) -> Result<AIResponse, ProviderApiError> {
        let body = self.request_body(messages, config, false);
        let resp = self.send(&body).await?;
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderApiError::transport(self.provider, e))?;
        parse_response(self.provider, &text)
    }

    pub(crate) async fn stream(
        &self,
        messages: &[Message],
        config: &AICallConfig,
    ) -> Result<ChunkStream, ProviderApiError> {
        let body = self.request_body(messages, config, true);
        let resp = self.send(&body).await?;
        let provider = self.provider;
        Ok(normalize(provider, body_stream(resp), move |payload| {
            decode_stream_event(provider, payload)
        }))
    }
}

/**
 * \brief 解析阻塞调用的响应体；缺失 usage 时计 0。
 */
pub(crate) fn parse_response(provider: ProviderName, body: &str) -> Result<AIResponse, ProviderApiError> {
    let parsed: ChatCompletionResponse = serde_json::from_str(body)
        .map_err(|e| ProviderApiError::new(provider, format!("invalid response body: {}", e)))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderApiError::new(provider, "response contained no choices"))?;
    let content = choice
        .message
        .and_then(|m| m.content)
        .unwrap_or_default();
    let usage = parsed
        .usage
        .map(|u| {
            let prompt = u.prompt_tokens.unwrap_or(0);
            let completion = u.completion_tokens.unwrap_or(0);
            TokenUsage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: u.total_tokens.unwrap_or(prompt + completion),
            }
        })
        .unwrap_or_default();
    Ok(AIResponse {
        content,
        finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
        usage,
    })
}

/**
 * \brief 解码单个流事件：`[DONE]` 或带 finish_reason 的块视为结束。
 */
pub(crate) fn decode_stream_event(
    provider: ProviderName,
    payload: &str,
) -> Result<Vec<StreamSignal>, ProviderApiError> {
    if payload.trim() == "[DONE]" {
        return Ok(vec![StreamSignal::Finished]);
    }
    let chunk: ChatCompletionChunk = serde_json::from_str(payload)
        .map_err(|e| ProviderApiError::new(provider, format!("invalid stream event: {}", e)))?;
    if let Some(err) = chunk.error {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string())
            .unwrap_or_else(|| err.to_string());
        return Err(ProviderApiError::new(provider, message));
    }
    let mut signals = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.and_then(|d| d.content) {
            signals.push(StreamSignal::Delta(text));
        }
        if choice.finish_reason.is_some() {
            signals.push(StreamSignal::Finished);
        }
    }
    Ok(signals)
}
