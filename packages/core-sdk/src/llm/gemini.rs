use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::stream::{normalize, StreamSignal};
use super::{body_stream, check_status, split_system, trim_base, ChunkStream, ProviderClient};
use crate::error::ProviderApiError;
use crate::models::{AICallConfig, AIResponse, Message, ProviderName, Role, TokenUsage};

/// 密钥走请求头，不进入 URL。
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<OwnedPart>,
}

#[derive(Debug, Serialize)]
struct OwnedPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    total_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl Candidate {
    fn text(&self) -> String {
        self.content
            .as_ref()
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

/**
 * \brief Gemini 适配器；密钥以 query 参数传递，system 指令放在 systemInstruction。
 */
pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            model,
        }
    }

    fn model_for(&self, config: &AICallConfig) -> String {
        config
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.model.clone())
    }

    fn request_body<'a>(&self, messages: &'a [Message], config: &AICallConfig) -> GenerateRequest<'a> {
        let (system, rest) = split_system(messages);
        GenerateRequest {
            contents: rest
                .into_iter()
                .map(|m| Content {
                    role: match m.role {
                        Role::Assistant => "model",
                        _ => "user",
                    },
                    parts: vec![TextPart { text: &m.content }],
                })
                .collect(),
            system_instruction: system.map(|text| SystemInstruction {
                parts: vec![OwnedPart { text }],
            }),
            generation_config: GenerationConfig {
                temperature: config.temperature(),
                max_output_tokens: config.max_tokens(),
                top_p: config.top_p(),
            },
        }
    }

    async fn send(
        &self,
        url: String,
        query: &[(&str, &str)],
        body: &GenerateRequest<'_>,
    ) -> Result<reqwest::Response, ProviderApiError> {
        let resp = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .query(query)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderApiError::transport(ProviderName::Gemini, e))?;
        check_status(ProviderName::Gemini, resp).await
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    fn provider(&self) -> ProviderName {
        ProviderName::Gemini
    }

    async fn generate_content(
        &self,
        messages: &[Message],
        config: &AICallConfig,
    ) -> Result<AIResponse, ProviderApiError> {
        let url = format!(
            "{}/models/{}:generateContent",
            trim_base(&self.base_url),
            self.model_for(config)
        );
        let body = self.request_body(messages, config);
        let resp = self
            .send(url, &[], &body)
            .await?;
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderApiError::transport(ProviderName::Gemini, e))?;
        parse_response(&text)
    }

    async fn generate_content_stream(
        &self,
        messages: &[Message],
        config: &AICallConfig,
    ) -> Result<ChunkStream, ProviderApiError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent",
            trim_base(&self.base_url),
            self.model_for(config)
        );
        let body = self.request_body(messages, config);
        let resp = self
            .send(url, &[("alt", "sse")], &body)
            .await?;
        Ok(normalize(ProviderName::Gemini, body_stream(resp), decode_stream_event))
    }
}

fn parse_body(body: &str) -> Result<GenerateResponse, ProviderApiError> {
    let parsed: GenerateResponse = serde_json::from_str(body).map_err(|e| {
        ProviderApiError::new(ProviderName::Gemini, format!("invalid response body: {}", e))
    })?;
    if let Some(err) = &parsed.error {
        return Err(ProviderApiError::new(ProviderName::Gemini, err.message.clone()));
    }
    Ok(parsed)
}

/**
 * \brief 阻塞响应；usageMetadata 缺失时用量计 0。
 */
fn parse_response(body: &str) -> Result<AIResponse, ProviderApiError> {
    let parsed = parse_body(body)?;
    let candidate = parsed
        .candidates
        .first()
        .ok_or_else(|| ProviderApiError::new(ProviderName::Gemini, "response contained no candidates"))?;
    let usage = parsed
        .usage_metadata
        .as_ref()
        .map(|u| {
            let prompt = u.prompt_token_count.unwrap_or(0);
            let completion = u.candidates_token_count.unwrap_or(0);
            TokenUsage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: u.total_token_count.unwrap_or(prompt + completion),
            }
        })
        .unwrap_or_default();
    Ok(AIResponse {
        content: candidate.text(),
        finish_reason: candidate
            .finish_reason
            .clone()
            .unwrap_or_else(|| "STOP".to_string()),
        usage,
    })
}

/**
 * \brief 每个事件都是一个完整的 GenerateResponse；带 finishReason 的事件即最后一块。
 */
fn decode_stream_event(payload: &str) -> Result<Vec<StreamSignal>, ProviderApiError> {
    let parsed = parse_body(payload)?;
    let mut signals = Vec::new();
    for candidate in &parsed.candidates {
        let text = candidate.text();
        if !text.is_empty() {
            signals.push(StreamSignal::Delta(text));
        }
        if candidate.finish_reason.is_some() {
            signals.push(StreamSignal::Finished);
        }
    }
    Ok(signals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::stream::tests::collect;
    use crate::llm::test_support::serve;
    use axum::{
        extract::RawQuery,
        http::HeaderMap,
        routing::post,
        Json, Router,
    };
    use serde_json::json;

    const SECRET: &str = "AIzaSECRETKEY123";

    #[test]
    fn test_request_uses_system_instruction_and_model_role() {
        let client = GeminiClient::new("k".into(), "http://x".into(), "gemini-1.5-flash".into());
        let messages = vec![
            Message::system("regras"),
            Message::user("oi"),
            Message::assistant("olá"),
        ];
        let body = client.request_body(&messages, &AICallConfig::default());
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "regras");
        assert_eq!(value["contents"][1]["role"], "model");
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 4096);
        assert_eq!(value["contents"].as_array().map(|a| a.len()), Some(2));
    }

    #[test]
    fn test_parse_response_without_usage_reports_zero() {
        let resp = parse_response(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"a"},{"text":"b"}]},"finishReason":"STOP"}]}"#,
        )
        .expect("parse");
        assert_eq!(resp.content, "ab");
        assert_eq!(resp.usage, TokenUsage::default());
    }

    #[test]
    fn test_parse_response_error_object() {
        let err = parse_response(r#"{"error":{"code":400,"message":"API key not valid"}}"#)
            .expect_err("error body");
        assert_eq!(err.message, "API key not valid");
    }

    #[tokio::test]
    async fn test_simulated_stream_with_finish_reason() {
        let chunks = collect(
            ProviderName::Gemini,
            vec![
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"{\\\"tipo\\\":\"}],\"role\":\"model\"}}]}\r\n\r\n",
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"\\\"erro\\\"}\"}],\"role\":\"model\"},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"totalTokenCount\":7}}\r\n\r\n",
            ],
            decode_stream_event,
        )
        .await;
        let chunks = chunks.into_iter().map(|c| c.expect("chunk")).collect::<Vec<_>>();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
        let text: String = chunks.iter().filter(|c| !c.done).map(|c| c.content.as_str()).collect();
        assert_eq!(text, "{\"tipo\":\"erro\"}");
    }

    #[tokio::test]
    async fn test_api_key_sent_as_header_not_query() {
        let app = Router::new().route(
            "/v1beta/models/{action}",
            post(|headers: HeaderMap, RawQuery(query): RawQuery| async move {
                assert_eq!(
                    headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()),
                    Some(SECRET)
                );
                assert!(!query.unwrap_or_default().contains(SECRET));
                Json(json!({
                    "candidates": [{"content": {"role": "model", "parts": [{"text": "OK"}]}, "finishReason": "STOP"}]
                }))
            }),
        );
        let base = serve(app).await;
        let client = GeminiClient::new(SECRET.into(), format!("{}/v1beta", base), "gemini-1.5-flash".into());
        let resp = client
            .generate_content(&[Message::user("oi")], &AICallConfig::default())
            .await
            .expect("blocking");
        assert_eq!(resp.content, "OK");
    }

    #[tokio::test]
    async fn test_transport_error_does_not_leak_key() {
        let client = GeminiClient::new(SECRET.into(), "http://127.0.0.1:1/v1beta".into(), "gemini-1.5-flash".into());
        let err = client
            .generate_content(&[Message::user("oi")], &AICallConfig::default())
            .await
            .expect_err("connection refused");
        assert!(!err.to_string().contains(SECRET), "{}", err);

        let status = client.test_connection().await;
        assert!(!status.success);
        assert!(!status.message.contains(SECRET));
    }
}
