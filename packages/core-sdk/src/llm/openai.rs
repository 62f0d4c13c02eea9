use async_trait::async_trait;

use super::chat_completions::ChatCompletionsClient;
use super::{ChunkStream, ProviderClient};
use crate::error::ProviderApiError;
use crate::models::{AICallConfig, AIResponse, Message, ProviderName};

/**
 * \brief OpenAI 适配器。
 */
pub struct OpenAIClient {
    inner: ChatCompletionsClient,
}

impl OpenAIClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            inner: ChatCompletionsClient::new(ProviderName::OpenAI, api_key, base_url, model),
        }
    }
}

#[async_trait]
impl ProviderClient for OpenAIClient {
    fn provider(&self) -> ProviderName {
        ProviderName::OpenAI
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::test_support::serve;
    use crate::models::TokenUsage;
    use axum::{http::header::CONTENT_TYPE, http::StatusCode, routing::post, Json, Router};
    use futures_util::StreamExt;
    use serde_json::{json, Value};

    async fn completions(Json(body): Json<Value>) -> axum::response::Response {
        use axum::response::IntoResponse;
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["messages"][0]["role"], "system");
        if body["stream"] == true {
            let sse = concat!(
                "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"REPORT \"},\"finish_reason\":null}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"z_test.\"},\"finish_reason\":\"stop\"}]}\n\n",
                "data: [DONE]\n\n"
            );
            ([(CONTENT_TYPE, "text/event-stream")], sse).into_response()
        } else {
            Json(json!({
                "choices": [{"message": {"role": "assistant", "content": "REPORT z_test."}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 4, "total_tokens": 9}
            }))
            .into_response()
        }
    }

    fn messages() -> Vec<Message> {
        vec![Message::system("sys"), Message::user("gere")]
    }

    #[tokio::test]
    async fn test_stream_matches_blocking_content() {
        let base = serve(Router::new().route("/v1/chat/completions", post(completions))).await;
        let client = OpenAIClient::new("sk-test".into(), format!("{}/v1", base), "gpt-4o-mini".into());

        let full = client
            .generate_content(&messages(), &AICallConfig::default())
            .await
            .expect("blocking call");
        assert_eq!(full.usage, TokenUsage::new(5, 4));

        let chunks = client
            .generate_content_stream(&messages(), &AICallConfig::default())
            .await
            .expect("stream call")
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|c| c.expect("chunk"))
            .collect::<Vec<_>>();
        assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
        assert!(chunks.last().map(|c| c.done && c.content.is_empty()).unwrap_or(false));
        let text: String = chunks.iter().filter(|c| !c.done).map(|c| c.content.as_str()).collect();
        assert_eq!(text, full.content);
    }

    #[tokio::test]
    async fn test_vendor_rejection_becomes_provider_error() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"error": {"message": "Incorrect API key provided"}})),
                )
            }),
        );
        let base = serve(app).await;
        let client = OpenAIClient::new("bad".into(), format!("{}/v1", base), "gpt-4o-mini".into());
        let err = client
            .generate_content(&messages(), &AICallConfig::default())
            .await
            .expect_err("401");
        assert_eq!(err.provider, ProviderName::OpenAI);
        assert_eq!(err.status, Some(401));
        assert_eq!(err.message, "Incorrect API key provided");

        let status = client.test_connection().await;
        assert!(!status.success);
    }
}
