use std::{pin::Pin, sync::Arc};

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use serde::Serialize;

use crate::error::ProviderApiError;
use crate::manager::ProviderManager;
use crate::models::{AICallConfig, AIResponse};
use crate::prompts::PromptRequest;
use crate::telemetry;
use crate::validate::{validate_response, ValidationOutcome, ValidationReport};

/**
 * \brief 推送给前端的事件，序列化后作为 SSE 的 `data:` 行。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    Token { content: String },
    Done { result: ValidationReport },
    Error { message: String },
}

pub type EventStream = Pin<Box<dyn Stream<Item = GenerationEvent> + Send>>;

/**
 * \brief 流式生成：逐块转发 token，结束后对完整文本做清洗与校验，发出 done。
 * \details Provider 错误以 error 事件结束序列；校验失败仍以 done 事件携带 isValid=false。
 */
pub fn stream_generation(
    manager: Arc<ProviderManager>,
    request: PromptRequest,
    config: AICallConfig,
) -> EventStream {
    let out = stream! {
        let messages = request.messages();
        let policy = request.validation_policy();
        telemetry::log_event(
            "generation",
            &format!(
                "user {} task {} refinement={}",
                manager.user_id(),
                request.task_kind().as_str(),
                request.is_refinement()
            ),
        );

        let mut chunks = match manager.generate_content_stream(&messages, &config).await {
            Ok(chunks) => chunks,
            Err(err) => {
                telemetry::log_error("generation", &err.to_string());
                yield GenerationEvent::Error { message: err.to_string() };
                return;
            }
        };

        let mut text = String::new();
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) if chunk.done => break,
                Ok(chunk) => {
                    text.push_str(&chunk.content);
                    yield GenerationEvent::Token { content: chunk.content };
                }
                Err(err) => {
                    telemetry::log_error("generation", &err.to_string());
                    yield GenerationEvent::Error { message: err.to_string() };
                    return;
                }
            }
        }

        let outcome = validate_response(&text, policy);
        log_outcome(&outcome);
        yield GenerationEvent::Done { result: ValidationReport::from(&outcome) };
    };
    Box::pin(out)
}

/**
 * \brief 阻塞式生成并校验。
 */
pub async fn generate_blocking(
    manager: &ProviderManager,
    request: &PromptRequest,
    config: &AICallConfig,
) -> Result<(AIResponse, ValidationOutcome), ProviderApiError> {
    let response = manager
        .generate_content(&request.messages(), config)
        .await?;
    let outcome = validate_response(&response.content, request.validation_policy());
    log_outcome(&outcome);
    Ok((response, outcome))
}

fn log_outcome(outcome: &ValidationOutcome) {
    match outcome {
        Ok(parsed) if parsed.is_error() => telemetry::log_error(
            "generation",
            &format!("model reported an error outcome: {:?}", parsed),
        ),
        Ok(parsed) => telemetry::log_event("generation", &format!("valid response tipo={}", parsed.tipo())),
        Err(failure) => telemetry::log_error(
            "generation",
            &format!(
                "invalid response: {} ({})",
                failure.error,
                failure.detail.as_deref().unwrap_or("-")
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::llm::{ChunkStream, ProviderClient};
    use crate::manager::{ClientFactory, ProviderStore};
    use crate::models::{AIProvider, AIStreamChunk, Message, ProviderName, TokenUsage, UsageRecord};
    use crate::prompts::{AbapSpecForm, AbapStyle, PromptTask};
    use async_trait::async_trait;
    use futures_util::stream;

    struct EmptyStore;

    #[async_trait]
    impl ProviderStore for EmptyStore {
        async fn find_default_provider(&self, _user_id: &str) -> anyhow::Result<Option<AIProvider>> {
            Ok(None)
        }

        async fn record_usage(&self, _record: &UsageRecord) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct CannedClient {
        parts: Vec<&'static str>,
        fail_midway: bool,
    }

    #[async_trait]
    impl ProviderClient for CannedClient {
        fn provider(&self) -> ProviderName {
            ProviderName::Groq
        }

        async fn generate_content(
            &self,
            _messages: &[Message],
            _config: &AICallConfig,
        ) -> Result<AIResponse, ProviderApiError> {
            Ok(AIResponse {
                content: self.parts.concat(),
                finish_reason: "stop".into(),
                usage: TokenUsage::default(),
            })
        }

        async fn generate_content_stream(
            &self,
            _messages: &[Message],
            _config: &AICallConfig,
        ) -> Result<ChunkStream, ProviderApiError> {
            let mut items = self
                .parts
                .iter()
                .map(|p| Ok(AIStreamChunk::delta(*p)))
                .collect::<Vec<_>>();
            if self.fail_midway {
                items.push(Err(ProviderApiError::new(ProviderName::Groq, "connection reset")));
            } else {
                items.push(Ok(AIStreamChunk::done()));
            }
            Ok(Box::pin(stream::iter(items)))
        }
    }

    fn manager(parts: Vec<&'static str>, fail_midway: bool) -> Arc<ProviderManager> {
        let mut settings = Settings::default();
        settings.default_provider.api_key = Some("gsk".into());
        let factory: ClientFactory = Arc::new(move |_, _, _| {
            Ok(Box::new(CannedClient {
                parts: parts.clone(),
                fail_midway,
            }) as Box<dyn ProviderClient>)
        });
        Arc::new(ProviderManager::new("u1", Arc::new(EmptyStore), &settings).with_client_factory(factory))
    }

    fn request() -> PromptRequest {
        PromptRequest::new(PromptTask::Abap {
            form: AbapSpecForm {
                program_name: "Z_TEST".into(),
                description: "teste".into(),
                ..Default::default()
            },
            style: AbapStyle::ObjectOriented,
        })
    }

    #[tokio::test]
    async fn test_tokens_then_done_with_valid_report() {
        let parts = vec![
            "<think>vou pensar {x}</think>",
            "```json\n{\"tipo\":\"codigo\",",
            "\"codigo_principal\":\"REPORT z_test.\"}\n```",
        ];
        let events = stream_generation(manager(parts, false), request(), AICallConfig::default())
            .collect::<Vec<_>>()
            .await;
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], GenerationEvent::Token { .. }));
        match events.last() {
            Some(GenerationEvent::Done { result }) => {
                assert!(result.is_valid);
                assert_eq!(result.tipo.as_deref(), Some("codigo"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_output_still_ends_with_done() {
        let events = stream_generation(
            manager(vec!["não sei responder"], false),
            request(),
            AICallConfig::default(),
        )
        .collect::<Vec<_>>()
        .await;
        match events.last() {
            Some(GenerationEvent::Done { result }) => {
                assert!(!result.is_valid);
                assert_eq!(result.candidate.as_deref(), Some("não sei responder"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_provider_error_ends_with_error_event() {
        let events = stream_generation(manager(vec!["{\"tipo\":"], true), request(), AICallConfig::default())
            .collect::<Vec<_>>()
            .await;
        assert_eq!(events.len(), 2);
        match &events[1] {
            GenerationEvent::Error { message } => assert!(message.contains("connection reset")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_event_wire_shape() {
        let token = serde_json::to_value(GenerationEvent::Token { content: "a".into() }).expect("json");
        assert_eq!(token["type"], "token");
        assert_eq!(token["content"], "a");
        let err = serde_json::to_value(GenerationEvent::Error { message: "x".into() }).expect("json");
        assert_eq!(err["type"], "error");
    }

    #[tokio::test]
    async fn test_blocking_generation_validates() {
        let mgr = manager(vec!["{\"tipo\":\"perguntas\",\"perguntas\":[{\"pergunta\":\"A?\"}]}"], false);
        let (resp, outcome) = generate_blocking(&mgr, &request(), &AICallConfig::default())
            .await
            .expect("generate");
        assert!(resp.content.contains("perguntas"));
        assert_eq!(outcome.expect("valid").tipo(), "perguntas");
    }
}
