//! Provider 解析与调用路由。
//!
//! 每个请求上下文创建一个 [`ProviderManager`]；首次调用时解析用户的默认 Provider
//! （找不到或查询失败时回退到不落库的免费默认 Provider），之后结果被缓存。

use std::sync::{Arc, Mutex};

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::config::{DefaultProviderSettings, Settings};
use crate::error::ProviderApiError;
use crate::llm::{create_client, ChunkStream, ProviderClient};
use crate::models::{
    AICallConfig, AIProvider, AIResponse, ConnectionStatus, Message, ProviderName, TokenUsage,
    UsageRecord,
};
use crate::telemetry;

/**
 * \brief Manager 依赖的存储接口：默认 Provider 查询与用量追加。
 */
#[async_trait]
pub trait ProviderStore: Send + Sync {
    /// 用户的默认且启用的 Provider。
    async fn find_default_provider(&self, user_id: &str) -> anyhow::Result<Option<AIProvider>>;

    async fn record_usage(&self, record: &UsageRecord) -> anyhow::Result<()>;
}

/**
 * \brief 构造适配器的工厂：(厂商, API Key, 默认模型)。
 */
pub type ClientFactory = Arc<
    dyn Fn(ProviderName, Option<String>, Option<String>) -> Result<Box<dyn ProviderClient>, ProviderApiError>
        + Send
        + Sync,
>;

/**
 * \brief 解析结果：用户配置的行，或合成的免费默认 Provider。
 */
#[derive(Debug, Clone)]
pub enum ResolvedProvider {
    Configured(AIProvider),
    Default { provider: ProviderName, model: String },
}

impl ResolvedProvider {
    pub fn vendor(&self) -> ProviderName {
        match self {
            ResolvedProvider::Configured(row) => row.provider_name,
            ResolvedProvider::Default { provider, .. } => *provider,
        }
    }

    pub fn model(&self) -> String {
        match self {
            ResolvedProvider::Configured(row) => row.effective_model(),
            ResolvedProvider::Default { model, .. } => model.clone(),
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, ResolvedProvider::Default { .. })
    }
}

type PendingWrites = Arc<Mutex<Vec<JoinHandle<()>>>>;

struct Resolution {
    provider: ResolvedProvider,
    client: Result<Arc<dyn ProviderClient>, ProviderApiError>,
}

/**
 * \brief Provider 管理器。
 * \details 状态：未初始化 -> 已解析(配置/默认)。生成方法会按需触发初始化。
 */
pub struct ProviderManager {
    user_id: String,
    store: Arc<dyn ProviderStore>,
    default_provider: DefaultProviderSettings,
    factory: ClientFactory,
    state: OnceCell<Resolution>,
    pending: PendingWrites,
}

impl ProviderManager {
    pub fn new(user_id: impl Into<String>, store: Arc<dyn ProviderStore>, settings: &Settings) -> Self {
        let endpoints = settings.endpoints.clone();
        let factory: ClientFactory =
            Arc::new(move |provider, key, model| create_client(provider, key, model, &endpoints));
        Self {
            user_id: user_id.into(),
            store,
            default_provider: settings.default_provider.clone(),
            factory,
            state: OnceCell::new(),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /**
     * \brief 替换适配器工厂（测试或自定义传输时使用）。
     */
    pub fn with_client_factory(mut self, factory: ClientFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /**
     * \brief 解析 Provider；幂等，只会查询一次存储。
     */
    pub async fn initialize(&self) -> &ResolvedProvider {
        &self.resolution().await.provider
    }

    /// 已解析的 Provider；未初始化时返回 None。
    pub fn resolved(&self) -> Option<&ResolvedProvider> {
        self.state.get().map(|r| &r.provider)
    }

    async fn resolution(&self) -> &Resolution {
        self.state.get_or_init(|| self.resolve()).await
    }

    async fn resolve(&self) -> Resolution {
        match self.store.find_default_provider(&self.user_id).await {
            Ok(Some(row)) => {
                match (self.factory)(row.provider_name, row.api_key.clone(), Some(row.effective_model())) {
                    Ok(client) => {
                        telemetry::log_event(
                            "manager",
                            &format!(
                                "user {} resolved provider {} ({} / {})",
                                self.user_id,
                                row.id,
                                row.provider_name,
                                row.effective_model()
                            ),
                        );
                        return Resolution {
                            provider: ResolvedProvider::Configured(row),
                            client: Ok(Arc::from(client)),
                        };
                    }
                    Err(err) => telemetry::log_error(
                        "manager",
                        &format!("provider {} is unusable, falling back to default: {}", row.id, err),
                    ),
                }
            }
            Ok(None) => telemetry::log_event(
                "manager",
                &format!("user {} has no configured provider, using default", self.user_id),
            ),
            Err(err) => telemetry::log_error(
                "manager",
                &format!("provider lookup failed for user {}: {:#}", self.user_id, err),
            ),
        }

        let defaults = &self.default_provider;
        Resolution {
            provider: ResolvedProvider::Default {
                provider: defaults.provider,
                model: defaults.model.clone(),
            },
            client: (self.factory)(
                defaults.provider,
                defaults.api_key.clone(),
                Some(defaults.model.clone()),
            )
            .map(Arc::from),
        }
    }

    /**
     * \brief 合并调用参数：调用方显式字段优先，厂商固定为已解析的 Provider。
     */
    fn merge_config(&self, resolved: &ResolvedProvider, config: &AICallConfig) -> AICallConfig {
        if let Some(requested) = config.provider {
            if requested != resolved.vendor() {
                telemetry::log_event(
                    "manager",
                    &format!(
                        "requested provider {} ignored, user is bound to {}",
                        requested,
                        resolved.vendor()
                    ),
                );
            }
        }
        AICallConfig {
            provider: Some(resolved.vendor()),
            model: config
                .model
                .clone()
                .filter(|m| !m.trim().is_empty())
                .or_else(|| Some(resolved.model())),
            ..config.clone()
        }
    }

    fn usage_record(&self, resolved: &ResolvedProvider, model: &str, usage: TokenUsage, estimated: bool) -> Option<UsageRecord> {
        match resolved {
            ResolvedProvider::Configured(row) => Some(UsageRecord {
                user_id: self.user_id.clone(),
                provider_id: Some(row.id),
                provider_name: row.provider_name,
                model_name: model.to_string(),
                usage,
                estimated,
            }),
            ResolvedProvider::Default { .. } => None,
        }
    }

    /**
     * \brief 等待已发出的用量写入完成；进程退出前调用。
     */
    pub async fn flush_usage(&self) {
        let handles = match self.pending.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(err) = handle.await {
                telemetry::log_error("manager", &format!("usage task aborted: {}", err));
            }
        }
    }

    /**
     * \brief 阻塞式生成，成功后在后台记录用量（失败只记日志）。
     */
    pub async fn generate_content(
        &self,
        messages: &[Message],
        config: &AICallConfig,
    ) -> Result<AIResponse, ProviderApiError> {
        let resolution = self.resolution().await;
        let client = resolution.client.clone()?;
        let merged = self.merge_config(&resolution.provider, config);
        let response = client.generate_content(messages, &merged).await?;

        let model = merged.model.clone().unwrap_or_else(|| resolution.provider.model());
        if let Some(record) = self.usage_record(&resolution.provider, &model, response.usage, false) {
            spawn_usage(&self.pending, self.store.clone(), record);
        }
        Ok(response)
    }

    /**
     * \brief 流式生成；按块累计字符数估算用量，收到 done 块时在后台写入。
     */
    pub async fn generate_content_stream(
        &self,
        messages: &[Message],
        config: &AICallConfig,
    ) -> Result<ChunkStream, ProviderApiError> {
        let resolution = self.resolution().await;
        let client = resolution.client.clone()?;
        let merged = self.merge_config(&resolution.provider, config);
        let mut inner = client.generate_content_stream(messages, &merged).await?;

        let model = merged.model.clone().unwrap_or_else(|| resolution.provider.model());
        let mut pending = self.usage_record(&resolution.provider, &model, TokenUsage::default(), true);
        let store = self.store.clone();
        let writes = self.pending.clone();

        let out = try_stream! {
            let mut chars = 0usize;
            while let Some(item) = inner.next().await {
                let chunk = item?;
                if chunk.done {
                    if let Some(mut record) = pending.take() {
                        record.usage = TokenUsage::estimate_from_chars(chars);
                        spawn_usage(&writes, store.clone(), record);
                    }
                    yield chunk;
                    break;
                }
                chars += chunk.content.chars().count();
                yield chunk;
            }
        };
        Ok(Box::pin(out))
    }

    /**
     * \brief 对已解析的 Provider 做连通性探测。
     */
    pub async fn test_connection(&self) -> ConnectionStatus {
        match &self.resolution().await.client {
            Ok(client) => client.test_connection().await,
            Err(err) => ConnectionStatus {
                success: false,
                message: err.to_string(),
            },
        }
    }
}

/**
 * \brief 用量写入不阻塞生成结果；句柄登记后由 flush_usage 等待。
 */
fn spawn_usage(pending: &PendingWrites, store: Arc<dyn ProviderStore>, record: UsageRecord) {
    let handle = tokio::spawn(async move {
        record_usage(store.as_ref(), &record).await;
    });
    if let Ok(mut guard) = pending.lock() {
        guard.retain(|h| !h.is_finished());
        guard.push(handle);
    }
}

async fn record_usage(store: &dyn ProviderStore, record: &UsageRecord) {
    if let Err(err) = store.record_usage(record).await {
        telemetry::log_error(
            "manager",
            &format!("usage tracking failed for user {}: {:#}", record.user_id, err),
        );
    }
}
