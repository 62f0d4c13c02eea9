use std::{convert::Infallible, sync::Arc};

use anyhow::{anyhow, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, get_service, post, put},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::services::ServeDir;

use crate::{
    config::Settings,
    db,
    generation::{stream_generation, GenerationEvent},
    llm,
    manager::ProviderManager,
    models::{AICallConfig, AIProvider, ConnectionStatus, ProviderName},
    prompts::PromptRequest,
    telemetry,
};

type ApiError = (StatusCode, String);

/**
 * \brief 处理器共享状态：启动时解析的配置。
 */
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
}

/**
 * \brief 构建路由；配置了静态目录时以 ServeDir 作为兜底服务。
 */
pub fn router(settings: Settings) -> Router {
    let ui_dir = settings.ui_dir.clone();
    let state = AppState {
        settings: Arc::new(settings),
    };

    let app = Router::new()
        .route("/api/providers", get(get_providers).post(create_provider))
        .route("/api/providers/test", post(test_unsaved_provider))
        .route(
            "/api/providers/{id}",
            put(update_provider).delete(delete_provider),
        )
        .route("/api/providers/{id}/select", post(select_provider))
        .route("/api/providers/{id}/test", post(test_saved_provider))
        .route("/api/generate", post(generate_sse))
        .route("/api/usage", get(get_usage))
        .route("/api/health", get(health_check))
        .with_state(state);

    match ui_dir {
        Some(dir) => {
            let static_service =
                get_service(ServeDir::new(dir).append_index_html_on_directories(true));
            app.fallback_service(static_service)
        }
        None => app,
    }
}

/**
 * \brief 启动本地 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:8787"
 */
pub async fn run(addr: &str, settings: Settings) -> Result<()> {
    // 启动前确认数据库可用并完成迁移
    db::open(&settings.db_path)?;
    let app = router(settings);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Deserialize, Debug)]
struct UserQuery {
    user_id: String,
}

#[derive(Deserialize, Debug)]
struct ProviderRequest {
    user_id: String,
    provider_name: ProviderName,
    /** \brief 更新时省略表示保留原密钥 */
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    is_default: bool,
    #[serde(default)]
    is_active: Option<bool>,
}

#[derive(Serialize, Debug)]
struct ProviderItem {
    id: i64,
    provider_name: ProviderName,
    model_name: String,
    /** \brief 只返回是否已配置与末四位，不回传密钥 */
    has_api_key: bool,
    api_key_hint: Option<String>,
    is_default: bool,
    is_active: bool,
    updated_at: String,
}

#[derive(Serialize, Debug)]
struct ProvidersState {
    providers: Vec<ProviderItem>,
    default_provider_id: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct UnsavedProviderRequest {
    provider_name: ProviderName,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    model_name: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GenerateRequest {
    user_id: String,
    #[serde(flatten)]
    request: PromptRequest,
    #[serde(default)]
    config: AICallConfig,
}

fn key_hint(key: &str) -> Option<String> {
    let chars = key.trim().chars().collect::<Vec<_>>();
    if chars.len() < 8 {
        return None;
    }
    Some(format!("...{}", chars[chars.len() - 4..].iter().collect::<String>()))
}

fn provider_item(p: AIProvider) -> ProviderItem {
    let key = p.api_key.as_deref().map(str::trim).unwrap_or_default();
    ProviderItem {
        id: p.id,
        provider_name: p.provider_name,
        model_name: p.effective_model(),
        has_api_key: !key.is_empty(),
        api_key_hint: key_hint(key),
        is_default: p.is_default,
        is_active: p.is_active,
        updated_at: p.updated_at,
    }
}

fn build_provider_state(conn: &rusqlite::Connection, user_id: &str) -> Result<ProvidersState> {
    let providers = db::list_providers(conn, user_id)?;
    let default_provider_id = providers.iter().find(|p| p.is_default).map(|p| p.id);
    Ok(ProvidersState {
        providers: providers.into_iter().map(provider_item).collect(),
        default_provider_id,
    })
}

fn open_db(state: &AppState) -> Result<rusqlite::Connection, ApiError> {
    db::open(&state.settings.db_path).map_err(internal_err)
}

fn require_user(user_id: &str) -> Result<&str, ApiError> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return Err(bad_request(anyhow!("user_id is required")));
    }
    Ok(trimmed)
}

/**
 * \brief 获取用户的 Provider 列表。
 */
async fn get_providers(
    State(state): State<AppState>,
    Query(q): Query<UserQuery>,
) -> Result<Json<ProvidersState>, ApiError> {
    let user_id = require_user(&q.user_id)?;
    let conn = open_db(&state)?;
    let providers = build_provider_state(&conn, user_id).map_err(internal_err)?;
    Ok(Json(providers))
}

/**
 * \brief 新增 Provider。
 */
async fn create_provider(
    State(state): State<AppState>,
    Json(payload): Json<ProviderRequest>,
) -> Result<Json<ProvidersState>, ApiError> {
    let user_id = require_user(&payload.user_id)?.to_string();
    let conn = open_db(&state)?;
    let input = db::NewProvider {
        user_id: user_id.clone(),
        provider_name: payload.provider_name,
        api_key: payload.api_key,
        model_name: payload.model_name,
        is_default: payload.is_default,
        is_active: payload.is_active.unwrap_or(true),
    };
    let id = db::insert_provider(&conn, &input).map_err(internal_err)?;
    telemetry::log_event(
        "server.provider",
        &format!("create id={} user={} provider={}", id, user_id, input.provider_name),
    );
    let providers = build_provider_state(&conn, &user_id).map_err(internal_err)?;
    Ok(Json(providers))
}

/**
 * \brief 更新 Provider。
 */
async fn update_provider(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<ProviderRequest>,
) -> Result<Json<ProvidersState>, ApiError> {
    let user_id = require_user(&payload.user_id)?.to_string();
    let conn = open_db(&state)?;
    let existing = db::get_provider(&conn, id)
        .map_err(internal_err)?
        .filter(|p| p.user_id == user_id)
        .ok_or_else(|| not_found(anyhow!("provider id {} not found", id)))?;
    let input = db::NewProvider {
        user_id: user_id.clone(),
        provider_name: payload.provider_name,
        api_key: payload.api_key.or(existing.api_key),
        model_name: payload.model_name,
        is_default: payload.is_default,
        is_active: payload.is_active.unwrap_or(existing.is_active),
    };
    db::update_provider(&conn, id, &input).map_err(internal_err)?;
    telemetry::log_event("server.provider", &format!("update id={} user={}", id, user_id));
    let providers = build_provider_state(&conn, &user_id).map_err(internal_err)?;
    Ok(Json(providers))
}

/**
 * \brief 删除 Provider。
 */
async fn delete_provider(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<ProvidersState>, ApiError> {
    let user_id = require_user(&q.user_id)?;
    let conn = open_db(&state)?;
    db::delete_provider(&conn, user_id, id).map_err(not_found)?;
    telemetry::log_event("server.provider", &format!("delete id={} user={}", id, user_id));
    let providers = build_provider_state(&conn, user_id).map_err(internal_err)?;
    Ok(Json(providers))
}

/**
 * \brief 设置默认 Provider。
 */
async fn select_provider(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<ProvidersState>, ApiError> {
    let user_id = require_user(&q.user_id)?;
    let conn = open_db(&state)?;
    db::set_default_provider(&conn, user_id, id).map_err(not_found)?;
    telemetry::log_event("server.provider", &format!("select-default id={} user={}", id, user_id));
    let providers = build_provider_state(&conn, user_id).map_err(internal_err)?;
    Ok(Json(providers))
}

/**
 * \brief 对已保存的 Provider 做连通性探测。
 */
async fn test_saved_provider(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<ConnectionStatus>, ApiError> {
    let user_id = require_user(&q.user_id)?;
    let conn = open_db(&state)?;
    let provider = db::get_provider(&conn, id)
        .map_err(internal_err)?
        .filter(|p| p.user_id == user_id)
        .ok_or_else(|| not_found(anyhow!("provider id {} not found", id)))?;
    drop(conn);
    let status = check_connection(
        &state.settings,
        provider.provider_name,
        provider.api_key.clone(),
        Some(provider.effective_model()),
    )
    .await;
    Ok(Json(status))
}

/**
 * \brief 预检：使用未保存的配置验证凭证。
 */
async fn test_unsaved_provider(
    State(state): State<AppState>,
    Json(payload): Json<UnsavedProviderRequest>,
) -> Json<ConnectionStatus> {
    Json(check_connection(&state.settings, payload.provider_name, payload.api_key, payload.model_name).await)
}

async fn check_connection(
    settings: &Settings,
    provider: ProviderName,
    api_key: Option<String>,
    model: Option<String>,
) -> ConnectionStatus {
    let status = match llm::create_client(provider, api_key, model, &settings.endpoints) {
        Ok(client) => client.test_connection().await,
        Err(err) => ConnectionStatus {
            success: false,
            message: err.to_string(),
        },
    };
    telemetry::log_event(
        "server.provider",
        &format!("test provider={} success={}", provider, status.success),
    );
    status
}

/**
 * \brief 生成接口：POST /api/generate，以 SSE 推送 token/done/error 事件。
 */
async fn generate_sse(
    State(state): State<AppState>,
    Json(payload): Json<GenerateRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user_id = require_user(&payload.user_id)?.to_string();
    let store = db::SqliteStore::open(&state.settings.db_path).map_err(internal_err)?;
    let manager = ProviderManager::new(user_id.clone(), Arc::new(store), &state.settings);
    telemetry::log_event(
        "server.generate",
        &format!(
            "user={} task={} refinement={}",
            user_id,
            payload.request.task_kind().as_str(),
            payload.request.is_refinement()
        ),
    );

    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let mut events = stream_generation(Arc::new(manager), payload.request, payload.config);
    // 客户端断开后继续消费，保证用量照常记录
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let _ = tx.send(Ok(sse_event(&event)));
        }
    });

    Ok(Sse::new(UnboundedReceiverStream::new(rx)).keep_alive(KeepAlive::new()))
}

fn sse_event(event: &GenerationEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().data(data),
        Err(err) => {
            telemetry::log_error("server.generate", &format!("event encode failed: {}", err));
            Event::default().data(
                serde_json::json!({"type": "error", "message": err.to_string()}).to_string(),
            )
        }
    }
}

/**
 * \brief 用户的用量记录。
 */
async fn get_usage(
    State(state): State<AppState>,
    Query(q): Query<UserQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user(&q.user_id)?;
    let conn = open_db(&state)?;
    let usage = db::list_usage(&conn, user_id).map_err(internal_err)?;
    Ok(Json(serde_json::json!({ "usage": usage })))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

fn not_found<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::NOT_FOUND, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::test_support::serve;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DB_SEQ: AtomicUsize = AtomicUsize::new(0);

    fn temp_db() -> PathBuf {
        let seq = DB_SEQ.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "abapgen-server-test-{}-{}.db",
            std::process::id(),
            seq
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn start(settings: Settings) -> String {
        serve(router(settings)).await
    }

    #[tokio::test]
    async fn test_provider_crud_flow() {
        let settings = Settings {
            db_path: temp_db(),
            ..Settings::default()
        };
        let base = start(settings).await;
        let http = reqwest::Client::new();

        let created: Value = http
            .post(format!("{}/api/providers", base))
            .json(&json!({"user_id": "u1", "provider_name": "openai", "api_key": "sk-test-123456", "is_default": true}))
            .send()
            .await
            .expect("create")
            .json()
            .await
            .expect("json");
        let first_id = created["default_provider_id"].as_i64().expect("default id");
        assert_eq!(created["providers"][0]["api_key_hint"], "...3456");
        assert!(created["providers"][0].get("api_key").is_none());

        let created: Value = http
            .post(format!("{}/api/providers", base))
            .json(&json!({"user_id": "u1", "provider_name": "gemini", "api_key": "g-key"}))
            .send()
            .await
            .expect("create 2")
            .json()
            .await
            .expect("json");
        assert_eq!(created["providers"].as_array().map(|a| a.len()), Some(2));
        let second_id = created["providers"][1]["id"].as_i64().expect("id");

        let selected: Value = http
            .post(format!("{}/api/providers/{}/select?user_id=u1", base, second_id))
            .send()
            .await
            .expect("select")
            .json()
            .await
            .expect("json");
        assert_eq!(selected["default_provider_id"].as_i64(), Some(second_id));

        let foreign = http
            .delete(format!("{}/api/providers/{}?user_id=u2", base, first_id))
            .send()
            .await
            .expect("delete foreign");
        assert_eq!(foreign.status(), reqwest::StatusCode::NOT_FOUND);

        let remaining: Value = http
            .delete(format!("{}/api/providers/{}?user_id=u1", base, first_id))
            .send()
            .await
            .expect("delete")
            .json()
            .await
            .expect("json");
        assert_eq!(remaining["providers"].as_array().map(|a| a.len()), Some(1));
    }

    #[tokio::test]
    async fn test_unsaved_check_without_key_fails_softly() {
        let base = start(Settings {
            db_path: temp_db(),
            ..Settings::default()
        })
        .await;
        let status: ConnectionStatus = reqwest::Client::new()
            .post(format!("{}/api/providers/test", base))
            .json(&json!({"provider_name": "anthropic"}))
            .send()
            .await
            .expect("status")
            .json()
            .await
            .expect("json");
        assert!(!status.success);
        assert!(status.message.contains("anthropic"));
    }

    #[tokio::test]
    async fn test_generate_streams_tokens_and_done() {
        let vendor = Router::new().route(
            "/openai/v1/chat/completions",
            post(|| async {
                (
                    [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                    [
                        "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"tipo\\\":\\\"perguntas\\\",\"}}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{\"content\":\"\\\"perguntas\\\":[{\\\"pergunta\\\":\\\"Qual tabela?\\\"}]}\"},\"finish_reason\":\"stop\"}]}\n\n",
                        "data: [DONE]\n\n",
                    ]
                    .concat(),
                )
            }),
        );
        let vendor_base = serve(vendor).await;

        let mut settings = Settings {
            db_path: temp_db(),
            ..Settings::default()
        };
        settings.endpoints.groq = format!("{}/openai/v1", vendor_base);
        settings.default_provider.api_key = Some("gsk-test".into());
        let base = start(settings).await;

        let body = reqwest::Client::new()
            .post(format!("{}/api/generate", base))
            .json(&json!({
                "user_id": "u1",
                "task": "abap",
                "form": {"nome_programa": "Z_X", "descricao": "relatório"}
            }))
            .send()
            .await
            .expect("generate")
            .text()
            .await
            .expect("body");

        let events = body
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(|d| serde_json::from_str::<Value>(d).expect("event json"))
            .collect::<Vec<_>>();
        assert_eq!(events.iter().filter(|e| e["type"] == "token").count(), 2);
        let done = events.last().expect("done event");
        assert_eq!(done["type"], "done");
        assert_eq!(done["result"]["isValid"], true);
        assert_eq!(done["result"]["tipo"], "perguntas");
    }

    #[tokio::test]
    async fn test_missing_user_is_rejected() {
        let base = start(Settings {
            db_path: temp_db(),
            ..Settings::default()
        })
        .await;
        let resp = reqwest::Client::new()
            .get(format!("{}/api/usage?user_id=%20", base))
            .send()
            .await
            .expect("usage");
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        let health: Value = reqwest::get(format!("{}/api/health", base))
            .await
            .expect("health")
            .json()
            .await
            .expect("json");
        assert_eq!(health["ok"], true);
    }
}
