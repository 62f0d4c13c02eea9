use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::{path::Path, sync::Mutex, thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::manager::ProviderStore;
use crate::models::{AIProvider, ProviderName, TokenUsage, UsageRecord};

const PROVIDER_COLUMNS: &str =
    "id, user_id, provider_name, api_key, model_name, is_default, is_active, created_at, updated_at";

/**
 * \brief 新建或更新 Provider 时的输入。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProvider {
    pub user_id: String,
    pub provider_name: ProviderName,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/**
 * \brief 带主键与时间戳的用量行。
 */
#[derive(Debug, Clone, Serialize)]
pub struct StoredUsage {
    pub id: i64,
    #[serde(flatten)]
    pub record: UsageRecord,
    pub created_at: String,
}

/**
 * \brief 打开数据库文件并执行迁移。
 */
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    migrate(&conn)?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS ai_providers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            provider_name TEXT NOT NULL,
            api_key TEXT,
            model_name TEXT,
            is_default INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ai_providers_user ON ai_providers(user_id);

        CREATE TABLE IF NOT EXISTS ai_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            provider_id INTEGER,
            provider_name TEXT NOT NULL,
            model_name TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            estimated INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ai_usage_user ON ai_usage(user_id);
        "#,
        )
    })?;
    Ok(())
}

fn now() -> Result<String> {
    Ok(OffsetDateTime::now_utc().format(&Rfc3339)?)
}

fn parse_provider_name(idx: usize, raw: String) -> rusqlite::Result<ProviderName> {
    raw.parse::<ProviderName>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

fn map_provider(row: &Row<'_>) -> rusqlite::Result<AIProvider> {
    Ok(AIProvider {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider_name: parse_provider_name(2, row.get(2)?)?,
        api_key: row.get(3)?,
        model_name: row.get(4)?,
        is_default: row.get::<_, i64>(5)? != 0,
        is_active: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn clear_defaults(conn: &Connection, user_id: &str, keep: i64) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "UPDATE ai_providers SET is_default=0 WHERE user_id=?1 AND is_default=1 AND id<>?2",
            params![user_id, keep],
        )
    })?;
    Ok(())
}

/**
 * \brief 新增 Provider；is_default=true 时同一用户的其它默认行被取消。
 */
pub fn insert_provider(conn: &Connection, input: &NewProvider) -> Result<i64> {
    let ts = now()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO ai_providers (user_id, provider_name, api_key, model_name, is_default, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                input.user_id,
                input.provider_name.as_str(),
                input.api_key,
                input.model_name,
                input.is_default,
                input.is_active,
                ts
            ],
        )
    })?;
    let id = conn.last_insert_rowid();
    if input.is_default {
        clear_defaults(conn, &input.user_id, id)?;
    }
    Ok(id)
}

/**
 * \brief 更新 Provider（仅限所属用户）。
 */
pub fn update_provider(conn: &Connection, id: i64, input: &NewProvider) -> Result<()> {
    let ts = now()?;
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE ai_providers SET provider_name=?1, api_key=?2, model_name=?3, is_default=?4, is_active=?5, updated_at=?6
             WHERE id=?7 AND user_id=?8",
            params![
                input.provider_name.as_str(),
                input.api_key,
                input.model_name,
                input.is_default,
                input.is_active,
                ts,
                id,
                input.user_id
            ],
        )
    })?;
    if rows == 0 {
        bail!("provider id {} not found", id);
    }
    if input.is_default {
        clear_defaults(conn, &input.user_id, id)?;
    }
    Ok(())
}

/**
 * \brief 删除 Provider；历史用量保留，provider_id 置空。
 */
pub fn delete_provider(conn: &Connection, user_id: &str, id: i64) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "DELETE FROM ai_providers WHERE id=?1 AND user_id=?2",
            params![id, user_id],
        )
    })?;
    if rows == 0 {
        bail!("provider id {} not found", id);
    }
    retry_on_locked(|| {
        conn.execute(
            "UPDATE ai_usage SET provider_id=NULL WHERE provider_id=?1",
            params![id],
        )
    })?;
    Ok(())
}

/**
 * \brief 列出用户的全部 Provider。
 */
pub fn list_providers(conn: &Connection, user_id: &str) -> Result<Vec<AIProvider>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ai_providers WHERE user_id=?1 ORDER BY id ASC",
        PROVIDER_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![user_id], map_provider)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 按 ID 获取 Provider。
 */
pub fn get_provider(conn: &Connection, id: i64) -> Result<Option<AIProvider>> {
    conn.query_row(
        &format!("SELECT {} FROM ai_providers WHERE id=?1", PROVIDER_COLUMNS),
        params![id],
        map_provider,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 设置默认 Provider；同一用户至多一行 is_default=1。
 */
pub fn set_default_provider(conn: &Connection, user_id: &str, id: i64) -> Result<()> {
    match get_provider(conn, id)? {
        Some(p) if p.user_id == user_id => {}
        _ => bail!("provider id {} not found", id),
    }
    let ts = now()?;
    retry_on_locked(|| {
        conn.execute(
            "UPDATE ai_providers SET is_default=1, updated_at=?1 WHERE id=?2",
            params![ts, id],
        )
    })?;
    clear_defaults(conn, user_id, id)
}

/**
 * \brief 用户的默认且启用的 Provider。
 */
pub fn find_default_provider(conn: &Connection, user_id: &str) -> Result<Option<AIProvider>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM ai_providers WHERE user_id=?1 AND is_default=1 AND is_active=1
             ORDER BY updated_at DESC, id DESC LIMIT 1",
            PROVIDER_COLUMNS
        ),
        params![user_id],
        map_provider,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 追加一条用量记录。
 */
pub fn record_usage(conn: &Connection, record: &UsageRecord) -> Result<i64> {
    let ts = now()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO ai_usage (user_id, provider_id, provider_name, model_name, prompt_tokens, completion_tokens, total_tokens, estimated, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.user_id,
                record.provider_id,
                record.provider_name.as_str(),
                record.model_name,
                record.usage.prompt_tokens,
                record.usage.completion_tokens,
                record.usage.total_tokens,
                record.estimated,
                ts
            ],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 按时间倒序列出用户的用量记录。
 */
pub fn list_usage(conn: &Connection, user_id: &str) -> Result<Vec<StoredUsage>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, provider_id, provider_name, model_name, prompt_tokens, completion_tokens, total_tokens, estimated, created_at
         FROM ai_usage WHERE user_id=?1 ORDER BY id DESC",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok(StoredUsage {
                id: row.get(0)?,
                record: UsageRecord {
                    user_id: row.get(1)?,
                    provider_id: row.get(2)?,
                    provider_name: parse_provider_name(3, row.get(3)?)?,
                    model_name: row.get(4)?,
                    usage: TokenUsage {
                        prompt_tokens: row.get(5)?,
                        completion_tokens: row.get(6)?,
                        total_tokens: row.get(7)?,
                    },
                    estimated: row.get::<_, i64>(8)? != 0,
                },
                created_at: row.get(9)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行指数退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}

/**
 * \brief 基于 SQLite 的 ProviderStore 实现。
 */
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_connection(open(path)?))
    }

    /// 调用方负责已执行迁移。
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection poisoned"))?;
        f(&guard)
    }
}

#[async_trait]
impl ProviderStore for SqliteStore {
    async fn find_default_provider(&self, user_id: &str) -> Result<Option<AIProvider>> {
        self.with_conn(|conn| find_default_provider(conn, user_id))
    }

    async fn record_usage(&self, record: &UsageRecord) -> Result<()> {
        self.with_conn(|conn| record_usage(conn, record).map(|_| ()))
    }
}
