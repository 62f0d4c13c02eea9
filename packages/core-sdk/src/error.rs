use thiserror::Error;

use crate::models::ProviderName;

/**
 * \brief 厂商调用失败：网络错误或厂商侧拒绝（鉴权、限流、请求格式等）。
 */
#[derive(Debug, Clone, Error)]
#[error("{provider} API error: {message}")]
pub struct ProviderApiError {
    pub provider: ProviderName,
    pub message: String,
    /** \brief HTTP 状态码（若有） */
    pub status: Option<u16>,
}

impl ProviderApiError {
    pub fn new(provider: ProviderName, message: impl Into<String>) -> Self {
        Self {
            provider,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /**
     * \brief 包装 reqwest 错误，保留厂商信息。
     * \details 去掉错误中的 URL，查询参数可能携带凭证。
     */
    pub fn transport(provider: ProviderName, err: reqwest::Error) -> Self {
        let err = err.without_url();
        let mut out = Self::new(provider, err.to_string());
        out.status = err.status().map(|s| s.as_u16());
        out
    }

    /**
     * \brief 从非 2xx 响应体中提取厂商错误信息。
     */
    pub fn from_body(provider: ProviderName, status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                let err = v.get("error")?;
                err.get("message")
                    .and_then(|m| m.as_str())
                    .or_else(|| err.as_str())
                    .map(|m| m.to_string())
            })
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    format!("request failed with status {}", status)
                } else {
                    trimmed.to_string()
                }
            });
        Self::new(provider, message).with_status(status)
    }
}
