use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// 默认采样参数。
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_TOP_P: f32 = 0.9;

/**
 * \brief 支持的模型厂商。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Groq,
    Gemini,
    OpenAI,
    Anthropic,
}

impl ProviderName {
    pub const ALL: [ProviderName; 4] = [
        ProviderName::Groq,
        ProviderName::Gemini,
        ProviderName::OpenAI,
        ProviderName::Anthropic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Groq => "groq",
            ProviderName::Gemini => "gemini",
            ProviderName::OpenAI => "openai",
            ProviderName::Anthropic => "anthropic",
        }
    }

    /**
     * \brief 未指定模型时使用的厂商默认模型。
     */
    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderName::Groq => "llama-3.3-70b-versatile",
            ProviderName::Gemini => "gemini-1.5-flash",
            ProviderName::OpenAI => "gpt-4o-mini",
            ProviderName::Anthropic => "claude-3-5-sonnet-20241022",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groq" => Ok(ProviderName::Groq),
            "gemini" | "google" => Ok(ProviderName::Gemini),
            "openai" => Ok(ProviderName::OpenAI),
            "anthropic" | "claude" => Ok(ProviderName::Anthropic),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/**
 * \brief 用户保存的 Provider 配置行。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AIProvider {
    /** \brief 自增主键 */
    pub id: i64,
    /** \brief 所属用户 */
    pub user_id: String,
    /** \brief 厂商 */
    pub provider_name: ProviderName,
    /** \brief API Key，免费默认 Provider 可为空 */
    pub api_key: Option<String>,
    /** \brief 选用的模型，为空时使用厂商默认模型 */
    pub model_name: Option<String>,
    pub is_default: bool,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl AIProvider {
    /**
     * \brief 实际生效的模型名。
     */
    pub fn effective_model(&self) -> String {
        self.model_name
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.provider_name.default_model())
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/**
 * \brief 统一消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/**
 * \brief 单次调用的参数；所有字段可选，缺省值见 DEFAULT_* 常量。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AICallConfig {
    #[serde(default)]
    pub provider: Option<ProviderName>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
}

impl AICallConfig {
    pub fn temperature(&self) -> f32 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn top_p(&self) -> f32 {
        self.top_p.unwrap_or(DEFAULT_TOP_P)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /**
     * \brief 流式路径的粗略估算：字符数 / 4，仅用于内部计量。
     */
    pub fn estimate_from_chars(completion_chars: usize) -> Self {
        let completion = u32::try_from(completion_chars / 4).unwrap_or(u32::MAX);
        Self::new(0, completion)
    }
}

/**
 * \brief 阻塞调用的完整结果。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AIResponse {
    pub content: String,
    pub finish_reason: String,
    pub usage: TokenUsage,
}

/**
 * \brief 流式增量；最后一块 content 为空且 done=true。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AIStreamChunk {
    pub content: String,
    pub done: bool,
}

impl AIStreamChunk {
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            content: String::new(),
            done: true,
        }
    }
}

/**
 * \brief testConnection 探测结果。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub success: bool,
    pub message: String,
}

/**
 * \brief 一次生成调用的用量记录（仅追加）。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub provider_id: Option<i64>,
    pub provider_name: ProviderName,
    pub model_name: String,
    pub usage: TokenUsage,
    /** \brief 流式调用的用量为估算值 */
    pub estimated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_name_parse_and_display() {
        for name in ProviderName::ALL {
            assert_eq!(name.as_str().parse::<ProviderName>(), Ok(name));
        }
        assert_eq!("Claude".parse::<ProviderName>(), Ok(ProviderName::Anthropic));
        assert!("mistral".parse::<ProviderName>().is_err());
    }

    #[test]
    fn test_call_config_defaults() {
        let config = AICallConfig::default();
        assert_eq!(config.temperature(), 0.7);
        assert_eq!(config.max_tokens(), 4096);
        assert_eq!(config.top_p(), 0.9);
    }

    #[test]
    fn test_call_config_wire_names() {
        let config: AICallConfig =
            serde_json::from_str(r#"{"provider":"gemini","maxTokens":10,"topP":0.5}"#)
                .expect("parse config");
        assert_eq!(config.provider, Some(ProviderName::Gemini));
        assert_eq!(config.max_tokens(), 10);
        assert_eq!(config.top_p(), 0.5);
        assert_eq!(config.temperature(), 0.7);
    }

    #[test]
    fn test_usage_estimate() {
        let usage = TokenUsage::estimate_from_chars(41);
        assert_eq!(usage.completion_tokens, 10);
        assert_eq!(usage.prompt_tokens, 0);
        assert_eq!(usage.total_tokens, 10);
    }

    #[test]
    fn test_effective_model_falls_back() {
        let provider = AIProvider {
            id: 1,
            user_id: "u1".into(),
            provider_name: ProviderName::OpenAI,
            api_key: Some("sk".into()),
            model_name: Some("  ".into()),
            is_default: true,
            is_active: true,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(provider.effective_model(), "gpt-4o-mini");
    }
}
