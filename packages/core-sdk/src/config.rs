use std::path::PathBuf;

use crate::models::ProviderName;

/**
 * \brief 各厂商 API 基地址。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub groq: String,
    pub openai: String,
    pub anthropic: String,
    pub gemini: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            groq: "https://api.groq.com/openai/v1".to_string(),
            openai: "https://api.openai.com/v1".to_string(),
            anthropic: "https://api.anthropic.com/v1".to_string(),
            gemini: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }
}

impl Endpoints {
    pub fn base_for(&self, provider: ProviderName) -> &str {
        match provider {
            ProviderName::Groq => &self.groq,
            ProviderName::OpenAI => &self.openai,
            ProviderName::Anthropic => &self.anthropic,
            ProviderName::Gemini => &self.gemini,
        }
    }
}

/**
 * \brief 用户未配置时使用的免费默认 Provider（不落库）。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultProviderSettings {
    pub provider: ProviderName,
    /** \brief 应用级密钥，启动时注入 */
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for DefaultProviderSettings {
    fn default() -> Self {
        Self {
            provider: ProviderName::Groq,
            api_key: None,
            model: ProviderName::Groq.default_model().to_string(),
        }
    }
}

/**
 * \brief 应用配置，启动时解析一次并显式传递。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub telemetry_enabled: bool,
    /** \brief 静态前端目录（可选） */
    pub ui_dir: Option<PathBuf>,
    pub endpoints: Endpoints,
    pub default_provider: DefaultProviderSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("abapgen.db"),
            log_dir: PathBuf::from("logs"),
            telemetry_enabled: false,
            ui_dir: None,
            endpoints: Endpoints::default(),
            default_provider: DefaultProviderSettings::default(),
        }
    }
}

impl Settings {
    /**
     * \brief 从进程环境读取配置；未设置的项保持默认值。
     */
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 以任意键值来源构建配置，便于测试。
     */
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut settings = Settings::default();

        if let Some(path) = get("ABAPGEN_DB_PATH") {
            settings.db_path = PathBuf::from(path);
        }
        if let Some(dir) = get("ABAPGEN_LOG_DIR") {
            settings.log_dir = PathBuf::from(dir);
        }
        if let Some(flag) = get("ABAPGEN_TELEMETRY") {
            settings.telemetry_enabled = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        settings.ui_dir = get("ABAPGEN_UI_DIR").map(PathBuf::from);

        if let Some(base) = get("ABAPGEN_GROQ_BASE") {
            settings.endpoints.groq = base;
        }
        if let Some(base) = get("ABAPGEN_OPENAI_BASE") {
            settings.endpoints.openai = base;
        }
        if let Some(base) = get("ABAPGEN_ANTHROPIC_BASE") {
            settings.endpoints.anthropic = base;
        }
        if let Some(base) = get("ABAPGEN_GEMINI_BASE") {
            settings.endpoints.gemini = base;
        }

        settings.default_provider.api_key = get("GROQ_API_KEY");
        if let Some(model) = get("ABAPGEN_DEFAULT_MODEL") {
            settings.default_provider.model = model;
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_lookup_overrides() {
        let env: HashMap<&str, &str> = [
            ("ABAPGEN_DB_PATH", "/tmp/x.db"),
            ("ABAPGEN_TELEMETRY", "true"),
            ("GROQ_API_KEY", "gsk-free"),
            ("ABAPGEN_OPENAI_BASE", "http://127.0.0.1:9000/v1"),
            ("ABAPGEN_UI_DIR", " "),
        ]
        .into_iter()
        .collect();
        let settings = Settings::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(settings.db_path, PathBuf::from("/tmp/x.db"));
        assert!(settings.telemetry_enabled);
        assert_eq!(settings.default_provider.api_key.as_deref(), Some("gsk-free"));
        assert_eq!(
            settings.endpoints.base_for(ProviderName::OpenAI),
            "http://127.0.0.1:9000/v1"
        );
        assert_eq!(settings.ui_dir, None);
        assert_eq!(settings.default_provider.provider, ProviderName::Groq);
    }

    #[test]
    fn test_defaults_without_env() {
        let settings = Settings::from_lookup(|_| None);
        assert_eq!(settings, Settings::default());
    }
}
