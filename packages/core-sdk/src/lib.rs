pub mod config;
pub mod db;
pub mod error;
pub mod generation;
pub mod llm;
pub mod manager;
pub mod models;
pub mod prompts;
pub mod sanitize;
pub mod server;
pub mod telemetry;
pub mod validate;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::db;
    pub use crate::error::ProviderApiError;
    pub use crate::generation::{generate_blocking, stream_generation, GenerationEvent};
    pub use crate::llm::{self, create_client, ProviderClient};
    pub use crate::manager::{ProviderManager, ProviderStore, ResolvedProvider};
    pub use crate::models;
    pub use crate::prompts::{PromptRequest, PromptTask};
    pub use crate::sanitize::sanitize_json_response;
    pub use crate::server;
    pub use crate::telemetry;
    pub use crate::validate::{validate_response, ParsedModelResponse, ValidationReport};
}
