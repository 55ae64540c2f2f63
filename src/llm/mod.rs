//! 推理层：服务抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、重试策略、prompt 模板

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod prompts;
pub mod retry;
pub mod traits;

use std::sync::Arc;

pub use deepseek::{create_deepseek_reasoner, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::MockReasoner;
pub use openai::OpenAiReasoner;
pub use retry::{retry_async, RetryConfig};
pub use traits::{extract_json, LlmError, ReasoningRequest, ReasoningService, ReasoningTask};

use crate::config::AppConfig;

/// 推理后端种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    DeepSeek,
    OpenAi,
    Mock,
}

/// 显式配置的 provider 优先；未指定或不认识时按 DeepSeek > OpenAI > Mock 依次取有 Key 的后端
pub fn select_backend(provider: &str, has_deepseek_key: bool, has_openai_key: bool) -> Backend {
    match provider.trim().to_lowercase().as_str() {
        "mock" => Backend::Mock,
        "openai" if has_openai_key => Backend::OpenAi,
        // DeepSeek 兼容端点也接受 OPENAI_API_KEY
        "deepseek" if has_deepseek_key || has_openai_key => Backend::DeepSeek,
        "openai" | "deepseek" => Backend::Mock,
        _ if has_deepseek_key => Backend::DeepSeek,
        _ if has_openai_key => Backend::OpenAi,
        _ => Backend::Mock,
    }
}

/// 按配置与环境变量创建推理服务；没有可用 Key 时退回离线 Mock
pub fn create_reasoner_from_config(cfg: &AppConfig) -> Arc<dyn ReasoningService> {
    let openai_key = std::env::var("OPENAI_API_KEY").ok();
    let backend = select_backend(
        &cfg.llm.provider,
        std::env::var("DEEPSEEK_API_KEY").is_ok(),
        openai_key.is_some(),
    );

    match backend {
        Backend::DeepSeek => {
            let reasoner = create_deepseek_reasoner(cfg.llm.model.as_deref());
            tracing::info!("Using DeepSeek reasoner ({})", reasoner.model());
            Arc::new(reasoner)
        }
        Backend::OpenAi => {
            let model = cfg.llm.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            tracing::info!("Using OpenAI reasoner ({})", model);
            Arc::new(OpenAiReasoner::new(cfg.llm.base_url.as_deref(), &model, openai_key.as_deref()))
        }
        Backend::Mock if cfg.llm.provider.eq_ignore_ascii_case("mock") => {
            tracing::info!("Using offline mock reasoner");
            Arc::new(MockReasoner::new())
        }
        Backend::Mock => {
            tracing::warn!(provider = %cfg.llm.provider, "No API key for provider, using offline mock reasoner");
            Arc::new(MockReasoner::new())
        }
    }
}
