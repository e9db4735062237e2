//! LLM 层：提供方抽象与实现（OpenAI 兼容 / Mock）及重试包装

pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmSection;

pub use mock::MockProvider;
pub use openai::OpenAiProvider;
pub use retry::{RetryConfig, RetryingProvider};
pub use traits::{LlmError, ModelProvider};
pub use types::{LlmOptions, ModelResponse, TokenUsage, ToolCall, ToolDefinition};

pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// 已知后端的默认端点与 API Key 环境变量
struct ProviderDefaults {
    base_url: &'static str,
    key_envs: &'static [&'static str],
    default_model: Option<&'static str>,
    extra_models: &'static [&'static str],
}

fn provider_defaults(provider: &str) -> Option<ProviderDefaults> {
    match provider {
        "openai" => Some(ProviderDefaults {
            base_url: "https://api.openai.com/v1",
            key_envs: &["OPENAI_API_KEY"],
            default_model: None,
            extra_models: &["gpt-4o", "gpt-4o-mini"],
        }),
        "deepseek" => Some(ProviderDefaults {
            base_url: "https://api.deepseek.com/v1",
            key_envs: &["DEEPSEEK_API_KEY"],
            default_model: Some(DEEPSEEK_CHAT),
            extra_models: &[DEEPSEEK_CHAT, DEEPSEEK_REASONER],
        }),
        "doubao" => Some(ProviderDefaults {
            base_url: "https://ark.cn-beijing.volces.com/api/v3",
            key_envs: &["DOUBAO_API_KEY", "ARK_API_KEY"],
            default_model: None,
            extra_models: &[],
        }),
        _ => None,
    }
}

/// 根据 [llm] 配置创建提供方（已套上重试包装）
///
/// 只有 provider = "mock" 时才使用 MockProvider；未知 provider 或找不到 API Key 返回
/// `LlmError::Configuration`。deepseek 在仍使用默认 OpenAI 模型名时改用 deepseek-chat。
pub fn create_provider_from_config(cfg: &LlmSection) -> Result<Arc<dyn ModelProvider>, LlmError> {
    let provider = cfg.provider.trim().to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM");
        return Ok(Arc::new(MockProvider::new()));
    }

    let defaults = provider_defaults(&provider).ok_or_else(|| {
        LlmError::Configuration(format!(
            "unknown provider '{}' (expected openai, deepseek, doubao or mock)",
            cfg.provider
        ))
    })?;

    let key_envs: Vec<&str> = match &cfg.api_key_env {
        Some(var) => vec![var.as_str()],
        None => defaults.key_envs.to_vec(),
    };
    let api_key = key_envs
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            LlmError::Configuration(format!(
                "no API key for {provider}: set {}",
                key_envs.join(" or ")
            ))
        })?;

    let model = match defaults.default_model {
        Some(m) if cfg.model.is_empty() || cfg.model.starts_with("gpt-") => m.to_string(),
        _ => cfg.model.clone(),
    };
    if model.is_empty() {
        return Err(LlmError::Configuration(format!("no model configured for {provider}")));
    }
    let base_url = cfg.base_url.as_deref().unwrap_or(defaults.base_url);

    let inner = OpenAiProvider::new(
        provider.clone(),
        base_url,
        Some(api_key),
        &model,
        Duration::from_secs(cfg.request_timeout_secs.max(1)),
    )?
    .with_supported_models(defaults.extra_models.iter().map(|m| m.to_string()));
    tracing::info!(provider = %provider, model = %model, base_url = %base_url, "Using OpenAI-compatible LLM");

    Ok(Arc::new(RetryingProvider::new(Arc::new(inner), cfg.retry.clone())))
}
