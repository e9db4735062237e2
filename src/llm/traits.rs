//! 模型提供方抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / 重试包装）实现 ModelProvider：generate_response 接收完整消息历史、
//! 调用选项与取消令牌；重试策略属于提供方自身，编排器从不重试。

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::{LlmOptions, ModelResponse};
use crate::memory::Message;

/// 模型调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Request timed out")]
    Timeout,

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Malformed response: {0}")]
    InvalidResponse(String),

    #[error("Provider misconfigured: {0}")]
    Configuration(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl LlmError {
    /// 网络抖动、限流、超时与 5xx 可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Network(_) | LlmError::RateLimited { .. } | LlmError::Timeout => true,
            LlmError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// 模型提供方 trait
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// 提供方名称（用于日志与轨迹元数据）
    fn name(&self) -> &str;

    /// 发送消息历史并返回响应；必须响应 cancel
    async fn generate_response(
        &self,
        messages: &[Message],
        options: &LlmOptions,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, LlmError>;

    /// 支持的模型列表
    fn supported_models(&self) -> Vec<String>;

    /// 检查配置（API Key、端点等）是否可用
    async fn validate_configuration(&self) -> bool;
}
