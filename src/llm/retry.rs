//! 重试包装：对可重试错误（网络、限流、超时、5xx）做指数退避
//!
//! 重试属于模型提供方自身，编排器只看到最终结果。退避等待可被取消。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::llm::{LlmError, LlmOptions, ModelProvider, ModelResponse};
use crate::memory::Message;

/// 重试参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 首次之外的最大重试次数
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次重试前的等待（attempt 从 1 开始）；限流时至少等待服务端给出的时长
    pub fn backoff_for(&self, attempt: u32, error: &LlmError) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let base = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64) as u64;
        let ms = match error {
            LlmError::RateLimited { retry_after_ms } => base.max(*retry_after_ms),
            _ => base,
        };
        Duration::from_millis(ms)
    }
}

/// 带重试的提供方包装
pub struct RetryingProvider {
    inner: Arc<dyn ModelProvider>,
    config: RetryConfig,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn ModelProvider>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl ModelProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate_response(
        &self,
        messages: &[Message],
        options: &LlmOptions,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.generate_response(messages, options, cancel).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let wait = self.config.backoff_for(attempt, &e);
                    tracing::warn!(
                        provider = %self.inner.name(),
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "model call failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn supported_models(&self) -> Vec<String> {
        self.inner.supported_models()
    }

    async fn validate_configuration(&self) -> bool {
        self.inner.validate_configuration().await
    }
}
