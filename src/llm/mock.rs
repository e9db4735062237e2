//! Mock 模型提供方（用于测试与离线运行，无需 API）
//!
//! 按脚本顺序返回预置响应或错误；脚本耗尽后回显最后一条 User 消息。
//! 每次调用的消息快照都会被记录，便于断言请求内容。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::{LlmError, LlmOptions, ModelProvider, ModelResponse, TokenUsage};
use crate::memory::{Message, Role};

/// 脚本化 Mock 提供方
#[derive(Debug, Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<Result<ModelResponse, LlmError>>>,
    calls: Mutex<Vec<(Vec<Message>, LlmOptions)>>,
    delay: Option<Duration>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按顺序返回给定响应
    pub fn with_responses(responses: impl IntoIterator<Item = ModelResponse>) -> Self {
        let provider = Self::new();
        for r in responses {
            provider.push_response(r);
        }
        provider
    }

    /// 每次调用前等待（可被取消），用于模拟慢模型
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_response(&self, response: ModelResponse) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(response));
        }
    }

    pub fn push_error(&self, error: LlmError) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(error));
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// 第 n 次调用收到的消息
    pub fn messages_of_call(&self, n: usize) -> Option<Vec<Message>> {
        self.calls.lock().ok()?.get(n).map(|(m, _)| m.clone())
    }

    /// 第 n 次调用收到的选项
    pub fn options_of_call(&self, n: usize) -> Option<LlmOptions> {
        self.calls.lock().ok()?.get(n).map(|(_, o)| o.clone())
    }

    fn echo(messages: &[Message]) -> ModelResponse {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let content = format!("Echo from Mock: {last_user}");
        let completion = content.split_whitespace().count() as u64;
        ModelResponse::text(content).with_usage(TokenUsage::new(messages.len() as u64, completion))
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate_response(
        &self,
        messages: &[Message],
        options: &LlmOptions,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((messages.to_vec(), options.clone()));
        }

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(reply) => reply,
            None => Ok(Self::echo(messages)),
        }
    }

    fn supported_models(&self) -> Vec<String> {
        vec!["mock".to_string()]
    }

    async fn validate_configuration(&self) -> bool {
        true
    }
}
