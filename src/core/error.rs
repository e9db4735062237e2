//! Agent 错误类型
//!
//! 只有 Provider 与 Cancelled 会终止编排循环；工具层错误（ToolNotFound / ToolExecutionFailed 等）
//! 在分发层被转换为失败的工具结果，供模型观察并自我纠正。

use thiserror::Error;

use crate::llm::LlmError;
use crate::trajectory::StoreError;

/// 编排过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 模型调用失败：轨迹终结为 Failed，错误原样返回给调用方
    #[error("Model provider error: {0}")]
    Provider(#[from] LlmError),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool {tool} failed: {message}")]
    ToolExecutionFailed { tool: String, message: String },

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Invalid input for tool {0}")]
    InvalidToolInput(String),

    /// 轨迹存储 I/O 失败：直接向上传播，轨迹可能停留在 InProgress
    #[error("Trajectory storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Session not started")]
    SessionNotStarted,

    #[error("Session already started: {0}")]
    SessionAlreadyStarted(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),
}

impl AgentError {
    /// 是否会终止编排循环
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Provider(_) | AgentError::Cancelled | AgentError::Storage(_)
        )
    }
}
