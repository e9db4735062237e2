//! 编排过程事件：供 CLI / 前端展示思考、工具调用、观察与回复

use serde::Serialize;

use crate::llm::TokenUsage;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 轨迹已创建
    TrajectoryStarted { trajectory_id: String },
    /// 正在调用模型（第几步）
    Thinking { step: u32 },
    /// 模型回复的文本内容
    AssistantMessage { text: String },
    /// 调用工具
    ToolCall {
        call_id: String,
        tool: String,
        arguments: String,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        call_id: String,
        tool: String,
        success: bool,
        preview: String,
    },
    /// Token 使用统计（本次调用 + 累计）
    TokenUsage { usage: TokenUsage, cumulative: TokenUsage },
    /// 一个用户回合结束（交互模式），content 为最后一次模型回复
    TurnFinished { content: String },
    /// 错误
    Error { text: String },
    /// 轨迹已终结
    TrajectoryFinished { trajectory_id: String, status: String },
}
