//! 对话历史
//!
//! 仅追加的消息序列，顺序与真实事件顺序一致；Tool 消息必须携带 tool_call_id / tool_name，
//! 其它角色不得携带。消息本身不落库，只有它们对轨迹步骤的影响会被记录。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::llm::ToolCall;
use crate::trajectory::now_utc;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// 仅 Tool 消息：对应的调用 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// 仅 Tool 消息：工具名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// 仅 Assistant 消息：本轮发出的工具调用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            tool_call_id: None,
            tool_name: None,
            tool_calls: Vec::new(),
            timestamp: now_utc(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content.into())
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    /// 带工具调用的 assistant 消息
    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(Role::Assistant, content.into());
        msg.tool_calls = tool_calls;
        msg
    }

    pub fn tool(
        content: impl Into<String>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(Role::Tool, content.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg.tool_name = Some(tool_name.into());
        msg
    }

    /// 校验角色与附加字段是否匹配
    pub fn validate(&self) -> Result<(), AgentError> {
        let has_tool_fields = self.tool_call_id.is_some() || self.tool_name.is_some();
        match self.role {
            Role::Tool if self.tool_call_id.as_deref().map_or(true, str::is_empty) => Err(
                AgentError::InvalidMessage("tool message without tool_call_id".to_string()),
            ),
            Role::Tool => Ok(()),
            _ if has_tool_fields => Err(AgentError::InvalidMessage(format!(
                "{:?} message must not carry tool_call_id/tool_name",
                self.role
            ))),
            Role::Assistant => Ok(()),
            _ if !self.tool_calls.is_empty() => Err(AgentError::InvalidMessage(format!(
                "{:?} message must not carry tool calls",
                self.role
            ))),
            _ => Ok(()),
        }
    }
}

/// 消息历史：仅追加；clear 用于交互模式下开启新话题（保留 system 消息）
#[derive(Clone, Debug, Default)]
pub struct MessageHistory {
    messages: Vec<Message>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: Message) -> Result<(), AgentError> {
        msg.validate()?;
        self.messages.push(msg);
        Ok(())
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) -> Result<(), AgentError> {
        for msg in messages {
            self.push(msg)?;
        }
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// 丢弃除 system 以外的全部消息
    pub fn clear(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_message_requires_call_id() {
        let mut history = MessageHistory::new();
        let mut bad = Message::tool("out", "", "bash");
        assert!(history.push(bad.clone()).is_err());
        bad.tool_call_id = Some("call_1".into());
        assert!(history.push(bad).is_ok());
    }

    #[test]
    fn test_non_tool_message_rejects_tool_fields() {
        let mut msg = Message::user("hi");
        msg.tool_name = Some("bash".into());
        assert!(matches!(msg.validate(), Err(AgentError::InvalidMessage(_))));

        let mut sys = Message::system("rules");
        sys.tool_calls.push(ToolCall::new("c1", "bash", "{}"));
        assert!(sys.validate().is_err());

        let asst = Message::assistant_with_calls("", vec![ToolCall::new("c1", "bash", "{}")]);
        assert!(asst.validate().is_ok());
    }

    #[test]
    fn test_history_keeps_order_and_clear_keeps_system() {
        let mut history = MessageHistory::new();
        history
            .extend([
                Message::system("sys"),
                Message::user("q1"),
                Message::assistant("a1"),
                Message::tool("r", "c1", "bash"),
            ])
            .unwrap();
        let roles: Vec<Role> = history.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::Tool]);

        history.clear();
        assert_eq!(history.len(), 1);
        assert_eq!(history.messages()[0].role, Role::System);
    }
}
