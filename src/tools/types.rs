//! 工具输入与执行结果
//!
//! ToolInput 由模型给出的 JSON 参数解析而来（原文保留在 raw 中）；
//! ToolOutcome 是分发层的统一返回值，工具失败不再以 Err 形式越过注册表边界。

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::ToolCall;

/// 工具输入
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInput {
    /// 模型给出的原始参数字符串
    pub raw: String,
    /// 解析后的参数；参数不是 JSON 对象时为空
    pub parameters: Map<String, Value>,
    pub working_directory: PathBuf,
}

impl ToolInput {
    pub fn new(parameters: Value, working_directory: impl AsRef<Path>) -> Self {
        let raw = parameters.to_string();
        let parameters = match parameters {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            raw,
            parameters,
            working_directory: working_directory.as_ref().to_path_buf(),
        }
    }

    /// 从工具调用解析；空参数视为 `{}`
    pub fn from_call(call: &ToolCall, working_directory: impl AsRef<Path>) -> Self {
        let trimmed = call.arguments.trim();
        let parameters = if trimmed.is_empty() {
            Map::new()
        } else {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    tracing::debug!(tool = %call.name, "tool arguments are not a JSON object");
                    Map::new()
                }
            }
        };
        Self {
            raw: call.arguments.clone(),
            parameters,
            working_directory: working_directory.as_ref().to_path_buf(),
        }
    }

    /// 取单个参数并反序列化；缺失或类型不符返回 None
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.parameters
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// 整体反序列化为参数结构体
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.parameters.clone()))
    }
}

/// 工具执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// 回填给模型的 Tool 消息正文
    pub fn to_message_content(&self) -> String {
        if self.success {
            match &self.data {
                Some(Value::String(s)) => format!("Tool succeeded: {}\n{}", self.message, s),
                Some(data) => format!("Tool succeeded: {}\n{}", self.message, data),
                None => format!("Tool succeeded: {}", self.message),
            }
        } else {
            format!(
                "Tool failed: {}",
                self.error.as_deref().unwrap_or(self.message.as_str())
            )
        }
    }
}
