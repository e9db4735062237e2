//! 工具注册表
//!
//! 启动时构建一次，之后只读；通过引用（Arc）传入编排器，不存在全局工具表。
//! 所有工具实现 Tool trait，dispatch 负责查找、校验、执行，并保证不会有错误越过注册表边界。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::llm::{ToolCall, ToolDefinition};
use crate::tools::{executor, ToolInput, ToolOutcome};

/// 默认单次工具执行超时
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、输入校验、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型调用时使用）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认为无参数对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行前的参数校验；返回 false 时不会执行
    fn validate_input(&self, _input: &ToolInput) -> bool {
        true
    }

    /// 执行工具。Ok 中可以是失败的 ToolOutcome（工具自行报告失败），Err 表示执行异常；
    /// 实现需在 cancel 触发后尽快返回
    async fn execute(&self, input: ToolInput, cancel: &CancellationToken) -> Result<ToolOutcome, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self {
            tools: HashMap::new(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置单次执行超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 注册工具；同名工具会被替换
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_shared(Arc::new(tool));
    }

    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous instance replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// 已注册工具名（按字典序）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 供模型请求使用的工具描述（按名称排序，保证请求可复现）
    pub fn describe_all(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// 分发一次工具调用。未知工具、校验失败、执行错误、panic、超时与取消全部转为失败的 ToolOutcome
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        working_directory: &Path,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        executor::dispatch(self, call, working_directory, cancel).await
    }
}
