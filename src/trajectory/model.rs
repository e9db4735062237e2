//! 轨迹数据模型
//!
//! Trajectory（一次完整执行）拥有有序的 TrajectoryStep 列表；TrajectoryResult 在终结时写入一次。
//! 所有时间均为 UTC，并截断到微秒，保证写入 SQLite 再读回时逐字段一致。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;

/// 字符串键的元数据（值为任意 JSON）
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// 当前 UTC 时间（微秒精度，与存储格式一致）
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// 解析枚举字符串失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

/// 为「存储用字符串 <-> 枚举」生成 as_str / Display / FromStr（FromStr 大小写不敏感）
macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s.eq_ignore_ascii_case($text) {
                        return Ok($name::$variant);
                    }
                )+
                Err(ParseEnumError {
                    kind: $kind,
                    value: s.to_string(),
                })
            }
        }
    };
}

/// 轨迹状态：InProgress 之后的三种状态均为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrajectoryStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

string_enum!(TrajectoryStatus, "trajectory status", {
    InProgress => "InProgress",
    Completed => "Completed",
    Failed => "Failed",
    Cancelled => "Cancelled",
});

impl TrajectoryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TrajectoryStatus::InProgress)
    }
}

/// 步骤类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepType {
    #[serde(rename = "LLMCall")]
    LlmCall,
    ToolExecution,
    UserInput,
    SystemOperation,
}

string_enum!(StepType, "step type", {
    LlmCall => "LLMCall",
    ToolExecution => "ToolExecution",
    UserInput => "UserInput",
    SystemOperation => "SystemOperation",
});

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    InProgress,
    Completed,
    Failed,
    Skipped,
}

string_enum!(StepStatus, "step status", {
    InProgress => "InProgress",
    Completed => "Completed",
    Failed => "Failed",
    Skipped => "Skipped",
});

/// 单个执行步骤（一次模型调用或一次工具执行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    /// 为空时由存储层生成 UUID
    pub id: String,
    /// 调用方分配，同一轨迹内单调递增
    pub step_number: u32,
    pub step_type: StepType,
    pub name: String,
    pub description: String,
    pub status: StepStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// 序列化后的输入（通常为 JSON）
    pub input_data: String,
    /// 序列化后的输出
    pub output_data: String,
    pub error: Option<String>,
    pub metadata: Metadata,
}

impl TrajectoryStep {
    /// 新建进行中的步骤，start_time = now
    pub fn begin(step_number: u32, step_type: StepType, name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            step_number,
            step_type,
            name: name.into(),
            description: String::new(),
            status: StepStatus::InProgress,
            start_time: now_utc(),
            end_time: None,
            input_data: String::new(),
            output_data: String::new(),
            error: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input_data = input.into();
        self
    }

    /// 标记成功结束
    pub fn complete(&mut self, output: impl Into<String>) {
        self.output_data = output.into();
        self.status = StepStatus::Completed;
        self.end_time = Some(now_utc());
    }

    /// 标记失败结束（取消也走这里，error 中注明）
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.status = StepStatus::Failed;
        self.end_time = Some(now_utc());
    }

    /// 执行耗时（毫秒）；未结束时为 0
    pub fn execution_time_ms(&self) -> i64 {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
            .unwrap_or(0)
    }
}

/// Token 统计之外的执行统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryStatistics {
    pub total_steps: u32,
    pub successful_steps: u32,
    pub failed_steps: u32,
    pub llm_calls: u32,
    pub tool_executions: u32,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
}

impl TrajectoryStatistics {
    /// 累加一个已结束的步骤
    pub fn observe(&mut self, step: &TrajectoryStep) {
        self.total_steps += 1;
        match step.status {
            StepStatus::Completed => self.successful_steps += 1,
            StepStatus::Failed => self.failed_steps += 1,
            StepStatus::InProgress | StepStatus::Skipped => {}
        }
        match step.step_type {
            StepType::LlmCall => self.llm_calls += 1,
            StepType::ToolExecution => self.tool_executions += 1,
            StepType::UserInput | StepType::SystemOperation => {}
        }
    }

    pub fn add_tokens(&mut self, usage: &TokenUsage) {
        self.token_usage
            .get_or_insert_with(TokenUsage::default)
            .accumulate(usage);
    }
}

/// 轨迹最终结果（终结时写入一次）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryResult {
    pub success: bool,
    /// 外部取消导致的终结
    #[serde(default)]
    pub cancelled: bool,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub statistics: TrajectoryStatistics,
}

impl TrajectoryResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            success: false,
            cancelled: true,
            message: message.into(),
            error: Some("Cancelled".to_string()),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_statistics(mut self, statistics: TrajectoryStatistics) -> Self {
        self.statistics = statistics;
        self
    }

    /// 终结后的轨迹状态：取消 > 成功 > 失败
    pub fn terminal_status(&self) -> TrajectoryStatus {
        if self.cancelled {
            TrajectoryStatus::Cancelled
        } else if self.success {
            TrajectoryStatus::Completed
        } else {
            TrajectoryStatus::Failed
        }
    }
}

/// 一次端到端执行的完整记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub id: String,
    pub session_id: String,
    pub status: TrajectoryStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub description: String,
    pub metadata: Metadata,
    pub result: Option<TrajectoryResult>,
    /// 按 step_number 升序
    pub steps: Vec<TrajectoryStep>,
}

impl Trajectory {
    /// 总耗时（毫秒）；未结束时为 0
    pub fn total_execution_time_ms(&self) -> i64 {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
            .unwrap_or(0)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!("completed".parse::<TrajectoryStatus>(), Ok(TrajectoryStatus::Completed));
        assert_eq!("InProgress".parse::<TrajectoryStatus>(), Ok(TrajectoryStatus::InProgress));
        assert!("done".parse::<TrajectoryStatus>().is_err());
        assert_eq!("llmcall".parse::<StepType>(), Ok(StepType::LlmCall));
        assert_eq!(StepType::LlmCall.to_string(), "LLMCall");
    }

    #[test]
    fn test_terminal_status_derivation() {
        assert_eq!(TrajectoryResult::success("ok").terminal_status(), TrajectoryStatus::Completed);
        assert_eq!(
            TrajectoryResult::failure("boom", "boom").terminal_status(),
            TrajectoryStatus::Failed
        );
        assert_eq!(TrajectoryResult::cancelled("stop").terminal_status(), TrajectoryStatus::Cancelled);
        assert!(!TrajectoryStatus::InProgress.is_terminal());
        assert!(TrajectoryStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_statistics_observe() {
        let mut stats = TrajectoryStatistics::default();
        let mut llm = TrajectoryStep::begin(1, StepType::LlmCall, "model");
        llm.complete("hi");
        let mut tool = TrajectoryStep::begin(2, StepType::ToolExecution, "bash");
        tool.fail("exit 1");
        stats.observe(&llm);
        stats.observe(&tool);
        stats.add_tokens(&TokenUsage::new(10, 5));
        stats.add_tokens(&TokenUsage::new(1, 1));

        assert_eq!(stats.total_steps, 2);
        assert_eq!(stats.successful_steps, 1);
        assert_eq!(stats.failed_steps, 1);
        assert_eq!(stats.llm_calls, 1);
        assert_eq!(stats.tool_executions, 1);
        assert_eq!(stats.token_usage.map(|u| u.total_tokens), Some(17));
    }

    #[test]
    fn test_step_execution_time_non_negative() {
        let mut step = TrajectoryStep::begin(1, StepType::ToolExecution, "bash");
        assert_eq!(step.execution_time_ms(), 0);
        step.complete("");
        assert!(step.end_time.is_some());
        assert!(step.execution_time_ms() >= 0);
    }
}
