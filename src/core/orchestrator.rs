//! Agent 编排器：主控循环
//!
//! 一条轨迹由一个 Orchestrator 驱动：start_session 先创建 InProgress 轨迹，随后每次 step()
//! 把消息历史与工具 schema 发给模型、追加 assistant 消息，并按模型给出的顺序逐个分发工具调用
//! （从不并行），每次模型调用与每次工具分发各记录一个步骤。步骤只在到达最终状态时落库，
//! 因此库中不会残留 InProgress 步骤。
//!
//! 只有模型错误与取消会终止循环；工具层失败转为 Tool 消息，让模型自行纠正。编排器从不重试。

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, AgentEvent};
use crate::llm::{LlmError, LlmOptions, ModelProvider, ModelResponse, ToolCall};
use crate::memory::{Message, MessageHistory, Role};
use crate::tools::{ToolOutcome, ToolRegistry};
use crate::trajectory::{
    Metadata, StepType, TrajectoryRecorder, TrajectoryResult, TrajectoryStatistics,
    TrajectoryStatus, TrajectoryStep,
};

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;
/// 默认单回合最大 step 数，防止死循环
pub const DEFAULT_MAX_TURN_STEPS: usize = 20;

/// 交互模式下发往编排器的用户命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 提交用户输入，触发一个回合
    Submit(String),
    /// 清空对话历史（保留 system 消息）
    Clear,
    /// 结束会话
    Quit,
}

impl Command {
    /// 解析一行输入：exit / quit 结束，clear 清空，空行忽略，其余作为用户输入
    pub fn parse(line: &str) -> Option<Command> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.to_lowercase().as_str() {
            "exit" | "quit" => Some(Command::Quit),
            "clear" => Some(Command::Clear),
            _ => Some(Command::Submit(trimmed.to_string())),
        }
    }
}

/// 编排参数
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// 交互模式下一个回合内 step() 的上限
    pub max_turn_steps: usize,
    /// 工具的工作目录
    pub working_directory: PathBuf,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            system_prompt: None,
            model: None,
            temperature: None,
            max_tokens: None,
            max_turn_steps: DEFAULT_MAX_TURN_STEPS,
            working_directory: PathBuf::from("."),
        }
    }
}

/// 单次 step() 的结果
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// 模型回复文本
    pub content: String,
    /// 本次分发的工具调用数
    pub tool_calls: usize,
    /// 其中失败的数量
    pub failed_tools: usize,
}

impl StepReport {
    /// 模型发出了工具调用，需要再调用一次模型以观察结果
    pub fn wants_follow_up(&self) -> bool {
        self.tool_calls > 0
    }
}

/// 一次运行的最终结果（供入口函数返回给调用方）
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub trajectory_id: String,
    pub status: TrajectoryStatus,
    /// 最后一次模型回复
    pub content: String,
    pub error: Option<String>,
}

/// 编排器：持有一条轨迹的全部运行时状态
pub struct Orchestrator {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    recorder: Arc<dyn TrajectoryRecorder>,
    settings: AgentSettings,
    session_id: String,
    history: MessageHistory,
    trajectory_id: Option<String>,
    next_step: u32,
    stats: TrajectoryStatistics,
    last_content: String,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        recorder: Arc<dyn TrajectoryRecorder>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            provider,
            tools,
            recorder,
            settings,
            session_id: uuid::Uuid::new_v4().to_string(),
            history: MessageHistory::new(),
            trajectory_id: None,
            next_step: 1,
            stats: TrajectoryStatistics::default(),
            last_content: String::new(),
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// 外部取消令牌（Ctrl+C 等）
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 过程事件通道
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn trajectory_id(&self) -> Option<&str> {
        self.trajectory_id.as_deref()
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    pub fn statistics(&self) -> &TrajectoryStatistics {
        &self.stats
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn send_event(&self, ev: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(ev);
        }
    }

    fn require_trajectory(&self) -> Result<String, AgentError> {
        self.trajectory_id.clone().ok_or(AgentError::SessionNotStarted)
    }

    fn take_step_number(&mut self) -> u32 {
        let n = self.next_step;
        self.next_step += 1;
        n
    }

    /// 持久化一个已结束的步骤并计入统计
    async fn persist_step(&mut self, trajectory_id: &str, step: TrajectoryStep) -> Result<(), AgentError> {
        self.stats.observe(&step);
        tracing::debug!(
            trajectory_id = %trajectory_id,
            step = step.step_number,
            step_type = %step.step_type,
            status = %step.status,
            "step recorded"
        );
        self.recorder.record_step(trajectory_id, step).await?;
        Ok(())
    }

    /// 创建轨迹（在任何模型调用之前）。配置了系统提示词且初始消息中没有 system 时自动置顶
    pub async fn start_session(
        &mut self,
        initial_messages: Vec<Message>,
        mut metadata: Metadata,
    ) -> Result<String, AgentError> {
        if let Some(id) = &self.trajectory_id {
            return Err(AgentError::SessionAlreadyStarted(id.clone()));
        }

        let has_system = initial_messages.iter().any(|m| m.role == Role::System);
        if let Some(prompt) = self.settings.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            if !has_system {
                self.history.push(Message::system(prompt))?;
            }
        }
        self.history.extend(initial_messages)?;

        metadata
            .entry("provider".to_string())
            .or_insert_with(|| serde_json::json!(self.provider.name()));
        if let Some(model) = &self.settings.model {
            metadata
                .entry("model".to_string())
                .or_insert_with(|| serde_json::json!(model));
        }

        let id = self.recorder.start_trajectory(&self.session_id, metadata).await?;
        tracing::info!(session_id = %self.session_id, trajectory_id = %id, "session started");
        self.trajectory_id = Some(id.clone());
        self.send_event(AgentEvent::TrajectoryStarted {
            trajectory_id: id.clone(),
        });
        Ok(id)
    }

    /// 追加用户输入，并记录一个 UserInput 步骤
    pub async fn submit_user_input(&mut self, text: &str) -> Result<(), AgentError> {
        let trajectory_id = self.require_trajectory()?;
        self.history.push(Message::user(text))?;
        let n = self.take_step_number();
        let mut step = TrajectoryStep::begin(n, StepType::UserInput, "user_input").with_input(text);
        step.complete("");
        self.persist_step(&trajectory_id, step).await
    }

    fn llm_options(&self) -> LlmOptions {
        LlmOptions {
            model: self.settings.model.clone(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            tools: self.tools.describe_all(),
        }
    }

    /// 一次「调用模型 -> 依次分发工具调用」
    pub async fn step(&mut self) -> Result<StepReport, AgentError> {
        let trajectory_id = self.require_trajectory()?;
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let options = self.llm_options();
        let n = self.take_step_number();
        let request_summary = serde_json::json!({
            "model": options.model,
            "message_count": self.history.len(),
            "tools": options.tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "last_message": self.history.last(),
        });
        let mut llm_step = TrajectoryStep::begin(n, StepType::LlmCall, self.provider.name())
            .with_description("Model call")
            .with_input(request_summary.to_string());

        self.send_event(AgentEvent::Thinking { step: n });
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LlmError::Cancelled),
            r = self.provider.generate_response(self.history.messages(), &options, &self.cancel) => r,
        };

        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                let cancelled = e == LlmError::Cancelled || self.cancel.is_cancelled();
                llm_step.fail(if cancelled { "Cancelled".to_string() } else { e.to_string() });
                self.persist_step(&trajectory_id, llm_step).await?;
                if cancelled {
                    return Err(AgentError::Cancelled);
                }
                tracing::warn!(trajectory_id = %trajectory_id, error = %e, "model call failed");
                self.send_event(AgentEvent::Error { text: e.to_string() });
                return Err(AgentError::Provider(e));
            }
        };

        normalize_tool_call_ids(&mut response.tool_calls, n);
        self.complete_llm_step(&trajectory_id, llm_step, &response).await?;

        self.last_content = response.content.clone();
        if !response.content.is_empty() {
            self.send_event(AgentEvent::AssistantMessage {
                text: response.content.clone(),
            });
        }
        self.history.push(Message::assistant_with_calls(
            response.content.clone(),
            response.tool_calls.clone(),
        ))?;

        let mut failed_tools = 0;
        for call in &response.tool_calls {
            if !self.dispatch_tool(&trajectory_id, call).await? {
                failed_tools += 1;
            }
        }

        Ok(StepReport {
            content: response.content,
            tool_calls: response.tool_calls.len(),
            failed_tools,
        })
    }

    async fn complete_llm_step(
        &mut self,
        trajectory_id: &str,
        mut step: TrajectoryStep,
        response: &ModelResponse,
    ) -> Result<(), AgentError> {
        let output = serde_json::json!({
            "content": response.content,
            "tool_calls": response.tool_calls,
        });
        step.complete(output.to_string());
        step.metadata
            .insert("finish_reason".to_string(), serde_json::json!(response.finish_reason));
        if !response.model.is_empty() {
            step.metadata
                .insert("model".to_string(), serde_json::json!(response.model));
        }
        if let Some(usage) = &response.usage {
            step.metadata
                .insert("token_usage".to_string(), serde_json::json!(usage));
            self.stats.add_tokens(usage);
            if let Some(cumulative) = self.stats.token_usage {
                self.send_event(AgentEvent::TokenUsage {
                    usage: *usage,
                    cumulative,
                });
            }
        }
        self.persist_step(trajectory_id, step).await
    }

    /// 分发一个工具调用；返回工具是否成功。取消时记录失败步骤并返回 Cancelled
    async fn dispatch_tool(&mut self, trajectory_id: &str, call: &ToolCall) -> Result<bool, AgentError> {
        let n = self.take_step_number();
        let mut step = TrajectoryStep::begin(n, StepType::ToolExecution, call.name.clone())
            .with_description(format!("Tool call {}", call.id))
            .with_input(call.arguments.clone());
        step.metadata
            .insert("tool_call_id".to_string(), serde_json::json!(call.id));

        self.send_event(AgentEvent::ToolCall {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        let outcome = if self.cancel.is_cancelled() {
            ToolOutcome::failure("Tool execution cancelled", AgentError::Cancelled.to_string())
        } else {
            self.tools
                .dispatch(call, &self.settings.working_directory, &self.cancel)
                .await
        };
        let cancelled = self.cancel.is_cancelled();

        step.output_data = serde_json::to_string(&outcome).unwrap_or_default();
        if cancelled {
            step.fail(AgentError::Cancelled.to_string());
        } else if outcome.success {
            let output = std::mem::take(&mut step.output_data);
            step.complete(output);
        } else {
            step.fail(
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| outcome.message.clone()),
            );
        }
        self.persist_step(trajectory_id, step).await?;

        let content = outcome.to_message_content();
        self.send_event(AgentEvent::Observation {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            success: outcome.success,
            preview: preview(&content),
        });
        self.history
            .push(Message::tool(content, call.id.clone(), call.name.clone()))?;

        if cancelled {
            return Err(AgentError::Cancelled);
        }
        Ok(outcome.success)
    }

    /// 交互回合：追加用户输入后反复 step()，直到模型不再发出工具调用或达到上限
    pub async fn run_turn(&mut self, user_input: &str) -> Result<String, AgentError> {
        self.submit_user_input(user_input).await?;
        let max_steps = self.settings.max_turn_steps.max(1);
        let mut content = String::new();
        for i in 0..max_steps {
            let report = self.step().await?;
            tracing::debug!(
                step = i + 1,
                tool_calls = report.tool_calls,
                failed_tools = report.failed_tools,
                "turn step finished"
            );
            content = report.content.clone();
            if !report.wants_follow_up() {
                break;
            }
            if i + 1 == max_steps {
                tracing::warn!(max_steps, "turn stopped at step limit while tools were still requested");
            }
        }
        Ok(content)
    }

    /// 清空对话历史并记录一个 SystemOperation 步骤
    pub async fn clear_history(&mut self) -> Result<(), AgentError> {
        let trajectory_id = self.require_trajectory()?;
        let before = self.history.len();
        self.history.clear();
        let n = self.take_step_number();
        let mut step = TrajectoryStep::begin(n, StepType::SystemOperation, "clear_history")
            .with_description("Conversation history cleared");
        step.complete(format!("removed {} messages", before - self.history.len()));
        self.persist_step(&trajectory_id, step).await
    }

    /// 终结轨迹（统计自动写入结果）
    pub async fn finalize(&mut self, result: TrajectoryResult) -> Result<RunOutcome, AgentError> {
        let trajectory_id = self.require_trajectory()?;
        let status = result.terminal_status();
        let error = result.error.clone();
        let result = result.with_statistics(self.stats.clone());
        self.recorder.complete_trajectory(&trajectory_id, result).await?;
        self.send_event(AgentEvent::TrajectoryFinished {
            trajectory_id: trajectory_id.clone(),
            status: status.to_string(),
        });
        Ok(RunOutcome {
            trajectory_id,
            status,
            content: self.last_content.clone(),
            error,
        })
    }

    /// 按循环的终止条件终结轨迹；存储错误直接返回，不再尝试写入
    async fn finalize_from(
        &mut self,
        outcome: Result<(), AgentError>,
        success_message: &str,
        data: serde_json::Value,
    ) -> Result<RunOutcome, AgentError> {
        let result = match outcome {
            Ok(()) => TrajectoryResult::success(success_message).with_data(data),
            Err(AgentError::Cancelled) => TrajectoryResult::cancelled("Cancelled by user"),
            Err(AgentError::Storage(e)) => return Err(AgentError::Storage(e)),
            Err(e) => {
                tracing::warn!(error = %e, "agent loop aborted");
                TrajectoryResult::failure(e.to_string(), e.to_string())
            }
        };
        self.finalize(result).await
    }

    /// 单次任务：恰好一次 step()，然后终结
    pub async fn run_one_shot(&mut self, task: &str) -> Result<RunOutcome, AgentError> {
        if self.trajectory_id.is_none() {
            let mut metadata = Metadata::new();
            metadata.insert("description".to_string(), serde_json::json!(task));
            metadata.insert("mode".to_string(), serde_json::json!("one_shot"));
            self.start_session(Vec::new(), metadata).await?;
        }

        let outcome = match self.submit_user_input(task).await {
            Ok(()) => self.step().await.map(|_| ()),
            Err(e) => Err(e),
        };
        let data = serde_json::json!(self.last_content);
        self.finalize_from(outcome, "Task completed", data).await
    }

    /// 交互会话：消费命令直到 Quit、通道关闭、取消或模型错误
    pub async fn run_interactive(
        &mut self,
        mut commands: mpsc::Receiver<Command>,
    ) -> Result<RunOutcome, AgentError> {
        if self.trajectory_id.is_none() {
            let mut metadata = Metadata::new();
            metadata.insert("description".to_string(), serde_json::json!("Interactive Chat"));
            metadata.insert("mode".to_string(), serde_json::json!("chat"));
            self.start_session(Vec::new(), metadata).await?;
        }

        let cancel = self.cancel.clone();
        let mut turns = 0u32;
        let outcome: Result<(), AgentError> = loop {
            let cmd = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(AgentError::Cancelled),
                cmd = commands.recv() => cmd,
            };
            match cmd {
                None | Some(Command::Quit) => break Ok(()),
                Some(Command::Clear) => {
                    if let Err(e) = self.clear_history().await {
                        break Err(e);
                    }
                }
                Some(Command::Submit(text)) => match self.run_turn(&text).await {
                    Ok(content) => {
                        turns += 1;
                        self.send_event(AgentEvent::TurnFinished { content });
                    }
                    Err(e) if e.is_fatal() => break Err(e),
                    Err(e) => {
                        tracing::warn!(error = %e, "turn failed");
                        self.send_event(AgentEvent::Error { text: e.to_string() });
                        self.send_event(AgentEvent::TurnFinished {
                            content: String::new(),
                        });
                    }
                },
            }
        };

        let data = serde_json::json!({ "turns": turns });
        self.finalize_from(outcome, "Chat session completed", data).await
    }
}

/// 空或重复的调用 ID 改写为 `call_{step}_{index}`，同一条 assistant 消息内保持唯一
fn normalize_tool_call_ids(calls: &mut [ToolCall], step_number: u32) {
    let mut seen = HashSet::new();
    for (i, call) in calls.iter_mut().enumerate() {
        if call.id.trim().is_empty() || seen.contains(&call.id) {
            let mut id = format!("call_{step_number}_{i}");
            while seen.contains(&id) {
                id.push('_');
            }
            tracing::debug!(tool = %call.name, original = %call.id, id = %id, "tool call id rewritten");
            call.id = id;
        }
        seen.insert(call.id.clone());
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!("{}...", s.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}
