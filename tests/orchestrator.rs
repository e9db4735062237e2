//! 编排循环集成测试：Mock 模型 + 脚本化工具 + 内存轨迹库

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use waggle::core::{AgentError, AgentEvent, AgentSettings, Command, Orchestrator};
use waggle::llm::{LlmError, MockProvider, ModelResponse, TokenUsage, ToolCall};
use waggle::memory::Role;
use waggle::tools::{Tool, ToolInput, ToolOutcome, ToolRegistry};
use waggle::trajectory::{
    Metadata, SearchQuery, SqliteTrajectoryStore, StepStatus, StepType, StoreError, Trajectory,
    TrajectoryRecorder, TrajectoryResult, TrajectoryStatus, TrajectoryStep,
};

/// 记录调用顺序并回显参数
struct RecordingTool {
    name: &'static str,
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Records the order of calls"
    }

    async fn execute(&self, input: ToolInput, _cancel: &CancellationToken) -> Result<ToolOutcome, String> {
        self.seen
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, input.get_str("tag").unwrap_or_default()));
        Ok(ToolOutcome::success(format!("{} ran", self.name)))
    }
}

/// 只在取消时返回
struct HangingTool;

#[async_trait]
impl Tool for HangingTool {
    fn name(&self) -> &str {
        "hang"
    }

    fn description(&self) -> &str {
        "Never finishes on its own"
    }

    async fn execute(&self, _input: ToolInput, cancel: &CancellationToken) -> Result<ToolOutcome, String> {
        cancel.cancelled().await;
        Err("interrupted".to_string())
    }
}

/// 轨迹可以创建，但步骤写入总是失败（模拟磁盘错误）
struct FailingRecorder {
    inner: SqliteTrajectoryStore,
    completed: Mutex<bool>,
}

#[async_trait]
impl TrajectoryRecorder for FailingRecorder {
    async fn start_trajectory(&self, session_id: &str, metadata: Metadata) -> Result<String, StoreError> {
        self.inner.start_trajectory(session_id, metadata).await
    }

    async fn record_step(&self, _trajectory_id: &str, _step: TrajectoryStep) -> Result<String, StoreError> {
        Err(StoreError::Task("disk full".to_string()))
    }

    async fn complete_trajectory(&self, trajectory_id: &str, result: TrajectoryResult) -> Result<(), StoreError> {
        *self.completed.lock().unwrap() = true;
        self.inner.complete_trajectory(trajectory_id, result).await
    }

    async fn get_trajectory(&self, trajectory_id: &str) -> Result<Option<Trajectory>, StoreError> {
        self.inner.get_trajectory(trajectory_id).await
    }

    async fn get_session_trajectories(&self, session_id: &str) -> Result<Vec<Trajectory>, StoreError> {
        self.inner.get_session_trajectories(session_id).await
    }

    async fn search_trajectories(&self, query: &SearchQuery) -> Result<Vec<Trajectory>, StoreError> {
        self.inner.search_trajectories(query).await
    }

    async fn delete_trajectory(&self, trajectory_id: &str) -> Result<(), StoreError> {
        self.inner.delete_trajectory(trajectory_id).await
    }
}

struct Harness {
    provider: Arc<MockProvider>,
    store: Arc<SqliteTrajectoryStore>,
    orchestrator: Orchestrator,
}

fn harness(provider: MockProvider, tools: ToolRegistry, settings: AgentSettings) -> Harness {
    let provider = Arc::new(provider);
    let store = Arc::new(SqliteTrajectoryStore::open_in_memory().unwrap());
    let orchestrator = Orchestrator::new(provider.clone(), Arc::new(tools), store.clone(), settings)
        .with_session_id("test-session");
    Harness {
        provider,
        store,
        orchestrator,
    }
}

async fn load(store: &SqliteTrajectoryStore, id: &str) -> Trajectory {
    store.get_trajectory(id).await.unwrap().unwrap()
}

fn call(id: &str, name: &str, args: &str) -> ToolCall {
    ToolCall::new(id, name, args)
}

#[tokio::test]
async fn test_session_starts_before_any_model_call() {
    let mut h = harness(MockProvider::new(), ToolRegistry::new(), AgentSettings::default());
    let id = h.orchestrator.start_session(Vec::new(), Metadata::new()).await.unwrap();

    assert_eq!(h.provider.call_count(), 0);
    let t = load(&h.store, &id).await;
    assert_eq!(t.status, TrajectoryStatus::InProgress);
    assert_eq!(t.session_id, "test-session");
    assert_eq!(t.metadata.get("provider"), Some(&serde_json::json!("mock")));

    assert!(matches!(
        h.orchestrator.start_session(Vec::new(), Metadata::new()).await,
        Err(AgentError::SessionAlreadyStarted(_))
    ));
}

#[tokio::test]
async fn test_step_without_session_is_rejected() {
    let mut h = harness(MockProvider::new(), ToolRegistry::new(), AgentSettings::default());
    assert!(matches!(h.orchestrator.step().await, Err(AgentError::SessionNotStarted)));
}

#[tokio::test]
async fn test_unknown_tool_becomes_tool_message_and_loop_continues() {
    let provider = MockProvider::with_responses([
        ModelResponse::text("").with_tool_call(call("c1", "does_not_exist", "{}")),
        ModelResponse::text("sorry, that tool is unavailable"),
    ]);
    let mut h = harness(provider, ToolRegistry::new(), AgentSettings::default());
    let id = h.orchestrator.start_session(Vec::new(), Metadata::new()).await.unwrap();

    let content = h.orchestrator.run_turn("use the tool").await.unwrap();
    assert_eq!(content, "sorry, that tool is unavailable");
    assert_eq!(h.provider.call_count(), 2);

    let tool_msg = h
        .orchestrator
        .history()
        .messages()
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(tool_msg.content.to_lowercase().contains("not found"));
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("c1"));

    // 第二次模型调用能看到工具结果
    let second = h.provider.messages_of_call(1).unwrap();
    assert_eq!(second.last().map(|m| m.role), Some(Role::Tool));

    let outcome = h
        .orchestrator
        .finalize(waggle::trajectory::TrajectoryResult::success("ok"))
        .await
        .unwrap();
    let t = load(&h.store, &id).await;
    assert_eq!(outcome.status, TrajectoryStatus::Completed);
    let tool_step = t
        .steps
        .iter()
        .find(|s| s.step_type == StepType::ToolExecution)
        .unwrap();
    assert_eq!(tool_step.status, StepStatus::Failed);
    assert_eq!(tool_step.name, "does_not_exist");
}

#[tokio::test]
async fn test_provider_error_fails_trajectory_without_further_steps() {
    let provider = MockProvider::new();
    provider.push_error(LlmError::Auth("invalid api key".into()));
    let mut h = harness(provider, ToolRegistry::new(), AgentSettings::default());

    let outcome = h.orchestrator.run_one_shot("list the files").await.unwrap();
    assert_eq!(outcome.status, TrajectoryStatus::Failed);
    assert!(outcome.error.as_deref().unwrap().contains("invalid api key"));
    assert_eq!(h.provider.call_count(), 1);

    let t = load(&h.store, &outcome.trajectory_id).await;
    assert_eq!(t.status, TrajectoryStatus::Failed);
    let result = t.result.unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("invalid api key"));
    let last = t.steps.last().unwrap();
    assert_eq!(last.step_type, StepType::LlmCall);
    assert_eq!(last.status, StepStatus::Failed);
    assert!(t.steps.iter().all(|s| s.step_type != StepType::ToolExecution));
}

#[tokio::test]
async fn test_cancel_during_tool_marks_step_and_trajectory_cancelled() {
    let provider = MockProvider::with_responses([
        ModelResponse::text("").with_tool_call(call("c1", "hang", "{}")),
    ]);
    let mut tools = ToolRegistry::new();
    tools.register(HangingTool);
    let cancel = CancellationToken::new();
    let mut h = harness(provider, tools, AgentSettings::default());
    h.orchestrator = h.orchestrator.with_cancel_token(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = h.orchestrator.run_one_shot("hang please").await.unwrap();
    assert_eq!(outcome.status, TrajectoryStatus::Cancelled);

    let t = load(&h.store, &outcome.trajectory_id).await;
    assert_eq!(t.status, TrajectoryStatus::Cancelled);
    assert!(t.steps.iter().all(|s| s.status != StepStatus::InProgress));
    let tool_step = t.steps.last().unwrap();
    assert_eq!(tool_step.step_type, StepType::ToolExecution);
    assert_eq!(tool_step.status, StepStatus::Failed);
    assert_eq!(tool_step.error.as_deref(), Some("Cancelled"));
}

#[tokio::test]
async fn test_cancel_during_model_call_fails_llm_step() {
    let provider = MockProvider::new().with_delay(Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let mut h = harness(provider, ToolRegistry::new(), AgentSettings::default());
    h.orchestrator = h.orchestrator.with_cancel_token(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let outcome = h.orchestrator.run_one_shot("think slowly").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.status, TrajectoryStatus::Cancelled);

    let t = load(&h.store, &outcome.trajectory_id).await;
    assert_eq!(t.status, TrajectoryStatus::Cancelled);
    assert!(t.result.unwrap().cancelled);
    let shape: Vec<(StepType, StepStatus)> = t.steps.iter().map(|s| (s.step_type, s.status)).collect();
    assert_eq!(
        shape,
        vec![
            (StepType::UserInput, StepStatus::Completed),
            (StepType::LlmCall, StepStatus::Failed),
        ]
    );
    assert_eq!(t.steps[1].error.as_deref(), Some("Cancelled"));
}

#[tokio::test]
async fn test_storage_error_propagates_and_leaves_trajectory_open() {
    let recorder = Arc::new(FailingRecorder {
        inner: SqliteTrajectoryStore::open_in_memory().unwrap(),
        completed: Mutex::new(false),
    });
    let provider = Arc::new(MockProvider::new());
    let mut orchestrator = Orchestrator::new(
        provider.clone(),
        Arc::new(ToolRegistry::new()),
        recorder.clone(),
        AgentSettings::default(),
    );

    let err = orchestrator.run_one_shot("write something").await.unwrap_err();
    assert!(matches!(err, AgentError::Storage(_)));
    assert!(err.to_string().contains("disk full"));
    assert!(!*recorder.completed.lock().unwrap());
    assert_eq!(provider.call_count(), 0);

    let id = orchestrator.trajectory_id().unwrap().to_string();
    let t = recorder.get_trajectory(&id).await.unwrap().unwrap();
    assert_eq!(t.status, TrajectoryStatus::InProgress);
    assert!(t.result.is_none());
    assert!(t.end_time.is_none());
}

#[tokio::test]
async fn test_empty_tool_call_id_is_synthesized() {
    let provider = MockProvider::with_responses([
        ModelResponse::text("").with_tool_call(ToolCall::new("", "missing_tool", "{}"))
    ]);
    let mut h = harness(provider, ToolRegistry::new(), AgentSettings::default());

    let outcome = h.orchestrator.run_one_shot("call a tool").await.unwrap();
    assert_eq!(outcome.status, TrajectoryStatus::Completed);

    let messages = h.orchestrator.history().messages();
    let assistant = messages.iter().find(|m| m.role == Role::Assistant).unwrap();
    let synthesized = assistant.tool_calls[0].id.clone();
    assert!(!synthesized.is_empty());
    let tool_msg = messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some(synthesized.as_str()));

    let t = load(&h.store, &outcome.trajectory_id).await;
    let tool_step = t
        .steps
        .iter()
        .find(|s| s.step_type == StepType::ToolExecution)
        .unwrap();
    assert_eq!(tool_step.metadata["tool_call_id"], serde_json::json!(synthesized));
    assert_eq!(tool_step.status, StepStatus::Failed);
}

#[tokio::test]
async fn test_step_report_counts_failed_tools() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(RecordingTool {
        name: "alpha",
        seen: seen.clone(),
    });
    let provider = MockProvider::with_responses([ModelResponse::text("")
        .with_tool_call(call("c1", "alpha", "{}"))
        .with_tool_call(call("c2", "missing", "{}"))]);
    let mut h = harness(provider, tools, AgentSettings::default());
    h.orchestrator.start_session(Vec::new(), Metadata::new()).await.unwrap();
    h.orchestrator.submit_user_input("mixed").await.unwrap();

    let report = h.orchestrator.step().await.unwrap();
    assert_eq!(report.tool_calls, 2);
    assert_eq!(report.failed_tools, 1);
    assert!(report.wants_follow_up());
}

#[tokio::test]
async fn test_duplicate_tool_call_ids_are_made_unique() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(RecordingTool {
        name: "alpha",
        seen: seen.clone(),
    });
    let provider = MockProvider::with_responses([ModelResponse::text("")
        .with_tool_call(call("dup", "alpha", r#"{"tag":"1"}"#))
        .with_tool_call(call("dup", "alpha", r#"{"tag":"2"}"#))]);
    let mut h = harness(provider, tools, AgentSettings::default());

    let outcome = h.orchestrator.run_one_shot("twice").await.unwrap();
    assert_eq!(outcome.status, TrajectoryStatus::Completed);
    assert_eq!(seen.lock().unwrap().len(), 2);

    let ids: Vec<String> = h
        .orchestrator
        .history()
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.clone())
        .collect();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], "dup");
    assert_ne!(ids[1], "dup");
}

#[tokio::test]
async fn test_tool_calls_run_in_emission_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(RecordingTool {
        name: "alpha",
        seen: seen.clone(),
    });
    tools.register(RecordingTool {
        name: "beta",
        seen: seen.clone(),
    });
    let provider = MockProvider::with_responses([ModelResponse::text("working")
        .with_tool_call(call("c1", "beta", r#"{"tag":"1"}"#))
        .with_tool_call(call("c2", "alpha", r#"{"tag":"2"}"#))
        .with_tool_call(call("c3", "beta", r#"{"tag":"3"}"#))
        .with_usage(TokenUsage::new(12, 3))]);
    let mut h = harness(provider, tools, AgentSettings::default());

    let outcome = h.orchestrator.run_one_shot("go").await.unwrap();
    assert_eq!(outcome.status, TrajectoryStatus::Completed);
    assert_eq!(outcome.content, "working");
    assert_eq!(*seen.lock().unwrap(), vec!["beta:1", "alpha:2", "beta:3"]);
    // 单次任务只调用一次模型
    assert_eq!(h.provider.call_count(), 1);

    let t = load(&h.store, &outcome.trajectory_id).await;
    let numbers: Vec<u32> = t.steps.iter().map(|s| s.step_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    let tool_ids: Vec<_> = t
        .steps
        .iter()
        .filter(|s| s.step_type == StepType::ToolExecution)
        .map(|s| s.metadata["tool_call_id"].clone())
        .collect();
    assert_eq!(tool_ids, vec!["c1", "c2", "c3"]);

    let stats = t.result.unwrap().statistics;
    assert_eq!(stats.llm_calls, 1);
    assert_eq!(stats.tool_executions, 3);
    assert_eq!(stats.failed_steps, 0);
    assert_eq!(stats.token_usage.map(|u| u.total_tokens), Some(15));

    let tool_messages: Vec<_> = h
        .orchestrator
        .history()
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.clone())
        .collect();
    assert_eq!(tool_messages, vec!["c1", "c2", "c3"]);
}

#[tokio::test]
async fn test_system_prompt_is_prepended_once() {
    let settings = AgentSettings {
        system_prompt: Some("be brief".into()),
        ..AgentSettings::default()
    };
    let mut h = harness(MockProvider::new(), ToolRegistry::new(), settings);
    h.orchestrator.run_one_shot("hi").await.unwrap();

    let sent = h.provider.messages_of_call(0).unwrap();
    assert_eq!(sent[0].role, Role::System);
    assert_eq!(sent[0].content, "be brief");
    assert_eq!(sent.iter().filter(|m| m.role == Role::System).count(), 1);
}

#[tokio::test]
async fn test_interactive_session_handles_clear_and_quit() {
    let mut h = harness(MockProvider::new(), ToolRegistry::new(), AgentSettings::default());
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    h.orchestrator = h.orchestrator.with_events(ev_tx);

    let (tx, rx) = mpsc::channel(8);
    tx.send(Command::Submit("first".into())).await.unwrap();
    tx.send(Command::Clear).await.unwrap();
    tx.send(Command::Submit("second".into())).await.unwrap();
    tx.send(Command::Quit).await.unwrap();

    let outcome = h.orchestrator.run_interactive(rx).await.unwrap();
    assert_eq!(outcome.status, TrajectoryStatus::Completed);
    assert_eq!(outcome.content, "Echo from Mock: second");

    // clear 之后，第二次请求看不到第一轮
    let second = h.provider.messages_of_call(1).unwrap();
    assert!(second.iter().all(|m| m.content != "first"));

    let t = load(&h.store, &outcome.trajectory_id).await;
    assert_eq!(t.description, "Interactive Chat");
    assert!(t
        .steps
        .iter()
        .any(|s| s.step_type == StepType::SystemOperation && s.name == "clear_history"));

    let mut turns = 0;
    let mut finished = false;
    while let Ok(ev) = ev_rx.try_recv() {
        match ev {
            AgentEvent::TurnFinished { .. } => turns += 1,
            AgentEvent::TrajectoryFinished { status, .. } => {
                finished = true;
                assert_eq!(status, "Completed");
            }
            _ => {}
        }
    }
    assert_eq!(turns, 2);
    assert!(finished);
}

#[tokio::test]
async fn test_interactive_turn_stops_at_step_limit() {
    let provider = MockProvider::new();
    for i in 0..5 {
        provider.push_response(
            ModelResponse::text("").with_tool_call(call(&format!("c{i}"), "missing", "{}")),
        );
    }
    let settings = AgentSettings {
        max_turn_steps: 3,
        ..AgentSettings::default()
    };
    let mut h = harness(provider, ToolRegistry::new(), settings);
    h.orchestrator.start_session(Vec::new(), Metadata::new()).await.unwrap();

    h.orchestrator.run_turn("loop forever").await.unwrap();
    assert_eq!(h.provider.call_count(), 3);
}

#[tokio::test]
async fn test_interactive_provider_error_ends_session_failed() {
    let provider = MockProvider::new();
    provider.push_error(LlmError::Network("connection reset".into()));
    let mut h = harness(provider, ToolRegistry::new(), AgentSettings::default());

    let (tx, rx) = mpsc::channel(4);
    tx.send(Command::Submit("hello".into())).await.unwrap();
    tx.send(Command::Submit("never processed".into())).await.unwrap();

    let outcome = h.orchestrator.run_interactive(rx).await.unwrap();
    assert_eq!(outcome.status, TrajectoryStatus::Failed);
    assert!(outcome.error.unwrap().contains("connection reset"));
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn test_interactive_cancel_while_idle() {
    let cancel = CancellationToken::new();
    let mut h = harness(MockProvider::new(), ToolRegistry::new(), AgentSettings::default());
    h.orchestrator = h.orchestrator.with_cancel_token(cancel.clone());

    let (_tx, rx) = mpsc::channel::<Command>(1);
    cancel.cancel();
    let outcome = h.orchestrator.run_interactive(rx).await.unwrap();
    assert_eq!(outcome.status, TrajectoryStatus::Cancelled);
    let t = load(&h.store, &outcome.trajectory_id).await;
    assert!(t.result.unwrap().cancelled);
}
