//! Headless Agent 运行时
//!
//! 供 CLI 或其他前端调用的无界面入口：create_agent_components 按配置构建模型提供方、工具注册表
//! 与轨迹存储（启动时构建一次，多会话共享）；start_chat_session 跑交互会话，
//! execute_one_shot_task 跑单次任务。两者都返回轨迹 id 与最终回复。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, AgentEvent, AgentSettings, Command, Orchestrator, RunOutcome};
use crate::llm::{create_provider_from_config, LlmError, ModelProvider};
use crate::tools::{builtin_registry, ToolRegistry};
use crate::trajectory::{SqliteTrajectoryStore, TrajectoryRecorder, TrajectoryService};

/// 预构建的 Agent 组件，可多会话共享
#[derive(Clone)]
pub struct AgentComponents {
    pub provider: Arc<dyn ModelProvider>,
    pub tools: Arc<ToolRegistry>,
    pub recorder: Arc<dyn TrajectoryRecorder>,
    pub settings: AgentSettings,
}

impl AgentComponents {
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
        }
    }

    /// 读侧轨迹服务（list / show / delete / cleanup）
    pub fn trajectory_service(&self) -> TrajectoryService {
        TrajectoryService::new(self.recorder.clone())
    }

    fn orchestrator(
        &self,
        events: Option<mpsc::UnboundedSender<AgentEvent>>,
        cancel: CancellationToken,
    ) -> Orchestrator {
        let orchestrator = Orchestrator::new(
            self.provider.clone(),
            self.tools.clone(),
            self.recorder.clone(),
            self.settings.clone(),
        )
        .with_cancel_token(cancel);
        match events {
            Some(tx) => orchestrator.with_events(tx),
            None => orchestrator,
        }
    }
}

/// 按配置构建 Agent 组件：打开轨迹库（已完成建表）、创建并校验模型提供方、注册内置工具
///
/// 提供方配置不完整（未知 provider、缺少 API Key、校验失败）时返回 ConfigError，不会静默改用 Mock。
pub async fn create_agent_components(cfg: &AppConfig) -> Result<AgentComponents, AgentError> {
    let workspace = cfg.app.workspace();
    let workspace = workspace.canonicalize().unwrap_or(workspace);

    let db_path = cfg.trajectory.database_path();
    let store = SqliteTrajectoryStore::open(&db_path).await?;

    let provider = create_provider_from_config(&cfg.llm).map_err(|e| match e {
        LlmError::Configuration(msg) => AgentError::ConfigError(msg),
        other => AgentError::Provider(other),
    })?;
    if !provider.validate_configuration().await {
        return Err(AgentError::ConfigError(format!(
            "provider '{}' failed configuration check (API key, model and base_url)",
            provider.name()
        )));
    }
    let tools = builtin_registry(
        &workspace,
        cfg.tools.shell.allowed_commands.clone(),
        cfg.tools.tool_timeout_secs,
    );
    tracing::info!(tools = ?tools.names(), workspace = %workspace.display(), "tools registered");

    let settings = AgentSettings {
        system_prompt: Some(cfg.agent.system_prompt.clone()).filter(|p| !p.trim().is_empty()),
        model: Some(cfg.llm.model.clone()).filter(|m| !m.is_empty()),
        temperature: cfg.llm.temperature,
        max_tokens: cfg.llm.max_tokens,
        max_turn_steps: cfg.agent.max_turn_steps,
        working_directory: workspace,
    };

    Ok(AgentComponents::new(
        provider,
        Arc::new(tools),
        Arc::new(store),
        settings,
    ))
}

/// 交互会话：消费命令直到 Quit / 通道关闭 / 取消 / 模型错误
pub async fn start_chat_session(
    components: &AgentComponents,
    commands: mpsc::Receiver<Command>,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
    cancel: CancellationToken,
) -> Result<RunOutcome, AgentError> {
    let mut orchestrator = components.orchestrator(events, cancel);
    let outcome = orchestrator.run_interactive(commands).await?;
    tracing::info!(
        trajectory_id = %outcome.trajectory_id,
        status = %outcome.status,
        "chat session finished"
    );
    Ok(outcome)
}

/// 单次任务：恰好一次模型调用（及其工具调用），然后终结轨迹
pub async fn execute_one_shot_task(
    components: &AgentComponents,
    task: &str,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
    cancel: CancellationToken,
) -> Result<RunOutcome, AgentError> {
    let mut orchestrator = components.orchestrator(events, cancel);
    let outcome = orchestrator.run_one_shot(task).await?;
    tracing::info!(
        trajectory_id = %outcome.trajectory_id,
        status = %outcome.status,
        "task finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockProvider, ModelResponse};
    use crate::trajectory::TrajectoryStatus;

    fn components(provider: MockProvider) -> AgentComponents {
        AgentComponents::new(
            Arc::new(provider),
            Arc::new(ToolRegistry::new()),
            Arc::new(SqliteTrajectoryStore::open_in_memory().unwrap()),
            AgentSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_one_shot_returns_content() {
        let c = components(MockProvider::with_responses([ModelResponse::text("42")]));
        let outcome = execute_one_shot_task(&c, "answer", None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, TrajectoryStatus::Completed);
        assert_eq!(outcome.content, "42");

        let t = c
            .trajectory_service()
            .show(&outcome.trajectory_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.description, "answer");
    }

    #[tokio::test]
    async fn test_chat_session_ends_on_quit() {
        let c = components(MockProvider::new());
        let (tx, rx) = mpsc::channel(4);
        tx.send(Command::Submit("hello".into())).await.unwrap();
        tx.send(Command::Quit).await.unwrap();
        let outcome = start_chat_session(&c, rx, None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, TrajectoryStatus::Completed);
        assert_eq!(outcome.content, "Echo from Mock: hello");
    }

    #[tokio::test]
    async fn test_create_components_with_mock_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".to_string();
        cfg.app.workspace_root = Some(dir.path().to_path_buf());
        cfg.trajectory.db_path = Some(dir.path().join("db").join("t.db"));

        let c = create_agent_components(&cfg).await.unwrap();
        assert_eq!(c.provider.name(), "mock");
        assert_eq!(
            c.tools.names(),
            vec!["bash", "file_edit_tool", "list_dir", "task_done", "view_files"]
        );
        assert_eq!(c.settings.max_turn_steps, 20);
        assert!(dir.path().join("db").join("t.db").exists());
    }

    #[tokio::test]
    async fn test_create_components_rejects_unusable_provider() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.app.workspace_root = Some(dir.path().to_path_buf());
        cfg.trajectory.db_path = Some(dir.path().join("t.db"));

        cfg.llm.provider = "openai".to_string();
        cfg.llm.api_key_env = Some("WAGGLE_TEST_KEY_THAT_IS_NEVER_SET".to_string());
        let err = create_agent_components(&cfg).await.err().unwrap();
        assert!(matches!(err, AgentError::ConfigError(_)), "{err}");

        cfg.llm.provider = "nowhere".to_string();
        let err = create_agent_components(&cfg).await.err().unwrap();
        assert!(matches!(err, AgentError::ConfigError(_)), "{err}");

        std::env::set_var("WAGGLE_TEST_BAD_URL_KEY", "sk-test");
        cfg.llm.provider = "openai".to_string();
        cfg.llm.api_key_env = Some("WAGGLE_TEST_BAD_URL_KEY".to_string());
        cfg.llm.base_url = Some("not a url".to_string());
        let err = create_agent_components(&cfg).await.err().unwrap();
        assert!(matches!(err, AgentError::ConfigError(_)), "{err}");
    }
}
