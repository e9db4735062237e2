//! Waggle - Rust 智能体编排与轨迹记录
//!
//! 入口：解析命令行、初始化日志、加载配置，然后按子命令运行交互会话、单次任务或轨迹管理。
//! 轨迹管理子命令只打开轨迹库，不需要模型提供方。

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use waggle::config::{load_config, AppConfig};
use waggle::core::{AgentEvent, Command, SessionSupervisor};
use waggle::trajectory::service::{format_detail, format_list};
use waggle::trajectory::{SqliteTrajectoryStore, TrajectoryService};
use waggle::{create_agent_components, execute_one_shot_task, start_chat_session, AgentComponents, RunOutcome};

#[derive(Parser, Debug)]
#[command(name = "waggle")]
#[command(about = "Cancellable agent loop with SQLite trajectory recording", long_about = None)]
#[command(version)]
struct Cli {
    /// 配置文件路径（默认 config/default.toml + 环境变量）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 输出 debug 日志
    #[arg(short, long, global = true)]
    verbose: bool,

    /// 省略时进入交互会话
    #[command(subcommand)]
    command: Option<Commands>,
}

/// 覆盖 [llm] 配置
#[derive(Args, Debug, Clone, Default, PartialEq)]
struct LlmOverrides {
    /// 模型名，如 gpt-4o / deepseek-chat
    #[arg(long)]
    model: Option<String>,

    /// 提供方：openai / deepseek / doubao / mock
    #[arg(long)]
    provider: Option<String>,
}

impl LlmOverrides {
    /// 切换 provider 时丢弃原配置中属于旧后端的 base_url 与 api_key_env
    fn apply(&self, cfg: &mut AppConfig) {
        if let Some(provider) = &self.provider {
            if !provider.eq_ignore_ascii_case(&cfg.llm.provider) {
                cfg.llm.base_url = None;
                cfg.llm.api_key_env = None;
            }
            cfg.llm.provider = provider.clone();
        }
        if let Some(model) = &self.model {
            cfg.llm.model = model.clone();
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 交互会话：exit / quit 退出，clear 清空历史，Ctrl+C 取消
    Chat {
        #[command(flatten)]
        llm: LlmOverrides,
    },
    /// 单次任务：一次模型调用及其工具调用
    Run {
        /// 任务描述
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,

        #[command(flatten)]
        llm: LlmOverrides,

        /// 把最终回复写入文件
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 轨迹管理
    #[command(alias = "traj")]
    Trajectories {
        #[command(subcommand)]
        action: TrajectoryCommand,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
enum TrajectoryCommand {
    /// 最近的轨迹
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// 状态过滤：InProgress / Completed / Failed / Cancelled
        #[arg(short, long)]
        status: Option<String>,
    },
    /// 轨迹详情（含步骤）
    Show { id: String },
    /// 删除一条轨迹
    Delete {
        id: String,

        /// 跳过确认
        #[arg(short, long)]
        yes: bool,
    },
    /// 删除 N 天前的轨迹
    Cleanup {
        #[arg(short, long, default_value_t = 30)]
        days: u32,

        /// 跳过确认
        #[arg(short, long)]
        yes: bool,
    },
}

/// 在终端询问 y/N
async fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{prompt} (y/N): ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
    reader.read_line(&mut line).await?;
    Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// 打印过程事件
fn spawn_event_printer(mut rx: mpsc::UnboundedReceiver<AgentEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            match ev {
                AgentEvent::TrajectoryStarted { trajectory_id } => {
                    println!("[轨迹] {trajectory_id}");
                }
                AgentEvent::Thinking { step } => println!("[思考] 第 {step} 步..."),
                AgentEvent::AssistantMessage { text } => println!("\n{text}\n"),
                AgentEvent::ToolCall { tool, arguments, .. } => {
                    println!("[工具] {tool} {arguments}");
                }
                AgentEvent::Observation {
                    tool,
                    success,
                    preview,
                    ..
                } => {
                    let mark = if success { "成功" } else { "失败" };
                    println!("[观察] {tool} {mark}: {preview}");
                }
                AgentEvent::TokenUsage { usage, cumulative } => {
                    tracing::debug!(
                        total = usage.total_tokens,
                        cumulative = cumulative.total_tokens,
                        "token usage"
                    );
                }
                AgentEvent::TurnFinished { .. } => {
                    print!("> ");
                    let _ = std::io::stdout().flush();
                }
                AgentEvent::Error { text } => eprintln!("[错误] {text}"),
                AgentEvent::TrajectoryFinished {
                    trajectory_id,
                    status,
                } => println!("[轨迹] {trajectory_id} 结束: {status}"),
            }
        }
    })
}

async fn run_chat(components: &AgentComponents, supervisor: &SessionSupervisor) -> anyhow::Result<()> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(16);
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let printer = spawn_event_printer(ev_rx);

    println!("交互模式：输入 exit 或 quit 退出，clear 清空历史，Ctrl+C 取消");
    print!("> ");
    std::io::stdout().flush()?;

    // 会话结束后单独停掉输入读取，不影响会话令牌
    let reader_cancel = supervisor.child_token();
    let reader_token = reader_cancel.clone();
    let reader = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = reader_token.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    let Some(cmd) = Command::parse(&line) else {
                        continue;
                    };
                    let quit = cmd == Command::Quit;
                    if cmd_tx.send(cmd).await.is_err() || quit {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });

    let outcome = start_chat_session(components, cmd_rx, Some(ev_tx), supervisor.cancel_token()).await;
    reader_cancel.cancel();
    let _ = reader.await;
    let _ = printer.await;

    let outcome = outcome.context("chat session failed")?;
    if let Some(error) = outcome.error {
        eprintln!("会话结束: {error}");
    }
    Ok(())
}

async fn run_task(
    components: &AgentComponents,
    supervisor: &SessionSupervisor,
    task: &str,
) -> anyhow::Result<RunOutcome> {
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let printer = spawn_event_printer(ev_rx);
    let outcome = execute_one_shot_task(components, task, Some(ev_tx), supervisor.cancel_token()).await;
    let _ = printer.await;

    let outcome = outcome.context("task failed")?;
    match &outcome.error {
        Some(error) => bail!("任务失败 ({}): {}", outcome.trajectory_id, error),
        None => Ok(outcome),
    }
}

async fn run_trajectories(cfg: &AppConfig, action: TrajectoryCommand) -> anyhow::Result<()> {
    let db_path = cfg.trajectory.database_path();
    let store = SqliteTrajectoryStore::open(&db_path)
        .await
        .with_context(|| format!("failed to open trajectory store {}", db_path.display()))?;
    let service = TrajectoryService::new(Arc::new(store));

    match action {
        TrajectoryCommand::List { limit, status } => {
            let trajectories = service.list(limit, status.as_deref()).await?;
            print!("{}", format_list(&trajectories));
        }
        TrajectoryCommand::Show { id } => match service.show(&id).await? {
            Some(t) => print!("{}", format_detail(&t)),
            None => bail!("未找到轨迹: {id}"),
        },
        TrajectoryCommand::Delete { id, yes } => {
            let Some(t) = service.show(&id).await? else {
                bail!("未找到轨迹: {id}");
            };
            println!("轨迹: {} - {}", t.id, t.description);
            if !yes && !confirm("确定要删除此轨迹吗？").await? {
                println!("操作已取消");
                return Ok(());
            }
            service.delete(&id).await?;
            println!("轨迹已删除: {id}");
        }
        TrajectoryCommand::Cleanup { days, yes } => {
            let old = service.find_older_than(days).await?;
            if old.is_empty() {
                println!("没有找到 {days} 天前的轨迹记录");
                return Ok(());
            }
            println!("找到 {} 条 {days} 天前的轨迹记录", old.len());
            if !yes && !confirm("确定要删除这些轨迹吗？").await? {
                println!("操作已取消");
                return Ok(());
            }
            let deleted = service.cleanup_older_than(days).await?;
            println!("已删除 {deleted} 条轨迹记录");
        }
    }
    Ok(())
}

async fn build_components(cfg: &AppConfig) -> anyhow::Result<AgentComponents> {
    create_agent_components(cfg)
        .await
        .context("Failed to create agent")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    waggle::observability::init(cli.verbose);

    let mut cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "config load failed, using defaults");
        AppConfig::default()
    });

    let supervisor = SessionSupervisor::new();
    match cli.command.unwrap_or(Commands::Chat {
        llm: LlmOverrides::default(),
    }) {
        Commands::Chat { llm } => {
            llm.apply(&mut cfg);
            let components = build_components(&cfg).await?;
            supervisor.cancel_on_ctrl_c();
            run_chat(&components, &supervisor).await
        }
        Commands::Run { task, llm, output } => {
            let task = task.join(" ");
            let task = task.trim();
            if task.is_empty() {
                bail!("缺少任务描述");
            }
            llm.apply(&mut cfg);
            let components = build_components(&cfg).await?;
            supervisor.cancel_on_ctrl_c();
            let outcome = run_task(&components, &supervisor, task).await?;
            if let Some(path) = output {
                tokio::fs::write(&path, &outcome.content)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("结果已保存到 {}", path.display());
            }
            Ok(())
        }
        Commands::Trajectories { action } => run_trajectories(&cfg, action).await,
    }
}
