//! Waggle - Rust 智能体编排与轨迹记录
//!
//! 模块划分：
//! - **agent**: 无头 Agent 运行时（交互会话 / 单次任务入口）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排主循环、错误类型、过程事件、会话监管
//! - **llm**: 模型提供方抽象与实现（OpenAI 兼容 / Mock / 重试包装）
//! - **memory**: 对话历史
//! - **observability**: tracing 初始化
//! - **tools**: Tool trait、注册表与分发、内置工具（bash / list_dir / view_files）
//! - **trajectory**: 轨迹模型、SQLite 存储、查询与读侧服务

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
pub mod trajectory;

pub use agent::{create_agent_components, execute_one_shot_task, start_chat_session, AgentComponents};
pub use core::{AgentError, AgentEvent, Command, Orchestrator, RunOutcome};
