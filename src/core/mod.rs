//! 核心编排层：错误类型、过程事件、会话监管、主控循环

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod session_supervisor;

pub use error::AgentError;
pub use events::AgentEvent;
pub use orchestrator::{
    AgentSettings, Command, Orchestrator, RunOutcome, StepReport, DEFAULT_MAX_TURN_STEPS,
};
pub use session_supervisor::SessionSupervisor;
