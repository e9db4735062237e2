//! 工具层：Tool trait、注册表与分发、内置工具（bash / list_dir / view_files / file_edit_tool / task_done）

pub mod edit;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;
pub mod shell;
pub mod task_done;
pub mod types;

use std::path::Path;
use std::time::Duration;

pub use edit::FileEditTool;
pub use filesystem::{ListDirTool, SafeFs, ViewFilesTool};
pub use registry::{Tool, ToolRegistry, DEFAULT_TOOL_TIMEOUT};
pub use schema::parameters_schema_for;
pub use shell::ShellTool;
pub use task_done::TaskDoneTool;
pub use types::{ToolInput, ToolOutcome};

/// 注册全部内置工具，文件类工具以 workspace 为沙箱根
pub fn builtin_registry(
    workspace: impl AsRef<Path>,
    allowed_commands: Vec<String>,
    timeout_secs: u64,
) -> ToolRegistry {
    let workspace = workspace.as_ref();
    // 分发层超时略长于工具自身超时，让工具先给出具体的超时信息
    let mut registry =
        ToolRegistry::new().with_timeout(Duration::from_secs(timeout_secs.saturating_add(5)));
    registry.register(ShellTool::new(allowed_commands, timeout_secs));
    registry.register(ListDirTool::new(workspace));
    registry.register(ViewFilesTool::new(workspace));
    registry.register(FileEditTool::new(workspace));
    registry.register(TaskDoneTool::new());
    registry
}
