//! bash 工具：在工作目录下执行 shell 命令
//!
//! 禁止 rm -rf、mkfs、sudo 等危险子串；配置了白名单时只允许白名单内的命令名（首词）。
//! 通过 sh -c / cmd /C 执行，带超时；取消或超时时子进程随 future 一起被杀掉。

use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::tools::schema::parameters_schema_for;
use crate::tools::{Tool, ToolInput, ToolOutcome};

/// 禁止的命令子串（即使命令名在白名单中也不允许）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    "sudo ",
    "shutdown",
    "reboot",
    ":(){ :|:& };:", // fork bomb
];

/// 输出最多保留的字符数
const MAX_OUTPUT_CHARS: usize = 16_000;

#[derive(Debug, Deserialize, JsonSchema)]
struct BashArgs {
    /// 要执行的 shell 命令
    command: String,
    /// 本次执行的超时秒数（不超过工具配置的上限）
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// Shell 工具
pub struct ShellTool {
    allowed_commands: HashSet<String>,
    timeout_secs: u64,
}

impl ShellTool {
    /// allowed_commands 为空表示不限制命令名，只做危险子串检查
    pub fn new(allowed_commands: Vec<String>, timeout_secs: u64) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            timeout_secs,
        }
    }

    /// 只取第一个 token 作为命令名
    fn command_name(raw: &str) -> &str {
        raw.split_whitespace().next().unwrap_or("")
    }

    fn check_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        if let Some(forbidden) = FORBIDDEN_SUBSTR.iter().find(|f| raw_lower.contains(*f)) {
            return Err(format!("Forbidden pattern: {}", forbidden.trim()));
        }
        let name = Self::command_name(&raw_lower);
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.is_empty() || self.allowed_commands.contains(name) {
            Ok(())
        } else {
            Err(format!("Command '{}' not in allowlist", name))
        }
    }
}

fn truncate_output(s: &str) -> String {
    if s.chars().count() > MAX_OUTPUT_CHARS {
        let head: String = s.chars().take(MAX_OUTPUT_CHARS).collect();
        format!("{head}\n... (output truncated)")
    } else {
        s.to_string()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command in the working directory and return its stdout, stderr and exit code. Destructive commands are blocked."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<BashArgs>()
    }

    fn validate_input(&self, input: &ToolInput) -> bool {
        input
            .get_str("command")
            .map_or(false, |c| !c.trim().is_empty())
    }

    async fn execute(&self, input: ToolInput, cancel: &CancellationToken) -> Result<ToolOutcome, String> {
        let args: BashArgs = input.parse().map_err(|e| format!("Invalid arguments: {e}"))?;
        let command = args.command.trim();
        if let Err(reason) = self.check_allowed(command) {
            return Ok(ToolOutcome::failure(
                format!("Command blocked by policy: {command}"),
                reason,
            ));
        }
        if !input.working_directory.is_dir() {
            return Ok(ToolOutcome::failure(
                "Working directory does not exist",
                input.working_directory.display().to_string(),
            ));
        }

        let timeout_secs = args
            .timeout_secs
            .map_or(self.timeout_secs, |t| t.clamp(1, self.timeout_secs));
        tracing::info!(command = %command, timeout_secs, "bash tool execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&input.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| format!("Spawn failed: {e}"))?;
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(ToolOutcome::failure("Command cancelled", "Cancelled"));
            }
            r = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()) => {
                r.map_err(|_| format!("Command timed out after {timeout_secs}s"))?
                    .map_err(|e| format!("Execution failed: {e}"))?
            }
        };

        let stdout = truncate_output(&String::from_utf8_lossy(&output.stdout));
        let stderr = truncate_output(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code();
        let data = serde_json::json!({
            "command": command,
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        });

        if output.status.success() {
            Ok(ToolOutcome::success("Command completed").with_data(data))
        } else {
            let error = format!(
                "Exit code {}: {}",
                exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr.trim()
            );
            Ok(ToolOutcome::failure("Command failed", error).with_data(data))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(command: &str, dir: &std::path::Path) -> ToolInput {
        ToolInput::new(serde_json::json!({ "command": command }), dir)
    }

    #[test]
    fn test_policy() {
        let open = ShellTool::new(vec![], 5);
        assert!(open.check_allowed("echo hi").is_ok());
        assert!(open.check_allowed("rm -rf /").is_err());
        assert!(open.check_allowed("   ").is_err());

        let strict = ShellTool::new(vec!["ls".into(), "Echo".into()], 5);
        assert!(strict.check_allowed("echo hi").is_ok());
        assert!(strict.check_allowed("cat /etc/passwd").is_err());
    }

    #[test]
    fn test_validate_requires_command() {
        let tool = ShellTool::new(vec![], 5);
        let dir = std::env::temp_dir();
        assert!(tool.validate_input(&input("ls", &dir)));
        assert!(!tool.validate_input(&input(" ", &dir)));
        assert!(!tool.validate_input(&ToolInput::new(serde_json::json!({}), &dir)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let tool = ShellTool::new(vec![], 5);
        let outcome = tool
            .execute(input("ls", dir.path()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success);
        let stdout = outcome.data.unwrap()["stdout"].as_str().unwrap_or_default().to_string();
        assert!(stdout.contains("marker.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_reported_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ShellTool::new(vec![], 5);
        let outcome = tool
            .execute(input("exit 3", dir.path()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().starts_with("Exit code 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_stops_command() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ShellTool::new(vec![], 30);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let outcome = tool.execute(input("sleep 10", dir.path()), &cancel).await.unwrap();
        assert!(!outcome.success);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
