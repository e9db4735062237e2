//! 工具分发执行
//!
//! 查找 -> 校验 -> 在超时与取消下执行（panic 被捕获）；任何失败都映射为失败的 ToolOutcome，
//! 错误文本来自 AgentError。每次调用输出一条结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::time::Instant;

use futures_util::FutureExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::ToolCall;
use crate::tools::{ToolInput, ToolOutcome, ToolRegistry};

/// 审计日志中参数预览的最大字符数
const ARGS_PREVIEW_CHARS: usize = 200;

pub(crate) async fn dispatch(
    registry: &ToolRegistry,
    call: &ToolCall,
    working_directory: &Path,
    cancel: &CancellationToken,
) -> ToolOutcome {
    let start = Instant::now();
    let (outcome, label) = run(registry, call, working_directory, cancel).await;

    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": call.name,
        "call_id": call.id,
        "ok": outcome.success,
        "outcome": label,
        "duration_ms": start.elapsed().as_millis() as u64,
        "args_preview": args_preview(&call.arguments),
    });
    tracing::info!(audit = %audit.to_string(), "tool");

    outcome
}

async fn run(
    registry: &ToolRegistry,
    call: &ToolCall,
    working_directory: &Path,
    cancel: &CancellationToken,
) -> (ToolOutcome, &'static str) {
    let Some(tool) = registry.get(&call.name) else {
        let err = AgentError::ToolNotFound(call.name.clone());
        return (ToolOutcome::failure(err.to_string(), err.to_string()), "not_found");
    };

    let input = ToolInput::from_call(call, working_directory);
    if !tool.validate_input(&input) {
        let err = AgentError::InvalidToolInput(call.name.clone());
        return (ToolOutcome::failure(err.to_string(), err.to_string()), "invalid_input");
    }

    let guarded = AssertUnwindSafe(tool.execute(input, cancel)).catch_unwind();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let err = AgentError::Cancelled;
            return (ToolOutcome::failure("Tool execution cancelled", err.to_string()), "cancelled");
        }
        r = timeout(registry.timeout(), guarded) => r,
    };

    match result {
        Ok(Ok(Ok(outcome))) => {
            let label = if outcome.success { "ok" } else { "reported_failure" };
            (outcome, label)
        }
        Ok(Ok(Err(message))) => {
            let err = AgentError::ToolExecutionFailed {
                tool: call.name.clone(),
                message,
            };
            (ToolOutcome::failure(err.to_string(), err.to_string()), "error")
        }
        Ok(Err(panic)) => {
            let err = AgentError::ToolExecutionFailed {
                tool: call.name.clone(),
                message: format!("panicked: {}", panic_message(panic.as_ref())),
            };
            tracing::error!(tool = %call.name, "tool panicked");
            (ToolOutcome::failure(err.to_string(), err.to_string()), "panic")
        }
        Err(_) => {
            let err = AgentError::ToolTimeout(format!(
                "{} exceeded {:?}",
                call.name,
                registry.timeout()
            ));
            (ToolOutcome::failure(err.to_string(), err.to_string()), "timeout")
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn args_preview(args: &str) -> String {
    if args.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", args.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        args.to_string()
    }
}
