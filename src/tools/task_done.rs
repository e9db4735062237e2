//! 任务跟踪工具（task_done）
//!
//! 模型用它登记、推进并完成多步任务；任务板只在进程内存中，随注册表共享。

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::tools::schema::parameters_schema_for;
use crate::tools::{Tool, ToolInput, ToolOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
enum TaskAction {
    Create,
    Update,
    Progress,
    Complete,
    Cancel,
    Get,
    List,
    GetStatistics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
enum TaskState {
    Created,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskState {
    fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TaskDoneArgs {
    /// 操作：create / update / progress / complete / cancel / get / list / get_statistics
    action: TaskAction,
    /// 任务 ID；create 时省略则自动生成
    #[serde(default)]
    task_id: Option<String>,
    /// 任务标题（create 必填）
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Option<TaskPriority>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    /// 进度百分比 0-100（progress 操作）
    #[serde(default)]
    progress: Option<f64>,
    /// 完成结果（complete 操作）
    #[serde(default)]
    result: Option<String>,
    /// 取消原因或进度备注
    #[serde(default)]
    notes: Option<String>,
    /// list 的状态过滤
    #[serde(default)]
    status: Option<TaskState>,
}

#[derive(Debug, Clone, Serialize)]
struct StatusChange {
    status: TaskState,
    at: DateTime<Utc>,
    reason: String,
}

#[derive(Debug, Clone, Serialize)]
struct TaskEntry {
    id: String,
    title: String,
    description: String,
    status: TaskState,
    priority: TaskPriority,
    tags: Vec<String>,
    progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
    history: Vec<StatusChange>,
}

impl TaskEntry {
    fn transition(&mut self, status: TaskState, reason: impl Into<String>) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.finished_at = Some(now);
        }
        self.history.push(StatusChange {
            status,
            at: now,
            reason: reason.into(),
        });
    }
}

/// 任务跟踪工具
#[derive(Default)]
pub struct TaskDoneTool {
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl TaskDoneTool {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&self, args: TaskDoneArgs) -> Result<(String, Value), String> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| "Task board lock poisoned".to_string())?;

        if args.action == TaskAction::Create {
            let title = args.title.unwrap_or_default();
            if title.trim().is_empty() {
                return Err("Task title must not be empty".to_string());
            }
            let id = args
                .task_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            if tasks.contains_key(&id) {
                return Err(format!("Task {id} already exists"));
            }
            let now = Utc::now();
            let entry = TaskEntry {
                id: id.clone(),
                title: title.clone(),
                description: args.description.unwrap_or_default(),
                status: TaskState::Created,
                priority: args.priority.unwrap_or_default(),
                tags: args.tags.unwrap_or_default(),
                progress: 0.0,
                result: None,
                notes: None,
                created_at: now,
                updated_at: now,
                finished_at: None,
                history: vec![StatusChange {
                    status: TaskState::Created,
                    at: now,
                    reason: "created".to_string(),
                }],
            };
            tasks.insert(id.clone(), entry);
            return Ok((
                format!("Task '{title}' created"),
                serde_json::json!({ "task_id": id, "status": TaskState::Created }),
            ));
        }

        if args.action == TaskAction::List {
            let mut listed: Vec<&TaskEntry> = tasks
                .values()
                .filter(|t| args.status.map_or(true, |s| t.status == s))
                .collect();
            listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            return Ok((
                format!("{} task(s)", listed.len()),
                serde_json::json!({ "count": listed.len(), "tasks": listed }),
            ));
        }

        if args.action == TaskAction::GetStatistics {
            let total = tasks.len();
            let count = |s: TaskState| tasks.values().filter(|t| t.status == s).count();
            let completed = count(TaskState::Completed);
            let average_progress = if total == 0 {
                0.0
            } else {
                tasks.values().map(|t| t.progress).sum::<f64>() / total as f64
            };
            let completion_rate = if total == 0 {
                0.0
            } else {
                completed as f64 * 100.0 / total as f64
            };
            return Ok((
                format!("{completed}/{total} task(s) completed"),
                serde_json::json!({
                    "total": total,
                    "created": count(TaskState::Created),
                    "in_progress": count(TaskState::InProgress),
                    "completed": completed,
                    "cancelled": count(TaskState::Cancelled),
                    "average_progress": (average_progress * 100.0).round() / 100.0,
                    "completion_rate": (completion_rate * 100.0).round() / 100.0,
                }),
            ));
        }

        let id = args
            .task_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| "task_id is required".to_string())?;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| format!("Task {id} not found"))?;
        if args.action != TaskAction::Get && task.status.is_terminal() {
            return Err(format!("Task {id} is already {:?}", task.status));
        }

        let message = match args.action {
            TaskAction::Get => format!("Task {id}"),
            TaskAction::Update => {
                if let Some(title) = args.title.filter(|t| !t.trim().is_empty()) {
                    task.title = title;
                }
                if let Some(description) = args.description {
                    task.description = description;
                }
                if let Some(priority) = args.priority {
                    task.priority = priority;
                }
                if let Some(tags) = args.tags {
                    task.tags = tags;
                }
                task.updated_at = Utc::now();
                format!("Task {id} updated")
            }
            TaskAction::Progress => {
                let progress = args
                    .progress
                    .ok_or_else(|| "progress is required".to_string())?;
                if !(0.0..=100.0).contains(&progress) {
                    return Err(format!("progress must be within 0-100, got {progress}"));
                }
                task.progress = progress;
                if args.notes.is_some() {
                    task.notes = args.notes;
                }
                if task.status == TaskState::Created && progress > 0.0 {
                    task.transition(TaskState::InProgress, "work started");
                } else {
                    task.updated_at = Utc::now();
                }
                format!("Task {id} progress set to {progress:.1}%")
            }
            TaskAction::Complete => {
                task.progress = 100.0;
                task.result = args.result;
                task.transition(TaskState::Completed, "completed");
                format!("Task {id} completed")
            }
            TaskAction::Cancel => {
                let reason = args.notes.unwrap_or_else(|| "cancelled".to_string());
                task.notes = Some(reason.clone());
                task.transition(TaskState::Cancelled, reason);
                format!("Task {id} cancelled")
            }
            TaskAction::Create | TaskAction::List | TaskAction::GetStatistics => {
                return Err(format!("{:?} does not target a single task", args.action));
            }
        };
        let data = serde_json::to_value(&*task).map_err(|e| e.to_string())?;
        Ok((message, data))
    }
}

#[async_trait]
impl Tool for TaskDoneTool {
    fn name(&self) -> &str {
        "task_done"
    }

    fn description(&self) -> &str {
        "Track multi-step work: create tasks, report progress, then complete or cancel them. \
         Also lists tasks and reports statistics."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<TaskDoneArgs>()
    }

    fn validate_input(&self, input: &ToolInput) -> bool {
        input.get::<TaskAction>("action").is_some()
    }

    async fn execute(&self, input: ToolInput, _cancel: &CancellationToken) -> Result<ToolOutcome, String> {
        let args: TaskDoneArgs = input.parse().map_err(|e| format!("Invalid arguments: {e}"))?;
        tracing::info!(action = ?args.action, task_id = ?args.task_id, "task_done tool execute");
        match self.apply(args) {
            Ok((message, data)) => Ok(ToolOutcome::success(message).with_data(data)),
            Err(e) => Ok(ToolOutcome::failure("Task operation failed", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn run(tool: &TaskDoneTool, args: Value) -> ToolOutcome {
        tool.execute(ToolInput::new(args, "."), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let tool = TaskDoneTool::new();
        let created = run(&tool, json!({"action": "create", "task_id": "t1", "title": "Refactor"})).await;
        assert!(created.success);

        let progressed = run(&tool, json!({"action": "progress", "task_id": "t1", "progress": 40})).await;
        assert!(progressed.success);
        assert_eq!(progressed.data.unwrap()["status"], "in_progress");

        let done = run(&tool, json!({"action": "complete", "task_id": "t1", "result": "merged"})).await;
        let data = done.data.unwrap();
        assert_eq!(data["status"], "completed");
        assert_eq!(data["progress"], 100.0);
        assert_eq!(data["history"].as_array().unwrap().len(), 3);

        let again = run(&tool, json!({"action": "cancel", "task_id": "t1"})).await;
        assert!(!again.success);
        assert!(again.error.unwrap().contains("already"));
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let tool = TaskDoneTool::new();
        assert!(!run(&tool, json!({"action": "create", "title": "  "})).await.success);
        run(&tool, json!({"action": "create", "task_id": "t1", "title": "A"})).await;
        assert!(!run(&tool, json!({"action": "create", "task_id": "t1", "title": "B"})).await.success);
        assert!(!run(&tool, json!({"action": "progress", "task_id": "t1", "progress": 140})).await.success);
        assert!(!run(&tool, json!({"action": "get", "task_id": "nope"})).await.success);

        assert!(tool.validate_input(&ToolInput::new(json!({"action": "list"}), ".")));
        assert!(!tool.validate_input(&ToolInput::new(json!({"action": "explode"}), ".")));
    }

    #[tokio::test]
    async fn test_list_and_statistics() {
        let tool = TaskDoneTool::new();
        for id in ["a", "b", "c"] {
            run(&tool, json!({"action": "create", "task_id": id, "title": id})).await;
        }
        run(&tool, json!({"action": "complete", "task_id": "a"})).await;
        run(&tool, json!({"action": "cancel", "task_id": "b", "notes": "obsolete"})).await;

        let open = run(&tool, json!({"action": "list", "status": "created"})).await;
        let data = open.data.unwrap();
        assert_eq!(data["count"], 1);
        assert_eq!(data["tasks"][0]["id"], "c");

        let stats = run(&tool, json!({"action": "get_statistics"})).await.data.unwrap();
        assert_eq!(stats["total"], 3);
        assert_eq!(stats["completed"], 1);
        assert_eq!(stats["cancelled"], 1);
        assert_eq!(stats["completion_rate"], 33.33);
    }
}
