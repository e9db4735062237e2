//! 轨迹只读服务：列表、详情、删除、清理，以及供 CLI 使用的文本渲染
//!
//! 删除确认由调用方负责；本服务只执行。

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Duration;

use crate::trajectory::{
    now_utc, SearchQuery, StepStatus, StepType, StoreError, Trajectory, TrajectoryRecorder,
    TrajectoryStatus,
};

/// 详情视图中输入/输出的最大展示字符数
const PREVIEW_CHARS: usize = 100;
/// 列表视图中描述的最大展示字符数
const DESCRIPTION_CHARS: usize = 27;

/// 轨迹管理服务
#[derive(Clone)]
pub struct TrajectoryService {
    recorder: Arc<dyn TrajectoryRecorder>,
}

impl TrajectoryService {
    pub fn new(recorder: Arc<dyn TrajectoryRecorder>) -> Self {
        Self { recorder }
    }

    /// 最近的轨迹；status 无法识别时忽略该过滤条件
    pub async fn list(&self, limit: usize, status: Option<&str>) -> Result<Vec<Trajectory>, StoreError> {
        let mut query = SearchQuery::new().limit(limit);
        if let Some(raw) = status.filter(|s| !s.trim().is_empty()) {
            match raw.trim().parse::<TrajectoryStatus>() {
                Ok(status) => query = query.status(status),
                Err(e) => tracing::warn!(error = %e, "ignoring status filter"),
            }
        }
        self.recorder.search_trajectories(&query).await
    }

    pub async fn show(&self, id: &str) -> Result<Option<Trajectory>, StoreError> {
        self.recorder.get_trajectory(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.recorder.delete_trajectory(id).await
    }

    /// 结束时间早于 N 天前的轨迹（进行中的轨迹没有 end_time，不会命中）
    pub async fn find_older_than(&self, days: u32) -> Result<Vec<Trajectory>, StoreError> {
        let cutoff = now_utc() - Duration::days(i64::from(days));
        let query = SearchQuery::new().ended_between(None, Some(cutoff)).limit(0);
        self.recorder.search_trajectories(&query).await
    }

    /// 删除 N 天前结束的轨迹，返回成功删除的数量；单条失败只记录警告
    pub async fn cleanup_older_than(&self, days: u32) -> Result<usize, StoreError> {
        let old = self.find_older_than(days).await?;
        let mut deleted = 0;
        for trajectory in &old {
            match self.recorder.delete_trajectory(&trajectory.id).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    tracing::warn!(trajectory_id = %trajectory.id, error = %e, "failed to delete old trajectory")
                }
            }
        }
        tracing::info!(days, found = old.len(), deleted, "trajectory cleanup finished");
        Ok(deleted)
    }
}

pub fn status_text(status: TrajectoryStatus) -> &'static str {
    match status {
        TrajectoryStatus::InProgress => "进行中",
        TrajectoryStatus::Completed => "已完成",
        TrajectoryStatus::Failed => "失败",
        TrajectoryStatus::Cancelled => "已取消",
    }
}

fn step_type_text(step_type: StepType) -> &'static str {
    match step_type {
        StepType::LlmCall => "LLM调用",
        StepType::ToolExecution => "工具执行",
        StepType::UserInput => "用户输入",
        StepType::SystemOperation => "系统操作",
    }
}

fn step_status_text(status: StepStatus) -> &'static str {
    match status {
        StepStatus::InProgress => "进行中",
        StepStatus::Completed => "已完成",
        StepStatus::Failed => "失败",
        StepStatus::Skipped => "已跳过",
    }
}

/// 按字符截断，超出时追加 "..."
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{head}...")
    }
}

fn format_duration_ms(ms: i64) -> String {
    let ms = ms.max(0);
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1000) % 60,
        ms % 1000
    )
}

/// 列表视图
pub fn format_list(trajectories: &[Trajectory]) -> String {
    if trajectories.is_empty() {
        return "未找到任何轨迹记录\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(out, "找到 {} 条轨迹记录:\n", trajectories.len());
    let _ = writeln!(
        out,
        "{:<36} {:<8} {:<20} {:<30} {:<6}",
        "ID", "状态", "开始时间", "描述", "步骤数"
    );
    let _ = writeln!(out, "{}", "-".repeat(104));
    for t in trajectories {
        let _ = writeln!(
            out,
            "{:<36} {:<8} {:<20} {:<30} {:<6}",
            t.id,
            status_text(t.status),
            t.start_time.format("%Y-%m-%d %H:%M:%S"),
            truncate(&t.description, DESCRIPTION_CHARS),
            t.step_count()
        );
    }
    out
}

/// 详情视图
pub fn format_detail(t: &Trajectory) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "轨迹详情: {}", t.id);
    let _ = writeln!(out, "{}", "=".repeat(50));
    let _ = writeln!(out, "会话ID: {}", t.session_id);
    let _ = writeln!(out, "描述: {}", t.description);
    let _ = writeln!(out, "状态: {}", status_text(t.status));
    let _ = writeln!(out, "开始时间: {}", t.start_time.format("%Y-%m-%d %H:%M:%S"));
    if let Some(end) = t.end_time {
        let _ = writeln!(out, "结束时间: {}", end.format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(out, "总耗时: {}", format_duration_ms(t.total_execution_time_ms()));
    }

    if let Some(result) = &t.result {
        let _ = writeln!(out, "\n执行结果:");
        let _ = writeln!(out, "  成功: {}", if result.success { "是" } else { "否" });
        let _ = writeln!(out, "  消息: {}", result.message);
        if let Some(data) = result.data.as_ref().filter(|d| !d.is_null()) {
            let _ = writeln!(out, "  数据: {data}");
        }
        if let Some(error) = result.error.as_deref().filter(|e| !e.is_empty()) {
            let _ = writeln!(out, "  错误: {error}");
        }
        let stats = &result.statistics;
        let _ = writeln!(out, "\n统计信息:");
        let _ = writeln!(out, "  总步骤数: {}", stats.total_steps);
        let _ = writeln!(out, "  成功步骤: {}", stats.successful_steps);
        let _ = writeln!(out, "  失败步骤: {}", stats.failed_steps);
        let _ = writeln!(out, "  LLM调用次数: {}", stats.llm_calls);
        let _ = writeln!(out, "  工具执行次数: {}", stats.tool_executions);
        let tokens = stats.token_usage.map(|u| u.total_tokens).unwrap_or(0);
        let _ = writeln!(out, "  总Token使用: {tokens}");
    }

    if !t.steps.is_empty() {
        let _ = writeln!(out, "\n执行步骤 ({} 个):", t.steps.len());
        let _ = writeln!(out, "{}", "-".repeat(80));
        for step in &t.steps {
            let _ = writeln!(out, "步骤 {}: {}", step.step_number, step.name);
            let _ = writeln!(out, "  类型: {}", step_type_text(step.step_type));
            let _ = writeln!(out, "  状态: {}", step_status_text(step.status));
            if !step.description.is_empty() {
                let _ = writeln!(out, "  描述: {}", step.description);
            }
            let _ = writeln!(out, "  开始: {}", step.start_time.format("%H:%M:%S%.3f"));
            if let Some(end) = step.end_time {
                let _ = writeln!(out, "  结束: {}", end.format("%H:%M:%S%.3f"));
                let _ = writeln!(out, "  耗时: {}", format_duration_ms(step.execution_time_ms()));
            }
            if !step.input_data.is_empty() {
                let _ = writeln!(out, "  输入: {}", truncate(&step.input_data, PREVIEW_CHARS));
            }
            if !step.output_data.is_empty() {
                let _ = writeln!(out, "  输出: {}", truncate(&step.output_data, PREVIEW_CHARS));
            }
            if let Some(error) = step.error.as_deref() {
                let _ = writeln!(out, "  错误: {error}");
            }
            out.push('\n');
        }
    }

    if !t.metadata.is_empty() {
        let _ = writeln!(out, "元数据:");
        for (key, value) in &t.metadata {
            let _ = writeln!(out, "  {key}: {value}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::{Metadata, SqliteTrajectoryStore, TrajectoryResult, TrajectoryStep};

    async fn service_with_store() -> (TrajectoryService, Arc<SqliteTrajectoryStore>) {
        let store = Arc::new(SqliteTrajectoryStore::open_in_memory().unwrap());
        (TrajectoryService::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_list_filters_by_status_and_ignores_unknown() {
        let (service, store) = service_with_store().await;
        let done = store.start_trajectory("s", Metadata::new()).await.unwrap();
        store
            .complete_trajectory(&done, TrajectoryResult::success("ok"))
            .await
            .unwrap();
        store.start_trajectory("s", Metadata::new()).await.unwrap();

        let completed = service.list(10, Some("completed")).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done);

        let all = service.list(10, Some("bogus")).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_skips_in_progress_and_recent() {
        let (service, store) = service_with_store().await;
        let running = store.start_trajectory("s", Metadata::new()).await.unwrap();
        let finished = store.start_trajectory("s", Metadata::new()).await.unwrap();
        store
            .complete_trajectory(&finished, TrajectoryResult::success("ok"))
            .await
            .unwrap();

        // 0 天：所有已结束的轨迹都算过期
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(service.cleanup_older_than(0).await.unwrap(), 1);
        assert!(service.show(&finished).await.unwrap().is_none());
        assert!(service.show(&running).await.unwrap().is_some());

        assert_eq!(service.cleanup_older_than(30).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_format_detail_contains_steps_and_stats() {
        let (service, store) = service_with_store().await;
        let mut meta = Metadata::new();
        meta.insert("description".into(), serde_json::json!("list files"));
        let id = store.start_trajectory("s", meta).await.unwrap();
        let mut step = TrajectoryStep::begin(1, StepType::ToolExecution, "bash").with_input("x".repeat(300));
        step.fail("exit 1");
        store.record_step(&id, step).await.unwrap();
        store
            .complete_trajectory(&id, TrajectoryResult::failure("failed", "exit 1"))
            .await
            .unwrap();

        let t = service.show(&id).await.unwrap().unwrap();
        let text = format_detail(&t);
        assert!(text.contains("描述: list files"));
        assert!(text.contains("状态: 失败"));
        assert!(text.contains("步骤 1: bash"));
        assert!(text.contains("工具执行"));
        assert!(text.contains(&format!("{}...", "x".repeat(PREVIEW_CHARS))));

        let list = format_list(&[t]);
        assert!(list.contains(&id));
        assert!(format_list(&[]).contains("未找到"));
    }

    #[test]
    fn test_duration_format() {
        assert_eq!(format_duration_ms(3_723_045), "01:02:03.045");
        assert_eq!(format_duration_ms(-5), "00:00:00.000");
    }
}
