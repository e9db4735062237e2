//! 轨迹存储（SQLite）
//!
//! 单个 rusqlite 连接放在互斥锁后面，所有读写都在同一临界区内、于 blocking 线程池执行：
//! 嵌入式 SQLite 不支持多连接安全并发，写入量受模型/工具延迟限制（秒级），单写者足够。
//! `open` 返回前已完成建表与索引，拿到实例即处于就绪状态。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::trajectory::{
    now_utc, Metadata, SearchQuery, StepStatus, StepType, Trajectory, TrajectoryResult,
    TrajectoryStatus, TrajectoryStep,
};

/// 未提供 metadata["description"] 时的默认描述
pub const DEFAULT_DESCRIPTION: &str = "Trajectory";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS trajectories (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    result TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS trajectory_steps (
    id TEXT PRIMARY KEY,
    trajectory_id TEXT NOT NULL,
    step_number INTEGER NOT NULL,
    type TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    input_data TEXT NOT NULL DEFAULT '',
    output_data TEXT NOT NULL DEFAULT '',
    error TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    execution_time_ms INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (trajectory_id) REFERENCES trajectories (id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_trajectories_session_id ON trajectories (session_id);
CREATE INDEX IF NOT EXISTS idx_trajectories_status ON trajectories (status);
CREATE INDEX IF NOT EXISTS idx_trajectories_start_time ON trajectories (start_time);
CREATE INDEX IF NOT EXISTS idx_trajectory_steps_number ON trajectory_steps (trajectory_id, step_number);
";

/// 存储层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Trajectory not found: {0}")]
    NotFound(String),

    #[error("Trajectory {id} is not in progress (status: {status})")]
    NotInProgress { id: String, status: TrajectoryStatus },

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Storage task failed: {0}")]
    Task(String),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// 轨迹记录器接口：编排器只依赖该 trait
#[async_trait]
pub trait TrajectoryRecorder: Send + Sync {
    /// 新建 InProgress 轨迹，start_time = now(UTC)
    async fn start_trajectory(&self, session_id: &str, metadata: Metadata) -> Result<String, StoreError>;

    /// 追加一个步骤；step_number 由调用方保证单调，存储层不重排、不去重
    async fn record_step(&self, trajectory_id: &str, step: TrajectoryStep) -> Result<String, StoreError>;

    /// 终结轨迹；已终结的轨迹返回 NotInProgress
    async fn complete_trajectory(&self, trajectory_id: &str, result: TrajectoryResult) -> Result<(), StoreError>;

    /// 完整加载（含有序步骤）；不存在时返回 None
    async fn get_trajectory(&self, trajectory_id: &str) -> Result<Option<Trajectory>, StoreError>;

    /// 会话下全部轨迹，start_time 倒序
    async fn get_session_trajectories(&self, session_id: &str) -> Result<Vec<Trajectory>, StoreError>;

    /// 条件检索，start_time 倒序
    async fn search_trajectories(&self, query: &SearchQuery) -> Result<Vec<Trajectory>, StoreError>;

    /// 原子删除轨迹及其全部步骤；不存在时返回 NotFound
    async fn delete_trajectory(&self, trajectory_id: &str) -> Result<(), StoreError>;
}

/// 存储用时间格式：RFC3339 + 微秒 + Z，定长，字典序即时间序
pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp '{raw}': {e}")))
}

fn parse_metadata(raw: &str) -> Result<Metadata, StoreError> {
    if raw.trim().is_empty() {
        return Ok(Metadata::new());
    }
    Ok(serde_json::from_str(raw)?)
}

/// SQLite 轨迹存储
#[derive(Clone)]
pub struct SqliteTrajectoryStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteTrajectoryStore {
    /// 打开（或创建）数据库文件并完成建表；父目录不存在时自动创建
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = db_path.as_ref().to_path_buf();
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            if let Some(parent) = open_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&open_path)?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))??;

        tracing::info!(path = %path.display(), "trajectory store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// 内存数据库（测试与临时会话）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// 数据库文件路径；内存库为 None
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 在临界区内执行同步数据库操作
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// trajectories 表的一行（未解析）
struct TrajectoryRow {
    id: String,
    session_id: String,
    description: String,
    status: String,
    start_time: String,
    end_time: Option<String>,
    result: Option<String>,
    metadata: String,
}

impl TrajectoryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            status: row.get(3)?,
            start_time: row.get(4)?,
            end_time: row.get(5)?,
            result: row.get(6)?,
            metadata: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        })
    }

    fn into_trajectory(self, steps: Vec<TrajectoryStep>) -> Result<Trajectory, StoreError> {
        let status = self
            .status
            .parse::<TrajectoryStatus>()
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_str::<TrajectoryResult>)
            .transpose()?;
        Ok(Trajectory {
            id: self.id,
            session_id: self.session_id,
            status,
            start_time: parse_time(&self.start_time)?,
            end_time: self.end_time.as_deref().map(parse_time).transpose()?,
            description: self.description,
            metadata: parse_metadata(&self.metadata)?,
            result,
            steps,
        })
    }
}

/// trajectory_steps 表的一行（未解析）
struct StepRow {
    id: String,
    step_number: i64,
    step_type: String,
    name: String,
    description: String,
    status: String,
    start_time: String,
    end_time: Option<String>,
    input_data: String,
    output_data: String,
    error: Option<String>,
    metadata: String,
}

impl StepRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            step_number: row.get(1)?,
            step_type: row.get(2)?,
            name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            description: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            status: row.get(5)?,
            start_time: row.get(6)?,
            end_time: row.get(7)?,
            input_data: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
            output_data: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            error: row.get(10)?,
            metadata: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
        })
    }

    fn into_step(self) -> Result<TrajectoryStep, StoreError> {
        let invalid = |e: crate::trajectory::model::ParseEnumError| StoreError::InvalidData(e.to_string());
        Ok(TrajectoryStep {
            id: self.id,
            step_number: u32::try_from(self.step_number)
                .map_err(|_| StoreError::InvalidData(format!("bad step number {}", self.step_number)))?,
            step_type: self.step_type.parse::<StepType>().map_err(invalid)?,
            name: self.name,
            description: self.description,
            status: self.status.parse::<StepStatus>().map_err(invalid)?,
            start_time: parse_time(&self.start_time)?,
            end_time: self.end_time.as_deref().map(parse_time).transpose()?,
            input_data: self.input_data,
            output_data: self.output_data,
            error: self.error,
            metadata: parse_metadata(&self.metadata)?,
        })
    }
}

fn load_steps(conn: &Connection, trajectory_id: &str) -> Result<Vec<TrajectoryStep>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, step_number, type, name, description, status, start_time, end_time,
                input_data, output_data, error, metadata
         FROM trajectory_steps WHERE trajectory_id = ?1
         ORDER BY step_number ASC, rowid ASC",
    )?;
    let rows = stmt
        .query_map(params![trajectory_id], StepRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(StepRow::into_step).collect()
}

fn load_status(conn: &Connection, trajectory_id: &str) -> Result<Option<TrajectoryStatus>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM trajectories WHERE id = ?1",
            params![trajectory_id],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| {
        s.parse::<TrajectoryStatus>()
            .map_err(|e| StoreError::InvalidData(e.to_string()))
    })
    .transpose()
}

/// 只允许对 InProgress 轨迹写入
fn ensure_in_progress(conn: &Connection, trajectory_id: &str) -> Result<(), StoreError> {
    match load_status(conn, trajectory_id)? {
        None => Err(StoreError::NotFound(trajectory_id.to_string())),
        Some(TrajectoryStatus::InProgress) => Ok(()),
        Some(status) => Err(StoreError::NotInProgress {
            id: trajectory_id.to_string(),
            status,
        }),
    }
}

/// 执行 trajectories 查询并为每行加载步骤
fn hydrate(
    conn: &Connection,
    sql: &str,
    params: Vec<rusqlite::types::Value>,
) -> Result<Vec<Trajectory>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), TrajectoryRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|row| {
            let steps = load_steps(conn, &row.id)?;
            row.into_trajectory(steps)
        })
        .collect()
}

#[async_trait]
impl TrajectoryRecorder for SqliteTrajectoryStore {
    async fn start_trajectory(&self, session_id: &str, metadata: Metadata) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let description = metadata
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_DESCRIPTION)
            .to_string();
        let metadata_json = serde_json::to_string(&metadata)?;
        let start_time = format_time(&now_utc());
        let session_id = session_id.to_string();
        let row_id = id.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO trajectories (id, session_id, description, status, start_time, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row_id,
                    session_id,
                    description,
                    TrajectoryStatus::InProgress.as_str(),
                    start_time,
                    metadata_json
                ],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(trajectory_id = %id, "trajectory started");
        Ok(id)
    }

    async fn record_step(&self, trajectory_id: &str, mut step: TrajectoryStep) -> Result<String, StoreError> {
        if step.id.is_empty() {
            step.id = uuid::Uuid::new_v4().to_string();
        }
        let metadata_json = serde_json::to_string(&step.metadata)?;
        let trajectory_id = trajectory_id.to_string();
        let step_id = step.id.clone();

        self.with_conn(move |conn| {
            ensure_in_progress(conn, &trajectory_id)?;
            conn.execute(
                "INSERT INTO trajectory_steps
                 (id, trajectory_id, step_number, type, name, description, status, start_time, end_time,
                  input_data, output_data, error, metadata, execution_time_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    step.id,
                    trajectory_id,
                    i64::from(step.step_number),
                    step.step_type.as_str(),
                    step.name,
                    step.description,
                    step.status.as_str(),
                    format_time(&step.start_time),
                    step.end_time.as_ref().map(format_time),
                    step.input_data,
                    step.output_data,
                    step.error,
                    metadata_json,
                    step.execution_time_ms(),
                ],
            )?;
            Ok(())
        })
        .await?;

        Ok(step_id)
    }

    async fn complete_trajectory(&self, trajectory_id: &str, result: TrajectoryResult) -> Result<(), StoreError> {
        let status = result.terminal_status();
        let result_json = serde_json::to_string(&result)?;
        let id = trajectory_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            ensure_in_progress(&tx, &id)?;
            // end_time 不早于 start_time（时钟回拨时取 start_time）
            let start_raw: String = tx.query_row(
                "SELECT start_time FROM trajectories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            let end_time = now_utc().max(parse_time(&start_raw)?);
            tx.execute(
                "UPDATE trajectories SET status = ?1, end_time = ?2, result = ?3
                 WHERE id = ?4 AND status = ?5",
                params![
                    status.as_str(),
                    format_time(&end_time),
                    result_json,
                    id,
                    TrajectoryStatus::InProgress.as_str()
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::info!(trajectory_id = %trajectory_id, status = %status, "trajectory completed");
        Ok(())
    }

    async fn get_trajectory(&self, trajectory_id: &str) -> Result<Option<Trajectory>, StoreError> {
        let id = trajectory_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, session_id, description, status, start_time, end_time, result, metadata
                     FROM trajectories WHERE id = ?1",
                    params![id],
                    TrajectoryRow::from_row,
                )
                .optional()?;
            match row {
                Some(row) => {
                    let steps = load_steps(conn, &row.id)?;
                    Ok(Some(row.into_trajectory(steps)?))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_session_trajectories(&self, session_id: &str) -> Result<Vec<Trajectory>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            hydrate(
                conn,
                "SELECT id, session_id, description, status, start_time, end_time, result, metadata
                 FROM trajectories WHERE session_id = ?
                 ORDER BY start_time DESC, rowid DESC",
                vec![rusqlite::types::Value::Text(session_id)],
            )
        })
        .await
    }

    async fn search_trajectories(&self, query: &SearchQuery) -> Result<Vec<Trajectory>, StoreError> {
        let (sql, params) = query.to_sql();
        self.with_conn(move |conn| hydrate(conn, &sql, params)).await
    }

    async fn delete_trajectory(&self, trajectory_id: &str) -> Result<(), StoreError> {
        let id = trajectory_id.to_string();
        let removed_steps = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let steps = tx.execute(
                    "DELETE FROM trajectory_steps WHERE trajectory_id = ?1",
                    params![id],
                )?;
                let rows = tx.execute("DELETE FROM trajectories WHERE id = ?1", params![id])?;
                if rows == 0 {
                    // tx 未提交即回滚
                    return Err(StoreError::NotFound(id));
                }
                tx.commit()?;
                Ok(steps)
            })
            .await?;

        tracing::info!(trajectory_id = %trajectory_id, removed_steps, "trajectory deleted");
        Ok(())
    }
}
