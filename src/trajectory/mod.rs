//! 轨迹层：执行记录的数据模型、SQLite 存储、检索条件与只读服务
//!
//! - **model**: Trajectory / TrajectoryStep / TrajectoryResult 及状态枚举
//! - **query**: SearchQuery 到参数化 SQL 的编译
//! - **store**: TrajectoryRecorder trait 与 SqliteTrajectoryStore
//! - **service**: 列表 / 详情 / 删除 / 清理，以及文本渲染

pub mod model;
pub mod query;
pub mod service;
pub mod store;

pub use model::{
    now_utc, Metadata, ParseEnumError, StepStatus, StepType, Trajectory, TrajectoryResult,
    TrajectoryStatistics, TrajectoryStatus, TrajectoryStep,
};
pub use query::{SearchQuery, DEFAULT_SEARCH_LIMIT};
pub use service::TrajectoryService;
pub use store::{format_time, SqliteTrajectoryStore, StoreError, TrajectoryRecorder};
