//! 轨迹检索条件
//!
//! SearchQuery 编译为参数化 SQL：会话 / 状态 / 时间范围 / 关键词子串 / 元数据等值过滤，
//! 结果固定按 start_time 倒序；limit 为 0 表示不限制。

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use crate::trajectory::{Metadata, TrajectoryStatus};
use crate::trajectory::store::format_time;

/// 默认分页大小
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// 轨迹检索条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub session_id: Option<String>,
    pub status: Option<TrajectoryStatus>,
    pub start_time_after: Option<DateTime<Utc>>,
    pub start_time_before: Option<DateTime<Utc>>,
    pub end_time_after: Option<DateTime<Utc>>,
    pub end_time_before: Option<DateTime<Utc>>,
    /// 在 description 与 result 文本中做子串匹配
    pub keywords: Option<String>,
    /// 元数据等值过滤（仅标量值）
    pub metadata_filter: Metadata,
    pub limit: usize,
    pub offset: usize,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            session_id: None,
            status: None,
            start_time_after: None,
            start_time_before: None,
            end_time_after: None,
            end_time_before: None,
            keywords: None,
            metadata_filter: Metadata::new(),
            limit: DEFAULT_SEARCH_LIMIT,
            offset: 0,
        }
    }
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn status(mut self, status: TrajectoryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn started_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_time_after = after;
        self.start_time_before = before;
        self
    }

    pub fn ended_between(mut self, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Self {
        self.end_time_after = after;
        self.end_time_before = before;
        self
    }

    pub fn keywords(mut self, keywords: impl Into<String>) -> Self {
        self.keywords = Some(keywords.into());
        self
    }

    pub fn metadata_eq(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata_filter.insert(key.into(), value);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// 编译为 (SQL, 参数)；只选取 trajectories 表的列，步骤由调用方另行加载
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut sql = String::from(
            "SELECT id, session_id, description, status, start_time, end_time, result, metadata \
             FROM trajectories WHERE 1=1",
        );
        let mut params: Vec<SqlValue> = Vec::new();

        if let Some(session_id) = self.session_id.as_deref().filter(|s| !s.is_empty()) {
            sql.push_str(" AND session_id = ?");
            params.push(SqlValue::Text(session_id.to_string()));
        }
        if let Some(status) = self.status {
            sql.push_str(" AND status = ?");
            params.push(SqlValue::Text(status.as_str().to_string()));
        }

        let ranges = [
            ("start_time >= ?", self.start_time_after),
            ("start_time <= ?", self.start_time_before),
            ("end_time >= ?", self.end_time_after),
            ("end_time <= ?", self.end_time_before),
        ];
        for (clause, bound) in ranges {
            if let Some(t) = bound {
                sql.push_str(" AND ");
                sql.push_str(clause);
                params.push(SqlValue::Text(format_time(&t)));
            }
        }

        if let Some(keywords) = self.keywords.as_deref().filter(|k| !k.is_empty()) {
            let pattern = format!("%{}%", escape_like(keywords));
            sql.push_str(
                " AND (description LIKE ? ESCAPE '\\' OR IFNULL(result, '') LIKE ? ESCAPE '\\')",
            );
            params.push(SqlValue::Text(pattern.clone()));
            params.push(SqlValue::Text(pattern));
        }

        for (key, value) in &self.metadata_filter {
            let Some(bound) = scalar_to_sql(value) else {
                tracing::warn!(key = %key, "metadata filter ignores non-scalar value");
                continue;
            };
            sql.push_str(" AND json_extract(metadata, ?) = ?");
            params.push(SqlValue::Text(json_path(key)));
            params.push(bound);
        }

        sql.push_str(" ORDER BY start_time DESC, rowid DESC");

        if self.limit > 0 {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Integer(self.limit as i64));
        } else if self.offset > 0 {
            // SQLite 的 OFFSET 必须跟在 LIMIT 之后
            sql.push_str(" LIMIT -1");
        }
        if self.offset > 0 {
            sql.push_str(" OFFSET ?");
            params.push(SqlValue::Integer(self.offset as i64));
        }

        (sql, params)
    }
}

/// 转义 LIKE 通配符，使关键词按字面子串匹配
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `$."key"`，键中的双引号需转义
fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', "\\\""))
}

/// json_extract 返回值的 SQL 表示：布尔为 0/1，null 与嵌套结构不支持
fn scalar_to_sql(value: &serde_json::Value) -> Option<SqlValue> {
    match value {
        serde_json::Value::String(s) => Some(SqlValue::Text(s.clone())),
        serde_json::Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_query_orders_and_limits() {
        let (sql, params) = SearchQuery::new().to_sql();
        assert!(sql.ends_with("ORDER BY start_time DESC, rowid DESC LIMIT ?"));
        assert_eq!(params, vec![SqlValue::Integer(50)]);
    }

    #[test]
    fn test_filters_bind_in_clause_order() {
        let (sql, params) = SearchQuery::new()
            .session("s1")
            .status(TrajectoryStatus::Failed)
            .keywords("50%_off")
            .limit(0)
            .offset(10)
            .to_sql();

        assert!(sql.contains("session_id = ?"));
        assert!(sql.contains("status = ?"));
        assert!(sql.contains("LIMIT -1 OFFSET ?"));
        assert_eq!(params[0], SqlValue::Text("s1".into()));
        assert_eq!(params[1], SqlValue::Text("Failed".into()));
        assert_eq!(params[2], SqlValue::Text("%50\\%\\_off%".into()));
        assert_eq!(params.last(), Some(&SqlValue::Integer(10)));
    }

    #[test]
    fn test_metadata_filter_skips_nested_values() {
        let (sql, params) = SearchQuery::new()
            .metadata_eq("mode", serde_json::json!("chat"))
            .metadata_eq("nested", serde_json::json!({"a": 1}))
            .limit(0)
            .to_sql();
        assert_eq!(sql.matches("json_extract").count(), 1);
        assert_eq!(
            params,
            vec![SqlValue::Text("$.\"mode\"".into()), SqlValue::Text("chat".into())]
        );
    }
}
