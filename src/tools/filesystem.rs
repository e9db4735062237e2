//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! ListDirTool / ViewFilesTool 基于 SafeFs 提供目录列举与文件查看。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::core::AgentError;
use crate::tools::schema::parameters_schema_for;
use crate::tools::{Tool, ToolInput, ToolOutcome};

/// 递归列举的最大深度
const MAX_LIST_DEPTH: usize = 10;
/// 单次列举最多返回的条目数
const MAX_LIST_ENTRIES: usize = 2_000;
/// 一次最多查看的文件数
const MAX_VIEW_FILES: usize = 10;
/// 单文件大小上限（字节）
pub(crate) const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
/// 每个文件默认最多返回的行数
const DEFAULT_MAX_LINES: usize = 1_000;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 解析相对（或根内绝对）路径；不存在返回 ToolExecutionFailed，越界返回 PathEscape
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let trimmed = path.trim();
        if trimmed.is_empty() || trimmed == "." {
            return Ok(self.root_dir.clone());
        }
        let full = self.root_dir.join(trimmed.trim_start_matches("./"));
        let canonical = full.canonicalize().map_err(|_| AgentError::ToolExecutionFailed {
            tool: "fs".to_string(),
            message: format!("Path not found: {trimmed}"),
        })?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(AgentError::PathEscape(trimmed.to_string())) // 如 ../../etc/passwd
        }
    }

    pub(crate) fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') && name != "." && name != ".."
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListDirArgs {
    /// 相对工作区的目录，默认 "."
    #[serde(default)]
    path: Option<String>,
    /// 是否递归
    #[serde(default)]
    recursive: bool,
    /// 递归深度（1-10），默认 1
    #[serde(default)]
    max_depth: Option<usize>,
    /// 是否包含隐藏文件
    #[serde(default)]
    include_hidden: bool,
}

#[derive(Debug, Serialize)]
struct DirEntryInfo {
    path: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
}

/// 目录列举工具
pub struct ListDirTool {
    fs: SafeFs,
}

impl ListDirTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

fn list_entries(fs: &SafeFs, args: &ListDirArgs) -> Result<(Vec<DirEntryInfo>, bool), AgentError> {
    let base = fs.resolve(args.path.as_deref().unwrap_or("."))?;
    if !base.is_dir() {
        return Err(AgentError::ToolExecutionFailed {
            tool: "list_dir".to_string(),
            message: format!("Not a directory: {}", fs.relative(&base)),
        });
    }
    let depth = if args.recursive {
        args.max_depth.unwrap_or(1).clamp(1, MAX_LIST_DEPTH)
    } else {
        1
    };
    let include_hidden = args.include_hidden;

    let mut entries = Vec::new();
    let mut truncated = false;
    let walker = WalkDir::new(&base)
        .min_depth(1)
        .max_depth(depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || include_hidden || !is_hidden(&e.file_name().to_string_lossy())
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "list_dir skipped unreadable entry");
                continue;
            }
        };
        if entries.len() >= MAX_LIST_ENTRIES {
            truncated = true;
            break;
        }
        let is_dir = entry.file_type().is_dir();
        let size = if is_dir {
            None
        } else {
            entry.metadata().ok().map(|m| m.len())
        };
        entries.push(DirEntryInfo {
            path: fs.relative(entry.path()),
            kind: if is_dir { "directory" } else { "file" },
            size,
        });
    }
    Ok((entries, truncated))
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List files and subdirectories of a workspace directory, optionally recursive up to max_depth."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<ListDirArgs>()
    }

    fn validate_input(&self, input: &ToolInput) -> bool {
        match input.get::<i64>("max_depth") {
            Some(depth) => (1..=MAX_LIST_DEPTH as i64).contains(&depth),
            None => !input.parameters.contains_key("max_depth") || input.parameters["max_depth"].is_null(),
        }
    }

    async fn execute(&self, input: ToolInput, cancel: &CancellationToken) -> Result<ToolOutcome, String> {
        let args: ListDirArgs = input.parse().map_err(|e| format!("Invalid arguments: {e}"))?;
        tracing::info!(path = ?args.path, recursive = args.recursive, "list_dir tool execute");

        let fs = self.fs.clone();
        let listing = tokio::task::spawn_blocking(move || list_entries(&fs, &args));
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(ToolOutcome::failure("Listing cancelled", "Cancelled")),
            r = listing => r.map_err(|e| format!("Listing task failed: {e}"))?,
        };

        match result {
            Ok((entries, truncated)) => {
                let message = if truncated {
                    format!("Listed {} entries (truncated)", entries.len())
                } else {
                    format!("Listed {} entries", entries.len())
                };
                let data = serde_json::json!({ "count": entries.len(), "truncated": truncated, "entries": entries });
                Ok(ToolOutcome::success(message).with_data(data))
            }
            Err(e) => Ok(ToolOutcome::failure("Failed to list directory", e.to_string())),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ViewFilesArgs {
    /// 要查看的文件（相对工作区，最多 10 个）
    file_paths: Vec<String>,
    /// 起始行（从 1 开始）
    #[serde(default)]
    start_line: Option<usize>,
    /// 结束行（包含）
    #[serde(default)]
    end_line: Option<usize>,
    /// 每个文件最多返回的行数，默认 1000
    #[serde(default)]
    max_lines: Option<usize>,
    /// 是否带行号，默认 true
    #[serde(default)]
    show_line_numbers: Option<bool>,
}

#[derive(Debug, Serialize)]
struct FileView {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_lines: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl FileView {
    fn error(path: &str, error: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            content: None,
            total_lines: None,
            error: Some(error.into()),
        }
    }
}

/// 文件查看工具
pub struct ViewFilesTool {
    fs: SafeFs,
}

impl ViewFilesTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }

    async fn view_one(&self, path: &str, args: &ViewFilesArgs) -> FileView {
        let resolved = match self.fs.resolve(path) {
            Ok(p) => p,
            Err(e) => return FileView::error(path, e.to_string()),
        };
        let meta = match tokio::fs::metadata(&resolved).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return FileView::error(path, "Not a regular file"),
            Err(e) => return FileView::error(path, format!("Stat failed: {e}")),
        };
        if meta.len() > MAX_FILE_BYTES {
            return FileView::error(
                path,
                format!("File too large ({} bytes, limit {} bytes)", meta.len(), MAX_FILE_BYTES),
            );
        }
        let text = match tokio::fs::read(&resolved).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => return FileView::error(path, "Binary or non UTF-8 file"),
            },
            Err(e) => return FileView::error(path, format!("Read failed: {e}")),
        };

        let start = args.start_line.unwrap_or(1).max(1);
        let max_lines = args.max_lines.unwrap_or(DEFAULT_MAX_LINES).max(1);
        let numbered = args.show_line_numbers.unwrap_or(true);
        let lines: Vec<&str> = text.lines().collect();
        let end = args
            .end_line
            .unwrap_or(lines.len())
            .min(lines.len())
            .min(start.saturating_add(max_lines - 1));

        let mut content = String::new();
        for (idx, line) in lines.iter().enumerate().take(end).skip(start - 1) {
            if numbered {
                content.push_str(&format!("{:>6}\t{}\n", idx + 1, line));
            } else {
                content.push_str(line);
                content.push('\n');
            }
        }
        FileView {
            path: self.fs.relative(&resolved),
            content: Some(content),
            total_lines: Some(lines.len()),
            error: None,
        }
    }
}

#[async_trait]
impl Tool for ViewFilesTool {
    fn name(&self) -> &str {
        "view_files"
    }

    fn description(&self) -> &str {
        "View the contents of up to 10 workspace text files, optionally limited to a line range."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<ViewFilesArgs>()
    }

    fn validate_input(&self, input: &ToolInput) -> bool {
        let Some(paths) = input.get::<Vec<String>>("file_paths") else {
            return false;
        };
        let start_ok = input.get::<i64>("start_line").map_or(true, |s| s >= 1);
        !paths.is_empty() && paths.len() <= MAX_VIEW_FILES && start_ok
    }

    async fn execute(&self, input: ToolInput, cancel: &CancellationToken) -> Result<ToolOutcome, String> {
        let args: ViewFilesArgs = input.parse().map_err(|e| format!("Invalid arguments: {e}"))?;
        tracing::info!(files = args.file_paths.len(), "view_files tool execute");

        let mut views = Vec::with_capacity(args.file_paths.len());
        for path in &args.file_paths {
            if cancel.is_cancelled() {
                return Ok(ToolOutcome::failure("Viewing cancelled", "Cancelled"));
            }
            views.push(self.view_one(path, &args).await);
        }

        let ok = views.iter().filter(|v| v.error.is_none()).count();
        let message = format!("Read {}/{} files", ok, views.len());
        let data = serde_json::json!({ "files": views });
        if ok == 0 {
            let errors: Vec<String> = views
                .iter()
                .filter_map(|v| v.error.as_ref().map(|e| format!("{}: {}", v.path, e)))
                .collect();
            return Ok(ToolOutcome::failure(message, errors.join("; ")).with_data(data));
        }
        Ok(ToolOutcome::success(message).with_data(data))
    }
}
