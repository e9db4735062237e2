//! 文件编辑工具（file_edit_tool）
//!
//! 在沙箱内对已有文本文件做「查找并全部替换」；可选在同目录写一份带时间戳的备份。

use std::path::Path;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::tools::filesystem::{SafeFs, MAX_FILE_BYTES};
use crate::tools::schema::parameters_schema_for;
use crate::tools::{Tool, ToolInput, ToolOutcome};

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FileEditArgs {
    /// 要编辑的文件（相对工作区）
    file_path: String,
    /// 要查找的文本（所有出现处都会被替换）
    search_text: String,
    /// 替换文本，默认空串（即删除）
    #[serde(default)]
    replace_text: String,
    /// 是否先写备份 `<file>.backup.<时间戳>`，默认 true
    #[serde(default = "default_true")]
    create_backup: bool,
}

#[derive(Debug, Serialize)]
struct EditReport {
    file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    backup_path: Option<String>,
    replacement_count: usize,
    original_size: usize,
    new_size: usize,
    size_difference: i64,
}

/// 查找替换编辑工具
pub struct FileEditTool {
    fs: SafeFs,
}

impl FileEditTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }

    async fn edit(&self, args: &FileEditArgs, cancel: &CancellationToken) -> Result<EditReport, String> {
        let path = self.fs.resolve(&args.file_path).map_err(|e| e.to_string())?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| format!("Stat failed: {e}"))?;
        if !meta.is_file() {
            return Err(format!("Not a regular file: {}", args.file_path));
        }
        if meta.permissions().readonly() {
            return Err(format!("File is read-only: {}", args.file_path));
        }
        if meta.len() > MAX_FILE_BYTES {
            return Err(format!(
                "File too large ({} bytes, limit {} bytes)",
                meta.len(),
                MAX_FILE_BYTES
            ));
        }

        let original = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("Read failed: {e}"))?;
        let replacement_count = original.matches(args.search_text.as_str()).count();
        if replacement_count == 0 {
            return Err(format!("Search text not found in {}", args.file_path));
        }
        if cancel.is_cancelled() {
            return Err("Cancelled".to_string());
        }

        let backup_path = if args.create_backup {
            let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
            let mut backup = path.clone().into_os_string();
            backup.push(format!(".backup.{stamp}"));
            tokio::fs::write(&backup, &original)
                .await
                .map_err(|e| format!("Backup failed: {e}"))?;
            Some(self.fs.relative(Path::new(&backup)))
        } else {
            None
        };

        let updated = original.replace(args.search_text.as_str(), &args.replace_text);
        tokio::fs::write(&path, &updated)
            .await
            .map_err(|e| format!("Write failed: {e}"))?;

        Ok(EditReport {
            file_path: self.fs.relative(&path),
            backup_path,
            replacement_count,
            original_size: original.len(),
            new_size: updated.len(),
            size_difference: updated.len() as i64 - original.len() as i64,
        })
    }
}

#[async_trait]
impl Tool for FileEditTool {
    fn name(&self) -> &str {
        "file_edit_tool"
    }

    fn description(&self) -> &str {
        "Edit a workspace text file by replacing every occurrence of search_text with replace_text. \
         Writes a timestamped backup next to the file unless create_backup is false."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<FileEditArgs>()
    }

    fn validate_input(&self, input: &ToolInput) -> bool {
        let non_empty = |key| input.get_str(key).is_some_and(|v| !v.is_empty());
        non_empty("file_path") && non_empty("search_text")
    }

    async fn execute(&self, input: ToolInput, cancel: &CancellationToken) -> Result<ToolOutcome, String> {
        let args: FileEditArgs = input.parse().map_err(|e| format!("Invalid arguments: {e}"))?;
        tracing::info!(file = %args.file_path, backup = args.create_backup, "file_edit_tool execute");

        match self.edit(&args, cancel).await {
            Ok(report) => {
                let message = format!(
                    "Edited {}: replaced {} occurrence(s)",
                    report.file_path, report.replacement_count
                );
                let data = serde_json::to_value(&report).map_err(|e| e.to_string())?;
                Ok(ToolOutcome::success(message).with_data(data))
            }
            Err(e) => Ok(ToolOutcome::failure("File edit failed", e)),
        }
    }
}
