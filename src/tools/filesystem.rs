//! 沙箱文件系统工具
//!
//! SafeFs 绑定 workspace 根，所有路径经 resolve 校验必须在根下（禁止 ../ 逃逸）；
//! ReadFileTool / ListDirTool 基于 SafeFs 提供只读能力，子代理可用，无需审批。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolOutput};

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
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

    /// 解析并校验已存在路径在沙箱内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let path = path.trim_start_matches("./");
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| format!("Path not found: {}", path))?;
        let root_canon = self
            .root_dir
            .canonicalize()
            .unwrap_or_else(|_| self.root_dir.clone());
        if canonical.starts_with(root_canon) {
            Ok(canonical)
        } else {
            Err(format!("Path escapes workspace: {}", path)) // 如 ../../etc/passwd
        }
    }

    /// 解析可能尚不存在的路径（写入场景）：仅做词法校验
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, String> {
        let path = path.trim_start_matches("./");
        let p = Path::new(path);
        if p.is_absolute() || path.split('/').any(|c| c == "..") {
            return Err(format!("Path escapes workspace: {}", path));
        }
        Ok(self.root_dir.join(p))
    }

    /// workspace 相对路径（账本记录用）
    pub fn relative(&self, path: &str) -> String {
        path.trim_start_matches("./").to_string()
    }

    pub fn read_file(&self, path: &str) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved).map_err(|e| format!("Read failed: {}", e))
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, String> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base).map_err(|e| format!("List failed: {}", e))? {
            let e = e.map_err(|e| format!("List failed: {}", e))?;
            let name = e.file_name().to_string_lossy().to_string();
            let suffix = if e.path().is_dir() { "/" } else { "" };
            entries.push(format!("{}{}", name, suffix));
        }
        entries.sort();
        Ok(entries)
    }
}

/// 读取文件内容
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the content of a file inside the workspace. Args: {\"path\": \"relative/path\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" }
            },
            "required": ["path"]
        })
    }

    fn subagent_eligible(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "Missing 'path' argument".to_string())?;
        let content = self.fs.read_file(path)?;
        Ok(ToolOutput::text(content))
    }
}

/// 列出目录
pub struct ListDirTool {
    fs: SafeFs,
}

impl ListDirTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root),
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List entries of a workspace directory. Args: {\"path\": \".\"}; directories end with '/'"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative directory, default '.'" }
            },
            "required": []
        })
    }

    fn subagent_eligible(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let entries = self.fs.list_dir(path)?;
        if entries.is_empty() {
            return Ok(ToolOutput::text("(empty directory)"));
        }
        Ok(ToolOutput::text(entries.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_and_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let read = ReadFileTool::new(dir.path());
        let out = read
            .execute(serde_json::json!({"path": "a.txt"}))
            .await
            .unwrap();
        assert_eq!(out.content, "hello");

        let ls = ListDirTool::new(dir.path());
        let out = ls.execute(serde_json::json!({})).await.unwrap();
        assert_eq!(out.content, "a.txt\nsub/");
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let read = ReadFileTool::new(dir.path());
        let err = read
            .execute(serde_json::json!({"path": "../../etc/passwd"}))
            .await
            .unwrap_err();
        assert!(err.contains("Path") || err.contains("not found"));
    }
}
