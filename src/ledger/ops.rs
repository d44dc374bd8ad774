//! 文件变更操作
//!
//! create / modify / delete 三种操作，携带前后内容快照；invert 给出逆操作，
//! apply 将操作落盘（相对 workspace 根解析路径）。回放保证幂等：
//! apply → revert → 重新 apply 得到字节一致的文件状态。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 单个文件变更操作（快照式，before/after 为完整内容）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOp {
    Create { path: String, after: String },
    Modify {
        path: String,
        before: String,
        after: String,
    },
    Delete { path: String, before: String },
}

impl FileOp {
    pub fn path(&self) -> &str {
        match self {
            FileOp::Create { path, .. } | FileOp::Modify { path, .. } | FileOp::Delete { path, .. } => path,
        }
    }

    /// 逆操作：Create ↔ Delete，Modify 交换 before/after
    pub fn invert(&self) -> FileOp {
        match self {
            FileOp::Create { path, after } => FileOp::Delete {
                path: path.clone(),
                before: after.clone(),
            },
            FileOp::Modify { path, before, after } => FileOp::Modify {
                path: path.clone(),
                before: after.clone(),
                after: before.clone(),
            },
            FileOp::Delete { path, before } => FileOp::Create {
                path: path.clone(),
                after: before.clone(),
            },
        }
    }

    /// 将操作应用到 workspace 根下的文件；Modify 在当前内容与 before 不符时告警但仍覆盖
    pub fn apply(&self, root: &Path) -> Result<(), AgentError> {
        let target = resolve(root, self.path())?;
        match self {
            FileOp::Create { after, .. } => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| AgentError::ToolExecutionFailed(format!("mkdir failed: {}", e)))?;
                }
                std::fs::write(&target, after)
                    .map_err(|e| AgentError::ToolExecutionFailed(format!("write failed: {}", e)))?;
            }
            FileOp::Modify { before, after, .. } => {
                if let Ok(current) = std::fs::read_to_string(&target) {
                    if &current != before {
                        tracing::warn!(path = %self.path(), "modify precondition mismatch, overwriting");
                    }
                }
                std::fs::write(&target, after)
                    .map_err(|e| AgentError::ToolExecutionFailed(format!("write failed: {}", e)))?;
            }
            FileOp::Delete { .. } => {
                if target.exists() {
                    std::fs::remove_file(&target)
                        .map_err(|e| AgentError::ToolExecutionFailed(format!("remove failed: {}", e)))?;
                }
            }
        }
        Ok(())
    }
}

/// 相对路径解析：禁止绝对路径与 ../ 逃逸
fn resolve(root: &Path, rel: &str) -> Result<PathBuf, AgentError> {
    let p = Path::new(rel);
    if p.is_absolute() || rel.split('/').any(|c| c == "..") {
        return Err(AgentError::ToolExecutionFailed(format!(
            "Path escapes workspace: {}",
            rel
        )));
    }
    Ok(root.join(p))
}
