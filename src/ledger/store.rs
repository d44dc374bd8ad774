//! 账本持久化
//!
//! 版本节点的追加式存储：JSONL 文件（每节点一行，跨进程存活）与内存实现（测试用）。
//! 打开时全量加载重建链与索引。

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::core::AgentError;
use crate::ledger::VersionNode;

/// 节点存储接口：append 必须是追加式的（绝不改写既有记录）
pub trait LedgerStore: Send + Sync {
    fn append(&self, node: &VersionNode) -> Result<(), AgentError>;
    fn load_all(&self) -> Result<Vec<VersionNode>, AgentError>;
}

/// JSONL 文件存储：一行一个节点，追加写入；父目录不存在时自动创建
#[derive(Debug)]
pub struct JsonlLedgerStore {
    path: PathBuf,
}

impl JsonlLedgerStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl LedgerStore for JsonlLedgerStore {
    fn append(&self, node: &VersionNode) -> Result<(), AgentError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::LedgerStore(format!("mkdir failed: {}", e)))?;
        }
        let line = serde_json::to_string(node)
            .map_err(|e| AgentError::LedgerStore(format!("serialize failed: {}", e)))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AgentError::LedgerStore(format!("open failed: {}", e)))?;
        writeln!(file, "{}", line)
            .map_err(|e| AgentError::LedgerStore(format!("append failed: {}", e)))?;
        file.sync_data()
            .map_err(|e| AgentError::LedgerStore(format!("sync failed: {}", e)))?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<VersionNode>, AgentError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)
            .map_err(|e| AgentError::LedgerStore(format!("read failed: {}", e)))?;
        let mut nodes = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let node: VersionNode = serde_json::from_str(line).map_err(|e| {
                AgentError::LedgerStore(format!("parse failed at line {}: {}", lineno + 1, e))
            })?;
            nodes.push(node);
        }
        Ok(nodes)
    }
}

/// 内存存储（测试与禁用持久化场景）
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    nodes: Mutex<Vec<VersionNode>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn append(&self, node: &VersionNode) -> Result<(), AgentError> {
        self.nodes.lock().unwrap().push(node.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<VersionNode>, AgentError> {
        Ok(self.nodes.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::FileOp;

    #[test]
    fn test_jsonl_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let store = JsonlLedgerStore::new(&path);
        let node = VersionNode::new(None, vec!["t1".to_string()], vec![FileOp::Create {
            path: "a.txt".to_string(),
            after: "hello".to_string(),
        }]);
        store.append(&node).unwrap();
        drop(store);

        let reopened = JsonlLedgerStore::new(&path);
        let nodes = reopened.load_all().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, node.id);
        assert_eq!(nodes[0].turn_refs, vec!["t1".to_string()]);
    }
}
