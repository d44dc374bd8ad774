//! 检查点 / 版本控制账本
//!
//! 以回合为索引的追加式变更记录：record_turn 为每个触发过工具批次的回合建立恰好一个
//! VersionNode（无文件变更时为空 ops 占位节点，保证 revert-by-turn-id 对可见回合总能命中）；
//! revert_to_turn 从链尾向目标节点（不含）逆序回放逆操作，恢复落盘文件状态。
//! 链本身从不截断：回退以新节点形式记入链（纯事件日志，可审计）。
//! append 与 revert 共享同一临界区。

mod ops;
mod store;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use ops::FileOp;
pub use store::{JsonlLedgerStore, LedgerStore, MemoryLedgerStore};

use crate::core::AgentError;

/// 不可变版本节点：parent 形成按创建时间排序的线性链
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionNode {
    pub id: String,
    pub parent: Option<String>,
    /// 该节点可被寻址的回合 id 集合（至少一个；回退节点使用合成 ref）
    pub turn_refs: Vec<String>,
    /// 有序的文件变更操作；占位节点为空
    pub ops: Vec<FileOp>,
    pub created_at: DateTime<Utc>,
}

impl VersionNode {
    pub fn new(parent: Option<String>, turn_refs: Vec<String>, ops: Vec<FileOp>) -> Self {
        Self {
            id: format!("node-{}", Uuid::new_v4()),
            parent,
            turn_refs,
            ops,
            created_at: Utc::now(),
        }
    }
}

/// 一次回退的结果摘要
#[derive(Debug, Clone)]
pub struct RevertOutcome {
    /// 回退目标节点 id
    pub target_node_id: String,
    /// 被逆放的节点数（目标之后的节点）
    pub nodes_reverted: usize,
    /// 实际应用的逆操作数
    pub ops_applied: usize,
    /// 记录本次回退的新节点 id
    pub revert_node_id: String,
}

struct LedgerInner {
    /// 创建顺序即链顺序
    nodes: Vec<VersionNode>,
    /// turn_ref -> nodes 下标（增量维护，重复查找 O(1)）
    index: HashMap<String, usize>,
}

/// 变更账本：唯一的多路径共享可写状态，链与索引由单一互斥锁保护
pub struct ChangeLedger {
    inner: Mutex<LedgerInner>,
    store: Box<dyn LedgerStore>,
    workspace_root: PathBuf,
}

impl ChangeLedger {
    /// 打开账本：从存储加载全部节点并重建索引
    pub fn open(
        store: Box<dyn LedgerStore>,
        workspace_root: impl AsRef<Path>,
    ) -> Result<Self, AgentError> {
        let nodes = store.load_all()?;
        let mut index = HashMap::new();
        for (pos, node) in nodes.iter().enumerate() {
            for turn_ref in &node.turn_refs {
                // 同一回合被重复记录时以最新节点为准
                index.insert(turn_ref.clone(), pos);
            }
        }
        Ok(Self {
            inner: Mutex::new(LedgerInner { nodes, index }),
            store,
            workspace_root: workspace_root.as_ref().to_path_buf(),
        })
    }

    /// 内存账本（测试与禁用持久化场景）
    pub fn in_memory(workspace_root: impl AsRef<Path>) -> Self {
        Self::open(Box::new(MemoryLedgerStore::new()), workspace_root)
            .expect("memory store cannot fail to open")
    }

    /// 记录一个回合的工具批次产物；ops 可为空（占位节点）。
    /// 调用方约定：纯聊天回合（未请求任何工具）不得调用，避免占位节点无界增长。
    pub fn record_turn(&self, turn_id: &str, ops: Vec<FileOp>) -> Result<VersionNode, AgentError> {
        let mut inner = self.inner.lock().unwrap();
        let parent = inner.nodes.last().map(|n| n.id.clone());
        let node = VersionNode::new(parent, vec![turn_id.to_string()], ops);
        self.store.append(&node)?;
        let pos = inner.nodes.len();
        inner.nodes.push(node.clone());
        inner.index.insert(turn_id.to_string(), pos);
        tracing::debug!(turn_id, node_id = %node.id, ops = node.ops.len(), "ledger: node recorded");
        Ok(node)
    }

    /// 回退到指定回合：恢复文件状态至该回合变更应用后的样子。
    /// 找不到节点返回 NodeNotFound（调用方据此触发快照回退机制）。
    pub fn revert_to_turn(&self, turn_id: &str) -> Result<RevertOutcome, AgentError> {
        let mut inner = self.inner.lock().unwrap();
        let pos = match inner.index.get(turn_id) {
            Some(p) => *p,
            None => {
                let mut known: Vec<String> = Vec::new();
                for node in &inner.nodes {
                    known.extend(node.turn_refs.iter().cloned());
                }
                return Err(AgentError::NodeNotFound {
                    turn_id: turn_id.to_string(),
                    known_turn_refs: known,
                });
            }
        };
        if pos >= inner.nodes.len() {
            return Err(AgentError::LedgerCorrupted(format!(
                "index points to missing node (turn '{}', position {})",
                turn_id, pos
            )));
        }
        let target_node_id = inner.nodes[pos].id.clone();

        // 从链尾回到目标（不含）：每个节点内操作逆序，再取逆操作
        let mut inverse_ops = Vec::new();
        let mut nodes_reverted = 0;
        for node in inner.nodes[pos + 1..].iter().rev() {
            nodes_reverted += 1;
            for op in node.ops.iter().rev() {
                inverse_ops.push(op.invert());
            }
        }
        for op in &inverse_ops {
            op.apply(&self.workspace_root)?;
        }

        // 回退本身作为新节点前向记录（链保持追加式，可审计）
        let revert_ref = format!("revert-{}", Uuid::new_v4());
        let parent = inner.nodes.last().map(|n| n.id.clone());
        let revert_node = VersionNode::new(parent, vec![revert_ref.clone()], inverse_ops.clone());
        self.store.append(&revert_node)?;
        let new_pos = inner.nodes.len();
        let revert_node_id = revert_node.id.clone();
        inner.nodes.push(revert_node);
        inner.index.insert(revert_ref, new_pos);

        tracing::info!(
            turn_id,
            target = %target_node_id,
            nodes_reverted,
            ops = inverse_ops.len(),
            "ledger: reverted to turn"
        );
        Ok(RevertOutcome {
            target_node_id,
            nodes_reverted,
            ops_applied: inverse_ops.len(),
            revert_node_id,
        })
    }

    /// 是否已有节点引用该回合
    pub fn has_turn(&self, turn_id: &str) -> bool {
        self.inner.lock().unwrap().index.contains_key(turn_id)
    }

    /// 节点总数（含回退节点）
    pub fn node_count(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    /// 全部已知 turn_refs（链序）
    pub fn known_turn_refs(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .iter()
            .flat_map(|n| n.turn_refs.iter().cloned())
            .collect()
    }
}
