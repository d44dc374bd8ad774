//! Agent 错误类型
//!
//! 覆盖回合编排、工具调度与变更账本的完整错误分类：
//! 可恢复（ToolNotFound 良性、审批拒绝走结果通道，不在此处）、阈值致命（FailureThresholdExceeded /
//! EmptyToolBatch）、致命（ModelNotReady / Cancelled / LedgerCorrupted）与账本查找失败（NodeNotFound）。

use thiserror::Error;

/// Agent 运行过程中可能出现的错误（模型、工具、账本、取消等）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 模型输出的 Tool Call 结构非法且无法修复（或模型未声明 enable_malformed_retry）
    #[error("Function call error: {0}")]
    FunctionCall(String),

    /// 工具不存在：良性，不计入失败阈值（如可选能力缺失）
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 非良性工具失败数超过阈值且模型未声明 enable_progressive_degradation
    #[error("Tool failure threshold exceeded: {failures} failures (threshold {threshold})")]
    FailureThresholdExceeded { failures: usize, threshold: usize },

    /// 整批工具无任何可用结果且至少一次失败
    #[error("Tool batch produced no usable results")]
    EmptyToolBatch,

    #[error("Model error: {0}")]
    ModelError(String),

    /// 模型客户端未初始化/不可用（会话启动前置检查失败）
    #[error("Model client not ready: {0}")]
    ModelNotReady(String),

    #[error("Cancelled")]
    Cancelled,

    /// 账本中找不到 turn 对应的节点；附带全部已知 turn_refs 供诊断与快照回退
    #[error("Version node not found for turn '{turn_id}' (known turn refs: {known_turn_refs:?})")]
    NodeNotFound {
        turn_id: String,
        known_turn_refs: Vec<String>,
    },

    /// 索引指向的节点在存储中缺失：账本损坏，立即终止
    #[error("Ledger corrupted: {0}")]
    LedgerCorrupted(String),

    #[error("Ledger store error: {0}")]
    LedgerStore(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 是否为良性错误（不计入调度器失败阈值）
    pub fn is_benign(&self) -> bool {
        matches!(self, AgentError::ToolNotFound(_))
    }
}
