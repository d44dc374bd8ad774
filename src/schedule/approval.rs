//! 审批门
//!
//! 工具调用执行前的确认检查点：工具声明 requires_approval 且会话策略未自动放行时，
//! 询问 ApprovalGate（可能长时间挂起，必须可取消）。ProceedAlways 会修改会话级策略，
//! 同形调用在本会话内自动放行。策略挂在会话对象上，不使用全局可变单例。

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::turn::ToolCallRequest;

/// 用户对单个调用的决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// 仅放行本次
    ProceedOnce,
    /// 放行并在本会话内自动放行同名工具
    ProceedAlways,
    /// 拒绝：调用不执行，产生合成的拒绝结果
    Reject,
}

/// 审批门：交互确认的外部协作者（展示层实现）；请求可能无限期挂起
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request_approval(&self, request: &ToolCallRequest) -> ApprovalOutcome;
}

/// 无人值守场景：一律放行
#[derive(Debug, Default)]
pub struct AutoApprovalGate;

#[async_trait]
impl ApprovalGate for AutoApprovalGate {
    async fn request_approval(&self, _request: &ToolCallRequest) -> ApprovalOutcome {
        ApprovalOutcome::ProceedOnce
    }
}

/// 测试/严格场景：一律拒绝
#[derive(Debug, Default)]
pub struct RejectAllGate;

#[async_trait]
impl ApprovalGate for RejectAllGate {
    async fn request_approval(&self, _request: &ToolCallRequest) -> ApprovalOutcome {
        ApprovalOutcome::Reject
    }
}

/// 会话级审批策略：ProceedAlways 累积的自动放行集合
#[derive(Debug, Default)]
pub struct SessionApprovalPolicy {
    always_allowed: RwLock<HashSet<String>>,
}

impl SessionApprovalPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// 该工具是否已被会话策略自动放行
    pub fn is_auto_allowed(&self, tool_name: &str) -> bool {
        self.always_allowed.read().unwrap().contains(tool_name)
    }

    /// 记录 ProceedAlways 决定
    pub fn allow_always(&self, tool_name: &str) {
        self.always_allowed
            .write()
            .unwrap()
            .insert(tool_name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proceed_always_mutates_policy() {
        let policy = SessionApprovalPolicy::new();
        assert!(!policy.is_auto_allowed("shell"));
        policy.allow_always("shell");
        assert!(policy.is_auto_allowed("shell"));
        assert!(!policy.is_auto_allowed("write_file"));
    }
}
