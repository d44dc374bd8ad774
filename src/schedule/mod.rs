//! 工具调度：审批门与有界并发调度器

mod approval;
mod scheduler;

pub use approval::{
    ApprovalGate, ApprovalOutcome, AutoApprovalGate, RejectAllGate, SessionApprovalPolicy,
};
pub use scheduler::{BatchOutcome, ToolScheduler, FAILURE_THRESHOLD};
