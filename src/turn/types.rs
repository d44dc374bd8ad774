//! 回合数据模型
//!
//! Turn（一次交换）、ContentPart（文本 / Tool Call 请求 / Tool Call 结果）、
//! ToolCallRequest / ToolCallResult 与回合终止状态。追加到历史后不再修改。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::FileOp;

/// 回合角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

/// 回合内容片段
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ToolCall(ToolCallRequest),
    ToolResult(ToolCallResult),
}

/// 一次交换回合：id 由调用方提供或自动生成，在单个会话内唯一
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Turn {
    pub fn new(id: impl Into<String>, role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            id: id.into(),
            role,
            parts,
        }
    }

    /// 用户文本回合（自动生成 id）
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(
            generate_turn_id(),
            Role::User,
            vec![ContentPart::Text { text: text.into() }],
        )
    }

    /// 模型回合：累计文本 + Tool Call 请求
    pub fn model(id: impl Into<String>, text: String, calls: Vec<ToolCallRequest>) -> Self {
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::Text { text });
        }
        parts.extend(calls.into_iter().map(ContentPart::ToolCall));
        Self::new(id, Role::Model, parts)
    }

    /// 工具结果回合（作为下一轮模型输入，角色为 User）
    pub fn tool_results(results: Vec<ToolCallResult>) -> Self {
        Self::new(
            generate_turn_id(),
            Role::User,
            results.into_iter().map(ContentPart::ToolResult).collect(),
        )
    }

    /// 回合内的纯文本拼接（忽略工具片段）
    pub fn text(&self) -> String {
        let mut out = String::new();
        for p in &self.parts {
            if let ContentPart::Text { text } = p {
                out.push_str(text);
            }
        }
        out
    }

    /// 回合内的 Tool Call 请求
    pub fn tool_calls(&self) -> Vec<&ToolCallRequest> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect()
    }
}

/// 生成回合 id
pub fn generate_turn_id() -> String {
    format!("turn-{}", Uuid::new_v4())
}

/// 生成调用 id（模型未提供 call_id 时使用）
pub fn generate_call_id() -> String {
    format!("call-{}", Uuid::new_v4())
}

/// 模型发出的工具调用请求；由调度器恰好消费一次
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub args: serde_json::Value,
    /// 是否由客户端侧（非模型）发起
    #[serde(default)]
    pub client_initiated: bool,
    /// 发起该调用的模型回合 id
    pub turn_id: String,
}

/// 工具调用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Success,
    Error,
    Canceled,
}

/// 工具调用结果（不可变）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub status: ToolCallStatus,
    /// 回馈给模型的内容
    pub content: String,
    /// 仅供外部观察者展示，不发送给模型
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<serde_json::Value>,
    /// 本次调用产生的文件变更（进入账本，不发送给模型）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_ops: Vec<FileOp>,
}

impl ToolCallResult {
    pub fn success(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            status: ToolCallStatus::Success,
            content: content.into(),
            display: None,
            file_ops: Vec::new(),
        }
    }

    pub fn error(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            status: ToolCallStatus::Error,
            content: content.into(),
            display: None,
            file_ops: Vec::new(),
        }
    }

    pub fn canceled(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            status: ToolCallStatus::Canceled,
            content: "Canceled before execution".to_string(),
            display: None,
            file_ops: Vec::new(),
        }
    }

    /// 是否携带可用的回馈内容（整批结果判定用）
    pub fn has_usable_content(&self) -> bool {
        self.status == ToolCallStatus::Success && !self.content.is_empty()
    }
}

/// 回合循环的正常终止状态（致命错误走 AgentError）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// 模型给出无工具调用的最终回复
    Completed { text: String },
    /// 达到回合上限：正常可报告状态，非错误
    MaxTurnsExceeded { limit: usize },
    /// 取消令牌触发
    Cancelled,
}

/// 单次 run_turns 的统计（子代理结果与观察者展示用）
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// 本次运行创建的文件（相对 workspace 路径）
    pub files_created: Vec<String>,
    /// 本次运行执行过的 shell 命令
    pub commands_run: Vec<String>,
    /// 工具调用总数
    pub tool_calls: usize,
}

/// run_turns 的完整返回：终止状态、消耗回合数与统计
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: TurnOutcome,
    pub turns_used: usize,
    pub stats: RunStats,
}
