//! Agent 过程事件：供外部展示层消费的流式观察协议
//!
//! 封闭的事件变体集合（session_init / message / tool_use / tool_result / subagent_update /
//! error / result），核心只负责发射，不做任何格式化或渲染。

use serde::Serialize;
use tokio::sync::mpsc;

use crate::turn::types::{Role, ToolCallStatus};

/// 工具结果预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

/// 过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 会话初始化
    SessionInit { session_id: String, model: String },
    /// 一条消息（delta 为 true 时表示流式增量）
    Message {
        role: Role,
        text: String,
        delta: bool,
    },
    /// 调用工具
    ToolUse {
        call_id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（截断预览，避免过长）
    ToolResult {
        call_id: String,
        status: ToolCallStatus,
        preview: String,
    },
    /// 子代理状态变化
    SubAgentUpdate {
        agent_id: String,
        status: String,
        current_turn: usize,
    },
    /// 错误
    Error { text: String },
    /// 终止：状态与 token 统计
    Result {
        status: String,
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
    },
}

/// 事件发射端：持有可选 sender，未注入时事件被丢弃
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl EventSink {
    /// 创建带通道的发射端，返回 (sink, receiver)
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// 无观察者的发射端（事件全部丢弃）
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, ev: AgentEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ev);
        }
    }

    /// 工具结果事件（内容截断为预览）
    pub fn emit_tool_result(&self, call_id: &str, status: ToolCallStatus, content: &str) {
        let preview: String = content.chars().take(RESULT_PREVIEW_CHARS).collect();
        let preview = if content.chars().count() > RESULT_PREVIEW_CHARS {
            format!("{}...", preview)
        } else {
            preview
        };
        self.emit(AgentEvent::ToolResult {
            call_id: call_id.to_string(),
            status,
            preview,
        });
    }
}
