//! 模型客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 ModelClient：send_message 返回 ModelChunk 流，
//! 每个 chunk 可携带文本增量、原始 Tool Call 与终止 finish_reason。
//! 不绑定任何特定供应商线协议；后端各自负责转换。

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::model::ModelProfile;
use crate::turn::Turn;

/// 流式响应的终止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    /// 模型自报 Tool Call 输出格式非法（轻量模型流式输出常见）
    MalformedToolCall,
}

/// 模型输出的原始 Tool Call：args 保持字符串形态，便于修复截断的 JSON
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawToolCall {
    /// 模型可能省略 id，由编排器补生成
    pub id: Option<String>,
    pub name: String,
    pub args_json: String,
}

/// 一个流式响应分片
#[derive(Debug, Clone, Default)]
pub struct ModelChunk {
    pub text: Option<String>,
    pub tool_calls: Vec<RawToolCall>,
    pub finish_reason: Option<FinishReason>,
}

/// 提供给模型的工具声明（name / description / JSON Schema 参数）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// ModelChunk 流
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, AgentError>> + Send>>;

/// 模型客户端 trait：发送 system 提示、累计历史与工具声明，取回分片流
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// 发送累计历史；system 每次调用传入（子代理动态拼装）；
    /// cancel 用于在流消费中途协作式中断
    async fn send_message(
        &self,
        system: &str,
        history: &[Turn],
        tools: &[FunctionDecl],
        cancel: CancellationToken,
    ) -> Result<ChunkStream, AgentError>;

    /// 当前激活模型的能力画像
    fn profile(&self) -> &ModelProfile;

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// Token 使用统计（累计值，跨调用共享）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}
