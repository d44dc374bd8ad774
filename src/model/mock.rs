//! Mock 模型客户端（用于测试，无需 API）
//!
//! 按脚本逐回合回放 ModelChunk 序列：每次 send_message 弹出一个脚本回合。
//! 脚本耗尽后回放纯文本 "Done."，便于循环自然终止。

use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::model::{
    ChunkStream, FinishReason, FunctionDecl, ModelChunk, ModelClient, ModelProfile, RawToolCall,
    TokenUsage,
};
use crate::turn::Turn;

/// 单个脚本回合：按顺序发射的分片
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    pub chunks: Vec<ModelChunk>,
}

impl ScriptedTurn {
    /// 纯文本回复（终止回合）
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            chunks: vec![ModelChunk {
                text: Some(text.into()),
                tool_calls: Vec::new(),
                finish_reason: Some(FinishReason::Stop),
            }],
        }
    }

    /// 一批 Tool Call（(name, args_json) 列表）
    pub fn tool_calls(calls: &[(&str, &str)]) -> Self {
        Self {
            chunks: vec![ModelChunk {
                text: None,
                tool_calls: calls
                    .iter()
                    .map(|(name, args)| RawToolCall {
                        id: None,
                        name: name.to_string(),
                        args_json: args.to_string(),
                    })
                    .collect(),
                finish_reason: Some(FinishReason::Stop),
            }],
        }
    }

    /// 带指定 finish_reason 的 Tool Call 回合（畸形输出场景）
    pub fn tool_calls_with_finish(calls: &[(&str, &str)], finish: FinishReason) -> Self {
        let mut t = Self::tool_calls(calls);
        if let Some(last) = t.chunks.last_mut() {
            last.finish_reason = Some(finish);
        }
        t
    }
}

/// 每次 mock 调用记账的固定 token 数（prompt, completion）
const MOCK_USAGE_PER_CALL: (u64, u64) = (7, 5);

/// Mock 客户端：脚本回放 + 调用计数
pub struct MockModelClient {
    profile: ModelProfile,
    script: Mutex<Vec<ScriptedTurn>>,
    calls_made: Mutex<usize>,
    usage: TokenUsage,
}

impl MockModelClient {
    pub fn new(script: Vec<ScriptedTurn>) -> Self {
        Self {
            profile: ModelProfile::new("mock"),
            script: Mutex::new(script),
            calls_made: Mutex::new(0),
            usage: TokenUsage::new(),
        }
    }

    pub fn with_profile(mut self, profile: ModelProfile) -> Self {
        self.profile = profile;
        self
    }

    /// send_message 被调用的次数（回合上限测试用）
    pub fn calls_made(&self) -> usize {
        *self.calls_made.lock().unwrap()
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    async fn send_message(
        &self,
        _system: &str,
        _history: &[Turn],
        _tools: &[FunctionDecl],
        _cancel: CancellationToken,
    ) -> Result<ChunkStream, AgentError> {
        *self.calls_made.lock().unwrap() += 1;
        self.usage.add(MOCK_USAGE_PER_CALL.0, MOCK_USAGE_PER_CALL.1);
        let next = {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                ScriptedTurn::text("Done.")
            } else {
                script.remove(0)
            }
        };
        let items: Vec<Result<ModelChunk, AgentError>> =
            next.chunks.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(items)))
    }

    fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}
