//! 模型能力画像
//!
//! 回合编排与调度行为随模型能力变化：并发上限、格式容错、畸形重试、渐进降级、
//! 流式截断倾向与上下文窗口。弱模型取保守默认值。

use serde::{Deserialize, Serialize};

/// 默认工具并发上限（保守值，保护弱模型不被结果乱序干扰）
pub const DEFAULT_TOOL_CONCURRENCY: usize = 2;

/// 默认上下文窗口（token）
pub const DEFAULT_CONTEXT_WINDOW: u64 = 128_000;

/// 模型能力画像
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    /// 模型标识（事件与日志用）
    pub name: String,
    /// 单 chunk 内工具并发上限（≥1）
    pub tool_concurrency: usize,
    /// 是否总是先校验/修复 Tool Call（轻量模型格式不稳）
    pub needs_format_tolerance: bool,
    /// 校验失败后是否允许使用修复结果继续（否则立即 FunctionCall 错误）
    pub enable_malformed_retry: bool,
    /// 失败数超阈值时是否继续执行（渐进降级）而非整批致命
    pub enable_progressive_degradation: bool,
    /// 流式输出是否容易截断参数（触发不完整性启发式检测）
    pub prone_to_incomplete_stream: bool,
    /// 上下文窗口（子代理压缩阈值基准）
    pub context_window_tokens: u64,
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
            tool_concurrency: DEFAULT_TOOL_CONCURRENCY,
            needs_format_tolerance: false,
            enable_malformed_retry: false,
            enable_progressive_degradation: false,
            prone_to_incomplete_stream: false,
            context_window_tokens: DEFAULT_CONTEXT_WINDOW,
        }
    }
}

impl ModelProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_concurrency(mut self, limit: usize) -> Self {
        self.tool_concurrency = limit.max(1);
        self
    }

    pub fn with_format_tolerance(mut self, enabled: bool) -> Self {
        self.needs_format_tolerance = enabled;
        self
    }

    pub fn with_malformed_retry(mut self, enabled: bool) -> Self {
        self.enable_malformed_retry = enabled;
        self
    }

    pub fn with_progressive_degradation(mut self, enabled: bool) -> Self {
        self.enable_progressive_degradation = enabled;
        self
    }

    pub fn with_incomplete_stream(mut self, enabled: bool) -> Self {
        self.prone_to_incomplete_stream = enabled;
        self
    }

    pub fn with_context_window(mut self, tokens: u64) -> Self {
        self.context_window_tokens = tokens;
        self
    }
}
