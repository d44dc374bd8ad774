//! 子代理历史压缩
//!
//! 子代理常跑长循环，历史逼近上下文窗口时触发压缩：旧回合折叠为一条摘要，
//! 最近的回合完整保留。压缩失败只告警不中断任务。

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::model::ModelClient;
use crate::turn::{ContentPart, Role, Turn};

/// 触发压缩的窗口占用比例
pub const COMPRESSION_THRESHOLD_RATIO: f64 = 0.8;

/// 压缩后完整保留的末尾回合数
const KEEP_RECENT_TURNS: usize = 4;

/// 粗略 token 估计：4 字符 ≈ 1 token（按字节计，宽松上偏）
pub fn estimate_tokens(history: &[Turn]) -> u64 {
    let mut chars = 0usize;
    for turn in history {
        for part in &turn.parts {
            chars += match part {
                ContentPart::Text { text } => text.len(),
                ContentPart::ToolCall(c) => c.name.len() + c.args.to_string().len(),
                ContentPart::ToolResult(r) => r.content.len(),
            };
        }
    }
    (chars / 4) as u64
}

/// 是否超过压缩阈值
pub fn over_threshold(history: &[Turn], context_window_tokens: u64) -> bool {
    let limit = (context_window_tokens as f64 * COMPRESSION_THRESHOLD_RATIO) as u64;
    estimate_tokens(history) > limit
}

/// 历史压缩器：输入完整历史，输出压缩后的等效历史
#[async_trait]
pub trait HistoryCompressor: Send + Sync {
    async fn compress(
        &self,
        history: &[Turn],
        cancel: &CancellationToken,
    ) -> Result<Vec<Turn>, AgentError>;
}

/// 模型摘要压缩器：让模型把旧回合总结为一段进度摘要，
/// 摘要以 User 回合形式放回历史头部，末尾 KEEP_RECENT_TURNS 个回合原样保留
pub struct ModelCompressor {
    model: Arc<dyn ModelClient>,
}

impl ModelCompressor {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }
}

const SUMMARY_SYSTEM: &str = "You are a summarization assistant. Condense the given \
agent transcript into a concise progress summary: what was asked, what has been done, \
key file paths and findings, and what remains. Output plain text only.";

#[async_trait]
impl HistoryCompressor for ModelCompressor {
    async fn compress(
        &self,
        history: &[Turn],
        cancel: &CancellationToken,
    ) -> Result<Vec<Turn>, AgentError> {
        if history.len() <= KEEP_RECENT_TURNS {
            return Ok(history.to_vec());
        }
        let (old, recent) = history.split_at(history.len() - KEEP_RECENT_TURNS);

        // 旧回合铺平成一段文本请求摘要
        let transcript = render_transcript(old);
        let ask = vec![Turn::user(transcript)];
        use futures_util::StreamExt;
        let mut stream = self
            .model
            .send_message(SUMMARY_SYSTEM, &ask, &[], cancel.clone())
            .await?;
        let mut summary = String::new();
        while let Some(chunk) = stream.next().await {
            if let Some(text) = chunk?.text {
                summary.push_str(&text);
            }
        }
        if summary.trim().is_empty() {
            return Err(AgentError::ModelError(
                "compressor returned empty summary".to_string(),
            ));
        }

        let mut out = Vec::with_capacity(KEEP_RECENT_TURNS + 1);
        out.push(Turn::user(format!(
            "[Progress so far, summarized]\n{}",
            summary.trim()
        )));
        out.extend(recent.iter().cloned());
        tracing::debug!(
            before = history.len(),
            after = out.len(),
            "sub-agent history compressed"
        );
        Ok(out)
    }
}

fn render_transcript(turns: &[Turn]) -> String {
    let mut out = String::new();
    for turn in turns {
        let label = match turn.role {
            Role::User => "input",
            Role::Model => "agent",
        };
        for part in &turn.parts {
            match part {
                ContentPart::Text { text } => {
                    out.push_str(&format!("[{}] {}\n", label, text));
                }
                ContentPart::ToolCall(c) => {
                    out.push_str(&format!("[agent] called {}({})\n", c.name, c.args));
                }
                ContentPart::ToolResult(r) => {
                    let preview: String = r.content.chars().take(300).collect();
                    out.push_str(&format!("[tool:{:?}] {}\n", r.status, preview));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MockModelClient, ScriptedTurn};

    #[test]
    fn test_threshold_detection() {
        let short = vec![Turn::user("hi")];
        assert!(!over_threshold(&short, 1000));

        let long = vec![Turn::user("x".repeat(5000))];
        assert!(over_threshold(&long, 1000));
    }

    #[tokio::test]
    async fn test_compress_keeps_recent_turns() {
        let model = MockModelClient::new(vec![ScriptedTurn::text("summary of early work")]);
        let compressor = ModelCompressor::new(Arc::new(model));

        let history: Vec<Turn> = (0..8).map(|i| Turn::user(format!("turn {}", i))).collect();
        let out = compressor
            .compress(&history, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.len(), 5);
        assert!(out[0].text().contains("summary of early work"));
        assert_eq!(out[4].text(), "turn 7");
    }

    #[tokio::test]
    async fn test_short_history_untouched() {
        let model = MockModelClient::new(vec![]);
        let compressor = ModelCompressor::new(Arc::new(model));
        let history = vec![Turn::user("a"), Turn::user("b")];
        let out = compressor
            .compress(&history, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
    }
}
