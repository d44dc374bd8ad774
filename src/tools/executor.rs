//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(request) 在超时内调用对应工具，
//! 超时或失败时转为 AgentError（ToolTimeout / ToolExecutionFailed / ToolNotFound）；
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::{Tool, ToolOutput, ToolRegistry};
use crate::turn::ToolCallRequest;

/// 工具执行器：对每次调用施加超时，并将结果映射为 AgentError
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn get_tool(&self, name: &str) -> Option<std::sync::Arc<dyn Tool>> {
        self.registry.get(name)
    }

    /// 执行一次工具调用；工具缺失返回 ToolNotFound（良性），超时返回 ToolTimeout，
    /// 工具返回 Err 则转为 ToolExecutionFailed；输出 JSON 审计日志
    pub async fn execute(&self, request: &ToolCallRequest) -> Result<ToolOutput, AgentError> {
        let tool = self
            .registry
            .get(&request.name)
            .ok_or_else(|| AgentError::ToolNotFound(request.name.clone()))?;

        let start = Instant::now();
        let result = timeout(self.timeout, tool.execute(request.args.clone())).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": request.name,
            "call_id": request.call_id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview(&request.args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(AgentError::ToolExecutionFailed(e)),
            Err(_) => Err(AgentError::ToolTimeout(request.name.clone())),
        }
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
