//! 任务委托工具
//!
//! 模型通过 delegate_task 把一个独立子任务交给子代理执行，拿回报告。
//! 本工具不进入子代理的受限工具集（subagent_eligible 为 false），
//! 委托因此不会递归嵌套。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::subagent::{SubAgentConfig, SubAgentStatus, SubAgentSupervisor, MAX_SUBAGENT_TURNS};
use crate::tools::edit::schema_value;
use crate::tools::{Tool, ToolOutput};

/// delegate_task 参数
#[derive(Debug, Deserialize, JsonSchema)]
struct DelegateArgs {
    /// 子任务描述（子代理的完整目标，自包含）
    task: String,
    /// 给子代理的附加上下文
    context: Option<String>,
    /// 子代理回合上限（缺省取硬上限）
    max_turns: Option<usize>,
}

/// 把任务委托给受限子代理并等待其报告
pub struct DelegateTaskTool {
    supervisor: SubAgentSupervisor,
}

impl DelegateTaskTool {
    pub fn new(supervisor: SubAgentSupervisor) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Tool for DelegateTaskTool {
    fn name(&self) -> &str {
        "delegate_task"
    }

    fn description(&self) -> &str {
        "Delegate a self-contained sub-task to a restricted sub-agent and wait for its report. \
Use for exploration or multi-step side quests that would clutter the main conversation."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<DelegateArgs>()
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let args: DelegateArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {}", e))?;

        let mut config = SubAgentConfig::new(args.task);
        if let Some(context) = args.context {
            config = config.with_context(context);
        }
        config = config.with_max_turns(args.max_turns.unwrap_or(MAX_SUBAGENT_TURNS));

        let result = self.supervisor.execute_task(config).await;
        match result.status {
            SubAgentStatus::Completed => {
                let mut content = result.report;
                if !result.files_created.is_empty() {
                    content.push_str(&format!(
                        "\n\nFiles created: {}",
                        result.files_created.join(", ")
                    ));
                }
                Ok(ToolOutput::text(content).with_display(serde_json::json!({
                    "agent_id": result.agent_id,
                    "turns_used": result.turns_used,
                    "total_tokens": result.token_usage.total_tokens,
                    "commands_run": result.commands_run,
                })))
            }
            SubAgentStatus::Cancelled => Err("Sub-agent cancelled".to_string()),
            _ => Err(result.report),
        }
    }
}
