//! 子代理监督器
//!
//! 把一个独立任务委托给受限的嵌套回合循环：工具集取父注册表的 subagent_view
//! （阻断写审批外溢与递归委托），回合上限硬封顶，历史逼近上下文窗口时压缩。
//! 生命周期：Starting → Running → Completing → Completed，或 Failed / Cancelled。
//! 子代理的失败折叠进结果，不向父会话抛错。

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ledger::ChangeLedger;
use crate::model::ModelClient;
use crate::schedule::{AutoApprovalGate, SessionApprovalPolicy, ToolScheduler};
use crate::subagent::compress::{over_threshold, HistoryCompressor};
use crate::tools::{ToolExecutor, ToolRegistry};
use crate::turn::{AgentEvent, EventSink, Exchange, StepOutcome, TurnOrchestrator};

/// 子代理回合数硬上限（配置值超出时封顶）
pub const MAX_SUBAGENT_TURNS: usize = 50;

/// 子代理工具调用超时（秒）
const SUBAGENT_TOOL_TIMEOUT_SECS: u64 = 120;

/// 子代理生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAgentStatus {
    Starting,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl SubAgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubAgentStatus::Completed | SubAgentStatus::Failed | SubAgentStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubAgentStatus::Starting => "starting",
            SubAgentStatus::Running => "running",
            SubAgentStatus::Completing => "completing",
            SubAgentStatus::Completed => "completed",
            SubAgentStatus::Failed => "failed",
            SubAgentStatus::Cancelled => "cancelled",
        }
    }
}

/// 委托任务配置
#[derive(Debug, Clone)]
pub struct SubAgentConfig {
    /// 任务描述（子代理的目标）
    pub task: String,
    /// 附加上下文（父会话摘出的相关信息）
    pub context: Option<String>,
    /// 回合上限（默认与硬上限一致）
    pub max_turns: usize,
}

impl SubAgentConfig {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            context: None,
            max_turns: MAX_SUBAGENT_TURNS,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    fn effective_max_turns(&self) -> usize {
        self.max_turns.clamp(1, MAX_SUBAGENT_TURNS)
    }
}

/// 单个子代理消耗的 token：共享客户端累计值在委托前后的差
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubAgentTokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl SubAgentTokenUsage {
    fn delta(before: (u64, u64, u64), after: (u64, u64, u64)) -> Self {
        Self {
            prompt_tokens: after.0.saturating_sub(before.0),
            completion_tokens: after.1.saturating_sub(before.1),
            total_tokens: after.2.saturating_sub(before.2),
        }
    }
}

/// 子代理执行结果：失败也走这里（status = Failed，report 为原因）
#[derive(Debug, Clone)]
pub struct SubAgentResult {
    pub agent_id: String,
    pub status: SubAgentStatus,
    /// 最终回复或失败原因
    pub report: String,
    pub turns_used: usize,
    pub token_usage: SubAgentTokenUsage,
    pub files_created: Vec<String>,
    pub commands_run: Vec<String>,
}

/// 异步委托的句柄：取消令牌 + join
pub struct SubAgentHandle {
    pub agent_id: String,
    cancel: CancellationToken,
    join: JoinHandle<SubAgentResult>,
}

impl SubAgentHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 等待子代理结束。任务 panic 时折叠为 Failed 结果
    pub async fn join(self) -> SubAgentResult {
        let agent_id = self.agent_id.clone();
        match self.join.await {
            Ok(result) => result,
            Err(e) => SubAgentResult {
                agent_id,
                status: SubAgentStatus::Failed,
                report: format!("sub-agent task aborted: {}", e),
                turns_used: 0,
                token_usage: SubAgentTokenUsage::default(),
                files_created: Vec::new(),
                commands_run: Vec::new(),
            },
        }
    }
}

/// 子代理监督器：按需克隆派生受限循环
#[derive(Clone)]
pub struct SubAgentSupervisor {
    model: Arc<dyn ModelClient>,
    registry: ToolRegistry,
    ledger: Arc<ChangeLedger>,
    events: EventSink,
    compressor: Option<Arc<dyn HistoryCompressor>>,
    parent_cancel: CancellationToken,
}

impl SubAgentSupervisor {
    pub fn new(
        model: Arc<dyn ModelClient>,
        registry: ToolRegistry,
        ledger: Arc<ChangeLedger>,
        events: EventSink,
        parent_cancel: CancellationToken,
    ) -> Self {
        Self {
            model,
            registry,
            ledger,
            events,
            compressor: None,
            parent_cancel,
        }
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn HistoryCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// 同步委托：在当前任务上运行到终止
    pub async fn execute_task(&self, config: SubAgentConfig) -> SubAgentResult {
        // 子令牌随本次委托结束即丢弃，父令牌上不留监听
        let cancel = self.parent_cancel.child_token();
        self.run(config, cancel).await
    }

    /// 异步委托：派生后台任务，返回句柄
    pub fn spawn(&self, config: SubAgentConfig) -> SubAgentHandle {
        let cancel = self.parent_cancel.child_token();
        let agent_cancel = cancel.clone();
        let this = self.clone();
        let agent_id = generate_agent_id();
        let id_for_run = agent_id.clone();
        let join = tokio::spawn(async move { this.run_with_id(id_for_run, config, agent_cancel).await });
        SubAgentHandle {
            agent_id,
            cancel,
            join,
        }
    }

    async fn run(&self, config: SubAgentConfig, cancel: CancellationToken) -> SubAgentResult {
        self.run_with_id(generate_agent_id(), config, cancel).await
    }

    async fn run_with_id(
        &self,
        agent_id: String,
        config: SubAgentConfig,
        cancel: CancellationToken,
    ) -> SubAgentResult {
        let max_turns = config.effective_max_turns();
        // 模型客户端与父会话共享，按前后差值归账本次委托的 token 消耗
        let usage_before = self.model.token_usage();
        self.emit_status(&agent_id, SubAgentStatus::Starting, 0);
        tracing::info!(agent_id = %agent_id, task = %config.task, max_turns, "sub-agent starting");

        let restricted = self.registry.subagent_view();
        let restricted_names = restricted.tool_names();
        let scheduler = ToolScheduler::new(
            ToolExecutor::new(restricted.clone(), SUBAGENT_TOOL_TIMEOUT_SECS),
            // 受限工具集不含需交互审批的危险入口，审批门直通
            Arc::new(AutoApprovalGate),
            Arc::new(SessionApprovalPolicy::new()),
            self.events.clone(),
        );
        let orchestrator = TurnOrchestrator::new(
            self.model.clone(),
            scheduler,
            restricted,
            self.ledger.clone(),
            self.events.clone(),
            build_system_prompt(&config, &restricted_names),
        )
        .with_max_turns(max_turns);

        let mut exchange = Exchange::new();
        exchange.push_user(config.task.clone());

        let window = self.model.profile().context_window_tokens;
        let mut final_text: Option<String> = None;
        let mut status = SubAgentStatus::Running;

        for turn in 1..=max_turns {
            self.emit_status(&agent_id, SubAgentStatus::Running, turn);

            if let Some(compressor) = &self.compressor {
                if over_threshold(&exchange.history, window) {
                    match compressor.compress(&exchange.history, &cancel).await {
                        Ok(compressed) => exchange.history = compressed,
                        // 压缩失败不致命：带着完整历史继续
                        Err(e) => {
                            tracing::warn!(agent_id = %agent_id, error = %e, "history compression failed")
                        }
                    }
                }
            }

            match orchestrator.step(&mut exchange, &cancel).await {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Final(text)) => {
                    self.emit_status(&agent_id, SubAgentStatus::Completing, turn);
                    final_text = Some(text);
                    status = SubAgentStatus::Completed;
                    break;
                }
                Ok(StepOutcome::Cancelled) => {
                    status = SubAgentStatus::Cancelled;
                    break;
                }
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, error = %e, "sub-agent failed");
                    final_text = Some(format!("Sub-agent failed: {}", e));
                    status = SubAgentStatus::Failed;
                    break;
                }
            }
        }

        let report = match (status, final_text) {
            (SubAgentStatus::Cancelled, _) => "Sub-agent cancelled".to_string(),
            (_, Some(text)) => text,
            // 循环耗尽上限：汇总留在 report 中，状态仍算完成
            (_, None) => {
                status = SubAgentStatus::Completed;
                format!(
                    "Sub-agent stopped at the {}-turn limit without a final reply",
                    max_turns
                )
            }
        };

        let token_usage = SubAgentTokenUsage::delta(usage_before, self.model.token_usage());
        self.emit_status(&agent_id, status, exchange.current_turn);
        tracing::info!(
            agent_id = %agent_id,
            status = status.as_str(),
            turns = exchange.current_turn,
            total_tokens = token_usage.total_tokens,
            "sub-agent finished"
        );
        SubAgentResult {
            agent_id,
            status,
            report,
            turns_used: exchange.current_turn,
            token_usage,
            files_created: exchange.stats.files_created,
            commands_run: exchange.stats.commands_run,
        }
    }

    fn emit_status(&self, agent_id: &str, status: SubAgentStatus, current_turn: usize) {
        self.events.emit(AgentEvent::SubAgentUpdate {
            agent_id: agent_id.to_string(),
            status: status.as_str().to_string(),
            current_turn,
        });
    }
}

fn generate_agent_id() -> String {
    format!("agent-{}", Uuid::new_v4())
}

/// 由任务、上下文与可用工具名拼装子代理 system 提示
fn build_system_prompt(config: &SubAgentConfig, tool_names: &[String]) -> String {
    let mut prompt = String::from(
        "You are a focused sub-agent. Complete exactly the task you are given using the \
available tools, then reply with a concise report of what you did and found. \
Do not ask questions; make reasonable assumptions.",
    );
    if !tool_names.is_empty() {
        prompt.push_str("\n\nAvailable tools: ");
        prompt.push_str(&tool_names.join(", "));
    }
    if let Some(context) = &config.context {
        prompt.push_str("\n\nContext from the parent session:\n");
        prompt.push_str(context);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::model::{MockModelClient, ScriptedTurn};
    use crate::tools::{Tool, ToolOutput};

    struct LookupTool;

    #[async_trait]
    impl Tool for LookupTool {
        fn name(&self) -> &str {
            "lookup"
        }
        fn description(&self) -> &str {
            "lookup"
        }
        fn subagent_eligible(&self) -> bool {
            true
        }
        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            // 微小延迟，让取消测试有机会插在回合之间
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            Ok(ToolOutput::text("42"))
        }
    }

    struct ForbiddenTool;

    #[async_trait]
    impl Tool for ForbiddenTool {
        fn name(&self) -> &str {
            "delegate_task"
        }
        fn description(&self) -> &str {
            "nested delegation"
        }
        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            Ok(ToolOutput::text("must never run"))
        }
    }

    fn supervisor(model: MockModelClient) -> SubAgentSupervisor {
        let mut registry = ToolRegistry::new();
        registry.register(LookupTool);
        registry.register(ForbiddenTool);
        SubAgentSupervisor::new(
            Arc::new(model),
            registry,
            Arc::new(ChangeLedger::in_memory("/tmp")),
            EventSink::disabled(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn sync_task_runs_to_completed() {
        let model = MockModelClient::new(vec![
            ScriptedTurn::tool_calls(&[("lookup", "{}")]),
            ScriptedTurn::text("The answer is 42."),
        ]);
        let sup = supervisor(model);

        let result = sup
            .execute_task(SubAgentConfig::new("find the answer"))
            .await;

        assert_eq!(result.status, SubAgentStatus::Completed);
        assert_eq!(result.report, "The answer is 42.");
        assert_eq!(result.turns_used, 2);
        // mock 每次调用记 7+5 token，两回合共 24
        assert_eq!(result.token_usage.prompt_tokens, 14);
        assert_eq!(result.token_usage.completion_tokens, 10);
        assert_eq!(result.token_usage.total_tokens, 24);
    }

    #[tokio::test]
    async fn token_usage_is_delta_not_cumulative() {
        // 共享客户端已有余额时，结果只记本次委托的增量
        let model = MockModelClient::new(vec![
            ScriptedTurn::text("warm-up"),
            ScriptedTurn::text("actual work"),
        ]);
        let model = Arc::new(model);
        let mut registry = ToolRegistry::new();
        registry.register(LookupTool);
        let sup = SubAgentSupervisor::new(
            model.clone(),
            registry,
            Arc::new(ChangeLedger::in_memory("/tmp")),
            EventSink::disabled(),
            CancellationToken::new(),
        );

        let first = sup.execute_task(SubAgentConfig::new("warm up")).await;
        let second = sup.execute_task(SubAgentConfig::new("work")).await;
        assert_eq!(first.token_usage.total_tokens, 12);
        assert_eq!(second.token_usage.total_tokens, 12);
        assert_eq!(model.token_usage().2, 24);
    }

    #[tokio::test]
    async fn ineligible_tool_is_invisible_to_subagent() {
        // 模型坚持调用被过滤的工具：得到 Tool not found，良性，循环继续到脚本耗尽
        let model = MockModelClient::new(vec![
            ScriptedTurn::tool_calls(&[("delegate_task", "{}")]),
            ScriptedTurn::text("gave up"),
        ]);
        let sup = supervisor(model);

        let result = sup.execute_task(SubAgentConfig::new("try nesting")).await;
        assert_eq!(result.status, SubAgentStatus::Completed);
        assert_eq!(result.report, "gave up");
    }

    #[tokio::test]
    async fn max_turns_is_hard_capped() {
        let cfg = SubAgentConfig::new("x").with_max_turns(10_000);
        assert_eq!(cfg.effective_max_turns(), MAX_SUBAGENT_TURNS);
        let cfg = SubAgentConfig::new("x").with_max_turns(0);
        assert_eq!(cfg.effective_max_turns(), 1);
    }

    #[tokio::test]
    async fn spawned_task_can_be_cancelled() {
        // 无限工具循环脚本，靠取消终止
        let script: Vec<ScriptedTurn> = (0..MAX_SUBAGENT_TURNS)
            .map(|_| ScriptedTurn::tool_calls(&[("lookup", "{}")]))
            .collect();
        let sup = supervisor(MockModelClient::new(script));

        let handle = sup.spawn(SubAgentConfig::new("spin"));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        handle.cancel();
        let result = handle.join().await;

        assert_eq!(result.status, SubAgentStatus::Cancelled);
        assert_eq!(result.report, "Sub-agent cancelled");
    }

    #[tokio::test]
    async fn parent_cancel_reaches_child_token() {
        let model = MockModelClient::new(
            (0..MAX_SUBAGENT_TURNS)
                .map(|_| ScriptedTurn::tool_calls(&[("lookup", "{}")]))
                .collect(),
        );
        let mut registry = ToolRegistry::new();
        registry.register(LookupTool);
        let parent = CancellationToken::new();
        let sup = SubAgentSupervisor::new(
            Arc::new(model),
            registry,
            Arc::new(ChangeLedger::in_memory("/tmp")),
            EventSink::disabled(),
            parent.clone(),
        );

        let handle = sup.spawn(SubAgentConfig::new("spin"));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        parent.cancel();
        let result = handle.join().await;
        assert_eq!(result.status, SubAgentStatus::Cancelled);
    }

    #[tokio::test]
    async fn status_transitions_are_emitted_in_order() {
        let (events, mut rx) = EventSink::channel();
        let mut registry = ToolRegistry::new();
        registry.register(LookupTool);
        let model = MockModelClient::new(vec![
            ScriptedTurn::tool_calls(&[("lookup", "{}")]),
            ScriptedTurn::text("done"),
        ]);
        let sup = SubAgentSupervisor::new(
            Arc::new(model),
            registry,
            Arc::new(ChangeLedger::in_memory("/tmp")),
            events,
            CancellationToken::new(),
        );

        let result = sup.execute_task(SubAgentConfig::new("go")).await;
        assert_eq!(result.status, SubAgentStatus::Completed);

        let mut statuses = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let AgentEvent::SubAgentUpdate { status, .. } = ev {
                statuses.push(status);
            }
        }
        assert_eq!(statuses.first().map(String::as_str), Some("starting"));
        assert!(statuses.iter().any(|s| s == "completing"));
        assert_eq!(statuses.last().map(String::as_str), Some("completed"));
    }
}
