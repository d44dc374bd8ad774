//! 回合编排循环
//!
//! 驱动「模型响应 → Tool Call 定稿 → 批量执行 → 结果回填历史」的核心循环。
//! 每个模型回合产生唯一 turn_id；产生文件变更的回合将变更记入账本，
//! 含 Tool Call 的交换中的纯文本终止回合也记一个空操作占位节点，
//! 保证「回合 → 账本节点」的可回溯映射不缺项。回合上限与取消都是正常
//! 终止状态，通过 TurnOutcome 报告；致命错误走 AgentError。

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::ledger::{ChangeLedger, FileOp};
use crate::model::{FinishReason, ModelClient, RawToolCall};
use crate::schedule::{BatchOutcome, ToolScheduler};
use crate::tools::ToolRegistry;
use crate::turn::repair::finalize_calls;
use crate::turn::{
    generate_turn_id, AgentEvent, EventSink, Role, RunReport, RunStats, Turn, ToolCallRequest,
    ToolCallResult, TurnOutcome,
};

/// 默认回合上限
pub const DEFAULT_MAX_TURNS: usize = 100;

/// 一次交换的可变状态：累计历史、回合计数与统计。
/// 跨多次 run_turns 复用同一个 Exchange 即可延续对话。
#[derive(Default)]
pub struct Exchange {
    pub history: Vec<Turn>,
    /// 本交换内已消耗的模型回合数
    pub current_turn: usize,
    /// 本交换内是否出现过 Tool Call（占位节点判定用）
    pub tool_calls_seen: bool,
    pub stats: RunStats,
}

impl Exchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加用户输入回合，开启新一段交换：占位判定只看本段内的 Tool Call
    pub fn push_user(&mut self, text: impl Into<String>) {
        self.tool_calls_seen = false;
        self.history.push(Turn::user(text));
    }
}

/// 单步推进的结论
pub enum StepOutcome {
    /// 模型发出了 Tool Call，结果已回填历史，循环继续
    Continue,
    /// 模型给出无 Tool Call 的最终文本
    Final(String),
    /// 取消令牌已触发
    Cancelled,
}

/// 回合编排器：组合模型客户端、调度器与账本，驱动完整回合循环
pub struct TurnOrchestrator {
    model: Arc<dyn ModelClient>,
    scheduler: ToolScheduler,
    registry: ToolRegistry,
    ledger: Arc<ChangeLedger>,
    events: EventSink,
    system_prompt: String,
    max_turns: usize,
}

impl TurnOrchestrator {
    pub fn new(
        model: Arc<dyn ModelClient>,
        scheduler: ToolScheduler,
        registry: ToolRegistry,
        ledger: Arc<ChangeLedger>,
        events: EventSink,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            model,
            scheduler,
            registry,
            ledger,
            events,
            system_prompt: system_prompt.into(),
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// 运行回合循环直到终止：最终回复 / 回合上限 / 取消。
    /// 上限与取消是正常结论，不是错误；致命错误（畸形调用不可修复、
    /// 失败数超阈值、模型错误）以 Err 返回，已产生的文件变更此前已记入账本。
    pub async fn run_turns(
        &self,
        exchange: &mut Exchange,
        cancel: &CancellationToken,
    ) -> Result<RunReport, AgentError> {
        let start_turn = exchange.current_turn;
        while exchange.current_turn - start_turn < self.max_turns {
            match self.step(exchange, cancel).await? {
                StepOutcome::Continue => {}
                StepOutcome::Final(text) => {
                    return Ok(RunReport {
                        outcome: TurnOutcome::Completed { text },
                        turns_used: exchange.current_turn - start_turn,
                        stats: exchange.stats.clone(),
                    });
                }
                StepOutcome::Cancelled => {
                    return Ok(RunReport {
                        outcome: TurnOutcome::Cancelled,
                        turns_used: exchange.current_turn - start_turn,
                        stats: exchange.stats.clone(),
                    });
                }
            }
        }
        tracing::warn!(limit = self.max_turns, "turn limit reached");
        Ok(RunReport {
            outcome: TurnOutcome::MaxTurnsExceeded {
                limit: self.max_turns,
            },
            turns_used: exchange.current_turn - start_turn,
            stats: exchange.stats.clone(),
        })
    }

    /// 单步：请求模型、定稿 Tool Call、执行批次并回填历史
    pub async fn step(
        &self,
        exchange: &mut Exchange,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, AgentError> {
        if cancel.is_cancelled() {
            return Ok(StepOutcome::Cancelled);
        }

        let decls = self.registry.function_declarations();
        let mut stream = self
            .model
            .send_message(&self.system_prompt, &exchange.history, &decls, cancel.clone())
            .await?;

        // 消费分片流：文本增量即时发射，Tool Call 原样累计待定稿
        let mut text = String::new();
        let mut raw_calls: Vec<RawToolCall> = Vec::new();
        let mut finish_reason: Option<FinishReason> = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if let Some(delta) = chunk.text {
                self.events.emit(AgentEvent::Message {
                    role: Role::Model,
                    text: delta.clone(),
                    delta: true,
                });
                text.push_str(&delta);
            }
            raw_calls.extend(chunk.tool_calls);
            if chunk.finish_reason.is_some() {
                finish_reason = chunk.finish_reason;
            }
        }

        let turn_id = generate_turn_id();
        exchange.current_turn += 1;

        let profile = self.model.profile();
        let calls = finalize_calls(raw_calls, profile, finish_reason, &turn_id)?;

        if calls.is_empty() {
            exchange
                .history
                .push(Turn::model(&turn_id, text.clone(), Vec::new()));
            // 本交换出现过 Tool Call 的情况下，终止回合也要在账本里占位，
            // 使每个回合都可作为 revert 目标
            if exchange.tool_calls_seen {
                self.ledger.record_turn(&turn_id, Vec::new())?;
            }
            return Ok(StepOutcome::Final(text));
        }

        exchange.tool_calls_seen = true;
        exchange.stats.tool_calls += calls.len();
        exchange
            .history
            .push(Turn::model(&turn_id, text, calls.clone()));

        let outcome = self
            .scheduler
            .execute(&calls, profile.tool_concurrency, profile, cancel)
            .await;

        match outcome {
            BatchOutcome::Completed(results) => {
                self.absorb_results(exchange, &turn_id, &calls, results)?;
                if cancel.is_cancelled() {
                    return Ok(StepOutcome::Cancelled);
                }
                Ok(StepOutcome::Continue)
            }
            BatchOutcome::Fatal { error, partial } => {
                // 中止前先把已落盘的变更记入账本，revert 才能覆盖它们
                self.absorb_results(exchange, &turn_id, &calls, partial)?;
                self.events.emit(AgentEvent::Error {
                    text: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// 结果回填：文件变更记入账本、统计更新、结果回合追加历史
    fn absorb_results(
        &self,
        exchange: &mut Exchange,
        turn_id: &str,
        calls: &[ToolCallRequest],
        results: Vec<ToolCallResult>,
    ) -> Result<(), AgentError> {
        let mut ops: Vec<FileOp> = Vec::new();
        for r in &results {
            for op in &r.file_ops {
                if let FileOp::Create { path, .. } = op {
                    exchange.stats.files_created.push(path.clone());
                }
            }
            ops.extend(r.file_ops.iter().cloned());
        }
        for call in calls {
            if call.name == "shell" {
                if let Some(cmd) = call.args.get("command").and_then(|v| v.as_str()) {
                    exchange.stats.commands_run.push(cmd.to_string());
                }
            }
        }
        self.ledger.record_turn(turn_id, ops)?;
        exchange.history.push(Turn::tool_results(results));
        Ok(())
    }

    pub fn ledger(&self) -> &Arc<ChangeLedger> {
        &self.ledger
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::{MockModelClient, ModelProfile, ScriptedTurn};
    use crate::schedule::{AutoApprovalGate, SessionApprovalPolicy, ToolScheduler};
    use crate::tools::{Tool, ToolExecutor, ToolOutput, ToolRegistry};

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo args back"
        }
        async fn execute(&self, args: serde_json::Value) -> Result<ToolOutput, String> {
            Ok(ToolOutput::text(args.to_string()))
        }
    }

    fn orchestrator(model: MockModelClient) -> TurnOrchestrator {
        orchestrator_shared(Arc::new(model))
    }

    fn orchestrator_shared(model: Arc<MockModelClient>) -> TurnOrchestrator {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let scheduler = ToolScheduler::new(
            ToolExecutor::new(registry.clone(), 5),
            Arc::new(AutoApprovalGate),
            Arc::new(SessionApprovalPolicy::new()),
            EventSink::disabled(),
        );
        let ledger = Arc::new(ChangeLedger::in_memory("/tmp"));
        TurnOrchestrator::new(
            model,
            scheduler,
            registry,
            ledger,
            EventSink::disabled(),
            "You are a coding agent.",
        )
    }

    #[tokio::test]
    async fn pure_text_reply_completes_in_one_turn() {
        let model = MockModelClient::new(vec![ScriptedTurn::text("All done.")]);
        let orch = orchestrator(model);
        let mut ex = Exchange::new();
        ex.push_user("hello");

        let report = orch
            .run_turns(&mut ex, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            report.outcome,
            TurnOutcome::Completed {
                text: "All done.".to_string()
            }
        );
        assert_eq!(report.turns_used, 1);
        // 无 Tool Call 的交换不产生账本节点
        assert_eq!(orch.ledger().node_count(), 0);
    }

    #[tokio::test]
    async fn tool_call_then_final_records_placeholder() {
        let model = MockModelClient::new(vec![
            ScriptedTurn::tool_calls(&[("echo", r#"{"x":1}"#)]),
            ScriptedTurn::text("Finished."),
        ]);
        let orch = orchestrator(model);
        let mut ex = Exchange::new();
        ex.push_user("run echo");

        let report = orch
            .run_turns(&mut ex, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.turns_used, 2);
        assert_eq!(ex.stats.tool_calls, 1);
        // 工具回合一个节点 + 终止回合占位一个
        assert_eq!(orch.ledger().node_count(), 2);
        // 历史：user / model+call / tool_results / model final
        assert_eq!(ex.history.len(), 4);
        assert_eq!(ex.history[2].role, Role::User);
    }

    #[tokio::test]
    async fn turn_limit_is_reported_not_error() {
        // 脚本永远发 Tool Call，耗尽上限
        let model = Arc::new(MockModelClient::new(vec![
            ScriptedTurn::tool_calls(&[("echo", "{}")]),
            ScriptedTurn::tool_calls(&[("echo", "{}")]),
            ScriptedTurn::tool_calls(&[("echo", "{}")]),
        ]));
        let orch = orchestrator_shared(model.clone()).with_max_turns(2);
        let mut ex = Exchange::new();
        ex.push_user("loop");

        let report = orch
            .run_turns(&mut ex, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, TurnOutcome::MaxTurnsExceeded { limit: 2 });
        assert_eq!(report.turns_used, 2);
        // 上限 N 保证模型调用数不超过 N
        assert_eq!(model.calls_made(), 2);
    }

    #[tokio::test]
    async fn reported_malformed_finish_trusts_repair() {
        // 模型自报畸形且声明可重试：截断参数被修复后照常执行
        let profile = ModelProfile::new("flaky").with_malformed_retry(true);
        let model = MockModelClient::new(vec![
            ScriptedTurn::tool_calls_with_finish(
                &[("echo", r#"{"x": "ab"#)],
                crate::model::FinishReason::MalformedToolCall,
            ),
            ScriptedTurn::text("ok"),
        ])
        .with_profile(profile);
        let orch = orchestrator(model);
        let mut ex = Exchange::new();
        ex.push_user("go");

        let report = orch
            .run_turns(&mut ex, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            report.outcome,
            TurnOutcome::Completed {
                text: "ok".to_string()
            }
        );
        assert_eq!(ex.stats.tool_calls, 1);
    }

    #[tokio::test]
    async fn cancelled_before_step_reports_cancelled() {
        let model = MockModelClient::new(vec![ScriptedTurn::text("unreached")]);
        let orch = orchestrator(model);
        let mut ex = Exchange::new();
        ex.push_user("hello");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = orch.run_turns(&mut ex, &cancel).await.unwrap();
        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        assert_eq!(report.turns_used, 0);
    }

    #[tokio::test]
    async fn malformed_call_without_retry_is_fatal() {
        let profile = ModelProfile::new("strict");
        let model = MockModelClient::new(vec![ScriptedTurn::tool_calls(&[(
            "echo",
            r#"{"x": 1"#,
        )])])
        .with_profile(profile);
        let orch = orchestrator(model);
        let mut ex = Exchange::new();
        ex.push_user("go");

        let err = orch
            .run_turns(&mut ex, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::FunctionCall(_)));
    }

    #[tokio::test]
    async fn malformed_call_with_tolerance_is_repaired() {
        let profile = ModelProfile::new("tolerant")
            .with_format_tolerance(true)
            .with_malformed_retry(true);
        let model = MockModelClient::new(vec![
            ScriptedTurn::tool_calls(&[("echo", r#"{"x": 1"#)]),
            ScriptedTurn::text("Repaired and done."),
        ])
        .with_profile(profile);
        let orch = orchestrator(model);
        let mut ex = Exchange::new();
        ex.push_user("go");

        let report = orch
            .run_turns(&mut ex, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            report.outcome,
            TurnOutcome::Completed {
                text: "Repaired and done.".to_string()
            }
        );
        // 修复后的调用照常执行并回填
        assert_eq!(ex.stats.tool_calls, 1);
        let results_turn = &ex.history[2];
        match &results_turn.parts[0] {
            crate::turn::ContentPart::ToolResult(r) => {
                assert!(r.content.contains("\"x\":1"));
            }
            other => panic!("expected tool result, got {:?}", other),
        }
    }
}
