//! 工具执行调度器
//!
//! 将一批 Tool Call 按并发上限切成连续 chunk：chunk 间严格串行，chunk 内并行扇出；
//! 每个调用先过审批门（仅挂起该调用，不阻塞整个 chunk）。调度器维护非良性失败计数，
//! 超过阈值且模型未声明渐进降级时整批致命中止。结果按请求顺序重组
//! （派发前截获显式下标，不依赖并发回调的完成顺序）。

use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::model::ModelProfile;
use crate::schedule::{ApprovalGate, ApprovalOutcome, SessionApprovalPolicy};
use crate::tools::ToolExecutor;
use crate::turn::{AgentEvent, EventSink, ToolCallRequest, ToolCallResult};

/// 非良性失败阈值：计数超过该值（即第 3 次失败）时整批中止
pub const FAILURE_THRESHOLD: usize = 2;

/// 单个调用的执行结论（内部）：结果 + 是否计入失败阈值
struct CallVerdict {
    result: ToolCallResult,
    counted_failure: bool,
}

/// 整批执行结论。致命中止时仍交还已产生的结果（含占位的 Canceled 结果），
/// 编排器据此把已落盘的文件变更记入账本，不因中止丢失。
pub enum BatchOutcome {
    Completed(Vec<ToolCallResult>),
    Fatal {
        error: AgentError,
        partial: Vec<ToolCallResult>,
    },
}

/// 工具执行调度器
pub struct ToolScheduler {
    executor: ToolExecutor,
    gate: Arc<dyn ApprovalGate>,
    policy: Arc<SessionApprovalPolicy>,
    events: EventSink,
}

impl ToolScheduler {
    pub fn new(
        executor: ToolExecutor,
        gate: Arc<dyn ApprovalGate>,
        policy: Arc<SessionApprovalPolicy>,
        events: EventSink,
    ) -> Self {
        Self {
            executor,
            gate,
            policy,
            events,
        }
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    /// 执行一批请求；返回与输入同序的结果列表。
    /// 取消语义：已开始的 chunk 跑完，未开始的调用产生 Canceled 结果，绝不静默丢弃。
    pub async fn execute(
        &self,
        requests: &[ToolCallRequest],
        concurrency_limit: usize,
        profile: &ModelProfile,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let limit = concurrency_limit.max(1);
        let mut slots: Vec<Option<ToolCallResult>> = (0..requests.len()).map(|_| None).collect();
        let mut failures = 0usize;

        for (chunk_idx, chunk) in requests.chunks(limit).enumerate() {
            let base = chunk_idx * limit;

            if cancel.is_cancelled() {
                for (offset, req) in chunk.iter().enumerate() {
                    slots[base + offset] = Some(ToolCallResult::canceled(&req.call_id));
                }
                continue; // 剩余 chunk 全部走取消分支
            }

            // chunk 内并行扇出，显式下标保证重组与请求同序
            let verdicts = join_all(chunk.iter().enumerate().map(|(offset, req)| {
                let idx = base + offset;
                async move { (idx, self.run_one(req, cancel).await) }
            }))
            .await;

            for (idx, verdict) in verdicts {
                if verdict.counted_failure {
                    failures += 1;
                }
                slots[idx] = Some(verdict.result);
            }

            if failures > FAILURE_THRESHOLD && !profile.enable_progressive_degradation {
                tracing::error!(failures, "tool batch aborted: failure threshold exceeded");
                // 已完成调用的结果随 Fatal 一并带回，文件操作不丢
                return BatchOutcome::Fatal {
                    error: AgentError::FailureThresholdExceeded {
                        failures,
                        threshold: FAILURE_THRESHOLD,
                    },
                    partial: finalize_slots(requests, slots),
                };
            }
        }

        let results = finalize_slots(requests, slots);

        // 整批无任何可用内容且存在非良性失败：视为整批失败。
        // 良性错误（工具缺失、用户拒绝）不会把批次升级为致命
        let any_usable = results.iter().any(|r| r.has_usable_content());
        if !results.is_empty() && !any_usable && failures > 0 {
            return BatchOutcome::Fatal {
                error: AgentError::EmptyToolBatch,
                partial: results,
            };
        }

        BatchOutcome::Completed(results)
    }

    /// 单个调用：审批门 → 执行 → 结果映射；错误捕获为结构化结果，不越过调度器边界
    async fn run_one(&self, request: &ToolCallRequest, cancel: &CancellationToken) -> CallVerdict {
        self.events.emit(AgentEvent::ToolUse {
            call_id: request.call_id.clone(),
            tool: request.name.clone(),
            args: request.args.clone(),
        });

        // 工具缺失：良性错误结果，不计入阈值
        let tool = match self.executor.get_tool(&request.name) {
            Some(t) => t,
            None => {
                let result =
                    ToolCallResult::error(&request.call_id, format!("Tool not found: {}", request.name));
                self.events
                    .emit_tool_result(&request.call_id, result.status, &result.content);
                return CallVerdict {
                    result,
                    counted_failure: false,
                };
            }
        };

        // 审批：仅挂起本调用；等待中可被取消
        if tool.requires_approval() && !self.policy.is_auto_allowed(&request.name) {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    let result = ToolCallResult::canceled(&request.call_id);
                    self.events
                        .emit_tool_result(&request.call_id, result.status, &result.content);
                    return CallVerdict { result, counted_failure: false };
                }
                outcome = self.gate.request_approval(request) => outcome,
            };
            match outcome {
                ApprovalOutcome::ProceedOnce => {}
                ApprovalOutcome::ProceedAlways => self.policy.allow_always(&request.name),
                ApprovalOutcome::Reject => {
                    // 拒绝是正常的「谢绝调用」结果，不计失败
                    let result = ToolCallResult::error(
                        &request.call_id,
                        format!("Tool call '{}' rejected by user", request.name),
                    );
                    self.events
                        .emit_tool_result(&request.call_id, result.status, &result.content);
                    return CallVerdict {
                        result,
                        counted_failure: false,
                    };
                }
            }
        }

        let verdict = match self.executor.execute(request).await {
            Ok(output) => {
                let mut result = ToolCallResult::success(&request.call_id, output.content);
                result.display = output.display;
                result.file_ops = output.file_ops;
                CallVerdict {
                    result,
                    counted_failure: false,
                }
            }
            Err(e) => {
                let counted = !e.is_benign();
                CallVerdict {
                    result: ToolCallResult::error(&request.call_id, format!("Error: {}", e)),
                    counted_failure: counted,
                }
            }
        };
        self.events.emit_tool_result(
            &request.call_id,
            verdict.result.status,
            &verdict.result.content,
        );
        verdict
    }
}

/// 把下标槽位展开为结果列表；未触及的槽位（致命中止后的剩余请求）补 Canceled 占位
fn finalize_slots(
    requests: &[ToolCallRequest],
    slots: Vec<Option<ToolCallResult>>,
) -> Vec<ToolCallResult> {
    slots
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| slot.unwrap_or_else(|| ToolCallResult::canceled(&requests[idx].call_id)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::schedule::{AutoApprovalGate, RejectAllGate};
    use crate::tools::{Tool, ToolOutput, ToolRegistry};
    use crate::turn::ToolCallStatus;

    /// 记录并发水位的测试工具：active 计数的历史最大值即实际并行度
    struct GaugeTool {
        name: String,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        fail: bool,
        needs_approval: bool,
    }

    #[async_trait]
    impl Tool for GaugeTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "gauge"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        fn requires_approval(&self) -> bool {
            self.needs_approval
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err("gauge failure".to_string());
            }
            Ok(ToolOutput::text(format!("{} ok", self.name)))
        }
    }

    struct Harness {
        scheduler: ToolScheduler,
        peak: Arc<AtomicUsize>,
    }

    fn harness(tools: Vec<(&str, bool, bool)>, gate: Arc<dyn ApprovalGate>) -> Harness {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        for (name, fail, needs_approval) in tools {
            registry.register(GaugeTool {
                name: name.to_string(),
                active: active.clone(),
                peak: peak.clone(),
                fail,
                needs_approval,
            });
        }
        let executor = ToolExecutor::new(registry, 5);
        let scheduler = ToolScheduler::new(
            executor,
            gate,
            Arc::new(SessionApprovalPolicy::new()),
            EventSink::disabled(),
        );
        Harness { scheduler, peak }
    }

    fn requests(names: &[&str]) -> Vec<ToolCallRequest> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| ToolCallRequest {
                call_id: format!("call-{i}"),
                name: name.to_string(),
                args: json!({}),
                client_initiated: false,
                turn_id: "t1".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn chunked_dispatch_respects_concurrency_limit() {
        let h = harness(vec![("t", false, false)], Arc::new(AutoApprovalGate));
        let reqs = requests(&["t", "t", "t", "t", "t"]);

        let outcome = h
            .scheduler
            .execute(&reqs, 2, &ModelProfile::default(), &CancellationToken::new())
            .await;

        let results = match outcome {
            BatchOutcome::Completed(r) => r,
            BatchOutcome::Fatal { error, .. } => panic!("unexpected fatal: {error}"),
        };
        assert_eq!(results.len(), 5);
        assert!(h.peak.load(Ordering::SeqCst) <= 2);
        // 结果与请求同序
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.call_id, format!("call-{i}"));
            assert_eq!(r.status, ToolCallStatus::Success);
        }
    }

    #[tokio::test]
    async fn two_failures_tolerated_third_aborts() {
        // chunk 大小 1：失败逐次累积。第 3 次失败后计数超过阈值 2，批次中止
        let h = harness(
            vec![("bad", true, false), ("good", false, false)],
            Arc::new(AutoApprovalGate),
        );
        let reqs = requests(&["bad", "bad", "good", "bad", "good"]);

        let outcome = h
            .scheduler
            .execute(&reqs, 1, &ModelProfile::default(), &CancellationToken::new())
            .await;

        match outcome {
            BatchOutcome::Fatal { error, partial } => {
                assert!(matches!(
                    error,
                    AgentError::FailureThresholdExceeded { failures: 3, .. }
                ));
                // 前 4 个已执行，最后一个补占位；账本侧仍拿到全部槽位
                assert_eq!(partial.len(), 5);
                assert_eq!(partial[2].status, ToolCallStatus::Success);
                assert_eq!(partial[4].status, ToolCallStatus::Canceled);
            }
            BatchOutcome::Completed(_) => panic!("expected fatal abort"),
        }
    }

    #[tokio::test]
    async fn two_failures_with_success_completes() {
        let h = harness(
            vec![("bad", true, false), ("good", false, false)],
            Arc::new(AutoApprovalGate),
        );
        let reqs = requests(&["bad", "good", "bad", "good"]);

        let outcome = h
            .scheduler
            .execute(&reqs, 2, &ModelProfile::default(), &CancellationToken::new())
            .await;

        assert!(matches!(outcome, BatchOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn degradation_profile_survives_threshold() {
        let h = harness(vec![("bad", true, false)], Arc::new(AutoApprovalGate));
        let reqs = requests(&["bad", "bad", "bad", "bad"]);
        let profile = ModelProfile::default().with_progressive_degradation(true);

        let outcome = h
            .scheduler
            .execute(&reqs, 2, &profile, &CancellationToken::new())
            .await;

        // 渐进降级模型：不中止，但全错批次仍判整批失败
        match outcome {
            BatchOutcome::Fatal { error, partial } => {
                assert!(matches!(error, AgentError::EmptyToolBatch));
                assert_eq!(partial.len(), 4);
            }
            BatchOutcome::Completed(_) => panic!("all-error batch must not complete"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_benign() {
        let h = harness(vec![("t", false, false)], Arc::new(AutoApprovalGate));
        let reqs = requests(&["nope", "nope", "nope", "t"]);

        let outcome = h
            .scheduler
            .execute(&reqs, 2, &ModelProfile::default(), &CancellationToken::new())
            .await;

        let results = match outcome {
            BatchOutcome::Completed(r) => r,
            BatchOutcome::Fatal { error, .. } => panic!("unexpected fatal: {error}"),
        };
        assert_eq!(results[0].status, ToolCallStatus::Error);
        assert!(results[0].content.contains("Tool not found"));
        assert_eq!(results[3].status, ToolCallStatus::Success);
    }

    #[tokio::test]
    async fn all_not_found_batch_completes_benignly() {
        // 整批只命中缺失工具：错误结果原样回馈模型，不升级为致命
        let h = harness(vec![("t", false, false)], Arc::new(AutoApprovalGate));
        let reqs = requests(&["nope", "nope"]);

        let outcome = h
            .scheduler
            .execute(&reqs, 2, &ModelProfile::default(), &CancellationToken::new())
            .await;

        let results = match outcome {
            BatchOutcome::Completed(r) => r,
            BatchOutcome::Fatal { error, .. } => panic!("unexpected fatal: {error}"),
        };
        assert!(results
            .iter()
            .all(|r| r.status == ToolCallStatus::Error && r.content.contains("Tool not found")));
    }

    #[tokio::test]
    async fn rejection_not_counted_toward_threshold() {
        let h = harness(vec![("guarded", false, true)], Arc::new(RejectAllGate));
        let reqs = requests(&["guarded", "guarded", "guarded", "guarded"]);

        let outcome = h
            .scheduler
            .execute(&reqs, 2, &ModelProfile::default(), &CancellationToken::new())
            .await;

        // 全部被拒：良性的「谢绝调用」结果，批次正常完成
        let results = match outcome {
            BatchOutcome::Completed(r) => r,
            BatchOutcome::Fatal { error, .. } => panic!("unexpected fatal: {error}"),
        };
        assert!(results
            .iter()
            .all(|r| r.content.contains("rejected by user")));
    }

    #[tokio::test]
    async fn cancellation_fills_remaining_chunks_with_canceled() {
        let h = harness(vec![("t", false, false)], Arc::new(AutoApprovalGate));
        let reqs = requests(&["t", "t", "t", "t"]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h
            .scheduler
            .execute(&reqs, 2, &ModelProfile::default(), &cancel)
            .await;

        let results = match outcome {
            BatchOutcome::Completed(r) => r,
            BatchOutcome::Fatal { error, .. } => panic!("unexpected fatal: {error}"),
        };
        assert!(results.iter().all(|r| r.status == ToolCallStatus::Canceled));
    }
}
