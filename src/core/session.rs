//! 会话装配
//!
//! 按配置把模型客户端、工具注册表、审批门、变更账本与回合编排器接成一个会话。
//! 子代理监督器共享同一账本与事件通道；delegate_task 工具在注册表定稿后注入，
//! 但不进入子代理视图。

use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::{AgentError, SessionSupervisor};
use crate::ledger::{ChangeLedger, JsonlLedgerStore, RevertOutcome};
use crate::model::ModelClient;
use crate::schedule::{ApprovalGate, SessionApprovalPolicy, ToolScheduler};
use crate::subagent::{ModelCompressor, SubAgentSupervisor};
use crate::tools::{
    DelegateTaskTool, EditFileTool, GrepTool, ListDirTool, ReadFileTool, ShellTool, ToolExecutor,
    ToolRegistry, WriteFileTool,
};
use crate::turn::{
    AgentEvent, EventSink, Exchange, RunReport, TurnOrchestrator,
};

const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous coding agent working inside a \
sandboxed workspace. Use the available tools to inspect and modify files and run commands. \
Work step by step; when the task is complete, reply with a summary and no further tool calls.";

/// 一个交互会话：持有编排器与跨提交的累计交换状态
pub struct Session {
    id: String,
    orchestrator: TurnOrchestrator,
    exchange: Exchange,
    ledger: Arc<ChangeLedger>,
    supervisor: SessionSupervisor,
    model: Arc<dyn ModelClient>,
    events: EventSink,
}

impl Session {
    /// 从配置装配会话。工具注册表挂载全部内建工具；
    /// 账本从配置的 JSONL 路径打开（跨进程续用同一账本链）。
    pub fn new(
        config: &AppConfig,
        model: Arc<dyn ModelClient>,
        gate: Arc<dyn ApprovalGate>,
        events: EventSink,
    ) -> Result<Self, AgentError> {
        let workspace: PathBuf = config
            .agent
            .workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("./workspace"));
        std::fs::create_dir_all(&workspace)
            .map_err(|e| AgentError::Config(format!("workspace creation failed: {}", e)))?;

        if let Some(parent) = config.ledger.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::Config(format!("ledger dir creation failed: {}", e)))?;
        }
        let ledger = Arc::new(ChangeLedger::open(
            Box::new(JsonlLedgerStore::new(&config.ledger.path)),
            &workspace,
        )?);

        let supervisor = SessionSupervisor::new();
        let mut registry = ToolRegistry::new();
        registry.register(ReadFileTool::new(&workspace));
        registry.register(ListDirTool::new(&workspace));
        registry.register(GrepTool::new(&workspace));
        registry.register(WriteFileTool::new(&workspace));
        registry.register(EditFileTool::new(&workspace));
        registry.register(ShellTool::new(
            &workspace,
            config.tools.shell_allowlist.clone(),
            config.tools.shell_timeout_secs,
        ));

        // 子代理看到的是此刻的受限视图：delegate_task 之后注册，天然不可嵌套
        let sub_supervisor = SubAgentSupervisor::new(
            model.clone(),
            registry.clone(),
            ledger.clone(),
            events.clone(),
            supervisor.cancel_token(),
        )
        .with_compressor(Arc::new(ModelCompressor::new(model.clone())));
        registry.register(DelegateTaskTool::new(sub_supervisor));

        let scheduler = ToolScheduler::new(
            ToolExecutor::new(registry.clone(), config.tools.tool_timeout_secs),
            gate,
            Arc::new(SessionApprovalPolicy::new()),
            events.clone(),
        );

        let system_prompt = config
            .agent
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let orchestrator = TurnOrchestrator::new(
            model.clone(),
            scheduler,
            registry,
            ledger.clone(),
            events.clone(),
            system_prompt,
        )
        .with_max_turns(config.agent.max_turns);

        let id = format!("session-{}", Uuid::new_v4());
        events.emit(AgentEvent::SessionInit {
            session_id: id.clone(),
            model: model.profile().name.clone(),
        });

        Ok(Self {
            id,
            orchestrator,
            exchange: Exchange::new(),
            ledger,
            supervisor,
            model,
            events,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 提交一条用户输入并运行回合循环到终止
    pub async fn submit(&mut self, prompt: impl Into<String>) -> Result<RunReport, AgentError> {
        self.exchange.push_user(prompt);
        let cancel = self.supervisor.cancel_token();
        let report = self.orchestrator.run_turns(&mut self.exchange, &cancel).await;
        if let Ok(report) = &report {
            let (prompt_tokens, completion_tokens, total_tokens) = self.model.token_usage();
            self.events.emit(AgentEvent::Result {
                status: match &report.outcome {
                    crate::turn::TurnOutcome::Completed { .. } => "completed".to_string(),
                    crate::turn::TurnOutcome::MaxTurnsExceeded { .. } => {
                        "max_turns_exceeded".to_string()
                    }
                    crate::turn::TurnOutcome::Cancelled => "cancelled".to_string(),
                },
                prompt_tokens,
                completion_tokens,
                total_tokens,
            });
        }
        report
    }

    /// 把 workspace 回退到指定回合刚结束时的状态
    pub fn revert_to_turn(&self, turn_id: &str) -> Result<RevertOutcome, AgentError> {
        self.ledger.revert_to_turn(turn_id)
    }

    /// 协作式取消：当前 chunk 跑完后停下
    pub fn cancel(&self) {
        self.supervisor.cancel();
    }

    pub fn ledger(&self) -> &Arc<ChangeLedger> {
        &self.ledger
    }

    pub fn history_len(&self) -> usize {
        self.exchange.history.len()
    }
}
