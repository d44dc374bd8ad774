//! Crane - 自治编码智能体运行时
//!
//! 入口：初始化日志与配置，装配会话并执行单个任务。
//! 用法：
//!   crane run "<prompt>"         执行一个任务到终止
//!   crane revert <turn_id>       把 workspace 回退到指定回合
//!   crane ledger                 列出账本中的回合引用

use std::sync::Arc;

use anyhow::{bail, Context};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crane::config::load_config;
use crane::core::Session;
use crane::model::OpenAiModelClient;
use crane::schedule::AutoApprovalGate;
use crane::turn::{AgentEvent, EventSink, TurnOutcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with(fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = load_config(None).context("Failed to load config")?;

    match args.first().map(String::as_str) {
        Some("run") => {
            let prompt = args.get(1).cloned().unwrap_or_default();
            if prompt.is_empty() {
                bail!("usage: crane run \"<prompt>\"");
            }
            run_prompt(&config, prompt).await
        }
        Some("revert") => {
            let turn_id = args
                .get(1)
                .context("usage: crane revert <turn_id>")?
                .clone();
            let session = build_session(&config, EventSink::disabled())?;
            let outcome = session.revert_to_turn(&turn_id)?;
            println!(
                "Reverted {} node(s), {} op(s) applied; recorded as {}",
                outcome.nodes_reverted, outcome.ops_applied, outcome.revert_node_id
            );
            Ok(())
        }
        Some("ledger") => {
            let session = build_session(&config, EventSink::disabled())?;
            for turn_ref in session.ledger().known_turn_refs() {
                println!("{}", turn_ref);
            }
            Ok(())
        }
        _ => bail!("usage: crane run \"<prompt>\" | crane revert <turn_id> | crane ledger"),
    }
}

fn build_session(
    config: &crane::config::AppConfig,
    events: EventSink,
) -> anyhow::Result<Session> {
    let api_key = std::env::var(&config.model.api_key_env).ok();
    let model = Arc::new(
        OpenAiModelClient::new(
            config.model.base_url.as_deref(),
            config.model.profile(),
            api_key.as_deref(),
        )
        .context("Model client setup failed")?,
    );
    Ok(Session::new(
        config,
        model,
        Arc::new(AutoApprovalGate),
        events,
    )?)
}

async fn run_prompt(config: &crane::config::AppConfig, prompt: String) -> anyhow::Result<()> {
    let (events, mut rx) = EventSink::channel();
    let mut session = build_session(config, events)?;

    // 事件回显：模型文本与工具进展打到 stdout
    let printer = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            match ev {
                AgentEvent::Message { text, .. } => print!("{}", text),
                AgentEvent::ToolUse { tool, .. } => eprintln!("\n[tool] {}", tool),
                AgentEvent::ToolResult {
                    status, preview, ..
                } => eprintln!("[tool:{:?}] {}", status, preview),
                AgentEvent::SubAgentUpdate {
                    agent_id, status, ..
                } => eprintln!("[subagent {}] {}", agent_id, status),
                AgentEvent::Error { text } => eprintln!("[error] {}", text),
                _ => {}
            }
        }
    });

    let result = session.submit(prompt).await;
    drop(session);
    let _ = printer.await;

    match result {
        Ok(report) => match report.outcome {
            TurnOutcome::Completed { .. } => {
                println!();
                Ok(())
            }
            TurnOutcome::MaxTurnsExceeded { limit } => {
                eprintln!(
                    "Stopped at the {}-turn limit; raise agent.max_turns (or CRANE__AGENT__MAX_TURNS) to allow more",
                    limit
                );
                std::process::exit(1);
            }
            TurnOutcome::Cancelled => {
                eprintln!("Cancelled");
                Ok(())
            }
        },
        Err(e) => {
            eprintln!("Agent failed: {}", e);
            std::process::exit(1);
        }
    }
}
