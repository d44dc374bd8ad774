//! 回合层：数据模型、过程事件、畸形 Tool Call 修复与回合编排循环

mod events;
mod orchestrator;
mod repair;
mod types;

pub use events::{AgentEvent, EventSink};
pub use orchestrator::{Exchange, StepOutcome, TurnOrchestrator, DEFAULT_MAX_TURNS};
pub use repair::{appears_incomplete_from_streaming, finalize_calls, repair_args};
pub use types::{
    generate_call_id, generate_turn_id, ContentPart, Role, RunReport, RunStats, Turn,
    ToolCallRequest, ToolCallResult, ToolCallStatus, TurnOutcome,
};
