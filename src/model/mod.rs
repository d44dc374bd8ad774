//! 模型后端：ModelClient 抽象、能力画像与实现（OpenAI 兼容 / Mock）

mod mock;
mod openai;
mod profile;
mod traits;

pub use mock::{MockModelClient, ScriptedTurn};
pub use openai::OpenAiModelClient;
pub use profile::{ModelProfile, DEFAULT_CONTEXT_WINDOW, DEFAULT_TOOL_CONCURRENCY};
pub use traits::{
    ChunkStream, FinishReason, FunctionDecl, ModelChunk, ModelClient, RawToolCall, TokenUsage,
};
