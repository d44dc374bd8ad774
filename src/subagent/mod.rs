//! 子代理：受限嵌套回合循环、生命周期监督与历史压缩

mod compress;
mod supervisor;

pub use compress::{
    estimate_tokens, over_threshold, HistoryCompressor, ModelCompressor,
    COMPRESSION_THRESHOLD_RATIO,
};
pub use supervisor::{
    SubAgentConfig, SubAgentHandle, SubAgentResult, SubAgentStatus, SubAgentSupervisor,
    SubAgentTokenUsage, MAX_SUBAGENT_TURNS,
};
