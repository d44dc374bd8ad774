//! 核心层：错误类型、会话取消监督与会话装配

mod error;
mod session;
mod session_supervisor;

pub use error::AgentError;
pub use session::Session;
pub use session_supervisor::SessionSupervisor;
