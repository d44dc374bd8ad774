//! 工具层：注册表、执行器与内建工具集
//!
//! 内建工具：read_file / list_directory / grep（只读，子代理可用）、
//! write_file / edit_file（写入，需审批）、shell（命令执行，需审批）、
//! delegate_task（子代理委托，不可嵌套）。

mod delegate;
mod edit;
mod executor;
mod filesystem;
mod grep;
mod registry;
mod shell;

pub use delegate::DelegateTaskTool;
pub use edit::{EditFileTool, WriteFileTool};
pub use executor::ToolExecutor;
pub use filesystem::{ListDirTool, ReadFileTool, SafeFs};
pub use grep::GrepTool;
pub use registry::{Tool, ToolOutput, ToolRegistry};
pub use shell::ShellTool;
