//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CRANE__*` 覆盖
//! （双下划线表示嵌套，如 `CRANE__MODEL__NAME=gpt-4o-mini`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::model::{ModelProfile, DEFAULT_CONTEXT_WINDOW, DEFAULT_TOOL_CONCURRENCY};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub ledger: LedgerSection,
}

/// [agent] 段：工作目录与回合上限
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 单次任务的回合上限
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// system 提示（未设置时用内建默认）
    pub system_prompt: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            workspace_root: None,
            max_turns: default_max_turns(),
            system_prompt: None,
        }
    }
}

fn default_max_turns() -> usize {
    100
}

/// [model] 段：后端地址与能力画像
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_model_name")]
    pub name: String,
    /// OpenAI 兼容端点；未设置时走官方端点
    pub base_url: Option<String>,
    /// API Key 所在的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_tool_concurrency")]
    pub tool_concurrency: usize,
    #[serde(default)]
    pub needs_format_tolerance: bool,
    #[serde(default)]
    pub enable_malformed_retry: bool,
    #[serde(default)]
    pub enable_progressive_degradation: bool,
    #[serde(default)]
    pub prone_to_incomplete_stream: bool,
    #[serde(default = "default_context_window")]
    pub context_window_tokens: u64,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            base_url: None,
            api_key_env: default_api_key_env(),
            tool_concurrency: default_tool_concurrency(),
            needs_format_tolerance: false,
            enable_malformed_retry: false,
            enable_progressive_degradation: false,
            prone_to_incomplete_stream: false,
            context_window_tokens: default_context_window(),
        }
    }
}

impl ModelSection {
    /// 由配置段构造能力画像
    pub fn profile(&self) -> ModelProfile {
        ModelProfile::new(&self.name)
            .with_tool_concurrency(self.tool_concurrency)
            .with_format_tolerance(self.needs_format_tolerance)
            .with_malformed_retry(self.enable_malformed_retry)
            .with_progressive_degradation(self.enable_progressive_degradation)
            .with_incomplete_stream(self.prone_to_incomplete_stream)
            .with_context_window(self.context_window_tokens)
    }
}

fn default_model_name() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_tool_concurrency() -> usize {
    DEFAULT_TOOL_CONCURRENCY
}

fn default_context_window() -> u64 {
    DEFAULT_CONTEXT_WINDOW
}

/// [tools] 段：工具超时与 Shell 白名单
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Shell 命令白名单（首个词匹配）；空表示全部拒绝
    #[serde(default = "default_shell_allowlist")]
    pub shell_allowlist: Vec<String>,
    /// Shell 命令超时（秒）
    #[serde(default = "default_shell_timeout_secs")]
    pub shell_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            shell_allowlist: default_shell_allowlist(),
            shell_timeout_secs: default_shell_timeout_secs(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    120
}

fn default_shell_timeout_secs() -> u64 {
    60
}

fn default_shell_allowlist() -> Vec<String> {
    [
        "ls", "cat", "head", "tail", "grep", "find", "wc", "echo", "pwd", "git", "cargo",
        "python3", "node",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// [ledger] 段：变更账本持久化
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerSection {
    /// 账本文件路径（JSONL，相对工作目录外部存放）
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(".crane/ledger.jsonl")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            agent: AgentSection::default(),
            model: ModelSection::default(),
            tools: ToolsSection::default(),
            ledger: LedgerSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 CRANE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CRANE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CRANE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_turns, 100);
        assert_eq!(cfg.model.tool_concurrency, DEFAULT_TOOL_CONCURRENCY);
        assert!(cfg.tools.shell_allowlist.contains(&"ls".to_string()));
    }

    #[test]
    fn test_profile_from_section() {
        let mut section = ModelSection::default();
        section.needs_format_tolerance = true;
        section.tool_concurrency = 4;
        let profile = section.profile();
        assert!(profile.needs_format_tolerance);
        assert_eq!(profile.tool_concurrency, 4);
    }
}
