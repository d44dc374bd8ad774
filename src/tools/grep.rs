//! 代码搜索工具 - 在 workspace 中搜索模式
//!
//! regex 或子串匹配，walkdir 递归遍历；跳过隐藏目录、超大文件与无法读取的文件，
//! 结果数封顶避免淹没模型上下文。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use walkdir::WalkDir;

use crate::tools::{Tool, ToolOutput};

/// 代码搜索工具
pub struct GrepTool {
    root: PathBuf,
    max_results: usize,
    max_file_size: u64,
}

impl GrepTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            max_results: 50,
            max_file_size: 1024 * 1024, // 1MB
        }
    }

    pub fn with_limits(mut self, max_results: usize, max_file_size: u64) -> Self {
        self.max_results = max_results;
        self.max_file_size = max_file_size;
        self
    }

    fn search(&self, pattern: &str, use_regex: bool) -> Result<Vec<String>, String> {
        let re = if use_regex {
            Some(regex::Regex::new(pattern).map_err(|e| format!("Invalid regex: {}", e))?)
        } else {
            None
        };

        let mut hits = Vec::new();
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| {
                // 遍历根自身不受隐藏名过滤影响，规则只作用于其下的条目
                e.depth() == 0
                    || !e
                        .file_name()
                        .to_str()
                        .map(|n| n.starts_with('.'))
                        .unwrap_or(false)
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            if hits.len() >= self.max_results {
                break;
            }
            if entry.metadata().map(|m| m.len()).unwrap_or(0) > self.max_file_size {
                continue;
            }
            let content = match std::fs::read_to_string(entry.path()) {
                Ok(c) => c,
                Err(_) => continue, // 跳过二进制/不可读文件
            };
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .display();
            for (lineno, line) in content.lines().enumerate() {
                let matched = match &re {
                    Some(re) => re.is_match(line),
                    None => line.contains(pattern),
                };
                if matched {
                    hits.push(format!("{}:{}: {}", rel, lineno + 1, line.trim()));
                    if hits.len() >= self.max_results {
                        break;
                    }
                }
            }
        }
        Ok(hits)
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search the workspace for a pattern. Args: {\"pattern\": \"...\", \"regex\": false}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Pattern to search for" },
                "regex": { "type": "boolean", "description": "Treat pattern as a regular expression" }
            },
            "required": ["pattern"]
        })
    }

    fn subagent_eligible(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let pattern = args
            .get("pattern")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "Missing 'pattern' argument".to_string())?;
        let use_regex = args.get("regex").and_then(|v| v.as_bool()).unwrap_or(false);

        let hits = self.search(pattern, use_regex)?;
        if hits.is_empty() {
            return Ok(ToolOutput::text(format!("No matches for '{}'", pattern)));
        }
        Ok(ToolOutput::text(hits.join("\n")))
    }
}
