//! 文件写入与精确编辑工具
//!
//! WriteFileTool 整文件写入（创建或覆盖），EditFileTool 精确字符串替换；
//! 两者都在执行前抓取 before 快照并产出 FileOp，供账本记录与回退。
//! 参数结构体经 schemars 自动生成 JSON Schema。

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::ledger::FileOp;
use crate::tools::filesystem::SafeFs;
use crate::tools::{Tool, ToolOutput};

/// 由参数结构体生成 JSON Schema
pub(crate) fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {}", e))
}

/// write_file 参数
#[derive(Debug, Deserialize, JsonSchema)]
struct WriteFileArgs {
    /// workspace 相对路径
    path: String,
    /// 完整文件内容
    content: String,
}

/// 整文件写入：不存在则创建，存在则覆盖
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(root: impl AsRef<std::path::Path>) -> Self {
        Self {
            fs: SafeFs::new(root),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in the workspace with the given content."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<WriteFileArgs>()
    }

    fn subagent_eligible(&self) -> bool {
        true
    }

    fn requires_approval(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let args: WriteFileArgs = parse_args(args)?;
        let target = self.fs.resolve_for_write(&args.path)?;
        let rel = self.fs.relative(&args.path);

        let before = std::fs::read_to_string(&target).ok();
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("mkdir failed: {}", e))?;
        }
        std::fs::write(&target, &args.content).map_err(|e| format!("Write failed: {}", e))?;

        let op = match before {
            Some(before) => FileOp::Modify {
                path: rel.clone(),
                before,
                after: args.content.clone(),
            },
            None => FileOp::Create {
                path: rel.clone(),
                after: args.content.clone(),
            },
        };
        let verb = match &op {
            FileOp::Create { .. } => "Created",
            _ => "Overwrote",
        };
        Ok(
            ToolOutput::text(format!("{} {} ({} bytes)", verb, rel, args.content.len()))
                .with_file_op(op),
        )
    }
}

/// edit_file 参数
#[derive(Debug, Deserialize, JsonSchema)]
struct EditFileArgs {
    /// workspace 相对路径
    path: String,
    /// 被替换的精确原文（必须唯一命中）
    old_string: String,
    /// 替换后的文本
    new_string: String,
}

/// 精确字符串替换：old_string 必须在文件中恰好出现一次
pub struct EditFileTool {
    fs: SafeFs,
}

impl EditFileTool {
    pub fn new(root: impl AsRef<std::path::Path>) -> Self {
        Self {
            fs: SafeFs::new(root),
        }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a workspace file. old_string must match exactly once."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<EditFileArgs>()
    }

    fn subagent_eligible(&self) -> bool {
        true
    }

    fn requires_approval(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let args: EditFileArgs = parse_args(args)?;
        let rel = self.fs.relative(&args.path);
        let before = self.fs.read_file(&args.path)?;

        let matches = before.matches(&args.old_string).count();
        if matches == 0 {
            return Err(format!("old_string not found in {}", rel));
        }
        if matches > 1 {
            return Err(format!(
                "old_string matches {} times in {}, must be unique",
                matches, rel
            ));
        }

        let after = before.replacen(&args.old_string, &args.new_string, 1);
        let target = self.fs.resolve(&args.path)?;
        std::fs::write(&target, &after).map_err(|e| format!("Write failed: {}", e))?;

        let line = before[..before.find(&args.old_string).unwrap_or(0)]
            .chars()
            .filter(|c| *c == '\n')
            .count()
            + 1;
        Ok(
            ToolOutput::text(format!("Edited {} at line {}", rel, line)).with_file_op(
                FileOp::Modify {
                    path: rel,
                    before,
                    after,
                },
            ),
        )
    }
}
