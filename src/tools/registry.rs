//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / schema / 子代理资格 / 审批标记 / execute），
//! 由 ToolRegistry 按名注册与查找；function_declarations 生成提供给模型的声明列表，
//! subagent_view 过滤出子代理可用的受限注册表。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::ledger::FileOp;
use crate::model::FunctionDecl;

/// 工具执行产物：回馈模型的内容、观察者展示数据与文件变更记录
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// 回馈给模型的内容
    pub content: String,
    /// 仅供展示层使用的结构化数据
    pub display: Option<Value>,
    /// 本次调用产生的文件变更（进入账本）
    pub file_ops: Vec<FileOp>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_display(mut self, display: Value) -> Self {
        self.display = Some(display);
        self
    }

    pub fn with_file_op(mut self, op: FileOp) -> Self {
        self.file_ops.push(op);
        self
    }
}

/// 工具 trait：名称、描述（供模型理解）、参数 schema、能力标记与异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型 tool call 中的 name 字段）
    fn name(&self) -> &str;

    /// 工具描述（供模型理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema（供模型生成正确的参数格式）
    /// 默认返回空对象，表示无参数或参数格式不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 是否允许进入子代理的受限工具集（默认不允许）
    fn subagent_eligible(&self) -> bool {
        false
    }

    /// 调用前是否需要交互确认（写入 / 执行类工具为 true）
    fn requires_approval(&self) -> bool {
        false
    }

    /// 执行工具
    async fn execute(&self, args: Value) -> Result<ToolOutput, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.values().cloned().collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 提供给模型的声明列表（名称序，输出稳定）
    pub fn function_declarations(&self) -> Vec<FunctionDecl> {
        let mut decls: Vec<FunctionDecl> = self
            .tools
            .values()
            .map(|t| FunctionDecl {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    /// 子代理受限视图：只保留 subagent_eligible 的工具（阻断子代理再生子代理）
    pub fn subagent_view(&self) -> ToolRegistry {
        let tools = self
            .tools
            .iter()
            .filter(|(_, t)| t.subagent_eligible())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ToolRegistry { tools }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTool {
        name: &'static str,
        eligible: bool,
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "fake"
        }
        fn subagent_eligible(&self) -> bool {
            self.eligible
        }
        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            Ok(ToolOutput::text("ok"))
        }
    }

    #[test]
    fn test_subagent_view_filters_ineligible() {
        let mut reg = ToolRegistry::new();
        reg.register(FakeTool {
            name: "read_file",
            eligible: true,
        });
        reg.register(FakeTool {
            name: "delegate_task",
            eligible: false,
        });
        let view = reg.subagent_view();
        assert_eq!(view.tool_names(), vec!["read_file".to_string()]);
    }

    #[test]
    fn test_declarations_sorted() {
        let mut reg = ToolRegistry::new();
        reg.register(FakeTool {
            name: "b_tool",
            eligible: true,
        });
        reg.register(FakeTool {
            name: "a_tool",
            eligible: true,
        });
        let decls = reg.function_declarations();
        assert_eq!(decls[0].name, "a_tool");
        assert_eq!(decls[1].name, "b_tool");
    }
}
