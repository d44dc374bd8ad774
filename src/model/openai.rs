//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url），使用原生 tools 协议；
//! 响应转为单分片 ModelChunk 流（上游按分片消费，后端是否真流式对编排层透明）。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionMessageToolCall, ChatCompletionMessageToolCalls,
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionTools,
    CreateChatCompletionRequestArgs, FunctionCall, FunctionObject,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::stream;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::model::{
    ChunkStream, FinishReason, FunctionDecl, ModelChunk, ModelClient, ModelProfile, RawToolCall,
    TokenUsage,
};
use crate::turn::{ContentPart, Role, Turn};

/// OpenAI 兼容客户端：持有 Client、能力画像与累计 token 统计
#[derive(Debug)]
pub struct OpenAiModelClient {
    client: Client<OpenAIConfig>,
    profile: ModelProfile,
    usage: TokenUsage,
}

impl OpenAiModelClient {
    /// 构造客户端；缺少 API key 时返回 ModelNotReady（会话启动前置检查）
    pub fn new(
        base_url: Option<&str>,
        profile: ModelProfile,
        api_key: Option<&str>,
    ) -> Result<Self, AgentError> {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                AgentError::ModelNotReady("no API key configured".to_string())
            })?;

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Ok(Self {
            client: Client::with_config(config),
            profile,
            usage: TokenUsage::new(),
        })
    }

    /// 将回合历史转为 API 消息：Model 回合 → assistant（content + tool_calls），
    /// ToolResult 片段 → tool 消息（按 call_id 关联）
    fn to_api_messages(
        &self,
        system: &str,
        history: &[Turn],
    ) -> Result<Vec<ChatCompletionRequestMessage>, AgentError> {
        let mut out = Vec::with_capacity(history.len() + 1);
        out.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system.to_string())
                .build()
                .map_err(|e| AgentError::ModelError(e.to_string()))?,
        ));

        for turn in history {
            match turn.role {
                Role::Model => {
                    let text = turn.text();
                    let tool_calls: Vec<ChatCompletionMessageToolCalls> = turn
                        .tool_calls()
                        .iter()
                        .map(|c| {
                            ChatCompletionMessageToolCalls::Function(ChatCompletionMessageToolCall {
                                id: c.call_id.clone(),
                                function: FunctionCall {
                                    name: c.name.clone(),
                                    arguments: c.args.to_string(),
                                },
                            })
                        })
                        .collect();
                    let mut args = ChatCompletionRequestAssistantMessageArgs::default();
                    if !text.is_empty() {
                        args.content(text);
                    }
                    if !tool_calls.is_empty() {
                        args.tool_calls(tool_calls);
                    }
                    out.push(ChatCompletionRequestMessage::Assistant(
                        args.build()
                            .map_err(|e| AgentError::ModelError(e.to_string()))?,
                    ));
                }
                Role::User => {
                    let mut text_parts = String::new();
                    for part in &turn.parts {
                        match part {
                            ContentPart::Text { text } => text_parts.push_str(text),
                            ContentPart::ToolResult(r) => {
                                out.push(ChatCompletionRequestMessage::Tool(
                                    ChatCompletionRequestToolMessageArgs::default()
                                        .content(r.content.clone())
                                        .tool_call_id(r.call_id.clone())
                                        .build()
                                        .map_err(|e| AgentError::ModelError(e.to_string()))?,
                                ));
                            }
                            ContentPart::ToolCall(_) => {}
                        }
                    }
                    if !text_parts.is_empty() {
                        out.push(ChatCompletionRequestMessage::User(
                            ChatCompletionRequestUserMessageArgs::default()
                                .content(text_parts)
                                .build()
                                .map_err(|e| AgentError::ModelError(e.to_string()))?,
                        ));
                    }
                }
            }
        }
        Ok(out)
    }

    fn to_api_tools(&self, tools: &[FunctionDecl]) -> Vec<ChatCompletionTools> {
        tools
            .iter()
            .map(|t| {
                ChatCompletionTools::Function(ChatCompletionTool {
                    function: FunctionObject {
                        name: t.name.clone(),
                        description: Some(t.description.clone()),
                        parameters: Some(t.parameters.clone()),
                        strict: None,
                    },
                })
            })
            .collect()
    }
}

#[async_trait]
impl ModelClient for OpenAiModelClient {
    async fn send_message(
        &self,
        system: &str,
        history: &[Turn],
        tools: &[FunctionDecl],
        cancel: CancellationToken,
    ) -> Result<ChunkStream, AgentError> {
        let mut request = CreateChatCompletionRequestArgs::default();
        request
            .model(&self.profile.name)
            .messages(self.to_api_messages(system, history)?);
        if !tools.is_empty() {
            request.tools(self.to_api_tools(tools));
        }
        let request = request
            .build()
            .map_err(|e| AgentError::ModelError(e.to_string()))?;

        // 取消优先于网络等待
        let chat = self.client.chat();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = chat.create(request) => {
                r.map_err(|e| AgentError::ModelError(e.to_string()))?
            }
        };

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::ModelError("empty choices".to_string()))?;

        // 只消费 function 形式的调用；custom 工具从未声明，忽略
        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| match c {
                ChatCompletionMessageToolCalls::Function(f) => Some(RawToolCall {
                    id: Some(f.id),
                    name: f.function.name,
                    args_json: f.function.arguments,
                }),
                ChatCompletionMessageToolCalls::Custom(_) => None,
            })
            .collect();

        let chunk = ModelChunk {
            text: choice.message.content,
            tool_calls,
            finish_reason: Some(FinishReason::Stop),
        };
        Ok(Box::pin(stream::iter(vec![Ok(chunk)])))
    }

    fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::{ToolCallRequest, ToolCallResult};

    fn client() -> OpenAiModelClient {
        OpenAiModelClient::new(None, ModelProfile::new("m"), Some("sk-test")).unwrap()
    }

    #[test]
    fn test_missing_api_key_is_not_ready() {
        let prev = std::env::var("OPENAI_API_KEY").ok();
        std::env::remove_var("OPENAI_API_KEY");
        let err = OpenAiModelClient::new(None, ModelProfile::new("m"), None).unwrap_err();
        assert!(matches!(err, AgentError::ModelNotReady(_)));
        if let Some(v) = prev {
            std::env::set_var("OPENAI_API_KEY", v);
        }
    }

    #[test]
    fn test_tool_declarations_wrap_function_variant() {
        let decls = vec![FunctionDecl {
            name: "read_file".to_string(),
            description: "read".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let tools = client().to_api_tools(&decls);
        assert_eq!(tools.len(), 1);
        match &tools[0] {
            ChatCompletionTools::Function(t) => {
                assert_eq!(t.function.name, "read_file");
                assert!(t.function.parameters.is_some());
            }
            other => panic!("expected function tool, got {:?}", other),
        }
    }

    #[test]
    fn test_history_conversion_links_tool_messages() {
        let call = ToolCallRequest {
            call_id: "c1".to_string(),
            name: "read_file".to_string(),
            args: serde_json::json!({"path": "a.txt"}),
            client_initiated: false,
            turn_id: "t1".to_string(),
        };
        let history = vec![
            Turn::user("read a.txt"),
            Turn::model("t1", String::new(), vec![call]),
            Turn::tool_results(vec![ToolCallResult::success("c1", "hello")]),
        ];
        let messages = client().to_api_messages("sys", &history).unwrap();

        // system / user / assistant(tool_calls) / tool
        assert_eq!(messages.len(), 4);
        match &messages[2] {
            ChatCompletionRequestMessage::Assistant(m) => {
                let calls = m.tool_calls.as_ref().expect("assistant tool_calls");
                match &calls[0] {
                    ChatCompletionMessageToolCalls::Function(f) => {
                        assert_eq!(f.id, "c1");
                        assert_eq!(f.function.name, "read_file");
                    }
                    other => panic!("expected function call, got {:?}", other),
                }
            }
            other => panic!("expected assistant message, got {:?}", other),
        }
        match &messages[3] {
            ChatCompletionRequestMessage::Tool(m) => {
                assert_eq!(m.tool_call_id, "c1");
            }
            other => panic!("expected tool message, got {:?}", other),
        }
    }
}
