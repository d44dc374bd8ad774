//! 畸形 Tool Call 检测与修复
//!
//! 部分后端/轻量模型在流式输出中容易产出不完整的 Tool Call（参数 JSON 被截断、
//! 双重编码等）。这里提供：流式截断的启发式检测、结构化修复（闭合截断的 JSON、
//! 类型纠偏）与按模型能力画像决策的 finalize 入口。对已合法的调用集合，修复是恒等的。

use serde_json::Value;

use crate::core::AgentError;
use crate::model::{FinishReason, ModelProfile, RawToolCall};
use crate::turn::types::{generate_call_id, ToolCallRequest};

/// 严格解析单个调用的参数；空参数视同空对象
fn parse_args_strict(raw: &RawToolCall) -> Result<Value, String> {
    let trimmed = raw.args_json.trim();
    if trimmed.is_empty() {
        return Ok(serde_json::json!({}));
    }
    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| format!("{}: {}", raw.name, e))?;
    coerce(value).ok_or_else(|| format!("{}: arguments are not an object", raw.name))
}

/// 类型纠偏：参数必须是对象；双重编码的字符串（"{\"k\":1}"）解开一层
fn coerce(value: Value) -> Option<Value> {
    match value {
        Value::Object(_) => Some(value),
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(m)) => Some(Value::Object(m)),
            _ => None,
        },
        Value::Null => Some(serde_json::json!({})),
        _ => None,
    }
}

/// 流式截断启发式：解析失败且分隔符不配平（或止于字符串/分隔符中途）
pub fn appears_incomplete_from_streaming(calls: &[RawToolCall]) -> bool {
    calls.iter().any(|c| {
        let trimmed = c.args_json.trim();
        if trimmed.is_empty() || serde_json::from_str::<Value>(trimmed).is_ok() {
            return false;
        }
        let (depth, in_string) = delimiter_state(trimmed);
        depth > 0 || in_string || trimmed.ends_with(',') || trimmed.ends_with(':')
    })
}

/// 扫描字符串末尾时的分隔符状态：(未闭合深度, 是否停在字符串内)
fn delimiter_state(s: &str) -> (i32, bool) {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => depth -= 1,
            _ => {}
        }
    }
    (depth, in_string)
}

/// 结构化修复：闭合未终结的字符串与括号、去掉悬挂的逗号/冒号，再尝试解析与纠偏。
/// 输入本就合法时返回等价结果（恒等）。
pub fn repair_args(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(serde_json::json!({}));
    }
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return coerce(v);
    }

    // 重新扫描，记录括号栈以便按序闭合
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in trimmed.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut fixed = trimmed.to_string();
    if escaped {
        fixed.pop(); // 尾部悬挂的反斜杠
    }
    if in_string {
        fixed.push('"');
    }
    // 悬挂的逗号/冒号导致闭合后仍非法
    while fixed.ends_with(',') || fixed.ends_with(':') {
        fixed.pop();
        while fixed.ends_with(char::is_whitespace) {
            fixed.pop();
        }
    }
    while let Some(closer) = stack.pop() {
        fixed.push(closer);
    }

    serde_json::from_str::<Value>(&fixed).ok().and_then(coerce)
}

/// 按模型能力画像定稿一批原始调用：
/// 1. 画像声明 prone_to_incomplete_stream 时运行截断检测；
/// 2. needs_format_tolerance 或检测到不完整时，对非法调用尝试修复并重新校验；
/// 3. 仍非法且未声明 enable_malformed_retry → FunctionCall 错误中止本回合；
/// 4. finish_reason 为 MalformedToolCall 且声明 enable_malformed_retry → 全部走修复，
///    以修复结果无条件替换原始输出。
pub fn finalize_calls(
    raw_calls: Vec<RawToolCall>,
    profile: &ModelProfile,
    finish_reason: Option<FinishReason>,
    turn_id: &str,
) -> Result<Vec<ToolCallRequest>, AgentError> {
    if raw_calls.is_empty() {
        return Ok(Vec::new());
    }

    let malformed_reported = finish_reason == Some(FinishReason::MalformedToolCall);
    let detected =
        profile.prone_to_incomplete_stream && appears_incomplete_from_streaming(&raw_calls);
    let trust_repair = malformed_reported && profile.enable_malformed_retry;
    let tolerant = profile.needs_format_tolerance || detected || malformed_reported;

    let mut out = Vec::with_capacity(raw_calls.len());
    for raw in raw_calls {
        let args = if trust_repair {
            // 模型自报畸形：修复结果优先于原始输出
            repair_args(&raw.args_json)
        } else {
            match parse_args_strict(&raw) {
                Ok(v) => Some(v),
                Err(reason) => {
                    if !tolerant {
                        return Err(AgentError::FunctionCall(reason));
                    }
                    repair_args(&raw.args_json)
                }
            }
        };

        let args = match args {
            Some(v) => v,
            None if profile.enable_malformed_retry => {
                // 修复失败但模型允许畸形重试：降级为空参数，让工具侧报参数错误
                tracing::warn!(tool = %raw.name, "unrepairable tool call args, degrading to empty object");
                serde_json::json!({})
            }
            None => {
                return Err(AgentError::FunctionCall(format!(
                    "unrepairable tool call arguments for '{}'",
                    raw.name
                )));
            }
        };

        out.push(ToolCallRequest {
            call_id: raw.id.unwrap_or_else(generate_call_id),
            name: raw.name,
            args,
            client_initiated: false,
            turn_id: turn_id.to_string(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str, args: &str) -> RawToolCall {
        RawToolCall {
            id: Some(format!("call-{}", name)),
            name: name.to_string(),
            args_json: args.to_string(),
        }
    }

    #[test]
    fn test_repair_is_identity_on_valid_args() {
        let valid = r#"{"path": "a.txt", "depth": 2}"#;
        let repaired = repair_args(valid).unwrap();
        let parsed: Value = serde_json::from_str(valid).unwrap();
        assert_eq!(repaired, parsed);
    }

    #[test]
    fn test_repair_closes_truncated_json() {
        let truncated = r#"{"path": "src/main.rs", "pattern": "fn ma"#;
        let repaired = repair_args(truncated).unwrap();
        assert_eq!(repaired["path"], "src/main.rs");
        assert_eq!(repaired["pattern"], "fn ma");
    }

    #[test]
    fn test_repair_unwraps_double_encoded_object() {
        let double = r#""{\"path\": \"a.txt\"}""#;
        let repaired = repair_args(double).unwrap();
        assert_eq!(repaired["path"], "a.txt");
    }

    #[test]
    fn test_incomplete_detection() {
        assert!(appears_incomplete_from_streaming(&[raw(
            "grep",
            r#"{"pattern": "x"#
        )]));
        assert!(!appears_incomplete_from_streaming(&[raw(
            "grep",
            r#"{"pattern": "x"}"#
        )]));
        // 非法但配平：不是流式截断的形状
        assert!(!appears_incomplete_from_streaming(&[raw("grep", "not json")]));
    }

    #[test]
    fn test_finalize_strict_failure_without_tolerance() {
        let profile = ModelProfile::new("m");
        let err = finalize_calls(
            vec![raw("grep", r#"{"pattern": "x"#)],
            &profile,
            Some(FinishReason::Stop),
            "t1",
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::FunctionCall(_)));
    }

    #[test]
    fn test_finalize_repairs_with_incomplete_stream_profile() {
        let profile = ModelProfile::new("m").with_incomplete_stream(true);
        let calls = finalize_calls(
            vec![raw("grep", r#"{"pattern": "fn ma"#)],
            &profile,
            Some(FinishReason::Stop),
            "t1",
        )
        .unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args["pattern"], "fn ma");
        assert_eq!(calls[0].turn_id, "t1");
    }

    #[test]
    fn test_finalize_generates_missing_call_ids() {
        let profile = ModelProfile::new("m");
        let calls = finalize_calls(
            vec![RawToolCall {
                id: None,
                name: "list_directory".to_string(),
                args_json: "{}".to_string(),
            }],
            &profile,
            None,
            "t1",
        )
        .unwrap();
        assert!(calls[0].call_id.starts_with("call-"));
    }

    #[test]
    fn test_finalize_trusts_repair_on_reported_malformed() {
        let profile = ModelProfile::new("m").with_malformed_retry(true);
        let calls = finalize_calls(
            vec![raw("read_file", r#"{"path": "a.txt"#)],
            &profile,
            Some(FinishReason::MalformedToolCall),
            "t1",
        )
        .unwrap();
        assert_eq!(calls[0].args["path"], "a.txt");
    }

    #[test]
    fn test_finalize_idempotent_on_wellformed_set() {
        // 已合法的调用集合经过 finalize 不被改写
        let profile = ModelProfile::new("m").with_format_tolerance(true);
        let input = vec![raw("grep", r#"{"pattern": "x"}"#)];
        let calls = finalize_calls(input, &profile, Some(FinishReason::Stop), "t1").unwrap();
        assert_eq!(calls[0].args, serde_json::json!({"pattern": "x"}));
        assert_eq!(calls[0].call_id, "call-grep");
    }
}
