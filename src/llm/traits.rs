//! 推理服务抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 ReasoningService：输入 prompt + system + 可选输出 schema，
//! 返回结构化 JSON（有 schema 时）或纯文本（Value::String）。传输或解析失败统一为 LlmError。

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// 推理服务错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("response parse error: {0}")]
    Parse(String),

    #[error("empty response")]
    EmptyResponse,

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// 推理调用的用途，便于 Mock 分派与日志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasoningTask {
    Think,
    Plan,
    Propose,
    Extract,
}

impl ReasoningTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningTask::Think => "think",
            ReasoningTask::Plan => "plan",
            ReasoningTask::Propose => "propose",
            ReasoningTask::Extract => "extract",
        }
    }
}

/// 一次推理请求
#[derive(Debug, Clone)]
pub struct ReasoningRequest {
    pub task: ReasoningTask,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub output_schema: Option<Value>,
    pub max_tokens: u32,
    /// 与 prompt 对应的结构化输入（离线实现可直接读取，无需解析文本）
    pub context: Value,
}

/// 推理服务 trait
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn call(&self, request: &ReasoningRequest) -> Result<Value, LlmError>;

    /// 粗略的 token 估算（约 4 字符 / token）
    fn count_tokens(&self, text: &str) -> u64 {
        (text.len() / 4) as u64
    }
}

/// 从模型输出中提取 JSON：支持 ```json 代码块、裸 JSON，或正文中第一个 `{` 到最后一个 `}`
pub fn extract_json(output: &str) -> Result<Value, LlmError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(LlmError::EmptyResponse);
    }

    let candidate = if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        trimmed
    };

    if let Ok(v) = serde_json::from_str::<Value>(candidate) {
        return Ok(v);
    }
    match (candidate.find('{'), candidate.rfind('}')) {
        (Some(s), Some(e)) if s < e => serde_json::from_str(&candidate[s..=e])
            .map_err(|err| LlmError::Parse(format!("{err}: {candidate}"))),
        _ => Err(LlmError::Parse(format!("no JSON object in: {candidate}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_fenced_json() {
        let v = extract_json("```json\n{\"goal_satisfied\": true}\n```").unwrap();
        assert_eq!(v["goal_satisfied"], true);
    }

    #[test]
    fn test_extract_embedded_json() {
        let v = extract_json("Sure! Here it is: {\"intent\": \"host_discovery\"} hope that helps").unwrap();
        assert_eq!(v["intent"], "host_discovery");
    }

    #[test]
    fn test_extract_failures() {
        assert_eq!(extract_json("   "), Err(LlmError::EmptyResponse));
        assert!(matches!(extract_json("no json here"), Err(LlmError::Parse(_))));
    }
}
