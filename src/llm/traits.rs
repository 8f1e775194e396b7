//! LLM 客户端抽象
//!
//! 所有后端实现 LlmClient::complete：输入模型名、消息与工具定义，输出 assistant 消息与 provider 报告的用量。
//! 失败统一为带状态码语义的 LlmError（401 鉴权 / 429 限流 / 5xx 暂时性 / 400 非法请求）。

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::Message;
use crate::rate_limit::UsageReport;

/// LLM 调用错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("provider error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed provider response: {0}")]
    Decode(String),

    #[error("request cancelled")]
    Cancelled,
}

fn retry_hint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:try again|retry) in ([0-9]+(?:\.[0-9]+)?)\s*(ms|s)\b")
            .unwrap_or_else(|e| panic!("invalid retry hint regex: {e}"))
    })
}

/// 从错误文本中提取「try again in 2.5s / 300ms」形式的建议等待时间
pub fn retry_hint_from_message(message: &str) -> Option<u64> {
    let caps = retry_hint_regex().captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let ms = match caps.get(2)?.as_str().to_ascii_lowercase().as_str() {
        "ms" => value,
        _ => value * 1000.0,
    };
    Some(ms.ceil() as u64)
}

impl LlmError {
    /// 按 HTTP 状态码与错误体分类；retry_after_ms 来自响应头（若有）
    pub fn from_status(status: u16, message: String, code: Option<&str>, retry_after_ms: Option<u64>) -> Self {
        match (status, code) {
            (_, Some("model_not_found")) | (404, _) => LlmError::InvalidModel(message),
            (429, Some("insufficient_quota")) => LlmError::Config(message),
            (401, _) | (403, _) => LlmError::Authentication(message),
            (429, _) => {
                let retry_after_ms = retry_after_ms.or_else(|| retry_hint_from_message(&message));
                LlmError::RateLimited {
                    message,
                    retry_after_ms,
                }
            }
            (400, _) | (422, _) => LlmError::InvalidRequest(message),
            (s, _) if s >= 500 => LlmError::Server { status: s, message },
            (s, _) => LlmError::Api { status: s, message },
        }
    }
}

/// 传给 LLM 的工具定义（名称、描述、参数 JSON Schema）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// provider 报告的用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// 一次补全请求
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolDefinition],
}

/// 一次补全结果：assistant 消息（可能含工具调用）+ 用量
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub message: Message,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl Completion {
    pub fn has_tool_calls(&self) -> bool {
        !self.message.tool_calls.is_empty()
    }
}

impl UsageReport for Completion {
    fn total_tokens(&self) -> Option<u64> {
        self.usage.map(|u| u.total_tokens)
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, LlmError>;

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            LlmError::from_status(401, "bad key".into(), None, None),
            LlmError::Authentication(_)
        ));
        assert!(matches!(
            LlmError::from_status(404, "no such model".into(), None, None),
            LlmError::InvalidModel(_)
        ));
        assert!(matches!(
            LlmError::from_status(400, "bad".into(), Some("model_not_found"), None),
            LlmError::InvalidModel(_)
        ));
        assert!(matches!(
            LlmError::from_status(400, "bad".into(), None, None),
            LlmError::InvalidRequest(_)
        ));
        assert!(matches!(
            LlmError::from_status(503, "busy".into(), None, None),
            LlmError::Server { status: 503, .. }
        ));
        assert!(matches!(
            LlmError::from_status(429, "quota".into(), Some("insufficient_quota"), None),
            LlmError::Config(_)
        ));
    }

    #[test]
    fn test_rate_limit_prefers_header_then_message() {
        match LlmError::from_status(429, "Please try again in 1.5s".into(), None, Some(700)) {
            LlmError::RateLimited { retry_after_ms, .. } => assert_eq!(retry_after_ms, Some(700)),
            other => panic!("unexpected {:?}", other),
        }
        match LlmError::from_status(429, "Please try again in 1.5s".into(), None, None) {
            LlmError::RateLimited { retry_after_ms, .. } => assert_eq!(retry_after_ms, Some(1500)),
            other => panic!("unexpected {:?}", other),
        }
        match LlmError::from_status(429, "slow down".into(), None, None) {
            LlmError::RateLimited { retry_after_ms, .. } => assert_eq!(retry_after_ms, None),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_retry_hint_units() {
        assert_eq!(retry_hint_from_message("Try again in 350ms."), Some(350));
        assert_eq!(retry_hint_from_message("please retry in 2 s"), Some(2000));
        assert_eq!(retry_hint_from_message("no hint"), None);
    }
}
