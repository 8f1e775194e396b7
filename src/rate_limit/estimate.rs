//! Token 估算
//!
//! 近似即可：英文约 4 字符/token，中文约 1.5 字符/token；每个工具定义另加固定开销。
//! 实际用量以 provider 返回的 usage 对账为准。

use crate::llm::ToolDefinition;
use crate::memory::Message;

/// 每条消息的固定开销（角色、分隔符）
const PER_MESSAGE_TOKENS: u64 = 4;
/// 每个工具定义的固定开销
pub const PER_TOOL_DEFINITION_TOKENS: u64 = 100;

/// Token 估算器（字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    pub fn estimate(text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        let mut ascii_chars = 0u64;
        let mut non_ascii_chars = 0u64;
        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }
        let tokens = ascii_chars.div_ceil(4) + (non_ascii_chars as f64 / 1.5).ceil() as u64;
        tokens.max(1)
    }

    /// 估算一次请求：全部消息（含工具调用参数）+ 工具定义
    pub fn estimate_request(messages: &[Message], tools: &[ToolDefinition]) -> u64 {
        let message_tokens: u64 = messages
            .iter()
            .map(|m| {
                let calls: u64 = m
                    .tool_calls
                    .iter()
                    .map(|c| Self::estimate(&c.name) + Self::estimate(&c.arguments))
                    .sum();
                PER_MESSAGE_TOKENS + Self::estimate(&m.content) + calls
            })
            .sum();
        let tool_tokens: u64 = tools
            .iter()
            .map(|t| {
                PER_TOOL_DEFINITION_TOKENS
                    + Self::estimate(&t.name)
                    + Self::estimate(&t.description)
                    + Self::estimate(&t.parameters.to_string())
            })
            .sum();
        message_tokens + tool_tokens
    }
}
