//! 错误恢复引擎
//!
//! 根据 AgentError 的分类与连续失败次数返回 RecoveryAction，供主循环决定退避重试、写回对话还是终止。

use std::time::Duration;

use crate::core::{AgentError, ErrorCode, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    /// LLM 调用连续失败上限，超过即终止
    max_consecutive_errors: usize,
    /// 连续失败时的基础退避
    error_backoff: Duration,
}

impl RecoveryEngine {
    pub fn new(max_consecutive_errors: usize, error_backoff: Duration) -> Self {
        Self {
            max_consecutive_errors,
            error_backoff,
        }
    }

    /// LLM 调用失败：不可恢复立即终止；可恢复则按连续次数线性退避，超上限终止
    pub fn on_llm_error(&self, err: &AgentError, consecutive: usize) -> RecoveryAction {
        if !err.recoverable || consecutive > self.max_consecutive_errors {
            return RecoveryAction::Abort;
        }
        let hinted = err
            .details
            .as_ref()
            .and_then(|d| d.get("retry_after_ms"))
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis);
        let backoff = self.error_backoff * consecutive.max(1) as u32;
        RecoveryAction::RetryAfter(hinted.map_or(backoff, |h| h.max(backoff)))
    }

    /// 单个工具失败：可恢复则写回对话让 LLM 调整，否则终止
    pub fn on_tool_error(&self, tool: &str, err: &AgentError) -> RecoveryAction {
        if !err.recoverable {
            return RecoveryAction::Abort;
        }
        let hint = match err.code {
            ErrorCode::ToolTimeout => " The action took too long; try a simpler step or take a snapshot first.",
            ErrorCode::InvalidInput => " Check the arguments against the tool schema.",
            ErrorCode::ConnectionLost => " The browser connection was reset; the page state may have been lost.",
            _ => "",
        };
        RecoveryAction::ReportToModel(format!(
            "Error executing {}: {}.{}",
            tool, err.message, hint
        ))
    }

    pub fn max_consecutive_errors(&self) -> usize {
        self.max_consecutive_errors
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}
