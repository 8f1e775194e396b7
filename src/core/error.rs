//! Agent 错误类型与恢复动作
//!
//! AgentError 在出错点创建并立即分类：错误码 + 是否可恢复。
//! 与 RecoveryEngine 配合：可恢复错误在本地重试，不可恢复错误立即终止本次运行。

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::llm::LlmError;
use crate::mcp::McpError;

/// 稳定错误码（对外结果中的 errorCode）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionInitFailed,
    ConnectionLost,
    ProviderAuthFailed,
    ProviderRateLimited,
    ProviderApiError,
    ToolExecutionFailed,
    ToolTimeout,
    InvalidInput,
    MaxIterations,
    Cancelled,
    Unknown,
}

impl ErrorCode {
    /// 固定的可恢复性规则（分类时使用）
    pub fn default_recoverable(self) -> bool {
        match self {
            ErrorCode::ConnectionInitFailed
            | ErrorCode::ProviderAuthFailed
            | ErrorCode::MaxIterations
            | ErrorCode::Cancelled => false,
            ErrorCode::ConnectionLost
            | ErrorCode::ProviderRateLimited
            | ErrorCode::ProviderApiError
            | ErrorCode::ToolExecutionFailed
            | ErrorCode::ToolTimeout
            | ErrorCode::InvalidInput
            | ErrorCode::Unknown => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ConnectionInitFailed => "CONNECTION_INIT_FAILED",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::ProviderAuthFailed => "PROVIDER_AUTH_FAILED",
            ErrorCode::ProviderRateLimited => "PROVIDER_RATE_LIMITED",
            ErrorCode::ProviderApiError => "PROVIDER_API_ERROR",
            ErrorCode::ToolExecutionFailed => "TOOL_EXECUTION_FAILED",
            ErrorCode::ToolTimeout => "TOOL_TIMEOUT",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::MaxIterations => "MAX_ITERATIONS",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent 运行过程中的错误：错误码、可读信息、是否可恢复、可选细节
#[derive(Error, Debug, Clone)]
#[error("[{code}] {message}")]
pub struct AgentError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
    pub details: Option<serde_json::Value>,
}

impl AgentError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable: code.default_recoverable(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// 覆盖分类时得到的可恢复标记（如重连重试预算耗尽后升级为终止）
    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn connection_init(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionInitFailed, message)
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionLost, message)
    }

    pub fn tool_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ToolExecutionFailed, message)
    }

    pub fn tool_timeout(tool: &str, after: Duration) -> Self {
        Self::new(
            ErrorCode::ToolTimeout,
            format!("Tool '{}' timed out after {}s", tool, after.as_secs()),
        )
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn max_iterations(max: usize) -> Self {
        Self::new(
            ErrorCode::MaxIterations,
            format!("Reached maximum iterations ({}) without completion", max),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "Run cancelled")
    }

    /// 路径逃逸：沙箱外路径一律视为非法输入
    pub fn path_escape(path: &str) -> Self {
        Self::invalid_input(format!("Path escapes the artifacts directory: {}", path))
    }
}

impl From<LlmError> for AgentError {
    fn from(err: LlmError) -> Self {
        let message = err.to_string();
        match err {
            LlmError::Authentication(_) => Self::new(ErrorCode::ProviderAuthFailed, message),
            LlmError::RateLimited { retry_after_ms, .. } => {
                let err = Self::new(ErrorCode::ProviderRateLimited, message);
                match retry_after_ms {
                    Some(ms) => err.with_details(serde_json::json!({ "retry_after_ms": ms })),
                    None => err,
                }
            }
            LlmError::InvalidModel(_) | LlmError::InvalidRequest(_) | LlmError::Config(_) => {
                Self::new(ErrorCode::ProviderApiError, message).with_recoverable(false)
            }
            LlmError::Server { status, .. } => Self::new(ErrorCode::ProviderApiError, message)
                .with_details(serde_json::json!({ "status": status })),
            LlmError::Api { status, .. } => Self::new(ErrorCode::ProviderApiError, message)
                .with_details(serde_json::json!({ "status": status })),
            LlmError::Network(_) | LlmError::Decode(_) => {
                Self::new(ErrorCode::ProviderApiError, message)
            }
            LlmError::Cancelled => Self::cancelled(),
        }
    }
}

impl From<McpError> for AgentError {
    fn from(err: McpError) -> Self {
        let message = err.to_string();
        match err {
            McpError::SpawnFailed(_) | McpError::InitFailed(_) => Self::connection_init(message),
            McpError::Transport(_) | McpError::Io(_) => Self::connection_lost(message),
            McpError::Json(_) | McpError::Protocol(_) | McpError::MethodNotFound(_) => Self::tool_failed(message),
        }
    }
}

/// 恢复引擎根据错误给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 退避后重试本轮（LLM 调用的可恢复错误）
    RetryAfter(Duration),
    /// 把错误写回对话，由 LLM 自行调整（工具失败）
    ReportToModel(String),
    /// 终止本次运行
    Abort,
}
