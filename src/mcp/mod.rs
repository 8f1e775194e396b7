//! 浏览器自动化协议（MCP）客户端
//!
//! - protocol: JSON-RPC 2.0 报文
//! - client: stdio 子进程传输
//! - connection: 进程级共享连接（惰性建立 / 健康检查 / 有界重连）

pub mod client;
pub mod connection;
pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

pub use client::{StdioConnector, StdioMcpClient};
pub use connection::AutomationConnection;
pub use protocol::{ContentPart, McpToolDefinition, ToolCallResult};

/// 与自动化服务端通信的 trait
#[async_trait::async_trait]
pub trait McpClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError>;

    /// 调用远程工具；isError 结果原样返回，由调用方判定
    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<ToolCallResult, McpError>;

    async fn health_check(&self) -> Result<(), McpError>;

    async fn shutdown(&self) -> Result<(), McpError>;
}

/// 建立新连接（生产中为启动子进程，测试中为内存桩）
#[async_trait::async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn McpClient>, McpError>;
}

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("server spawn failed: {0}")]
    SpawnFailed(String),

    #[error("connection initialization failed: {0}")]
    InitFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// [automation] 段：协议服务端子进程与连接策略
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub connect_attempts: u32,
    pub connect_backoff_ms: u64,
    pub health_check_timeout_secs: u64,
    pub init_timeout_secs: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            command: "npx".into(),
            args: vec!["@playwright/mcp@latest".into(), "--headless".into()],
            env: HashMap::new(),
            connect_attempts: 3,
            connect_backoff_ms: 1_000,
            health_check_timeout_secs: 5,
            init_timeout_secs: 30,
        }
    }
}
