//! 工具执行网关
//!
//! execute(name, args)：经 ToolCatalog 解析为本地或远程路由，施加单次超时；
//! 远程结果即便传输层成功，也检查 isError 与文本错误标记并提升为 TOOL_EXECUTION_FAILED；
//! 连接丢失时拆除连接、重连并重试一次。每次调用输出遮蔽后的结构化审计日志（JSON）。

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{AgentError, ErrorCode};
use crate::llm::ToolDefinition;
use crate::mcp::{AutomationConnection, ToolCallResult};
use crate::tools::{
    ListTestFilesTool, ReadTestFileTool, SafeFs, SecretMasker, TestRunTool, Tool, ToolCatalog, ToolRoute,
    ToolsConfig, WriteTestFileTool,
};

/// 远程会话关闭工具
pub const CLOSE_SESSION_TOOL: &str = "browser_close";

const ERROR_MESSAGE_CHARS: usize = 1_000;

/// 传输成功但内容表示失败：以 "Error:" / "### Error" 开头的行，或 TimeoutError
pub fn has_error_marker(text: &str) -> bool {
    text.contains("TimeoutError")
        || text.lines().map(str::trim_start).any(|line| {
            line.starts_with("Error:") || line.starts_with("### Error")
        })
}

fn promote_embedded_error(result: ToolCallResult) -> Result<String, AgentError> {
    let text = result.joined_text();
    if result.is_error || has_error_marker(&text) {
        let message: String = text.chars().take(ERROR_MESSAGE_CHARS).collect();
        return Err(AgentError::tool_failed(if message.trim().is_empty() {
            "Remote tool reported an error".to_string()
        } else {
            message
        }));
    }
    Ok(text)
}

pub struct ToolGateway {
    catalog: RwLock<ToolCatalog>,
    connection: AutomationConnection,
    masker: SecretMasker,
    default_timeout: Duration,
    artifacts: SafeFs,
    initialized: AtomicBool,
}

impl ToolGateway {
    /// 注册内置本地工具（测试文件读写 / 列表 / 运行器）
    pub fn new(connection: AutomationConnection, config: &ToolsConfig, project_root: &Path, artifacts: SafeFs) -> Self {
        let mut catalog = ToolCatalog::new();
        catalog.register_local(Arc::new(WriteTestFileTool::new(artifacts.clone())));
        catalog.register_local(Arc::new(ReadTestFileTool::new(artifacts.clone())));
        catalog.register_local(Arc::new(ListTestFilesTool::new(artifacts.clone())));
        catalog.register_local(Arc::new(
            TestRunTool::new(project_root, artifacts.clone(), config.test_runner.clone())
                .with_timeout(config.test_timeout_secs),
        ));

        Self {
            catalog: RwLock::new(catalog),
            connection,
            masker: SecretMasker::new(&config.sensitive_keys, &config.sensitive_values),
            default_timeout: Duration::from_secs(config.tool_timeout_secs.max(1)),
            artifacts,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn register_local(&self, tool: Arc<dyn Tool>) {
        self.catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_local(tool);
    }

    fn catalog(&self) -> RwLockReadGuard<'_, ToolCatalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// 建立自动化连接并载入远程工具目录；已初始化时直接返回
    pub async fn initialize(&self) -> Result<usize, AgentError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(self.catalog().remote_count());
        }

        let client = self.connection.client().await?;
        let tools = match timeout(self.default_timeout, client.list_tools()).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(e)) => return Err(AgentError::connection_init(format!("Failed to list remote tools: {}", e))),
            Err(_) => return Err(AgentError::connection_init("Timed out listing remote tools")),
        };

        let added = self
            .catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_remote(tools);
        self.initialized.store(true, Ordering::Release);
        info!(remote_tools = added, "tool gateway initialized");
        Ok(added)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.catalog().definitions().to_vec()
    }

    /// 已生成的测试产物（相对路径）
    pub fn artifacts(&self) -> Result<Vec<String>, AgentError> {
        self.artifacts.list_files()
    }

    /// 执行工具；取消令牌触发时立即返回 CANCELLED
    pub async fn execute(&self, name: &str, args: Value, cancel: &CancellationToken) -> Result<String, AgentError> {
        let start = Instant::now();
        let args_preview = self.masker.preview(&args);
        let secrets = self.masker.secrets_in(&args);
        debug!(tool = name, args = %args_preview, "tool start");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::cancelled()),
            r = self.dispatch(name, args) => r,
        };
        // 服务端错误文本可能回显输入值
        let result = result.map_err(|mut e| {
            e.message = self.masker.mask_text(&e.message, &secrets);
            e
        });

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.code == ErrorCode::ToolTimeout => "timeout",
            Err(e) if e.code == ErrorCode::Cancelled => "cancelled",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": result.is_ok(),
            "outcome": outcome,
            "error_code": result.as_ref().err().map(|e| e.code.as_str()),
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        info!(audit = %audit, "tool");

        result
    }

    async fn dispatch(&self, name: &str, args: Value) -> Result<String, AgentError> {
        let route = self
            .catalog()
            .resolve(name)
            .ok_or_else(|| AgentError::invalid_input(format!("Unknown tool: {}", name)))?;

        match route {
            ToolRoute::Local(tool) => {
                let limit = tool.timeout().unwrap_or(self.default_timeout);
                timeout(limit, tool.execute(args))
                    .await
                    .map_err(|_| AgentError::tool_timeout(name, limit))?
            }
            ToolRoute::Remote => self.execute_remote(name, args).await,
        }
    }

    async fn execute_remote(&self, name: &str, args: Value) -> Result<String, AgentError> {
        match self.call_remote_once(name, args.clone()).await {
            Err(e) if e.code == ErrorCode::ConnectionLost => {
                warn!(tool = name, error = %e, "automation connection lost, reconnecting once");
                self.connection.reset().await;
                match self.call_remote_once(name, args).await {
                    Err(e) if e.code == ErrorCode::ConnectionLost => Err(e.with_recoverable(false)),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn call_remote_once(&self, name: &str, args: Value) -> Result<String, AgentError> {
        let client = self.connection.client().await?;
        let result = timeout(self.default_timeout, client.call_tool(name, args))
            .await
            .map_err(|_| AgentError::tool_timeout(name, self.default_timeout))??;
        promote_embedded_error(result)
    }

    /// 尽力关闭远程浏览器会话；无连接或服务端不提供 browser_close 时跳过
    pub async fn close_session(&self) {
        if !self.catalog().is_remote(CLOSE_SESSION_TOOL) {
            return;
        }
        let Some(client) = self.connection.current().await else {
            return;
        };
        match timeout(self.default_timeout, client.call_tool(CLOSE_SESSION_TOOL, serde_json::json!({}))).await {
            Ok(Ok(_)) => info!("automation session closed"),
            Ok(Err(e)) => warn!(error = %e, "failed to close automation session"),
            Err(_) => warn!("timed out closing automation session"),
        }
    }

    /// 进程退出：关闭会话并停止协议服务端
    pub async fn shutdown(&self) {
        self.close_session().await;
        self.connection.reset().await;
        self.initialized.store(false, Ordering::Release);
    }
}
