//! stdio 传输的 MCP 客户端：子进程 stdin/stdout 上逐行收发 JSON-RPC

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::mcp::protocol::*;
use crate::mcp::{AutomationConfig, McpClient, McpConnector, McpError};

/// 透传给子进程的系统环境变量；其余继承环境一律清除
const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "USER", "LANG", "TERM", "TMPDIR"];

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Reader = Box<dyn AsyncBufRead + Send + Unpin>;

struct StdioChannel {
    writer: Writer,
    reader: Reader,
}

/// 通过子进程 stdio 通信的 MCP 客户端
///
/// 请求与其响应在同一把锁内完成，连接可被多个运行共享。
/// 超时被取消的请求，其迟到响应会因 id 不匹配而在下一次读取时被跳过。
pub struct StdioMcpClient {
    server_id: String,
    next_id: AtomicU64,
    channel: Mutex<StdioChannel>,
    child: Mutex<Option<Child>>,
    stopped: AtomicBool,
    health_timeout: Duration,
}

impl StdioMcpClient {
    /// 启动子进程并完成 initialize 握手
    pub async fn spawn(server_id: &str, config: &AutomationConfig) -> Result<Self, McpError> {
        if config.command.trim().is_empty() {
            return Err(McpError::SpawnFailed("empty automation command".into()));
        }

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.env_clear();
        for key in PASSTHROUGH_ENV {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        for (k, v) in &config.env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::SpawnFailed(format!("failed to spawn '{}': {e}", config.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::SpawnFailed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::SpawnFailed("failed to capture stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            let id = server_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server_id = %id, line = %line, "automation server stderr");
                }
            });
        }

        let client = Self::with_transport(
            server_id,
            Box::new(stdin),
            Box::new(BufReader::new(stdout)),
            Some(child),
            Duration::from_secs(config.health_check_timeout_secs.max(1)),
        );

        let init_timeout = Duration::from_secs(config.init_timeout_secs.max(1));
        match tokio::time::timeout(init_timeout, client.initialize()).await {
            Ok(Ok(())) => Ok(client),
            Ok(Err(e)) => {
                client.kill().await;
                Err(McpError::InitFailed(e.to_string()))
            }
            Err(_) => {
                client.kill().await;
                Err(McpError::InitFailed(format!(
                    "handshake timed out after {}s",
                    init_timeout.as_secs()
                )))
            }
        }
    }

    fn with_transport(
        server_id: &str,
        writer: Writer,
        reader: Reader,
        child: Option<Child>,
        health_timeout: Duration,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            next_id: AtomicU64::new(1),
            channel: Mutex::new(StdioChannel { writer, reader }),
            child: Mutex::new(child),
            stopped: AtomicBool::new(false),
            health_timeout,
        }
    }

    async fn initialize(&self) -> Result<(), McpError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: ClientCapabilities {},
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };
        let response = self
            .send_request("initialize", Some(serde_json::to_value(&params)?))
            .await?;
        debug!(server_id = %self.server_id, response = %response, "automation server initialized");

        let mut line = serde_json::to_string(&JsonRpcNotification::new("notifications/initialized"))?;
        line.push('\n');
        let mut channel = self.channel.lock().await;
        channel.writer.write_all(line.as_bytes()).await?;
        channel.writer.flush().await?;
        Ok(())
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let mut channel = self.channel.lock().await;
        self.exchange(&mut channel, method, params).await
    }

    /// 在已持有的通道上写出请求并读到对应 id 的响应
    async fn exchange(
        &self,
        channel: &mut StdioChannel,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        line.push('\n');

        channel.writer.write_all(line.as_bytes()).await?;
        channel.writer.flush().await?;

        let mut buf = String::new();
        loop {
            buf.clear();
            if channel.reader.read_line(&mut buf).await? == 0 {
                return Err(McpError::Transport("server closed stdout".into()));
            }
            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == Some(id) => return resp.into_result(),
                Ok(resp) => {
                    debug!(server_id = %self.server_id, id = ?resp.id, "skipping non-matching JSON-RPC message");
                }
                Err(_) => {
                    debug!(server_id = %self.server_id, line = trimmed, "ignoring non-JSON-RPC line");
                }
            }
        }
    }

    async fn kill(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl McpClient for StdioMcpClient {
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let result = self.send_request("tools/list", None).await?;
        let tools = result
            .get("tools")
            .cloned()
            .unwrap_or(serde_json::Value::Array(vec![]));
        serde_json::from_value(tools).map_err(|e| McpError::Protocol(format!("failed to parse tools list: {e}")))
    }

    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<ToolCallResult, McpError> {
        let params = ToolCallParams {
            name: name.to_string(),
            arguments,
        };
        let result = self
            .send_request("tools/call", Some(serde_json::to_value(&params)?))
            .await?;
        // 非标准结果原样转为文本，交由上层检查
        Ok(serde_json::from_value::<ToolCallResult>(result.clone())
            .unwrap_or_else(|_| ToolCallResult::text(result.to_string())))
    }

    /// 进程已退出或已停止为不健康；通道被在途请求占用时视为健康（不排队 ping），否则 ping
    async fn health_check(&self) -> Result<(), McpError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(McpError::Transport("server already shut down".into()));
        }
        if let Some(child) = self.child.lock().await.as_mut() {
            if let Some(status) = child.try_wait()? {
                return Err(McpError::Transport(format!("server exited with {status}")));
            }
        }
        let Ok(mut channel) = self.channel.try_lock() else {
            debug!(server_id = %self.server_id, "request in flight, skipping ping");
            return Ok(());
        };
        match tokio::time::timeout(self.health_timeout, self.exchange(&mut channel, "ping", None)).await {
            Ok(Ok(_)) | Ok(Err(McpError::MethodNotFound(_))) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(McpError::Transport("ping timed out".into())),
        }
    }

    async fn shutdown(&self) -> Result<(), McpError> {
        info!(server_id = %self.server_id, "stopping automation server");
        self.kill().await;
        Ok(())
    }
}

/// 按 [automation] 配置启动 stdio 子进程
pub struct StdioConnector {
    config: AutomationConfig,
}

impl StdioConnector {
    pub fn new(config: AutomationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl McpConnector for StdioConnector {
    async fn connect(&self) -> Result<Arc<dyn McpClient>, McpError> {
        let client = StdioMcpClient::spawn("automation", &self.config).await?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::AutomationConnection;
    use serde_json::{json, Value};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    /// 内存中的自动化服务端：tools/call 需要 3 秒，其余请求立即响应
    async fn serve(io: DuplexStream) {
        let (read, write) = tokio::io::split(io);
        let write: Arc<Mutex<WriteHalf<DuplexStream>>> = Arc::new(Mutex::new(write));
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = serde_json::from_str(&line).unwrap();
            let Some(id) = request.get("id").cloned() else {
                continue;
            };
            let method = request["method"].as_str().unwrap_or_default().to_string();
            let write = write.clone();
            tokio::spawn(async move {
                let result = if method == "tools/call" {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    json!({"content": [{"type": "text", "text": "waited"}]})
                } else {
                    json!({})
                };
                let mut out = json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string();
                out.push('\n');
                let mut w = write.lock().await;
                w.write_all(out.as_bytes()).await.unwrap();
                w.flush().await.unwrap();
            });
        }
    }

    fn in_memory_client() -> Arc<StdioMcpClient> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(server_io));
        let (read, write): (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) = tokio::io::split(client_io);
        Arc::new(StdioMcpClient::with_transport(
            "mem",
            Box::new(write),
            Box::new(BufReader::new(read)),
            None,
            Duration::from_secs(1),
        ))
    }

    struct SharedConnector(Arc<StdioMcpClient>);

    #[async_trait]
    impl McpConnector for SharedConnector {
        async fn connect(&self) -> Result<Arc<dyn McpClient>, McpError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_does_not_queue_behind_in_flight_call() {
        let client = in_memory_client();
        client.health_check().await.unwrap();

        let busy = client.clone();
        let in_flight = tokio::spawn(async move { busy.call_tool("browser_wait_for", json!({"time": 3})).await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        client.health_check().await.unwrap();
        let result = in_flight.await.unwrap().unwrap();
        assert_eq!(result.joined_text(), "waited");
        assert!(!client.stopped.load(Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_runs_share_connection_without_teardown() {
        let client = in_memory_client();
        let connection = Arc::new(AutomationConnection::new(
            Arc::new(SharedConnector(client.clone())),
            &AutomationConfig::default(),
        ));

        let first = connection.clone();
        let run_a = tokio::spawn(async move {
            let c = first.client().await?;
            c.call_tool("browser_wait_for", json!({})).await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let second = connection.client().await.unwrap();
        let reply = second.call_tool("browser_snapshot", json!({})).await;

        assert_eq!(run_a.await.unwrap().unwrap().joined_text(), "waited");
        assert!(reply.is_ok());
        assert!(connection.is_connected().await);
        assert!(!client.stopped.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_stopped_client_is_unhealthy() {
        let client = in_memory_client();
        client.shutdown().await.unwrap();
        assert!(matches!(client.health_check().await, Err(McpError::Transport(_))));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let config = AutomationConfig {
            command: "/nonexistent/scout-automation-server".into(),
            ..AutomationConfig::default()
        };
        let err = StdioMcpClient::spawn("t", &config).await.err().unwrap();
        assert!(matches!(err, McpError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let config = AutomationConfig {
            command: "  ".into(),
            ..AutomationConfig::default()
        };
        assert!(matches!(
            StdioConnector::new(config).connect().await.err().unwrap(),
            McpError::SpawnFailed(_)
        ));
    }
}
