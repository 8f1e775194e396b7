//! 进程级共享的自动化连接：惰性建立，复用前健康检查，断线后有界重连

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::mcp::{AutomationConfig, McpClient, McpConnector, McpError};

pub struct AutomationConnection {
    connector: Arc<dyn McpConnector>,
    client: Mutex<Option<Arc<dyn McpClient>>>,
    connect_attempts: u32,
    connect_backoff: Duration,
}

impl AutomationConnection {
    pub fn new(connector: Arc<dyn McpConnector>, config: &AutomationConfig) -> Self {
        Self {
            connector,
            client: Mutex::new(None),
            connect_attempts: config.connect_attempts.max(1),
            connect_backoff: Duration::from_millis(config.connect_backoff_ms),
        }
    }

    /// 取得可用连接：已有连接先做健康检查，不健康则拆除并重新建立
    pub async fn client(&self) -> Result<Arc<dyn McpClient>, McpError> {
        let mut slot = self.client.lock().await;
        if let Some(existing) = slot.as_ref() {
            match existing.health_check().await {
                Ok(()) => return Ok(existing.clone()),
                Err(e) => {
                    warn!(error = %e, "automation connection unhealthy, reconnecting");
                    let _ = existing.shutdown().await;
                    *slot = None;
                }
            }
        }

        let client = self.connect_with_retry().await?;
        *slot = Some(client.clone());
        Ok(client)
    }

    async fn connect_with_retry(&self) -> Result<Arc<dyn McpClient>, McpError> {
        let mut delay = self.connect_backoff;
        let mut last_error = String::new();
        for attempt in 1..=self.connect_attempts {
            match self.connector.connect().await {
                Ok(client) => {
                    info!(attempt, "automation connection established");
                    return Ok(client);
                }
                Err(e) => {
                    warn!(attempt, max = self.connect_attempts, error = %e, "automation connect failed");
                    last_error = e.to_string();
                    if attempt < self.connect_attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }
        Err(McpError::InitFailed(format!(
            "gave up after {} attempts: {last_error}",
            self.connect_attempts
        )))
    }

    /// 拆除当前连接（检测到断线后调用），下次 client() 会重新建立
    pub async fn reset(&self) {
        if let Some(client) = self.client.lock().await.take() {
            if let Err(e) = client.shutdown().await {
                warn!(error = %e, "failed to stop automation server");
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    /// 当前连接（不触发建立与健康检查）
    pub async fn current(&self) -> Option<Arc<dyn McpClient>> {
        self.client.lock().await.clone()
    }
}
