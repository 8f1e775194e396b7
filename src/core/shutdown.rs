//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发取消令牌，正在进行的运行收到取消后自行做会话清理；
//! 进程退出前由 ShutdownCoordinator 依次执行清理任务（如关闭自动化协议子进程），每项带超时。

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::tools::ToolGateway;

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

/// 进程级取消源：信号到达时取消所有运行令牌，只记录第一个原因
#[derive(Debug, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 运行级取消令牌（子 token，关闭时一并取消；单独取消不影响其他运行）
    pub fn run_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(reason);
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 监听 Ctrl+C 与 SIGTERM
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling active run");
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    info!("SIGTERM received, cancelling active run");
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }
}

/// 进程退出前的清理项
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理项；单项超时或失败只记日志，不阻止后续项
pub struct ShutdownCoordinator {
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Box::new(task));
    }

    /// 返回成功完成的清理项数量
    pub async fn run_cleanup(&self) -> usize {
        let mut completed = 0;
        for task in &self.tasks {
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    completed += 1;
                    info!(task = task.name(), "cleanup completed");
                }
                Ok(Err(e)) => warn!(task = task.name(), error = %e, "cleanup failed"),
                Err(_) => warn!(task = task.name(), timeout_secs = self.timeout.as_secs(), "cleanup timed out"),
            }
        }
        completed
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 自动化协议连接清理：关闭浏览器会话并结束子进程
pub struct AutomationCleanup {
    gateway: Arc<ToolGateway>,
}

impl AutomationCleanup {
    pub fn new(gateway: Arc<ToolGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for AutomationCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.gateway.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "AutomationConnection"
    }
}
