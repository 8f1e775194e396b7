//! Agent 运行时
//!
//! 持有进程级共享组件（LLM 客户端、RequestScheduler、ToolGateway），
//! run(task) 为每次运行构建 Planner / RecoveryEngine / 对话历史，并返回结构化 RunResult。
//! 多个运行可并发，共享同一调度器（全局限流）与同一自动化连接。

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{load_config, AppConfig};
use crate::core::{AgentError, RecoveryEngine};
use crate::llm::{LlmClient, OpenAiClient};
use crate::mcp::{AutomationConnection, StdioConnector};
use crate::rate_limit::RequestScheduler;
use crate::react::{run_agent_loop, AgentSession, EventEmitter, EventSender, Planner, RunResult};
use crate::tools::{SafeFs, ToolGateway};

pub struct AgentRuntime {
    llm: Arc<dyn LlmClient>,
    scheduler: Arc<RequestScheduler>,
    gateway: Arc<ToolGateway>,
    config: RwLock<AppConfig>,
    reload_on_run: bool,
    config_path: Option<PathBuf>,
}

impl AgentRuntime {
    /// 以注入的组件构建（测试或嵌入场景），不在运行开始时重读配置
    pub fn new(config: AppConfig, llm: Arc<dyn LlmClient>, gateway: Arc<ToolGateway>) -> Self {
        let scheduler = Arc::new(RequestScheduler::from_config(config.rate_limit.clone()));
        Self {
            llm,
            scheduler,
            gateway,
            config: RwLock::new(config),
            reload_on_run: false,
            config_path: None,
        }
    }

    /// 按配置构建 OpenAI 兼容客户端、stdio 自动化连接与本地工具
    pub fn from_config(config: AppConfig) -> Result<Self, AgentError> {
        let api_key = config.llm.api_key();
        if api_key.is_none() {
            warn!(env = %config.llm.api_key_env, "no API key set; LLM calls will fail authentication");
        }
        let llm = OpenAiClient::new(
            config.llm.base_url.as_deref(),
            api_key.as_deref(),
            Duration::from_secs(config.llm.request_timeout_secs),
        )?;

        let connector = Arc::new(StdioConnector::new(config.automation.clone()));
        let connection = AutomationConnection::new(connector, &config.automation);
        let artifacts = SafeFs::new(config.app.artifacts_root(), config.tools.max_artifact_bytes);
        let gateway = ToolGateway::new(connection, &config.tools, &config.app.workspace_root, artifacts);

        let mut runtime = Self::new(config, Arc::new(llm), Arc::new(gateway));
        runtime.reload_on_run = true;
        Ok(runtime)
    }

    pub fn with_config_reload(mut self, enabled: bool) -> Self {
        self.reload_on_run = enabled;
        self
    }

    /// 重读配置时额外叠加的配置文件（与启动时 --config 一致）
    pub fn with_config_path(mut self, path: Option<&Path>) -> Self {
        self.config_path = path.map(Path::to_path_buf);
        self
    }

    pub fn gateway(&self) -> &Arc<ToolGateway> {
        &self.gateway
    }

    pub fn scheduler(&self) -> &Arc<RequestScheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// 重读配置并把限流参数应用到共享调度器（只影响之后的调度决策）
    fn refresh_config(&self) -> AppConfig {
        if self.reload_on_run {
            match load_config(self.config_path.as_deref()) {
                Ok(fresh) => {
                    if fresh.rate_limit != self.scheduler.config() {
                        info!(tokens_per_minute = fresh.rate_limit.tokens_per_minute, "rate limit config updated");
                        self.scheduler.update_config(fresh.rate_limit.clone());
                    }
                    *self.config.write().unwrap_or_else(PoisonError::into_inner) = fresh;
                }
                Err(e) => warn!(error = %e, "config reload failed, keeping previous config"),
            }
        }
        self.config()
    }

    /// 执行一次运行；events 为可选的过程事件通道
    pub async fn run(&self, task: &str, events: Option<EventSender>, cancel: CancellationToken) -> RunResult {
        let emitter = events.map(EventEmitter::new).unwrap_or_default();
        if task.trim().is_empty() {
            let err = AgentError::invalid_input("Task must not be empty");
            emitter.error(err.message.clone());
            return RunResult::failed(&err);
        }

        let cfg = self.refresh_config();
        let run_id = Uuid::new_v4().to_string();
        let planner = Planner::new(self.llm.clone(), self.scheduler.clone(), cfg.llm.model.clone())
            .with_priority(cfg.agent.llm_priority);
        let recovery = RecoveryEngine::new(
            cfg.agent.max_consecutive_errors,
            Duration::from_millis(cfg.agent.error_backoff_ms),
        );
        let system_prompt = cfg.system_prompt();

        let session = AgentSession::new(&planner, &self.gateway, &recovery, &cfg.agent, &system_prompt)
            .with_cancel_token(cancel)
            .with_events(emitter)
            .with_run_id(run_id);
        run_agent_loop(&session, task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorCode;
    use crate::llm::ScriptedLlmClient;
    use crate::mcp::{McpClient, McpConnector, McpError};

    struct Unreachable;

    #[async_trait::async_trait]
    impl McpConnector for Unreachable {
        async fn connect(&self) -> Result<Arc<dyn McpClient>, McpError> {
            Err(McpError::SpawnFailed("no automation server in unit tests".into()))
        }
    }

    fn runtime(dir: &Path) -> AgentRuntime {
        let mut config = AppConfig::default();
        config.automation.connect_attempts = 1;
        let connection = AutomationConnection::new(Arc::new(Unreachable), &config.automation);
        let gateway = ToolGateway::new(connection, &config.tools, dir, SafeFs::new(dir.join("tests"), 1024));
        AgentRuntime::new(config, Arc::new(ScriptedLlmClient::new(Vec::new())), Arc::new(gateway))
    }

    #[tokio::test]
    async fn test_empty_task_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let result = runtime(dir.path()).run("   ", None, CancellationToken::new()).await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::InvalidInput));
    }

    #[tokio::test]
    async fn test_unreachable_automation_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path());
        let result = runtime.run("explore https://example.com", None, CancellationToken::new()).await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::ConnectionInitFailed));
        assert_eq!(runtime.scheduler().stats().used, 0);
    }
}
