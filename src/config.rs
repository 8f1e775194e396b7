//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SCOUT__*` 覆盖（双下划线表示嵌套，如 `SCOUT__RATE_LIMIT__TOKENS_PER_MINUTE=60000`）。

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::mcp::AutomationConfig;
use crate::rate_limit::RateLimitConfig;
use crate::react::AgentConfig;
use crate::tools::ToolsConfig;

/// 未配置或读取失败时使用的系统提示词
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous QA agent. Explore the web application with the browser tools, \
write Playwright tests for the flows you verify with write_test_file, run them with run_tests, and fix failures. \
When you are done, reply without tool calls with a JSON object: \
{\"summary\": \"...\", \"testFiles\": [\"...\"], \"issues\": [\"...\"]}.";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub rate_limit: RateLimitConfig,
    pub agent: AgentConfig,
    pub tools: ToolsConfig,
    pub automation: AutomationConfig,
}

/// [app] 段：工作目录、测试产物目录、系统提示词
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 测试运行器的工作目录
    pub workspace_root: PathBuf,
    /// 生成的测试文件目录（相对 workspace_root）
    pub artifacts_dir: PathBuf,
    pub system_prompt_path: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            artifacts_dir: PathBuf::from("tests/generated"),
            system_prompt_path: Some(PathBuf::from("config/prompts/system.txt")),
        }
    }
}

impl AppSection {
    pub fn artifacts_root(&self) -> PathBuf {
        self.workspace_root.join(&self.artifacts_dir)
    }
}

/// [llm] 段：OpenAI 兼容端点、模型、API Key 所在环境变量、超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: Option<String>,
    pub model: String,
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: None,
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 120,
        }
    }
}

impl LlmSection {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.trim().is_empty())
    }
}

impl AppConfig {
    /// 读取系统提示词文件；缺失时用内置提示词
    pub fn system_prompt(&self) -> String {
        self.app
            .system_prompt_path
            .as_deref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }
}

/// 从 config 目录加载配置，环境变量 SCOUT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SCOUT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SCOUT")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 每次运行开始时重新加载：tokens_per_minute / max_iterations / model 对下一次运行生效
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
