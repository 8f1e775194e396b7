//! 工具层：本地工具（测试产物读写 / 列表 / 运行器）、工具目录与执行网关

pub mod filesystem;
pub mod gateway;
pub mod mask;
pub mod registry;
pub mod test_run;

use serde::Deserialize;

pub use filesystem::{ListTestFilesTool, ReadTestFileTool, SafeFs, WriteTestFileTool, WrittenFile};
pub use gateway::{has_error_marker, ToolGateway, CLOSE_SESSION_TOOL};
pub use mask::SecretMasker;
pub use registry::{parse_args, schema_of, Tool, ToolCatalog, ToolRoute};
pub use test_run::{summarize_output, TestRunSummary, TestRunTool};

/// [tools] 段
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub max_artifact_bytes: usize,
    /// 测试运行器命令（程序 + 参数）
    pub test_runner: Vec<String>,
    pub test_timeout_secs: u64,
    /// 审计日志中需遮蔽的键名片段
    pub sensitive_keys: Vec<String>,
    /// 需遮蔽的字面值（如测试账号密码）
    pub sensitive_values: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 60,
            max_artifact_bytes: 256 * 1024,
            test_runner: vec!["npx".into(), "playwright".into(), "test".into()],
            test_timeout_secs: 300,
            sensitive_keys: ["password", "passwd", "secret", "token", "api_key", "apikey", "authorization", "cookie", "credential"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            sensitive_values: Vec::new(),
        }
    }
}
