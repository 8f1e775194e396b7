//! 外部测试运行器：执行配置的命令（默认 npx playwright test），可指定单个产物文件，
//! 从文本输出解析 passed / failed / skipped 计数。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

use crate::core::AgentError;
use crate::tools::{parse_args, schema_of, SafeFs, Tool};

const RAW_OUTPUT_CHARS: usize = 8_000;

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct RunTestsArgs {
    /// 只运行该产物文件（相对产物目录）；省略则运行整个套件
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunSummary {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub exit_code: Option<i32>,
    pub raw_output: String,
}

fn count_regex(kind: &'static str) -> &'static Regex {
    static PASSED: OnceLock<Regex> = OnceLock::new();
    static FAILED: OnceLock<Regex> = OnceLock::new();
    static SKIPPED: OnceLock<Regex> = OnceLock::new();
    let (cell, pattern) = match kind {
        "passed" => (&PASSED, r"(?i)\b(\d+)\s+passed\b"),
        "failed" => (&FAILED, r"(?i)\b(\d+)\s+failed\b"),
        _ => (&SKIPPED, r"(?i)\b(\d+)\s+(?:skipped|pending)\b"),
    };
    cell.get_or_init(|| Regex::new(pattern).unwrap_or_else(|e| panic!("invalid count regex: {e}")))
}

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap_or_else(|e| panic!("invalid ansi regex: {e}")))
}

fn parse_count(output: &str, kind: &'static str) -> u32 {
    count_regex(kind)
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// 从运行器输出解析计数；输出保留末尾部分
pub fn summarize_output(output: &str, exit_code: Option<i32>) -> TestRunSummary {
    let clean = ansi_regex().replace_all(output, "");
    let total = clean.chars().count();
    let raw_output = if total > RAW_OUTPUT_CHARS {
        clean.chars().skip(total - RAW_OUTPUT_CHARS).collect()
    } else {
        clean.to_string()
    };
    TestRunSummary {
        passed: parse_count(&clean, "passed"),
        failed: parse_count(&clean, "failed"),
        skipped: parse_count(&clean, "skipped"),
        exit_code,
        raw_output,
    }
}

pub struct TestRunTool {
    project_root: PathBuf,
    artifacts: SafeFs,
    command: Vec<String>,
    timeout: Duration,
}

impl TestRunTool {
    pub fn new(project_root: impl AsRef<Path>, artifacts: SafeFs, command: Vec<String>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
            artifacts,
            command,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = Duration::from_secs(timeout_secs);
        self
    }
}

#[async_trait]
impl Tool for TestRunTool {
    fn name(&self) -> &str {
        "run_tests"
    }

    fn description(&self) -> &str {
        "Run the generated browser tests with the configured test runner. \
         Optional {\"file\": \"path relative to the test artifacts directory\"}; \
         returns {passed, failed, skipped, exitCode, rawOutput}."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<RunTestsArgs>()
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout + Duration::from_secs(5))
    }

    async fn execute(&self, args: Value) -> Result<String, AgentError> {
        let args: RunTestsArgs = if args.is_null() {
            RunTestsArgs::default()
        } else {
            parse_args(self.name(), args)?
        };
        let (program, base_args) = self
            .command
            .split_first()
            .ok_or_else(|| AgentError::invalid_input("No test runner command configured"))?;

        let mut cmd = Command::new(program);
        cmd.args(base_args)
            .current_dir(&self.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(file) = args.file.as_deref().filter(|f| !f.trim().is_empty()) {
            let full = self.artifacts.resolve(file)?;
            let arg = full.strip_prefix(&self.project_root).unwrap_or(&full).to_path_buf();
            cmd.arg(arg);
        }

        tracing::info!(command = %self.command.join(" "), file = ?args.file, "run_tests");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| AgentError::tool_timeout(self.name(), self.timeout))?
            .map_err(|e| AgentError::tool_failed(format!("Failed to run tests: {}", e)))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            combined.push('\n');
            combined.push_str(&stderr);
        }

        let summary = summarize_output(&combined, output.status.code());
        serde_json::to_string(&summary).map_err(|e| AgentError::tool_failed(e.to_string()))
    }
}
