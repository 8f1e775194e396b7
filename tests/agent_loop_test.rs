//! Agent 运行集成测试：脚本化 LLM + 内存自动化服务端

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use scout::config::AppConfig;
use scout::core::ErrorCode;
use scout::llm::{text_completion, tool_call_completion, LlmError, ScriptedLlmClient};
use scout::mcp::{AutomationConnection, McpClient, McpConnector, McpError, McpToolDefinition, ToolCallResult};
use scout::memory::Role;
use scout::react::MODAL_HINT;
use scout::tools::{SafeFs, ToolGateway};
use scout::AgentRuntime;

const REMOTE_TOOLS: &[&str] = &[
    "browser_navigate",
    "browser_snapshot",
    "browser_click",
    "browser_navigate_back",
    "browser_close",
];

#[derive(Default)]
struct FakeBrowser {
    script: Mutex<VecDeque<ToolCallResult>>,
    calls: Mutex<Vec<String>>,
    connects: AtomicUsize,
    /// 该工具的调用永不返回
    stall: Option<&'static str>,
}

impl FakeBrowser {
    fn scripted(results: Vec<ToolCallResult>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            ..Self::default()
        })
    }

    fn calls_to(&self, tool: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.as_str() == tool).count()
    }
}

struct FakeClient(Arc<FakeBrowser>);

#[async_trait]
impl McpClient for FakeClient {
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        Ok(REMOTE_TOOLS
            .iter()
            .map(|name| McpToolDefinition {
                name: name.to_string(),
                description: format!("{} (fake)", name),
                input_schema: json!({"type": "object", "properties": {}}),
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, _arguments: Value) -> Result<ToolCallResult, McpError> {
        self.0.calls.lock().unwrap().push(name.to_string());
        if self.0.stall == Some(name) {
            std::future::pending::<()>().await;
        }
        let next = self.0.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| ToolCallResult::text("ok")))
    }

    async fn health_check(&self) -> Result<(), McpError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), McpError> {
        Ok(())
    }
}

struct FakeConnector(Arc<FakeBrowser>);

#[async_trait]
impl McpConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn McpClient>, McpError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeClient(self.0.clone())))
    }
}

fn runtime(
    dir: &Path,
    llm: Arc<ScriptedLlmClient>,
    browser: Arc<FakeBrowser>,
    tune: impl FnOnce(&mut AppConfig),
) -> AgentRuntime {
    let mut config = AppConfig::default();
    config.app.workspace_root = dir.to_path_buf();
    config.app.system_prompt_path = None;
    tune(&mut config);

    let connection = AutomationConnection::new(Arc::new(FakeConnector(browser)), &config.automation);
    let artifacts = SafeFs::new(config.app.artifacts_root(), config.tools.max_artifact_bytes);
    let gateway = ToolGateway::new(connection, &config.tools, dir, artifacts);
    AgentRuntime::new(config, llm, Arc::new(gateway))
}

#[tokio::test]
async fn test_successful_run_reports_written_tests() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        Ok(tool_call_completion(&[(
            "c1",
            "browser_navigate",
            json!({"url": "https://example.com"}),
        )])),
        Ok(tool_call_completion(&[(
            "c2",
            "write_test_file",
            json!({"path": "home.spec.ts", "content": "test('home', async () => {});"}),
        )])),
        Ok(text_completion(
            r#"{"summary": "Verified the home page", "testFiles": ["home.spec.ts"], "issues": []}"#,
        )),
    ]));
    let browser = FakeBrowser::scripted(vec![]);
    let runtime = runtime(dir.path(), llm.clone(), browser.clone(), |_| {});

    let result = runtime
        .run("Explore https://example.com", None, CancellationToken::new())
        .await;

    assert!(result.success, "{:?}", result);
    assert_eq!(result.message.as_deref(), Some("Verified the home page"));
    assert_eq!(result.test_files, Some(vec!["home.spec.ts".to_string()]));
    assert!(dir.path().join("tests/generated/home.spec.ts").exists());
    assert_eq!(llm.call_count(), 3);
    assert_eq!(browser.calls_to("browser_navigate"), 1);
    assert_eq!(browser.calls_to("browser_close"), 1);
    assert_eq!(runtime.scheduler().stats().used, 100 + 100 + 60);
}

#[tokio::test]
async fn test_max_iterations_closes_session() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(
        ScriptedLlmClient::new(vec![]).with_fallback(Ok(tool_call_completion(&[(
            "snap",
            "browser_snapshot",
            json!({}),
        )]))),
    );
    let browser = FakeBrowser::scripted(vec![]);
    let runtime = runtime(dir.path(), llm.clone(), browser.clone(), |c| c.agent.max_iterations = 2);

    let result = runtime.run("Explore forever", None, CancellationToken::new()).await;

    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::MaxIterations));
    assert_eq!(llm.call_count(), 2);
    assert_eq!(browser.calls_to("browser_snapshot"), 2);
    assert_eq!(browser.calls_to("browser_close"), 1);
}

#[tokio::test]
async fn test_embedded_error_is_reported_to_model() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(tool_call_completion(&[(
        "c1",
        "browser_click",
        json!({"element": "Sign in", "ref": "e12"}),
    )]))]));
    let browser = FakeBrowser::scripted(vec![ToolCallResult::text(
        "### Error\nElement not found: ref e12",
    )]);
    let runtime = runtime(dir.path(), llm.clone(), browser, |_| {});

    let result = runtime.run("Log in", None, CancellationToken::new()).await;
    assert!(result.success);

    let second_call = &llm.recorded_calls()[1];
    let observation = second_call
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("c1"))
        .expect("tool result for c1");
    assert!(observation.content.starts_with("Error executing browser_click"));
    assert!(observation.content.contains("Element not found"));
}

#[tokio::test]
async fn test_repeated_back_navigation_is_blocked() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(tool_call_completion(&[
        ("b1", "browser_navigate_back", json!({})),
        ("b2", "browser_navigate_back", json!({})),
        ("b3", "browser_navigate_back", json!({})),
    ]))]));
    let browser = FakeBrowser::scripted(vec![]);
    let runtime = runtime(dir.path(), llm.clone(), browser.clone(), |_| {});

    let result = runtime.run("Go back a lot", None, CancellationToken::new()).await;
    assert!(result.success);
    assert_eq!(browser.calls_to("browser_navigate_back"), 2);

    let second_call = &llm.recorded_calls()[1];
    let blocked = second_call
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("b3"))
        .expect("tool result for b3");
    assert!(blocked.content.contains("back navigations"));
}

#[tokio::test]
async fn test_modal_hint_after_repeated_interaction_failures() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(tool_call_completion(&[
        ("k1", "browser_click", json!({"ref": "e1"})),
        ("k2", "browser_click", json!({"ref": "e2"})),
        ("k3", "browser_click", json!({"ref": "e3"})),
    ]))]));
    let browser = FakeBrowser::scripted(vec![
        ToolCallResult::error("element intercepts pointer events"),
        ToolCallResult::error("element intercepts pointer events"),
        ToolCallResult::error("element intercepts pointer events"),
    ]);
    let runtime = runtime(dir.path(), llm.clone(), browser, |_| {});

    let result = runtime.run("Click things", None, CancellationToken::new()).await;
    assert!(result.success);

    let second_call = &llm.recorded_calls()[1];
    let last = second_call.last().unwrap();
    assert_eq!(last.role, Role::User);
    assert_eq!(last.content, MODAL_HINT);
    // 提示位于三条工具结果之后
    let len = second_call.len();
    assert!(second_call[len - 4..len - 1].iter().all(|m| m.role == Role::Tool));
}

#[tokio::test]
async fn test_auth_failure_is_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![Err(LlmError::Authentication(
        "Incorrect API key".into(),
    ))]));
    let browser = FakeBrowser::scripted(vec![]);
    let runtime = runtime(dir.path(), llm.clone(), browser.clone(), |_| {});

    let result = runtime.run("Explore", None, CancellationToken::new()).await;

    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::ProviderAuthFailed));
    assert_eq!(llm.call_count(), 1);
    assert_eq!(browser.calls_to("browser_close"), 1);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![]));
    let runtime = runtime(dir.path(), llm.clone(), FakeBrowser::scripted(vec![]), |_| {});

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = runtime.run("Explore", None, cancel).await;

    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::Cancelled));
    assert_eq!(llm.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_llm_error_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        Err(LlmError::Server {
            status: 503,
            message: "overloaded".into(),
        }),
        Ok(text_completion("all good")),
    ]));
    let runtime = runtime(dir.path(), llm.clone(), FakeBrowser::scripted(vec![]), |c| {
        c.agent.max_iterations = 1;
    });

    let result = runtime.run("Explore", None, CancellationToken::new()).await;

    // 重试不消耗轮数预算
    assert!(result.success, "{:?}", result);
    assert_eq!(result.message.as_deref(), Some("all good"));
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_llm_errors_abort_run() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![]).with_fallback(Err(LlmError::Server {
        status: 502,
        message: "bad gateway".into(),
    })));
    let runtime = runtime(dir.path(), llm.clone(), FakeBrowser::scripted(vec![]), |c| {
        c.agent.max_consecutive_errors = 2;
    });

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let result = runtime.run("Explore", Some(tx), CancellationToken::new()).await;

    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::ProviderApiError));
    assert!(result.error.unwrap().contains("3 consecutive LLM errors"));
    assert_eq!(llm.call_count(), 3);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(events.iter().any(|e| e.message.starts_with("Starting run")));
    assert!(events.iter().any(|e| e.message.contains("retrying")));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_slow_remote_tool() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(tool_call_completion(&[(
        "s1",
        "browser_snapshot",
        json!({}),
    )]))]));
    let browser = Arc::new(FakeBrowser {
        stall: Some("browser_snapshot"),
        ..FakeBrowser::default()
    });
    let runtime = runtime(dir.path(), llm.clone(), browser.clone(), |_| {});

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let result = runtime.run("Explore", None, cancel).await;

    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::Cancelled));
    assert_eq!(llm.call_count(), 1);
    assert_eq!(browser.calls_to("browser_snapshot"), 1);
    assert_eq!(browser.calls_to("browser_close"), 1);
    assert_eq!(runtime.scheduler().stats().used, 100);
    assert!(!runtime.scheduler().in_flight());
}

#[tokio::test]
async fn test_tool_failure_events_mask_secrets() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(tool_call_completion(&[(
        "f1",
        "browser_click",
        json!({"element": "Submit", "ref": "e7"}),
    )]))]));
    let browser = FakeBrowser::scripted(vec![ToolCallResult::error(
        "### Error\nawait page.fill('hunter2') failed: element detached",
    )]);
    let runtime = runtime(dir.path(), llm.clone(), browser, |c| {
        c.tools.sensitive_values = vec!["hunter2".into()];
    });

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let result = runtime.run("Submit the form", Some(tx), CancellationToken::new()).await;
    assert!(result.success, "{:?}", result);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let failure = events
        .iter()
        .find(|e| e.message.starts_with("browser_click failed"))
        .expect("tool failure event");
    assert!(failure.message.contains("page.fill('***')"));
    assert!(events.iter().all(|e| !e.message.contains("hunter2")));

    let observation = llm.recorded_calls()[1]
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("f1"))
        .cloned()
        .expect("tool result for f1");
    assert!(!observation.content.contains("hunter2"));
}
