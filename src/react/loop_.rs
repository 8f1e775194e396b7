//! Agent 控制循环
//!
//! 估算 -> 经调度器调用 LLM -> 无工具调用则结束并解析报告；有工具调用则逐个经网关执行，
//! 观察结果压缩后写回对话 -> 裁剪历史 -> 下一轮。
//! 终态：完成 / 失败 / 达到最大轮数 / 取消；每种终态都会尽力关闭远程会话。

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{AgentError, ErrorCode, PhaseTracker, RecoveryAction, RecoveryEngine, RunPhase};
use crate::memory::{ConversationHistory, Message};
use crate::react::{
    parse_final_report, summarize_observation, AgentConfig, BackNavigationGuard, EventEmitter, FinalReport,
    GuardDecision, ModalHintPolicy, Planner,
};
use crate::tools::ToolGateway;

/// 单次运行的对外结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl RunResult {
    pub fn completed(message: impl Into<String>, test_files: Vec<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            test_files: Some(test_files),
            error: None,
            error_code: None,
        }
    }

    pub fn failed(err: &AgentError) -> Self {
        Self {
            success: false,
            message: None,
            test_files: None,
            error: Some(err.message.clone()),
            error_code: Some(err.code),
        }
    }
}

/// 控制循环依赖（Planner / 网关 / 恢复引擎 / 配置 / 事件 / 取消）
pub struct AgentSession<'a> {
    pub planner: &'a Planner,
    pub gateway: &'a ToolGateway,
    pub recovery: &'a RecoveryEngine,
    pub config: &'a AgentConfig,
    pub system_prompt: &'a str,
    pub cancel_token: CancellationToken,
    pub events: EventEmitter,
    pub run_id: String,
}

impl<'a> AgentSession<'a> {
    pub fn new(
        planner: &'a Planner,
        gateway: &'a ToolGateway,
        recovery: &'a RecoveryEngine,
        config: &'a AgentConfig,
        system_prompt: &'a str,
    ) -> Self {
        Self {
            planner,
            gateway,
            recovery,
            config,
            system_prompt,
            cancel_token: CancellationToken::new(),
            events: EventEmitter::none(),
            run_id: "run".to_string(),
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }
}

enum Outcome {
    Done(FinalReport),
    Failed(AgentError),
    MaxIterations,
    Cancelled,
}

const EVENT_PREVIEW_CHARS: usize = 200;

fn preview(text: &str) -> String {
    let mut s: String = text.chars().take(EVENT_PREVIEW_CHARS).collect();
    if text.chars().count() > EVENT_PREVIEW_CHARS {
        s.push_str("...");
    }
    s
}

/// 可被取消的退避；返回 false 表示期间被取消
async fn backoff(cancel: &CancellationToken, wait: std::time::Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(wait) => true,
        _ = cancel.cancelled() => false,
    }
}

/// 执行一次完整运行，始终返回结构化结果
pub async fn run_agent_loop(session: &AgentSession<'_>, task: &str) -> RunResult {
    let cfg = session.config;
    let events = &session.events;
    let mut phase = PhaseTracker::new(session.run_id.clone());

    info!(run_id = %session.run_id, model = %session.planner.model(), max_iterations = cfg.max_iterations, "agent run started");
    events.info(format!("Starting run {}", session.run_id));

    let outcome = run_iterations(session, task, &mut phase).await;

    let result = match outcome {
        Outcome::Done(report) => {
            phase.transition(RunPhase::Done);
            let test_files = match session.gateway.artifacts() {
                Ok(files) if !files.is_empty() => files,
                Ok(_) => report.test_files.clone(),
                Err(e) => {
                    warn!(error = %e, "failed to list test artifacts");
                    report.test_files.clone()
                }
            };
            events.success(format!("Run completed: {}", preview(&report.summary)));
            for issue in &report.issues {
                events.warning(format!("Issue: {}", issue));
            }
            RunResult::completed(report.summary, test_files)
        }
        Outcome::MaxIterations => {
            phase.transition(RunPhase::MaxIterations);
            let err = AgentError::max_iterations(cfg.max_iterations);
            events.error(err.message.clone());
            RunResult::failed(&err)
        }
        Outcome::Cancelled => {
            phase.transition(RunPhase::Cancelled);
            let err = AgentError::cancelled();
            events.warning(err.message.clone());
            RunResult::failed(&err)
        }
        Outcome::Failed(err) => {
            phase.transition(RunPhase::Failed);
            events.error(format!("Run failed: {}", err));
            RunResult::failed(&err)
        }
    };

    session.gateway.close_session().await;
    let (prompt, completion, total) = session.planner.token_usage();
    info!(
        run_id = %session.run_id,
        success = result.success,
        error_code = ?result.error_code,
        prompt_tokens = prompt,
        completion_tokens = completion,
        total_tokens = total,
        "agent run finished"
    );
    result
}

async fn run_iterations(session: &AgentSession<'_>, task: &str, phase: &mut PhaseTracker) -> Outcome {
    let cfg = session.config;
    let events = &session.events;
    let cancel = &session.cancel_token;

    let init = tokio::select! {
        r = session.gateway.initialize() => r,
        _ = cancel.cancelled() => return Outcome::Cancelled,
    };
    if let Err(e) = init {
        return Outcome::Failed(e);
    }
    let tools = session.gateway.definitions();
    events.info(format!("{} tools available", tools.len()));

    let mut history = ConversationHistory::with_anchors(cfg.max_history_messages, session.system_prompt, task);
    let mut back_guard = BackNavigationGuard::new(cfg.back_navigation_limit);
    let mut modal_policy = ModalHintPolicy::new(cfg.modal_hint_threshold);
    let mut consecutive_errors = 0usize;
    let mut iteration = 0usize;

    'run: loop {
        if cancel.is_cancelled() {
            break 'run Outcome::Cancelled;
        }
        if iteration >= cfg.max_iterations {
            break 'run Outcome::MaxIterations;
        }
        iteration += 1;
        phase.transition(RunPhase::CallingLlm);
        events.info(format!("Iteration {}/{}", iteration, cfg.max_iterations));

        let completion = match session.planner.plan(history.messages(), &tools, cancel).await {
            Ok(completion) => {
                consecutive_errors = 0;
                completion
            }
            Err(e) if e.code == ErrorCode::Cancelled => break 'run Outcome::Cancelled,
            Err(e) => {
                consecutive_errors += 1;
                match session.recovery.on_llm_error(&e, consecutive_errors) {
                    RecoveryAction::RetryAfter(wait) => {
                        warn!(error = %e, consecutive_errors, wait_ms = wait.as_millis() as u64, "llm call failed, retrying");
                        events.warning(format!(
                            "LLM call failed ({}), retrying in {}ms",
                            e,
                            wait.as_millis()
                        ));
                        // 重试不消耗轮数预算，由连续错误上限兜底
                        iteration -= 1;
                        phase.transition(RunPhase::Iterating);
                        if !backoff(cancel, wait).await {
                            break 'run Outcome::Cancelled;
                        }
                        continue 'run;
                    }
                    _ if e.recoverable => {
                        let message = format!("{} consecutive LLM errors, giving up: {}", consecutive_errors, e.message);
                        break 'run Outcome::Failed(AgentError { message, ..e }.with_recoverable(false));
                    }
                    _ => break 'run Outcome::Failed(e),
                }
            }
        };

        let content = completion.message.content.clone();
        let tool_calls = completion.message.tool_calls.clone();
        if !content.trim().is_empty() {
            events.agent(preview(&content));
        }
        history.append(completion.message);
        history.prune();

        if tool_calls.is_empty() {
            break 'run Outcome::Done(parse_final_report(&content));
        }

        phase.transition(RunPhase::DispatchingTools);
        let mut hints = Vec::new();
        for call in &tool_calls {
            if cancel.is_cancelled() {
                break 'run Outcome::Cancelled;
            }
            events.agent(format!("Calling {}", call.name));

            if let GuardDecision::Block(reason) = back_guard.check(&call.name) {
                warn!(tool = %call.name, "back navigation blocked");
                events.warning(reason.clone());
                history.append(Message::tool(&call.id, reason));
                continue;
            }

            let result = match call.parse_arguments() {
                Ok(args) => session.gateway.execute(&call.name, args, cancel).await,
                Err(e) => Err(AgentError::invalid_input(format!(
                    "Arguments for {} are not valid JSON: {}",
                    call.name, e
                ))),
            };

            if let Some(hint) = modal_policy.record(&call.name, result.is_ok()) {
                events.warning("Repeated interaction failures, hinting at a blocking dialog");
                hints.push(hint);
            }

            match result {
                Ok(output) => {
                    debug!(tool = %call.name, chars = output.len(), "tool succeeded");
                    events.success(format!("{} succeeded", call.name));
                    let observation = summarize_observation(&call.name, &output, cfg.tool_result_max_chars);
                    history.append(Message::tool(&call.id, observation));
                }
                Err(e) if e.code == ErrorCode::Cancelled => break 'run Outcome::Cancelled,
                Err(e) => match session.recovery.on_tool_error(&call.name, &e) {
                    RecoveryAction::ReportToModel(report) => {
                        events.error(format!("{} failed: {}", call.name, e.message));
                        history.append(Message::tool(&call.id, report));
                    }
                    _ => break 'run Outcome::Failed(e),
                },
            }
        }

        // 提示放在本轮所有工具结果之后，避免插在 assistant 与其 tool 结果之间
        for hint in hints {
            history.append(Message::user(hint));
        }
        history.prune();
        phase.transition(RunPhase::Iterating);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_result_serialization() {
        let ok = RunResult::completed("done", vec!["a.spec.ts".into()]);
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["testFiles"][0], "a.spec.ts");
        assert!(json.get("errorCode").is_none());

        let failed = RunResult::failed(&AgentError::max_iterations(5));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["errorCode"], "MAX_ITERATIONS");
        assert!(json["error"].as_str().unwrap().contains('5'));
    }
}
