//! Planner：估算 token、经 RequestScheduler 串行调用 LLM；解析最终报告
//!
//! parse_final_report 从回复中提取 JSON（```json ... ``` 或首个 { 到末个 }），失败时退化为原文摘要。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::{Completion, CompletionRequest, LlmClient, ToolDefinition};
use crate::memory::Message;
use crate::rate_limit::{RequestScheduler, TokenEstimator};

/// 运行结束时 LLM 给出的结构化报告
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalReport {
    #[serde(default)]
    pub summary: String,
    #[serde(default, alias = "test_files")]
    pub test_files: Vec<String>,
    #[serde(default)]
    pub issues: Vec<String>,
}

fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        return Some(rest.find("```").map_or(rest, |end| &rest[..end]).trim());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// 解析最终回复；格式不对时原文作为 summary
pub fn parse_final_report(text: &str) -> FinalReport {
    let trimmed = text.trim();
    extract_json(trimmed)
        .and_then(|json| serde_json::from_str::<FinalReport>(json).ok())
        .filter(|report| !report.summary.is_empty() || !report.test_files.is_empty() || !report.issues.is_empty())
        .unwrap_or_else(|| FinalReport {
            summary: trimmed.to_string(),
            ..FinalReport::default()
        })
}

/// Planner：持有 LLM、共享调度器、模型名与调用优先级
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    scheduler: Arc<RequestScheduler>,
    model: String,
    priority: i32,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, scheduler: Arc<RequestScheduler>, model: impl Into<String>) -> Self {
        Self {
            llm,
            scheduler,
            model: model.into(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    pub fn scheduler(&self) -> &Arc<RequestScheduler> {
        &self.scheduler
    }

    pub async fn plan(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<Completion, AgentError> {
        let estimated = TokenEstimator::estimate_request(messages, tools);
        let request = CompletionRequest {
            model: &self.model,
            messages,
            tools,
        };
        tracing::debug!(model = %self.model, estimated, messages = messages.len(), "planning");
        self.scheduler
            .execute(estimated, self.priority, cancel, || self.llm.complete(request))
            .await
            .map_err(AgentError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorCode;
    use crate::llm::{text_completion, LlmError, ScriptedLlmClient};
    use crate::rate_limit::RateLimitConfig;

    #[test]
    fn test_parse_fenced_report() {
        let text = "Done.\n```json\n{\"summary\": \"Login flow covered\", \"testFiles\": [\"login.spec.ts\"], \"issues\": [\"slow page\"]}\n```";
        let report = parse_final_report(text);
        assert_eq!(report.summary, "Login flow covered");
        assert_eq!(report.test_files, vec!["login.spec.ts"]);
        assert_eq!(report.issues, vec!["slow page"]);
    }

    #[test]
    fn test_parse_bare_json_with_snake_case() {
        let report = parse_final_report("{\"summary\": \"ok\", \"test_files\": [\"a.spec.ts\"]}");
        assert_eq!(report.test_files, vec!["a.spec.ts"]);
    }

    #[test]
    fn test_malformed_report_falls_back_to_text() {
        let report = parse_final_report("I explored the site. {not json}");
        assert_eq!(report.summary, "I explored the site. {not json}");
        assert!(report.test_files.is_empty());
    }

    #[tokio::test]
    async fn test_plan_goes_through_scheduler() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(text_completion("hi"))]));
        let scheduler = Arc::new(RequestScheduler::from_config(RateLimitConfig::default()));
        let planner = Planner::new(llm.clone(), scheduler.clone(), "mock");

        let completion = planner
            .plan(&[Message::user("hello")], &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completion.message.content, "hi");
        // 对账后窗口内用量等于真实用量
        assert_eq!(scheduler.stats().used, 60);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_plan_maps_auth_error() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Err(LlmError::Authentication("bad key".into()))]));
        let scheduler = Arc::new(RequestScheduler::from_config(RateLimitConfig::default()));
        let planner = Planner::new(llm, scheduler, "mock");
        let err = planner
            .plan(&[Message::user("hello")], &[], &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorCode::ProviderAuthFailed);
        assert!(!err.recoverable);
    }
}
