//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本依次返回预设结果；脚本耗尽后返回 fallback（未设置时返回纯文本「done」）。
//! 每次调用的消息快照都会被记录，便于断言历史裁剪与提示注入。

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::llm::{Completion, CompletionRequest, LlmClient, LlmError, Usage};
use crate::memory::{Message, ToolCall};

/// 纯文本回复
pub fn text_completion(content: impl Into<String>) -> Completion {
    Completion {
        message: Message::assistant(content),
        finish_reason: Some("stop".into()),
        usage: Some(Usage {
            prompt_tokens: 50,
            completion_tokens: 10,
            total_tokens: 60,
        }),
    }
}

/// 只含工具调用的回复；calls 为 (id, name, arguments JSON)
pub fn tool_call_completion(calls: &[(&str, &str, serde_json::Value)]) -> Completion {
    let tool_calls = calls
        .iter()
        .map(|(id, name, args)| ToolCall::new(*id, *name, args.to_string()))
        .collect();
    Completion {
        message: Message::assistant_with_tools("", tool_calls),
        finish_reason: Some("tool_calls".into()),
        usage: Some(Usage {
            prompt_tokens: 80,
            completion_tokens: 20,
            total_tokens: 100,
        }),
    }
}

/// 脚本化客户端
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<Completion, LlmError>>>,
    fallback: Option<Result<Completion, LlmError>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(script: impl IntoIterator<Item = Result<Completion, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// 脚本耗尽后重复返回该结果
    pub fn with_fallback(mut self, fallback: Result<Completion, LlmError>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// 已发生的调用次数
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// 每次调用时发送的消息快照
    pub fn recorded_calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, LlmError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.messages.to_vec());
        let next = self.script.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        match next {
            Some(result) => result,
            None => self
                .fallback
                .clone()
                .unwrap_or_else(|| Ok(text_completion("done"))),
        }
    }
}
