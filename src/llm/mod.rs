//! LLM 层：客户端抽象与实现（OpenAI 兼容 / 脚本化 Mock）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{text_completion, tool_call_completion, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage, DEFAULT_BASE_URL};
pub use traits::{
    retry_hint_from_message, Completion, CompletionRequest, LlmClient, LlmError, ToolDefinition, Usage,
};
