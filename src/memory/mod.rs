//! 记忆层：单次运行的对话历史与有界剪枝

pub mod conversation;

pub use conversation::{ConversationHistory, Message, Role, ToolCall};
