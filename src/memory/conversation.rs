//! 对话历史
//!
//! 单次运行独占的消息序列。前两条（系统指令 + 初始任务）为锚点，永不剪枝；
//! 超过上限时只保留锚点与最近的消息，中间部分整体丢弃（不做摘要）。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// LLM 发出的一次工具调用请求；arguments 保留原始 JSON 文本，由调用方解析
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// 解析参数；空串视为空对象
    pub fn parse_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        let raw = self.arguments.trim();
        if raw.is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        serde_json::from_str(raw)
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// 仅 assistant 消息：本轮请求的工具调用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// 仅 tool 消息：对应的调用 id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// 锚点消息数（系统指令 + 初始任务）
const ANCHORS: usize = 2;

/// 有界对话历史
#[derive(Clone, Debug)]
pub struct ConversationHistory {
    messages: Vec<Message>,
    max_messages: usize,
}

impl ConversationHistory {
    /// max_messages 至少为锚点数 + 1
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_messages: max_messages.max(ANCHORS + 1),
        }
    }

    /// 以系统指令与初始任务作为锚点开始一段历史
    pub fn with_anchors(max_messages: usize, system: impl Into<String>, task: impl Into<String>) -> Self {
        let mut history = Self::new(max_messages);
        history.append(Message::system(system));
        history.append(Message::user(task));
        history
    }

    pub fn append(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// 超过上限时保留锚点 + 最近 (max - 2) 条，返回被丢弃的消息数。
    ///
    /// 尾部若从某个 assistant 请求的中途开始，保留该 assistant（只留下仍有结果的调用）顶替尾部第一条；
    /// 无法顶替时丢弃失去请求的 tool 消息。
    pub fn prune(&mut self) -> usize {
        if self.messages.len() <= self.max_messages {
            return 0;
        }
        let before = self.messages.len();
        let keep_tail = self.max_messages - ANCHORS;
        let mut tail_start = self.messages.len() - keep_tail;

        if self.messages[tail_start].role == Role::Tool {
            if let Some(owner) = self.trimmed_owner(tail_start) {
                let rest = self.messages.split_off(tail_start + 1);
                self.messages.truncate(ANCHORS);
                self.messages.push(owner);
                self.messages.extend(rest);
                let dropped = before - self.messages.len();
                tracing::debug!(dropped, kept = self.messages.len(), "history pruned, partial tool turn kept");
                return dropped;
            }
        }

        while tail_start < self.messages.len() && self.messages[tail_start].role == Role::Tool {
            tail_start += 1;
        }
        self.messages.drain(ANCHORS..tail_start);
        let dropped = before - self.messages.len();
        tracing::debug!(dropped, kept = self.messages.len(), "history pruned");
        dropped
    }

    /// tail_start 处的 tool 消息所属的 assistant 请求，只保留 tail_start 之后仍有结果的调用
    fn trimmed_owner(&self, tail_start: usize) -> Option<Message> {
        let owner = (ANCHORS..tail_start)
            .rev()
            .find(|&i| self.messages[i].role != Role::Tool)?;
        let request = &self.messages[owner];
        if request.role != Role::Assistant || request.tool_calls.is_empty() {
            return None;
        }
        let kept: Vec<&str> = self.messages[tail_start + 1..]
            .iter()
            .take_while(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        let mut trimmed = request.clone();
        trimmed.tool_calls.retain(|c| kept.contains(&c.id.as_str()));
        (!trimmed.tool_calls.is_empty()).then_some(trimmed)
    }
}
