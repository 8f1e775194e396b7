//! 运行过程事件：流式推送给调用方（CLI / SSE），核心只写不读

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Info,
    Success,
    Warning,
    Error,
    /// LLM 的思考内容 / 工具调用意图
    Agent,
}

/// 单条过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub kind: LogKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<LogEvent>;

/// 可选事件通道；接收端关闭后发送静默失败
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    tx: Option<EventSender>,
}

impl EventEmitter {
    pub fn new(tx: EventSender) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, kind: LogKind, message: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(LogEvent::new(kind, message));
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogKind::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.emit(LogKind::Success, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(LogKind::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogKind::Error, message);
    }

    pub fn agent(&self, message: impl Into<String>) {
        self.emit(LogKind::Agent, message);
    }
}
