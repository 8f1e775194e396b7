//! 认知层：Planner、恢复策略、观察压缩、过程事件、控制循环

pub mod events;
pub mod loop_;
pub mod observation;
pub mod planner;
pub mod policies;

use serde::Deserialize;

pub use events::{EventEmitter, EventSender, LogEvent, LogKind};
pub use loop_::{run_agent_loop, AgentSession, RunResult};
pub use observation::{summarize_observation, truncate_chars};
pub use planner::{parse_final_report, FinalReport, Planner};
pub use policies::{is_back_navigation, is_interaction, BackNavigationGuard, GuardDecision, ModalHintPolicy, MODAL_HINT};

/// [agent] 段：控制循环参数
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub max_history_messages: usize,
    pub max_consecutive_errors: usize,
    pub error_backoff_ms: u64,
    /// 单个工具结果写回对话前的字符上限
    pub tool_result_max_chars: usize,
    /// 允许的连续后退次数（0 关闭守卫）
    pub back_navigation_limit: usize,
    /// 交互连续失败多少次后提示模态框（0 关闭）
    pub modal_hint_threshold: usize,
    /// LLM 调用在共享调度器中的优先级
    pub llm_priority: i32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_history_messages: 40,
            max_consecutive_errors: 3,
            error_backoff_ms: 2_000,
            tool_result_max_chars: 4_000,
            back_navigation_limit: 2,
            modal_hint_threshold: 3,
            llm_priority: 0,
        }
    }
}
