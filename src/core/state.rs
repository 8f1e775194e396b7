//! 运行阶段状态机
//!
//! ITERATING → CALLING_LLM → DISPATCHING_TOOLS → ITERATING，终态为 Done / Failed / MaxIterations / Cancelled。

use serde::Serialize;

/// 单次运行的阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Iterating,
    CallingLlm,
    DispatchingTools,
    Done,
    Failed,
    MaxIterations,
    Cancelled,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunPhase::Done | RunPhase::Failed | RunPhase::MaxIterations | RunPhase::Cancelled
        )
    }

    /// 合法迁移：终态不可再迁移；非终态之间按主循环顺序流转，任何非终态都可进入终态
    pub fn can_transition_to(self, next: RunPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        matches!(
            (self, next),
            (RunPhase::Iterating, RunPhase::CallingLlm)
                | (RunPhase::CallingLlm, RunPhase::DispatchingTools)
                | (RunPhase::CallingLlm, RunPhase::Iterating)
                | (RunPhase::DispatchingTools, RunPhase::Iterating)
        )
    }
}

/// 阶段跟踪：记录迁移并在 debug 级别输出
#[derive(Debug)]
pub struct PhaseTracker {
    run_id: String,
    phase: RunPhase,
}

impl PhaseTracker {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            phase: RunPhase::Iterating,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn transition(&mut self, next: RunPhase) {
        if !self.phase.can_transition_to(next) {
            tracing::warn!(run_id = %self.run_id, from = ?self.phase, to = ?next, "unexpected phase transition");
        } else {
            tracing::debug!(run_id = %self.run_id, from = ?self.phase, to = ?next, "phase");
        }
        self.phase = next;
    }
}
