//! 限流层：token 估算、滑动窗口预算跟踪、单飞请求调度
//!
//! TokenBudgetTracker 与 RequestScheduler 是进程内唯一的共享可变状态，以 Arc 注入到每次运行。

pub mod estimate;
pub mod scheduler;
pub mod tracker;

use serde::Deserialize;

pub use estimate::TokenEstimator;
pub use scheduler::{RequestScheduler, UsageReport};
pub use tracker::{BudgetError, BudgetStats, Reservation, TokenBudgetTracker, TokenUsageRecord, TrackerLimits};

/// [rate_limit] 段：进程启动时读取，可在运行间热更新
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub tokens_per_minute: u64,
    pub requests_per_minute: Option<u64>,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// 单次 reserve 的总等待上限，超过后放行
    pub max_wait_secs: u64,
    /// 每次休眠的上限，保证取消及时生效
    pub wait_slice_secs: u64,
    pub safety_margin_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_minute: 30_000,
            requests_per_minute: None,
            max_retries: 5,
            initial_retry_delay_ms: 1_000,
            max_retry_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            max_wait_secs: 120,
            wait_slice_secs: 10,
            safety_margin_ms: 500,
        }
    }
}
