//! Token 预算跟踪（进程级共享）
//!
//! 以 60 秒滑动窗口记录 token 消耗。reserve 在容量足够时立即记账，否则按最旧记录的剩余寿命分片等待，
//! 每片不超过 wait_slice 以便及时响应取消；总等待超过 max_wait 时放行（可用性优先于严格守预算）。
//! 单次请求超过整个分钟额度时直接放行并告警，避免永远等不到。

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::RateLimitConfig;

/// 滑动窗口长度
pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BudgetError {
    #[error("cancelled while waiting for token budget")]
    Cancelled,
}

/// 一次已记账的用量（预留或对账后）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsageRecord {
    pub id: u64,
    pub tokens: u64,
    pub observed_at: Instant,
    /// 是否计入每分钟请求数（对账补记的差值不计）
    pub counts_request: bool,
}

/// 预留凭据：对账时用 id 找回原记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    id: Option<u64>,
    tokens: u64,
    /// 是否经由「超额放行」路径获得
    forced: bool,
}

impl Reservation {
    pub fn empty() -> Self {
        Self {
            id: None,
            tokens: 0,
            forced: false,
        }
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }
}

/// 预算快照
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetStats {
    pub used: u64,
    pub limit: u64,
    pub available: u64,
    pub percent_used: f64,
    pub requests_in_window: usize,
}

/// 影响调度决策的限额参数；更新后只作用于下一次决策
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerLimits {
    pub tokens_per_minute: u64,
    pub requests_per_minute: Option<u64>,
    pub max_wait: Duration,
    pub wait_slice: Duration,
    pub safety_margin: Duration,
}

impl From<&RateLimitConfig> for TrackerLimits {
    fn from(cfg: &RateLimitConfig) -> Self {
        Self {
            tokens_per_minute: cfg.tokens_per_minute,
            requests_per_minute: cfg.requests_per_minute,
            max_wait: Duration::from_secs(cfg.max_wait_secs),
            wait_slice: Duration::from_secs(cfg.wait_slice_secs.max(1)),
            safety_margin: Duration::from_millis(cfg.safety_margin_ms),
        }
    }
}

#[derive(Debug, Default)]
struct Window {
    records: VecDeque<TokenUsageRecord>,
    next_id: u64,
}

impl Window {
    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.records.front() {
            if now.saturating_duration_since(front.observed_at) >= WINDOW {
                self.records.pop_front();
            } else {
                break;
            }
        }
    }

    fn used(&self) -> u64 {
        self.records.iter().map(|r| r.tokens).sum()
    }

    fn requests(&self) -> usize {
        self.records.iter().filter(|r| r.counts_request).count()
    }

    fn push(&mut self, tokens: u64, now: Instant, forced: bool) -> Reservation {
        let id = self.append(tokens, now, true);
        Reservation {
            id: Some(id),
            tokens,
            forced,
        }
    }

    fn append(&mut self, tokens: u64, now: Instant, counts_request: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.records.push_back(TokenUsageRecord {
            id,
            tokens,
            observed_at: now,
            counts_request,
        });
        id
    }
}

/// 进程级 token 预算跟踪器；所有运行共享同一实例（Arc 注入）
#[derive(Debug)]
pub struct TokenBudgetTracker {
    window: Mutex<Window>,
    limits: RwLock<TrackerLimits>,
}

impl TokenBudgetTracker {
    pub fn new(limits: TrackerLimits) -> Self {
        Self {
            window: Mutex::new(Window::default()),
            limits: RwLock::new(limits),
        }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self::new(TrackerLimits::from(cfg))
    }

    pub fn limits(&self) -> TrackerLimits {
        *self.limits.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_limits(&self, limits: TrackerLimits) {
        *self.limits.write().unwrap_or_else(PoisonError::into_inner) = limits;
    }

    /// 等待容量并原子地记账；tokens 为 0 时不记账
    pub async fn reserve(
        &self,
        tokens: u64,
        cancel: &CancellationToken,
    ) -> Result<Reservation, BudgetError> {
        if tokens == 0 {
            return Ok(Reservation::empty());
        }
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(BudgetError::Cancelled);
            }
            let limits = self.limits();
            let wait = {
                let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
                let now = Instant::now();
                window.evict(now);

                if tokens > limits.tokens_per_minute {
                    warn!(
                        requested = tokens,
                        limit = limits.tokens_per_minute,
                        "request exceeds the whole per-minute budget, reserving anyway"
                    );
                    return Ok(window.push(tokens, now, true));
                }

                let used = window.used();
                let requests_ok = limits
                    .requests_per_minute
                    .map_or(true, |rpm| (window.requests() as u64) < rpm);
                if used + tokens <= limits.tokens_per_minute && requests_ok {
                    return Ok(window.push(tokens, now, false));
                }

                let waited = now.saturating_duration_since(started);
                if waited >= limits.max_wait {
                    warn!(
                        requested = tokens,
                        used,
                        limit = limits.tokens_per_minute,
                        waited_secs = waited.as_secs(),
                        "token budget wait ceiling reached, proceeding over budget"
                    );
                    return Ok(window.push(tokens, now, true));
                }

                let until_free = window
                    .records
                    .front()
                    .map(|oldest| {
                        WINDOW.saturating_sub(now.saturating_duration_since(oldest.observed_at))
                    })
                    .unwrap_or_default()
                    + limits.safety_margin;
                debug!(
                    requested = tokens,
                    used,
                    limit = limits.tokens_per_minute,
                    wait_ms = until_free.as_millis() as u64,
                    "waiting for token budget"
                );
                until_free
                    .min(limits.wait_slice)
                    .min(limits.max_wait - waited)
                    .max(Duration::from_millis(1))
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(BudgetError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// 对账：把预留记录修正为真实用量（差值 = actual - reserved）。
    /// 记录保留原时间戳；若原记录已过期且真实用量更大，则把差值作为新记录补记。
    pub fn record_actual(&self, reservation: &Reservation, actual: u64) {
        if actual == reservation.tokens {
            return;
        }
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        window.evict(now);
        let existing = reservation
            .id
            .and_then(|id| window.records.iter_mut().find(|r| r.id == id));
        match existing {
            Some(record) => {
                debug!(reserved = reservation.tokens, actual, "token reservation reconciled");
                record.tokens = actual;
            }
            None if actual > reservation.tokens => {
                window.append(actual - reservation.tokens, now, false);
            }
            None => {}
        }
    }

    /// 请求未到达 provider（失败 / 取消）时撤销预留的 token；请求计数保留
    pub fn release(&self, reservation: &Reservation) {
        self.record_actual(reservation, 0);
    }

    pub fn current_usage(&self) -> u64 {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.evict(Instant::now());
        window.used()
    }

    pub fn stats(&self) -> BudgetStats {
        let limit = self.limits().tokens_per_minute;
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.evict(Instant::now());
        let used = window.used();
        BudgetStats {
            used,
            limit,
            available: limit.saturating_sub(used),
            percent_used: if limit == 0 {
                100.0
            } else {
                used as f64 * 100.0 / limit as f64
            },
            requests_in_window: window.requests(),
        }
    }
}
