//! LLM 请求调度器（进程级共享）
//!
//! 单飞模型：同一时刻只有一个带预留的调用在执行（含其重试退避），其余调用进入优先级队列，
//! 按优先级降序、同优先级按到达顺序依次放行。每次尝试先向 TokenBudgetTracker 预留估算值，
//! 成功后用 provider 返回的真实用量对账；遇到限流按 provider 建议或指数退避重试，其它错误立即返回。

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BudgetStats, RateLimitConfig, TokenBudgetTracker, TrackerLimits};
use crate::llm::LlmError;

/// 调用结果中 provider 报告的真实 token 用量
pub trait UsageReport {
    fn total_tokens(&self) -> Option<u64>;
}

/// 排队中的调用：被唤醒即获得执行权
struct QueuedCall {
    priority: i32,
    seq: u64,
    wake: oneshot::Sender<()>,
}

impl PartialEq for QueuedCall {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedCall {}

impl PartialOrd for QueuedCall {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedCall {
    /// 大顶堆：优先级高者先出；同优先级 seq 小（先到）者先出
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    busy: bool,
    waiting: BinaryHeap<QueuedCall>,
    next_seq: u64,
}

/// 执行权：drop 时交给队首或置空闲
struct FlightGuard<'a> {
    scheduler: &'a RequestScheduler,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.release();
    }
}

/// 排队凭据：等待中被丢弃（取消）时，若执行权已经交到手上则立即转交
struct Ticket<'a> {
    scheduler: &'a RequestScheduler,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.scheduler.release();
            }
        }
    }
}

/// 请求调度器
pub struct RequestScheduler {
    tracker: Arc<TokenBudgetTracker>,
    config: RwLock<RateLimitConfig>,
    queue: Mutex<QueueState>,
}

impl RequestScheduler {
    pub fn new(tracker: Arc<TokenBudgetTracker>, config: RateLimitConfig) -> Self {
        Self {
            tracker,
            config: RwLock::new(config),
            queue: Mutex::new(QueueState::default()),
        }
    }

    /// 由配置同时创建 tracker 与 scheduler
    pub fn from_config(config: RateLimitConfig) -> Self {
        let tracker = Arc::new(TokenBudgetTracker::from_config(&config));
        Self::new(tracker, config)
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// 更新限流配置：只影响之后的调度决策，不回溯
    pub fn update_config(&self, config: RateLimitConfig) {
        self.tracker.set_limits(TrackerLimits::from(&config));
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn tracker(&self) -> &Arc<TokenBudgetTracker> {
        &self.tracker
    }

    pub fn stats(&self) -> BudgetStats {
        self.tracker.stats()
    }

    /// 排队等待执行权的调用数
    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).waiting.len()
    }

    pub fn in_flight(&self) -> bool {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).busy
    }

    async fn acquire(&self, priority: i32) -> FlightGuard<'_> {
        let rx = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if !queue.busy {
                queue.busy = true;
                return FlightGuard { scheduler: self };
            }
            let (wake, rx) = oneshot::channel();
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.waiting.push(QueuedCall {
                priority,
                seq,
                wake,
            });
            debug!(priority, seq, queued = queue.waiting.len(), "llm call queued");
            rx
        };
        let mut ticket = Ticket {
            scheduler: self,
            rx: Some(rx),
        };
        if let Some(rx) = ticket.rx.as_mut() {
            // 发送端只随调度器一起销毁，这里只会等到唤醒
            let _ = rx.await;
        }
        ticket.rx = None;
        FlightGuard { scheduler: self }
    }

    fn release(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(next) = queue.waiting.pop() {
            if next.wake.send(()).is_ok() {
                return;
            }
        }
        queue.busy = false;
    }

    /// 串行执行一次 LLM 调用（含限流重试）。
    ///
    /// request 每次尝试调用一次；返回值需报告真实用量以便对账。
    pub async fn execute<T, F, Fut>(
        &self,
        estimated_tokens: u64,
        priority: i32,
        cancel: &CancellationToken,
        mut request: F,
    ) -> Result<T, LlmError>
    where
        T: UsageReport,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let _flight = tokio::select! {
            guard = self.acquire(priority) => guard,
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
        };

        let cfg = self.config();
        let mut delay = Duration::from_millis(cfg.initial_retry_delay_ms);
        let max_delay = Duration::from_millis(cfg.max_retry_delay_ms);
        let mut attempt: u32 = 0;

        loop {
            let reservation = self
                .tracker
                .reserve(estimated_tokens, cancel)
                .await
                .map_err(|_| LlmError::Cancelled)?;

            let result = tokio::select! {
                r = request() => r,
                _ = cancel.cancelled() => {
                    self.tracker.release(&reservation);
                    return Err(LlmError::Cancelled);
                }
            };

            match result {
                Ok(value) => {
                    if let Some(actual) = value.total_tokens() {
                        self.tracker.record_actual(&reservation, actual);
                    }
                    debug!(
                        estimated = estimated_tokens,
                        actual = ?value.total_tokens(),
                        attempt,
                        "llm call completed"
                    );
                    return Ok(value);
                }
                Err(LlmError::RateLimited {
                    message,
                    retry_after_ms,
                }) if attempt < cfg.max_retries => {
                    self.tracker.release(&reservation);
                    attempt += 1;
                    let wait = retry_after_ms.map(Duration::from_millis).unwrap_or(delay);
                    warn!(
                        attempt,
                        max_retries = cfg.max_retries,
                        wait_ms = wait.as_millis() as u64,
                        provider_hint = retry_after_ms.is_some(),
                        %message,
                        "provider throttled, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                    delay = delay.mul_f64(cfg.backoff_multiplier.max(1.0)).min(max_delay);
                }
                Err(e) => {
                    self.tracker.release(&reservation);
                    return Err(e);
                }
            }
        }
    }
}
