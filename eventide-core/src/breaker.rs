//! 熔断器（Circuit Breaker）
//!
//! 按依赖名隔离的三态状态机，保护出站调用：
//! - CLOSED：放行调用，滚动窗口内连续失败越过阈值则跳闸进入 OPEN；
//! - OPEN：快速失败不触达依赖，冷却时长随连续跳闸指数递增并封顶；
//! - HALF_OPEN：放行有限试探调用，任一失败立即回到 OPEN，
//!   足量连续成功后闭合并清零计数。
//!
//! 状态为进程内单副本持有，副本之间互不共享统计，避免一个副本的失败
//! 影响健康副本的通断判断。计入统计的错误由可配置谓词决定（默认仅瞬时类）。
//!
use crate::error::{CoreError, CoreResult};
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// 熔断配置
#[derive(Builder, Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// 跳闸所需的窗口内连续失败次数
    #[builder(default = 5)]
    failure_threshold: u32,
    /// 连续失败的滚动窗口；窗口滑过后计数重新开始
    #[builder(default = Duration::from_secs(60))]
    failure_window: Duration,
    /// 首次跳闸后的冷却时长
    #[builder(default = Duration::from_secs(30))]
    open_timeout: Duration,
    /// 冷却时长的指数递增上限
    #[builder(default = Duration::from_secs(300))]
    open_timeout_cap: Duration,
    /// HALF_OPEN 下允许的并发试探调用数
    #[builder(default = 2)]
    half_open_trials: u32,
    /// 闭合所需的连续试探成功次数
    #[builder(default = 2)]
    half_open_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// 判定一次错误是否计入熔断统计的谓词
pub type FailurePredicate = Arc<dyn Fn(&CoreError) -> bool + Send + Sync>;

/// 对外可观测的熔断器快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    name: String,
    state: CircuitState,
    consecutive_failures: u32,
    trip_count: u32,
    /// 处于 OPEN 时已冷却的毫秒数
    open_for_ms: Option<u64>,
}

impl BreakerSnapshot {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn trip_count(&self) -> u32 {
        self.trip_count
    }

    pub fn open_for_ms(&self) -> Option<u64> {
        self.open_for_ms
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    window_started_at: Option<Instant>,
    opened_at: Option<Instant>,
    trip_count: u32,
    trials_in_flight: u32,
    trial_successes: u32,
}

/// 按依赖名实例化的熔断器；不同依赖互不影响
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    counts_failure: FailurePredicate,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_predicate(name, config, Arc::new(|err: &CoreError| err.is_transient()))
    }

    /// 自定义计入统计的错误谓词（例如仅超时）
    pub fn with_predicate(
        name: impl Into<String>,
        config: BreakerConfig,
        counts_failure: FailurePredicate,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            counts_failure,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                window_started_at: None,
                opened_at: None,
                trip_count: 0,
                trials_in_flight: 0,
                trial_successes: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 申请放行一次调用
    ///
    /// OPEN 冷却期内快速失败；冷却结束后首个申请转入 HALF_OPEN 并占用
    /// 一个试探席位；HALF_OPEN 下席位耗尽同样快速失败。
    pub fn try_acquire(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.current_open_timeout(inner.trip_count) {
                    inner.state = CircuitState::HalfOpen;
                    inner.trials_in_flight = 1;
                    inner.trial_successes = 0;
                    Ok(())
                } else {
                    Err(CoreError::BreakerOpen {
                        name: self.name.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trials_in_flight < self.config.half_open_trials {
                    inner.trials_in_flight += 1;
                    Ok(())
                } else {
                    Err(CoreError::BreakerOpen {
                        name: self.name.clone(),
                    })
                }
            }
        }
    }

    /// 记录一次成功调用
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.window_started_at = None;
            }
            CircuitState::HalfOpen => {
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.half_open_successes {
                    Self::close(&mut inner);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// 记录一次失败调用；不满足谓词的错误仅释放试探席位、不计入统计
    pub fn record_failure(&self, err: &CoreError) {
        let counts = (self.counts_failure)(err);
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => {
                if !counts {
                    return;
                }
                let now = Instant::now();
                let window_lapsed = inner
                    .window_started_at
                    .map(|at| now.duration_since(at) > self.config.failure_window)
                    .unwrap_or(true);
                if window_lapsed {
                    inner.window_started_at = Some(now);
                    inner.consecutive_failures = 0;
                }
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    Self::trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                if counts {
                    // 任一试探失败立即回到 OPEN，冷却时长随之递增
                    Self::trip(&mut inner);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            trip_count: inner.trip_count,
            open_for_ms: match inner.state {
                CircuitState::Open => inner.opened_at.map(|at| at.elapsed().as_millis() as u64),
                _ => None,
            },
        }
    }

    fn current_open_timeout(&self, trip_count: u32) -> Duration {
        let trips = trip_count.saturating_sub(1).min(16);
        let escalated = self.config.open_timeout.as_secs_f64() * 2f64.powi(trips as i32);
        Duration::from_secs_f64(escalated.min(self.config.open_timeout_cap.as_secs_f64()))
    }

    fn trip(inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trip_count += 1;
        inner.trials_in_flight = 0;
        inner.trial_successes = 0;
    }

    fn close(inner: &mut Inner) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.window_started_at = None;
        inner.opened_at = None;
        inner.trip_count = 0;
        inner.trials_in_flight = 0;
        inner.trial_successes = 0;
    }
}

#[cfg(feature = "runtime")]
impl CircuitBreaker {
    /// 包装一次出站调用：先申请放行，再按结果记录
    pub async fn call<T, Fut>(&self, fut: Fut) -> CoreResult<T>
    where
        Fut: std::future::Future<Output = CoreResult<T>>,
    {
        self.try_acquire()?;
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }
}
