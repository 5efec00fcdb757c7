//! 重试策略（Retry Policy）
//!
//! 纯函数计算带抖动的指数退避序列，并提供可取消的重试执行器：
//! - `delay_unjittered(attempt) = min(max_delay, base_delay * 2^attempt)`；
//! - 抖动系数在 `1 ± jitter_fraction` 区间内均匀采样；
//! - 执行器按显式分级函数区分瞬时/永久错误，永久错误立即上抛；
//! - 每次等待都监听取消信号，重试循环绝不超出关停周期。
//!
use crate::error::ErrorClass;
use bon::Builder;
use rand::Rng;
use std::time::Duration;

/// 无状态的重试配置，按调用消费
#[derive(Builder, Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次调用）
    #[builder(default = 3)]
    max_attempts: u32,
    /// 首次退避时长
    #[builder(default = Duration::from_secs(1))]
    base_delay: Duration,
    /// 退避时长上限
    #[builder(default = Duration::from_secs(30))]
    max_delay: Duration,
    /// 抖动系数（0 表示无抖动）
    #[builder(default = 0.1)]
    jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter_fraction(&self) -> f64 {
        self.jitter_fraction
    }

    /// 无抖动退避：`min(max_delay, base_delay * 2^attempt)`，attempt 从 0 起
    pub fn delay_unjittered(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(63) as i32);
        Duration::from_secs_f64(exp.min(self.max_delay.as_secs_f64()))
    }

    /// 带抖动退避：在 `delay * (1 ± jitter_fraction)` 区间内均匀采样
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_unjittered(attempt);
        if self.jitter_fraction <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng()
            .gen_range(1.0 - self.jitter_fraction..=1.0 + self.jitter_fraction);
        Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
    }
}

#[cfg(feature = "runtime")]
pub use executor::retry;

#[cfg(feature = "runtime")]
mod executor {
    use super::RetryPolicy;
    use crate::error::{CoreError, CoreResult, ErrorClass};
    use std::future::Future;
    use tokio_util::sync::CancellationToken;

    /// 以给定策略反复调用 `op`，耗尽后上抛最后一次错误
    ///
    /// `op` 接收从 0 起的尝试序号；分级为永久的错误立即上抛；
    /// 退避等待期间收到取消信号时同样以最后一次错误结束。
    pub async fn retry<T, Op, Fut>(
        policy: &RetryPolicy,
        token: &CancellationToken,
        classify: impl Fn(&CoreError) -> ErrorClass,
        mut op: Op,
    ) -> CoreResult<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if classify(&err) == ErrorClass::Permanent {
                        return Err(err);
                    }
                    attempt += 1;
                    if attempt >= policy.max_attempts() {
                        return Err(err);
                    }

                    let delay = policy.delay_for(attempt - 1);
                    tokio::select! {
                        _ = token.cancelled() => return Err(err),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// 默认分级：直接采用 `CoreError::class`
pub fn default_classify(err: &crate::error::CoreError) -> ErrorClass {
    err.class()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unjittered_delays_are_non_decreasing_up_to_the_cap() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(30))
            .build();

        let mut prev = Duration::ZERO;
        for attempt in 0..16 {
            let d = policy.delay_unjittered(attempt);
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            assert!(d <= Duration::from_secs(30));
            prev = d;
        }
        assert_eq!(policy.delay_unjittered(0), Duration::from_secs(1));
        assert_eq!(policy.delay_unjittered(10), Duration::from_secs(30));
    }

    #[test]
    fn jittered_delay_stays_within_the_band() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(30))
            .jitter_fraction(0.25)
            .build();

        for attempt in 0..8 {
            let base = policy.delay_unjittered(attempt).as_secs_f64();
            for _ in 0..64 {
                let d = policy.delay_for(attempt).as_secs_f64();
                assert!(d >= base * 0.75 - f64::EPSILON);
                assert!(d <= base * 1.25 + f64::EPSILON);
            }
        }
    }
}
