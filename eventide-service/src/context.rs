//! 服务上下文（ServiceContext）
//!
//! 承载业务服务运行所需的横切设施，进程启动时构造一次、按引用注入：
//! - 事件总线句柄与以服务名为消费组的处理器注册；
//! - 熔断器注册表与依赖调用组合（熔断优先，瞬时错误再重试）；
//! - 进程级关停令牌：重试循环与后台任务据此协作退出。
//!
use crate::breaker_registry::BreakerRegistry;
use crate::error::ServiceResult;
use eventide_core::error::{CoreError, CoreResult, ErrorClass};
use eventide_core::eventing::{EventBus, EventHandler, SubscribeOptions, SubscriptionId};
use eventide_core::retry::{RetryPolicy, default_classify, retry};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ServiceContext {
    bus: Arc<dyn EventBus>,
    breakers: BreakerRegistry,
    shutdown: CancellationToken,
}

impl ServiceContext {
    pub fn new(bus: Arc<dyn EventBus>, breakers: BreakerRegistry) -> Self {
        Self {
            bus,
            breakers,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn bus(&self) -> Arc<dyn EventBus> {
        self.bus.clone()
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// 以服务名为消费组注册处理器（同名服务的副本竞争消费同一事件流）
    pub async fn register_handler(
        &self,
        service: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> ServiceResult<SubscriptionId> {
        let selector = handler.handled_event_type();
        Ok(self.bus.subscribe(selector, service, handler, options).await?)
    }

    /// 依赖调用组合：熔断打开时快速失败，否则按策略重试瞬时错误
    ///
    /// `BreakerOpen` 分级为永久，重试器不会在冷却期内反复触达依赖。
    pub async fn call_dependency<T, Op, Fut>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        op: Op,
    ) -> ServiceResult<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        self.call_dependency_with(name, policy, default_classify, op)
            .await
    }

    /// 同上，但使用自定义错误分级函数
    pub async fn call_dependency_with<T, Op, Fut>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        classify: impl Fn(&CoreError) -> ErrorClass,
        mut op: Op,
    ) -> ServiceResult<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let breaker = self.breakers.get_or_create(name);
        let value = retry(policy, &self.shutdown, &classify, |attempt| {
            let breaker = breaker.clone();
            let fut = op(attempt);
            async move { breaker.call(fut).await }
        })
        .await?;
        Ok(value)
    }
}
