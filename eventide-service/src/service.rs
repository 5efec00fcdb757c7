//! 服务生命周期契约（Service）
//!
//! 每个业务服务实现 `start`/`stop`/`health_check`：
//! - `start`：以服务名为消费组订阅处理器、拉起受监督的后台任务；
//! - `stop`：退订并在宽限期内排空在途处理，超期强制取消；
//! - `health_check`：返回自身状态与所依赖熔断器的快照。
//!
//! `ServiceBase` 提供订阅簿记与任务集的通用底座，服务以组合方式复用。
//!
use crate::context::ServiceContext;
use crate::error::ServiceResult;
use crate::health::ServiceHealth;
use crate::task_set::TaskSet;
use async_trait::async_trait;
use eventide_core::eventing::{EventBus, EventHandler, SubscribeOptions, SubscriptionId};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// 启动所依赖的服务名，决定注册表的启动顺序
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// 订阅处理器并开始接收工作
    async fn start(&self, ctx: &ServiceContext) -> ServiceResult<()>;

    /// 退订并排空在途处理
    async fn stop(&self) -> ServiceResult<()>;

    async fn health_check(&self) -> ServiceHealth;
}

/// 服务生命周期的通用底座：订阅簿记 + 受监督任务集 + 宽限排空
pub struct ServiceBase {
    name: String,
    drain_grace: Duration,
    bus: Mutex<Option<Arc<dyn EventBus>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    tasks: TaskSet,
}

impl ServiceBase {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_drain_grace(name, Duration::from_secs(10))
    }

    pub fn with_drain_grace(name: impl Into<String>, drain_grace: Duration) -> Self {
        Self {
            name: name.into(),
            drain_grace,
            bus: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            tasks: TaskSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 后台任务归入该任务集，`drain` 时统一取消与等待
    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    /// 以服务名为消费组订阅，并记录订阅便于停止时退订
    pub async fn register_handler(
        &self,
        ctx: &ServiceContext,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> ServiceResult<()> {
        let subscription = ctx.register_handler(&self.name, handler, options).await?;
        *self.bus.lock().expect("service lock poisoned") = Some(ctx.bus());
        self.subscriptions
            .lock()
            .expect("service lock poisoned")
            .push(subscription);
        Ok(())
    }

    /// 停止序列：退订 → 取消任务并在宽限期内等待
    pub async fn drain(&self) -> ServiceResult<()> {
        let bus = self.bus.lock().expect("service lock poisoned").clone();
        let subscriptions = std::mem::take(
            &mut *self.subscriptions.lock().expect("service lock poisoned"),
        );
        if let Some(bus) = bus {
            for subscription in subscriptions {
                if let Err(err) = bus.unsubscribe(&subscription).await {
                    warn!(service = %self.name, %err, "unsubscribe failed");
                }
            }
        }

        if !self.tasks.cancel_and_join(self.drain_grace).await {
            warn!(service = %self.name, "in-flight tasks aborted after grace period");
        }
        Ok(())
    }
}
