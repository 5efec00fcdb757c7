//! 事件总线（EventBus）协议
//!
//! 定义基于消费组的发布/订阅抽象：
//! - `publish`：在发布边界完成负载校验后投递，支持批量；
//! - `subscribe`：以组名订阅，同组成员竞争消费、每组恰好收到一次；
//! - 未在可见性超时内确认的条目重投给另一名成员；
//! - 超过重投上限的条目进入死信通道，可查询而非丢弃。
//!
use crate::error::CoreResult as Result;
use crate::event::Event;
use crate::eventing::handler::{EventHandler, HandledEventType};
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// 订阅参数；可见性超时与在途上限未在全局约定，按订阅配置
#[derive(Builder, Clone, Copy, Debug)]
pub struct SubscribeOptions {
    /// 成员确认前条目的可见性超时，超时后重投给其他成员
    #[builder(default = Duration::from_secs(30))]
    visibility_timeout: Duration,
    /// 单个成员的最大在途条目数
    #[builder(default = 16)]
    max_in_flight: usize,
    /// 进入死信通道前的最大重投次数
    #[builder(default = 5)]
    max_redeliveries: u32,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SubscribeOptions {
    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn max_redeliveries(&self) -> u32 {
        self.max_redeliveries
    }
}

/// 订阅标识：组名 + 成员序号，用于退订
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionId {
    group: String,
    member: u64,
}

impl SubscriptionId {
    pub(crate) fn new(group: String, member: u64) -> Self {
        Self { group, member }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn member(&self) -> u64 {
        self.member
    }
}

/// 死信记录：耗尽重投后的条目，保留供排查
#[derive(Debug, Clone)]
pub struct DeadLetter {
    event: Event,
    group: String,
    reason: String,
    redeliveries: u32,
    dead_at: DateTime<Utc>,
}

impl DeadLetter {
    pub(crate) fn new(event: Event, group: String, reason: String, redeliveries: u32) -> Self {
        Self {
            event,
            group,
            reason,
            redeliveries,
            dead_at: Utc::now(),
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn redeliveries(&self) -> u32 {
        self.redeliveries
    }

    pub fn dead_at(&self) -> DateTime<Utc> {
        self.dead_at
    }
}

/// 事件总线：负责分发事件与按消费组调度处理
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &Event) -> Result<()>;

    async fn publish_batch(&self, events: &[Event]) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }

    /// 以组名订阅；同名组的多次订阅构成竞争消费的成员集合
    async fn subscribe(
        &self,
        selector: HandledEventType,
        group: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId>;

    /// 退订成员；组内最后一名成员退出后该组消失
    async fn unsubscribe(&self, subscription: &SubscriptionId) -> Result<()>;

    /// 查询死信通道
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;
}
