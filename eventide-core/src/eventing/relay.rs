//! 发件箱中继（Relay）
//!
//! 统一编排"轮询 → 发布 → 标记"的长驻任务：
//! - 周期从发件箱拉取到期批次并发布至总线，逐行标记结果；
//! - 发布失败按退避策略记录 `next_retry_at`，耗尽后转为死信行；
//! - 批内同一聚合在首次失败后整体让位，保持聚合内投递顺序；
//! - 周期回收滞留在投递中的行（崩溃恢复）与清理过期已投递行；
//! - 提供关闭与等待的 `RelayHandle`；失败只记录、绝不中断中继。
//!
use super::bus::EventBus;
use super::outbox::{OutboxRecord, OutboxStore};
use crate::error::CoreError;
use crate::retry::RetryPolicy;
use bon::Builder;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Relay：
/// - 周期性从 OutboxStore 拉取到期行并发布到 Bus
/// - 周期性恢复滞留行、清理已投递行
#[derive(Builder)]
pub struct Relay {
    event_bus: Arc<dyn EventBus>,
    outbox: Arc<dyn OutboxStore>,
    #[builder(default)]
    config: RelayConfig,
}

impl Relay {
    /// 启动中继，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> RelayHandle {
        let token = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(3);

        // poll worker（周期任务）
        {
            let bus = self.event_bus.clone();
            let outbox = self.outbox.clone();
            let config = self.config;

            tasks.push(Self::spawn_periodic(
                token.clone(),
                config.poll_interval,
                move || {
                    let bus = bus.clone();
                    let outbox = outbox.clone();
                    async move {
                        Self::drain_once(&bus, &outbox, &config).await;
                    }
                },
            ));
        }

        // requeue worker（周期任务，崩溃恢复）
        {
            let outbox = self.outbox.clone();
            let stuck_after = self.config.stuck_after;

            tasks.push(Self::spawn_periodic(token.clone(), stuck_after, move || {
                let outbox = outbox.clone();
                async move {
                    match outbox.requeue_publishing(stuck_after).await {
                        Ok(0) => {}
                        Ok(n) => debug!(count = n, "requeued stuck outbox rows"),
                        Err(err) => warn!(%err, "outbox requeue failed"),
                    }
                }
            }));
        }

        // clean worker（周期任务）
        {
            let outbox = self.outbox.clone();
            let retain = self.config.retain_published;

            tasks.push(Self::spawn_periodic(
                token.clone(),
                self.config.clean_interval,
                move || {
                    let outbox = outbox.clone();
                    async move {
                        match outbox.purge_published(retain).await {
                            Ok(0) => {}
                            Ok(n) => debug!(count = n, "purged published outbox rows"),
                            Err(err) => warn!(%err, "outbox purge failed"),
                        }
                    }
                },
            ));
        }

        RelayHandle { token, tasks }
    }

    fn spawn_periodic<F, Fut>(
        token: CancellationToken,
        interval: Duration,
        mut f: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => f().await,
                }
            }
        })
    }

    /// 单轮排空：领取批次、逐行发布并标记；任何失败都不会传播出去
    async fn drain_once(
        bus: &Arc<dyn EventBus>,
        outbox: &Arc<dyn OutboxStore>,
        config: &RelayConfig,
    ) {
        let records = match outbox.fetch_batch(config.batch_size).await {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "outbox poll failed");
                return;
            }
        };
        if records.is_empty() {
            return;
        }

        let ids: Vec<uuid::Uuid> = records.iter().map(|r| r.id()).collect();
        if let Err(err) = outbox.mark_publishing(&ids).await {
            warn!(%err, "failed to claim outbox batch");
            return;
        }

        // 发布失败的聚合：批内后续行原样放回，保持聚合内顺序
        let mut blocked: HashSet<String> = HashSet::new();
        for record in records {
            if blocked.contains(record.aggregate_id()) {
                if let Err(err) = outbox.mark_pending(record.id()).await {
                    warn!(%err, row = %record.id(), "failed to release outbox row");
                }
                continue;
            }

            match bus.publish(record.event()).await {
                Ok(()) => {
                    if let Err(err) = outbox.mark_published(&[record.id()]).await {
                        warn!(%err, row = %record.id(), "failed to mark outbox row published");
                    }
                }
                Err(err) => {
                    blocked.insert(record.aggregate_id().to_string());
                    Self::mark_publish_failure(outbox, &record, &err, config).await;
                }
            }
        }
    }

    async fn mark_publish_failure(
        outbox: &Arc<dyn OutboxStore>,
        record: &OutboxRecord,
        err: &CoreError,
        config: &RelayConfig,
    ) {
        let attempts = record.attempts() + 1;
        let result = if !err.is_transient() || attempts >= config.max_attempts {
            warn!(row = %record.id(), %err, attempts, "outbox row dead-lettered");
            outbox.mark_dead(record.id(), &err.to_string()).await
        } else {
            let delay = config.backoff.delay_for(record.attempts());
            let next_retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            outbox
                .mark_failed(record.id(), &err.to_string(), next_retry_at)
                .await
        };
        if let Err(mark_err) = result {
            warn!(%mark_err, row = %record.id(), "failed to record outbox failure");
        }
    }
}

/// 中继配置
#[derive(Clone, Copy, Debug)]
pub struct RelayConfig {
    /// 发件箱轮询间隔
    pub poll_interval: Duration,
    /// 单轮拉取的最大行数
    pub batch_size: usize,
    /// 转为死信前的最大发布尝试次数
    pub max_attempts: u32,
    /// 失败重试的退避策略
    pub backoff: RetryPolicy,
    /// 投递中行视为滞留的时长（崩溃恢复阈值，同时作为回收间隔）
    pub stuck_after: Duration,
    /// 清理任务的运行间隔
    pub clean_interval: Duration,
    /// 已投递行的保留时长
    pub retain_published: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 64,
            max_attempts: 5,
            backoff: RetryPolicy::default(),
            stuck_after: Duration::from_secs(30),
            clean_interval: Duration::from_secs(60),
            retain_published: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// 中继运行句柄：用于优雅关闭与等待任务结束
pub struct RelayHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreResult;
    use crate::event::{Event, Priority, SchemaRegistry};
    use crate::eventing::bus::{DeadLetter, SubscribeOptions, SubscriptionId};
    use crate::eventing::bus_inmemory::InMemoryEventBus;
    use crate::eventing::handler::{EventHandler, HandledEventType};
    use crate::eventing::outbox::{OutboxStatus, OutboxStore};
    use crate::eventing::outbox_inmemory::InMemoryOutboxStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// 记录发布顺序、可按事件 ID 注入若干次失败的总线桩
    #[derive(Default)]
    struct SpyBus {
        published: Mutex<Vec<Uuid>>,
        fail_plan: Mutex<HashMap<Uuid, u32>>,
    }

    impl SpyBus {
        fn fail_times(&self, id: Uuid, times: u32) {
            self.fail_plan.lock().unwrap().insert(id, times);
        }

        fn published(&self) -> Vec<Uuid> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventBus for SpyBus {
        async fn publish(&self, event: &Event) -> CoreResult<()> {
            {
                let mut plan = self.fail_plan.lock().unwrap();
                if let Some(remaining) = plan.get_mut(&event.id()) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(CoreError::event_bus("broker unavailable"));
                    }
                }
            }
            self.published.lock().unwrap().push(event.id());
            Ok(())
        }

        async fn subscribe(
            &self,
            _selector: HandledEventType,
            _group: &str,
            _handler: Arc<dyn EventHandler>,
            _options: SubscribeOptions,
        ) -> CoreResult<SubscriptionId> {
            Err(CoreError::event_bus("not supported"))
        }

        async fn unsubscribe(&self, _subscription: &SubscriptionId) -> CoreResult<()> {
            Ok(())
        }

        async fn dead_letters(&self) -> CoreResult<Vec<DeadLetter>> {
            Ok(Vec::new())
        }
    }

    fn mk_event(ty: &str, aggregate_id: &str) -> Event {
        Event::builder()
            .event_type(ty.to_string())
            .aggregate_type("user".to_string())
            .aggregate_id(aggregate_id.to_string())
            .payload(serde_json::json!({"n": 1}))
            .build()
    }

    fn fast_config() -> RelayConfig {
        RelayConfig {
            poll_interval: Duration::from_millis(10),
            batch_size: 16,
            max_attempts: 5,
            backoff: RetryPolicy::builder()
                .base_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(2))
                .build(),
            stuck_after: Duration::from_millis(20),
            clean_interval: Duration::from_millis(20),
            retain_published: Duration::from_secs(3600),
        }
    }

    async fn wait_for(store: &InMemoryOutboxStore, mut cond: impl FnMut(&InMemoryOutboxStore) -> bool) {
        let _ = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if cond(store) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_rows_are_published_within_one_poll_interval() {
        let bus = Arc::new(SpyBus::default());
        let store = Arc::new(InMemoryOutboxStore::new());
        store.enqueue(mk_event("user.answered", "u1")).unwrap();
        store.enqueue(mk_event("user.answered", "u2")).unwrap();

        let relay = Arc::new(
            Relay::builder()
                .event_bus(bus.clone())
                .outbox(store.clone())
                .config(fast_config())
                .build(),
        );
        let handle = relay.start();

        wait_for(&store, |s| {
            s.snapshot()
                .iter()
                .all(|r| r.status() == OutboxStatus::Published)
        })
        .await;
        handle.shutdown();
        handle.join().await;

        assert_eq!(bus.published().len(), 2);
        for record in store.snapshot() {
            assert_eq!(record.status(), OutboxStatus::Published);
            assert!(record.published_at().is_some());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_retries_turn_the_row_dead_but_queryable() {
        let bus = Arc::new(SpyBus::default());
        let store = Arc::new(InMemoryOutboxStore::new());
        let event = mk_event("user.answered", "u1");
        let id = event.id();
        bus.fail_times(id, u32::MAX);
        store.enqueue(event).unwrap();

        let mut config = fast_config();
        config.max_attempts = 2;
        let relay = Arc::new(
            Relay::builder()
                .event_bus(bus.clone())
                .outbox(store.clone())
                .config(config)
                .build(),
        );
        let handle = relay.start();

        wait_for(&store, |s| {
            s.get(id).map(|r| r.status() == OutboxStatus::Dead).unwrap_or(false)
        })
        .await;
        handle.shutdown();
        handle.join().await;

        let dead = store.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts(), 2);
        assert!(dead[0].last_error().unwrap().contains("broker unavailable"));
        assert!(bus.published().is_empty());

        // 死信行不再参与拉取
        assert!(store.fetch_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn per_aggregate_order_survives_a_transient_failure() {
        let bus = Arc::new(SpyBus::default());
        let store = Arc::new(InMemoryOutboxStore::new());
        let e1 = mk_event("user.answered", "u1");
        let e2 = mk_event("user.answered", "u1");
        let (id1, id2) = (e1.id(), e2.id());
        bus.fail_times(id1, 1);
        store.enqueue(e1).unwrap();
        store.enqueue(e2).unwrap();

        let relay = Arc::new(
            Relay::builder()
                .event_bus(bus.clone())
                .outbox(store.clone())
                .config(fast_config())
                .build(),
        );
        let handle = relay.start();

        wait_for(&store, |s| {
            s.snapshot()
                .iter()
                .all(|r| r.status() == OutboxStatus::Published)
        })
        .await;
        handle.shutdown();
        handle.join().await;

        assert_eq!(bus.published(), vec![id1, id2]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn permanent_publish_errors_dead_letter_immediately() {
        // 空注册表：发布被以未知事件类型拒绝（永久错误）
        let bus = Arc::new(InMemoryEventBus::new(Arc::new(SchemaRegistry::default())));
        let store = Arc::new(InMemoryOutboxStore::new());
        let event = mk_event("user.answered", "u1");
        let id = event.id();
        store.enqueue(event).unwrap();

        let relay = Arc::new(
            Relay::builder()
                .event_bus(bus)
                .outbox(store.clone())
                .config(fast_config())
                .build(),
        );
        let handle = relay.start();

        wait_for(&store, |s| {
            s.get(id).map(|r| r.status() == OutboxStatus::Dead).unwrap_or(false)
        })
        .await;
        handle.shutdown();
        handle.join().await;

        let record = store.get(id).unwrap();
        assert_eq!(record.status(), OutboxStatus::Dead);
        assert_eq!(record.attempts(), 1);
        assert!(record.last_error().unwrap().contains("unknown event type"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rows_stuck_in_publishing_are_recovered() {
        let bus = Arc::new(SpyBus::default());
        let store = Arc::new(InMemoryOutboxStore::new());
        let event = mk_event("user.answered", "u1");
        let id = event.id();
        store.enqueue(event).unwrap();
        // 模拟上一个中继实例在标记后崩溃
        store.mark_publishing(&[id]).await.unwrap();

        let relay = Arc::new(
            Relay::builder()
                .event_bus(bus.clone())
                .outbox(store.clone())
                .config(fast_config())
                .build(),
        );
        let handle = relay.start();

        wait_for(&store, |s| {
            s.get(id)
                .map(|r| r.status() == OutboxStatus::Published)
                .unwrap_or(false)
        })
        .await;
        handle.shutdown();
        handle.join().await;

        assert_eq!(bus.published(), vec![id]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cleaner_purges_old_published_rows() {
        let bus = Arc::new(SpyBus::default());
        let store = Arc::new(InMemoryOutboxStore::new());
        store.enqueue(mk_event("user.answered", "u1")).unwrap();

        let mut config = fast_config();
        config.retain_published = Duration::ZERO;
        let relay = Arc::new(
            Relay::builder()
                .event_bus(bus)
                .outbox(store.clone())
                .config(config)
                .build(),
        );
        let handle = relay.start();

        wait_for(&store, |s| s.snapshot().is_empty()).await;
        handle.shutdown();
        handle.join().await;

        assert!(store.snapshot().is_empty());
    }
}
