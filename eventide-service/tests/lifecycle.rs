use anyhow::Result as AnyResult;
use async_trait::async_trait;
use eventide_core::event::{Event, EventSchema, RequiredFields, SchemaRegistry};
use eventide_core::eventing::{
    EventBus, EventHandler, HandledEventType, InMemoryEventBus, InMemoryOutboxStore, Relay,
    RelayConfig, RelayHandle, SubscribeOptions,
};
use eventide_service::{
    BreakerRegistry, HealthStatus, Service, ServiceBase, ServiceContext, ServiceHealth,
    ServiceRegistry, ServiceResult,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// 中继服务：拥有发件箱与中继句柄，随生命周期启停
// ============================================================================

struct RelayService {
    store: Arc<InMemoryOutboxStore>,
    handle: Mutex<Option<RelayHandle>>,
}

impl RelayService {
    fn new(store: Arc<InMemoryOutboxStore>) -> Self {
        Self {
            store,
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Service for RelayService {
    fn name(&self) -> &str {
        "relay"
    }

    // 消费方先就位，事件不会发布到空总线
    fn dependencies(&self) -> Vec<String> {
        vec!["analysis".to_string()]
    }

    async fn start(&self, ctx: &ServiceContext) -> ServiceResult<()> {
        let relay = Arc::new(
            Relay::builder()
                .event_bus(ctx.bus())
                .outbox(self.store.clone())
                .config(RelayConfig {
                    poll_interval: Duration::from_millis(10),
                    ..Default::default()
                })
                .build(),
        );
        *self.handle.lock().unwrap() = Some(relay.start());
        Ok(())
    }

    async fn stop(&self) -> ServiceResult<()> {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.shutdown();
            handle.join().await;
        }
        Ok(())
    }

    async fn health_check(&self) -> ServiceHealth {
        let status = if self.handle.lock().unwrap().is_some() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        ServiceHealth::new("relay", status)
    }
}

// ============================================================================
// 分析服务：ServiceBase 底座 + 处理器 + 受监督后台任务
// ============================================================================

#[derive(Clone)]
struct AnalysisHandler {
    seen: Arc<Mutex<Vec<Uuid>>>,
}

#[async_trait]
impl EventHandler for AnalysisHandler {
    fn handler_name(&self) -> &str {
        "analysis"
    }

    fn handled_event_type(&self) -> HandledEventType {
        HandledEventType::One("user.answered".into())
    }

    async fn handle(&self, event: &Event) -> AnyResult<()> {
        self.seen.lock().unwrap().push(event.id());
        Ok(())
    }
}

struct AnalysisService {
    base: ServiceBase,
    seen: Arc<Mutex<Vec<Uuid>>>,
    heartbeat_stopped: Arc<AtomicBool>,
    breakers: Mutex<Option<BreakerRegistry>>,
}

impl AnalysisService {
    fn new() -> Self {
        Self {
            base: ServiceBase::with_drain_grace("analysis", Duration::from_secs(1)),
            seen: Arc::new(Mutex::new(Vec::new())),
            heartbeat_stopped: Arc::new(AtomicBool::new(false)),
            breakers: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Service for AnalysisService {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn start(&self, ctx: &ServiceContext) -> ServiceResult<()> {
        self.base
            .register_handler(
                ctx,
                Arc::new(AnalysisHandler {
                    seen: self.seen.clone(),
                }),
                SubscribeOptions::default(),
            )
            .await?;
        *self.breakers.lock().unwrap() = Some(ctx.breakers().clone());

        // 受监督的心跳任务：stop 时随任务集协作退出
        let token = self.base.tasks().cancellation_token();
        let stopped = self.heartbeat_stopped.clone();
        self.base.tasks().spawn(async move {
            token.cancelled().await;
            stopped.store(true, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn stop(&self) -> ServiceResult<()> {
        self.base.drain().await
    }

    async fn health_check(&self) -> ServiceHealth {
        let snapshots = self
            .breakers
            .lock()
            .unwrap()
            .as_ref()
            .map(|b| b.snapshots())
            .unwrap_or_default();
        ServiceHealth::from_breakers("analysis", snapshots.into_values())
    }
}

// ============================================================================
// 整机流程
// ============================================================================

fn schemas() -> Arc<SchemaRegistry> {
    let registry: SchemaRegistry =
        vec![Arc::new(RequiredFields::new("user.answered", 1, ["answer"])) as Arc<dyn EventSchema>]
            .into_iter()
            .collect();
    Arc::new(registry)
}

fn mk_event(aggregate_id: &str) -> Event {
    Event::builder()
        .event_type("user.answered".to_string())
        .aggregate_type("user".to_string())
        .aggregate_id(aggregate_id.to_string())
        .payload(serde_json::json!({"answer": "42"}))
        .build()
}

#[tokio::test(flavor = "multi_thread")]
async fn services_deliver_end_to_end_and_shut_down_in_order() -> AnyResult<()> {
    let bus = Arc::new(InMemoryEventBus::new(schemas()));
    let store = Arc::new(InMemoryOutboxStore::new());
    let ctx = Arc::new(ServiceContext::new(bus.clone(), BreakerRegistry::default()));

    let analysis = Arc::new(AnalysisService::new());
    let registry = ServiceRegistry::new(ctx);
    // 乱序注册：启动顺序由依赖声明决定
    registry.register(Arc::new(RelayService::new(store.clone())));
    registry.register(analysis.clone());

    registry.start_all().await?;

    // 业务侧入队，经中继到达消费组
    let event = mk_event("u1");
    let event_id = event.id();
    store.enqueue(event)?;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if analysis.seen.lock().unwrap().contains(&event_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(analysis.seen.lock().unwrap().as_slice(), [event_id]);

    let system = registry.health().await;
    assert_eq!(system.status(), HealthStatus::Healthy);

    registry.stop_all().await;

    // 后台任务随宽限排空协作退出，处理器已退订
    assert!(analysis.heartbeat_stopped.load(Ordering::SeqCst));
    bus.publish(&mk_event("u2")).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(analysis.seen.lock().unwrap().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn replicas_of_a_service_compete_for_the_same_events() -> AnyResult<()> {
    let bus = Arc::new(InMemoryEventBus::new(schemas()));
    let ctx = ServiceContext::new(bus.clone(), BreakerRegistry::default());

    let total = Arc::new(AtomicUsize::new(0));

    #[derive(Clone)]
    struct Replica {
        total: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl EventHandler for Replica {
        fn handler_name(&self) -> &str {
            "analysis"
        }
        fn handled_event_type(&self) -> HandledEventType {
            HandledEventType::One("user.answered".into())
        }
        async fn handle(&self, _event: &Event) -> AnyResult<()> {
            self.total.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    // 同名服务的两个副本注册到同一消费组
    for _ in 0..2 {
        ctx.register_handler(
            "analysis",
            Arc::new(Replica {
                total: total.clone(),
            }),
            SubscribeOptions::default(),
        )
        .await?;
    }

    for _ in 0..8 {
        bus.publish(&mk_event("u1")).await?;
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if total.load(Ordering::SeqCst) == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    // 组内竞争消费：总量恰好等于发布量，无重复
    assert_eq!(total.load(Ordering::SeqCst), 8);
    Ok(())
}
