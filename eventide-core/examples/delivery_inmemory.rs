/// 事件投递（内存版）示例
/// 展示 Outbox -> Relay -> Bus -> 消费组 的闭环，以及 handler 失败后的重投与死信
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use eventide_core::event::{Event, EventSchema, Priority, RequiredFields, SchemaRegistry};
use eventide_core::eventing::{
    EventBus, EventHandler, HandledEventType, InMemoryEventBus, InMemoryOutboxStore, OutboxStore,
    Relay, RelayConfig, SubscribeOptions,
};
use eventide_core::retry::RetryPolicy;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

// ============================================================================
// 示例处理器（EventHandler）
// ============================================================================

#[derive(Clone)]
struct PrintHandler {
    name: &'static str,
    types: HandledEventType,
    fail_on: Option<&'static str>,
    failed_once: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl EventHandler for PrintHandler {
    fn handler_name(&self) -> &str {
        self.name
    }

    fn handled_event_type(&self) -> HandledEventType {
        self.types.clone()
    }

    async fn handle(&self, event: &Event) -> AnyResult<()> {
        if let Some(bad) = self.fail_on
            && event.event_type() == bad
        {
            // 每个事件仅失败一次，演示重投后成功
            let mut failed = self.failed_once.lock().unwrap();
            let key = event.id().to_string();
            if !failed.contains(&key) {
                failed.push(key);
                anyhow::bail!("{} failed on {}", self.name, bad);
            }
        }
        println!(
            "handler={} type={} aggregate={} priority={} payload={}",
            self.name,
            event.event_type(),
            event.aggregate_id(),
            event.priority().as_str(),
            event.payload()
        );
        Ok(())
    }
}

// ============================================================================
// 工具函数
// ============================================================================

fn mk_event(ty: &str, aggregate_id: &str, priority: Priority, value: u32) -> Event {
    Event::builder()
        .event_type(ty.to_string())
        .priority(priority)
        .aggregate_type("user".to_string())
        .aggregate_id(aggregate_id.to_string())
        .maybe_trace_id(Some(format!("trace-{aggregate_id}")))
        .payload(serde_json::json!({"answer": value}))
        .build()
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> AnyResult<()> {
    println!("=== 事件投递（内存版）示例 ===\n");

    // Schema 注册表：发布边界只接受注册过的 (type, version)
    let schemas: SchemaRegistry = vec![
        Arc::new(RequiredFields::new("user.answered", 1, ["answer"])) as Arc<dyn EventSchema>,
        Arc::new(RequiredFields::new("user.left", 1, ["answer"])) as Arc<dyn EventSchema>,
    ]
    .into_iter()
    .collect();

    // Bus & 消费组
    let bus = Arc::new(InMemoryEventBus::new(Arc::new(schemas)));
    bus.subscribe(
        HandledEventType::All,
        "printer",
        Arc::new(PrintHandler {
            name: "printer",
            types: HandledEventType::All,
            fail_on: None,
            failed_once: Arc::new(Mutex::new(Vec::new())),
        }),
        SubscribeOptions::default(),
    )
    .await?;
    bus.subscribe(
        HandledEventType::One("user.left".to_string()),
        "flaky",
        Arc::new(PrintHandler {
            name: "flaky",
            types: HandledEventType::One("user.left".to_string()),
            fail_on: Some("user.left"),
            failed_once: Arc::new(Mutex::new(Vec::new())),
        }),
        SubscribeOptions::builder()
            .visibility_timeout(Duration::from_secs(5))
            .max_redeliveries(3)
            .build(),
    )
    .await?;

    // Outbox & Relay
    let store = Arc::new(InMemoryOutboxStore::new());
    store.enqueue(mk_event("user.answered", "u-1", Priority::Normal, 1))?;
    store.enqueue(mk_event("user.left", "u-2", Priority::Critical, 2))?;

    let relay = Arc::new(
        Relay::builder()
            .event_bus(bus.clone())
            .outbox(store.clone())
            .config(RelayConfig {
                poll_interval: Duration::from_millis(200),
                backoff: RetryPolicy::builder()
                    .base_delay(Duration::from_millis(100))
                    .build(),
                ..Default::default()
            })
            .build(),
    );
    let handle = relay.start();
    println!("✅ 中继已启动");

    // 演示在运行中继续塞入事件
    tokio::time::sleep(Duration::from_millis(300)).await;
    store.enqueue(mk_event("user.answered", "u-1", Priority::Low, 3))?;
    println!("✅ 追加事件: user.answered(u-1)");

    tokio::time::sleep(Duration::from_secs(2)).await;
    let stats = store.stats().await?;
    println!(
        "\n已投递 {} 行，死信 {} 行，总线死信 {} 条",
        stats.published,
        stats.dead,
        bus.dead_letters().await?.len()
    );

    handle.shutdown();
    handle.join().await;
    println!("✅ 优雅关闭完成");
    Ok(())
}
