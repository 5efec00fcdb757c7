//! 事件子系统（eventing）
//!
//! 提供事件投递的基础抽象与运行时：
//! - `EventBus`：基于消费组的发布/订阅协议，`InMemoryEventBus` 为其
//!   进程内实现（优先级通道、可见性超时、死信通道、大负载压缩）；
//! - `OutboxStore`：事务性发件箱协议，`InMemoryOutboxStore` 为测试与
//!   本地实现（Postgres 实现见 `persist` 模块）；
//! - `Relay`：轮询发件箱并发布到总线的长驻中继，附带滞留恢复与清理；
//! - `EventHandler`：对事件进行消费处理，投递语义为至少一次。
//!
//! 该模块仅定义协议与引擎，不绑定具体传输实现，可对接任意消息系统或内存实现。
//!
pub mod bus;
pub mod bus_inmemory;
pub mod handler;
pub mod outbox;
pub mod outbox_inmemory;
pub mod relay;

pub use bus::{DeadLetter, EventBus, SubscribeOptions, SubscriptionId};
pub use bus_inmemory::{BusConfig, InMemoryEventBus};
pub use handler::{EventHandler, HandledEventType};
pub use outbox::{OutboxRecord, OutboxStats, OutboxStatus, OutboxStore};
pub use outbox_inmemory::InMemoryOutboxStore;
pub use relay::{Relay, RelayConfig, RelayHandle};
