//! 事件投递与容错核心库（eventide-core）
//!
//! 提供跨服务事件投递的通用抽象与构件，用于在应用中实现：
//! - 事件模型与发布边界校验（`event`）
//! - 带抖动指数退避的重试策略（`retry`）
//! - 按依赖名隔离的熔断器（`breaker`）
//! - 事件子系统（`eventing`）：总线、发件箱、中继与处理器
//! - 事务性发件箱的 Postgres 实现（`persist`，特性开关）
//!
//! 本 crate 尽量保持与存储与传输实现解耦，仅定义核心接口与最小必要的错误类型，
//! 以便在不同基础设施（例如 Postgres、消息中间件等）上进行适配实现。
//!
//! 典型用法：
//! 1. 为每种 `(event_type, event_version)` 注册负载校验，构造事件总线；
//! 2. 业务事务内写入发件箱行，启动 `Relay` 异步发布；
//! 3. 以服务名作为消费组订阅处理器，处理器按 `event.id()` 幂等；
//! 4. 出站依赖调用经由熔断器与重试策略包装（组合见 eventide-service）。
//!
pub mod breaker;
pub mod error;
pub mod event;
pub mod retry;

#[cfg(feature = "runtime")]
pub mod eventing;

#[cfg(feature = "outbox-postgres")]
pub mod persist;
