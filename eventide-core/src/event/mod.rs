//! 事件模型（event）
//!
//! 定义事件的标准形态与发布边界上的校验：
//! - `Event`：不可变事实记录（标识、类型、版本、优先级、聚合归属、负载）；
//! - `Priority`：四级优先级通道，约定稳定的排空顺序；
//! - `EventSchema`/`SchemaRegistry`：以 `(event_type, event_version)` 为键的
//!   负载校验注册表，在发布边界拒绝未知组合与非法负载。
//!
mod envelope;
mod priority;
mod schema;

pub use envelope::Event;
pub use priority::Priority;
pub use schema::{EventSchema, RequiredFields, SchemaRegistry};
