//! 事件记录（Event）
//!
//! 定义事件在进程内与传输层的标准形态：一经构造不可变，
//! 负载以 `serde_json::Value` 承载并在发布边界由注册表校验。
//!
use super::priority::Priority;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
pub struct Event {
    /// 事件唯一标识符，下游消费者以此实现幂等去重
    #[builder(default = Uuid::new_v4())]
    id: Uuid,
    /// 事件类型（形如 `user.answered` 的命名空间化字符串）
    event_type: String,
    /// 事件版本，用于负载结构的版本控制
    #[builder(default = 1)]
    event_version: usize,
    /// 优先级通道
    #[builder(default)]
    priority: Priority,
    /// 聚合类型，用于区分不同的聚合根
    aggregate_type: String,
    /// 聚合 ID，同一聚合的事件按入队顺序投递
    aggregate_id: String,
    /// 链路追踪 ID
    trace_id: Option<String>,
    /// 事件产生时间
    #[builder(default = Utc::now())]
    produced_at: DateTime<Utc>,
    /// 事件负载，必须通过 `(event_type, event_version)` 注册的校验
    payload: Value,
}

impl Event {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> usize {
        self.event_version
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}
