//! 事件处理器（EventHandler）
//!
//! 定义消费某类/多类/全部事件的处理逻辑与元信息（名称、订阅类型）。
//! 投递语义为至少一次：处理器必须以 `event.id()` 为键实现幂等。
//!
use crate::event::Event;
use async_trait::async_trait;

#[derive(Clone, Debug)]
pub enum HandledEventType {
    One(String),
    Many(Vec<String>),
    All,
}

impl HandledEventType {
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            HandledEventType::One(t) => t == event_type,
            HandledEventType::Many(ts) => ts.iter().any(|t| t == event_type),
            HandledEventType::All => true,
        }
    }
}

/// 事件处理器：处理某一类型的事件
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于失败标记与审计）
    fn handler_name(&self) -> &str;
    /// 返回该处理器支持的事件类型
    fn handled_event_type(&self) -> HandledEventType;
    /// 处理事件；返回 Ok 才视为确认
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}
