//! 事件负载校验（Schema Registry）
//!
//! 以 `(event_type, event_version)` 为键的标签联合边界：每种事件组合
//! 注册一个校验器，发布时未知组合被拒绝、非法负载立即失败（永久错误，
//! 不进入重试）。
//!
use super::envelope::Event;
use crate::error::{CoreError, CoreResult as Result};
use serde_json::Value;
use std::sync::Arc;

/// 事件负载校验器
pub trait EventSchema: Send + Sync {
    fn applies(&self, event_type: &str, event_version: usize) -> bool;

    fn validate(&self, payload: &Value) -> Result<()>;
}

impl<T> EventSchema for Arc<T>
where
    T: EventSchema + ?Sized,
{
    fn applies(&self, event_type: &str, event_version: usize) -> bool {
        (**self).applies(event_type, event_version)
    }

    fn validate(&self, payload: &Value) -> Result<()> {
        (**self).validate(payload)
    }
}

/// 校验注册表：按注册顺序查找首个匹配的校验器
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: Vec<Arc<dyn EventSchema>>,
}

impl SchemaRegistry {
    /// 在发布边界校验事件：未知 `(type, version)` 组合与非法负载均被拒绝
    pub fn validate(&self, event: &Event) -> Result<()> {
        let Some(schema) = self
            .schemas
            .iter()
            .find(|s| s.applies(event.event_type(), event.event_version()))
        else {
            return Err(CoreError::UnknownEventType {
                event_type: event.event_type().to_string(),
                event_version: event.event_version(),
            });
        };

        schema
            .validate(event.payload())
            .map_err(|err| CoreError::SchemaValidation {
                event_type: event.event_type().to_string(),
                reason: err.to_string(),
            })
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl FromIterator<Arc<dyn EventSchema>> for SchemaRegistry {
    fn from_iter<I: IntoIterator<Item = Arc<dyn EventSchema>>>(iter: I) -> Self {
        Self {
            schemas: iter.into_iter().collect(),
        }
    }
}

impl Extend<Arc<dyn EventSchema>> for SchemaRegistry {
    fn extend<I: IntoIterator<Item = Arc<dyn EventSchema>>>(&mut self, iter: I) {
        self.schemas.extend(iter);
    }
}

/// 最小可用的对象负载校验：要求负载为 JSON 对象且包含给定字段
pub struct RequiredFields {
    event_type: String,
    event_version: usize,
    fields: Vec<&'static str>,
}

impl RequiredFields {
    pub fn new(
        event_type: impl Into<String>,
        event_version: usize,
        fields: impl IntoIterator<Item = &'static str>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_version,
            fields: fields.into_iter().collect(),
        }
    }
}

impl EventSchema for RequiredFields {
    fn applies(&self, event_type: &str, event_version: usize) -> bool {
        self.event_type == event_type && self.event_version == event_version
    }

    fn validate(&self, payload: &Value) -> Result<()> {
        let Some(obj) = payload.as_object() else {
            return Err(CoreError::codec("payload is not a JSON object"));
        };
        for field in &self.fields {
            if !obj.contains_key(*field) {
                return Err(CoreError::codec(format!("missing field: {field}")));
            }
        }
        Ok(())
    }
}
