//! 核心层统一错误定义
//!
//! 聚焦事件校验、总线/Outbox、依赖调用容错与持久化等最小必要集合，
//! 并内置瞬时/永久的错误分级（`ErrorClass`），供重试执行器与熔断器共同消费。
//!
use thiserror::Error;

/// 统一错误类型（基础库最小必要集）
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CoreError {
    // --- 序列化/校验 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("unknown event type: {event_type} v{event_version}")]
    UnknownEventType {
        event_type: String,
        event_version: usize,
    },
    #[error("schema validation failed: type={event_type}, reason={reason}")]
    SchemaValidation { event_type: String, reason: String },
    #[error("codec error: {reason}")]
    Codec { reason: String },

    // --- 事件系统 ---
    #[error("event bus error: {reason}")]
    EventBus { reason: String },
    #[error("event handler error: handler={handler}, reason={reason}")]
    EventHandler { handler: String, reason: String },
    #[error("outbox error: {reason}")]
    Outbox { reason: String },

    // --- 依赖调用/容错 ---
    #[error("dependency call failed: name={name}, reason={reason}")]
    Dependency { name: String, reason: String },
    #[error("operation timed out: {operation}")]
    Timeout { operation: String },
    #[error("circuit breaker open: {name}")]
    BreakerOpen { name: String },
    #[error("operation cancelled")]
    Cancelled,

    // --- 仓储/持久化 ---
    #[error("database error: {reason}")]
    Database { reason: String },
    #[error("not found: {reason}")]
    NotFound { reason: String },
}

/// 统一 Result 类型别名
pub type CoreResult<T> = Result<T, CoreError>;

/// 错误分级：瞬时错误可重试且计入熔断统计，永久错误立即失败、绝不重试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl CoreError {
    pub fn event_bus(reason: impl Into<String>) -> Self {
        CoreError::EventBus {
            reason: reason.into(),
        }
    }

    pub fn outbox(reason: impl Into<String>) -> Self {
        CoreError::Outbox {
            reason: reason.into(),
        }
    }

    pub fn codec(reason: impl Into<String>) -> Self {
        CoreError::Codec {
            reason: reason.into(),
        }
    }

    pub fn dependency(name: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::Dependency {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        CoreError::Timeout {
            operation: operation.into(),
        }
    }

    /// 显式错误分级：由重试执行器与熔断谓词共同消费，而非依据错误子类推断
    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::EventBus { .. }
            | CoreError::EventHandler { .. }
            | CoreError::Outbox { .. }
            | CoreError::Dependency { .. }
            | CoreError::Timeout { .. }
            | CoreError::Database { .. } => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

// ---- Cross-crate conversions for infrastructure convenience ----
// 允许在基础设施层直接使用 `?` 将 sqlx/uuid 等错误转换为 CoreError

#[cfg(feature = "outbox-postgres")]
impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::NotFound {
                reason: "row not found".to_string(),
            },
            other => CoreError::Database {
                reason: other.to_string(),
            },
        }
    }
}

impl From<uuid::Error> for CoreError {
    fn from(err: uuid::Error) -> Self {
        CoreError::Codec {
            reason: err.to_string(),
        }
    }
}
