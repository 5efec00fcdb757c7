//! 事务性发件箱（Outbox）协议
//!
//! 定义发件箱行的标准形态与存储协议：
//! - 行与业务变更写入同一事务（由具体存储实现保证），崩溃不丢事件；
//! - 中继按 `(priority, created_at)` 批量拉取到期行，同一聚合严格按
//!   创建顺序出队；
//! - 耗尽重试的行转为 `Dead`，经由可查询视图暴露而非静默丢弃。
//!
use crate::error::CoreResult as Result;
use crate::event::Event;
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// 发件箱行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Publishing,
    Published,
    Failed,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Publishing => "publishing",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Dead => "dead",
        }
    }

    /// 是否仍待投递（会被中继拉取或重新入队）
    pub fn is_unresolved(self) -> bool {
        matches!(
            self,
            OutboxStatus::Pending | OutboxStatus::Publishing | OutboxStatus::Failed
        )
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "publishing" => Ok(OutboxStatus::Publishing),
            "published" => Ok(OutboxStatus::Published),
            "failed" => Ok(OutboxStatus::Failed),
            "dead" => Ok(OutboxStatus::Dead),
            other => Err(crate::error::CoreError::Codec {
                reason: format!("unknown outbox status: {other}"),
            }),
        }
    }
}

/// 发件箱行：每个已产生的事件恰好一行
#[derive(Debug, Clone, Builder)]
pub struct OutboxRecord {
    /// 行标识，与事件标识一致
    id: Uuid,
    aggregate_type: String,
    aggregate_id: String,
    event: Event,
    #[builder(default = OutboxStatus::Pending)]
    status: OutboxStatus,
    #[builder(default = 0)]
    attempts: u32,
    last_error: Option<String>,
    #[builder(default = Utc::now())]
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// 以事件构造待投递行；行标识沿用事件标识
    pub fn from_event(event: Event) -> Self {
        Self::builder()
            .id(event.id())
            .aggregate_type(event.aggregate_type().to_string())
            .aggregate_id(event.aggregate_id().to_string())
            .event(event)
            .build()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn status(&self) -> OutboxStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at
    }

    pub(crate) fn set_status(&mut self, status: OutboxStatus) {
        self.status = status;
    }

    pub(crate) fn set_attempts(&mut self, attempts: u32) {
        self.attempts = attempts;
    }

    pub(crate) fn set_last_error(&mut self, reason: Option<String>) {
        self.last_error = reason;
    }

    pub(crate) fn set_published_at(&mut self, at: Option<DateTime<Utc>>) {
        self.published_at = at;
    }

    pub(crate) fn set_next_retry_at(&mut self, at: Option<DateTime<Utc>>) {
        self.next_retry_at = at;
    }
}

/// 按状态统计的监控视图
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub publishing: u64,
    pub published: u64,
    pub failed: u64,
    pub dead: u64,
}

/// 发件箱存储协议：中继据此拉取、标记与清理
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// 拉取到期批次：`Pending` 行与 `next_retry_at` 已到的 `Failed` 行，
    /// 按 `(priority, created_at)` 排序；同一聚合存在更早未投递行时整体让位
    async fn fetch_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// 将一批行标记为投递中
    async fn mark_publishing(&self, ids: &[Uuid]) -> Result<()>;

    /// 将一批行标记为已投递
    async fn mark_published(&self, ids: &[Uuid]) -> Result<()>;

    /// 将已领取的行原样放回待投递（用于批内让位，不增加尝试次数）
    async fn mark_pending(&self, id: Uuid) -> Result<()>;

    /// 标记一次投递失败：累加尝试次数并设置下次重试时间
    async fn mark_failed(
        &self,
        id: Uuid,
        reason: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()>;

    /// 标记为死信：不再被拉取，仅保留供排查
    async fn mark_dead(&self, id: Uuid, reason: &str) -> Result<()>;

    /// 将滞留在 `Publishing` 超过给定时长的行重新入队（崩溃恢复）
    async fn requeue_publishing(&self, stuck_after: Duration) -> Result<u64>;

    /// 查询死信行
    async fn dead_letters(&self) -> Result<Vec<OutboxRecord>>;

    /// 查询各状态行数
    async fn stats(&self) -> Result<OutboxStats>;

    /// 清理早于给定时长的已投递行，返回清理数量
    async fn purge_published(&self, older_than: Duration) -> Result<u64>;
}
