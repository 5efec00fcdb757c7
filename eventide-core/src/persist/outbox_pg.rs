//! Postgres 版发件箱存储（PgOutboxStore）
//!
//! 关键约束：
//! - `enqueue` 在调用方已开启的事务内执行、绝不自行开启事务，
//!   业务回滚时行随之消失，不会出现半产生的事件；
//! - 拉取即领取：`FOR UPDATE SKIP LOCKED` 保证多副本互不争用，
//!   被领取的行原子转为 `publishing`；
//! - 每轮每个聚合最多领取一行：存在更早未投递行的聚合整体让位，
//!   保证聚合内按创建顺序投递。
//!
use crate::error::{CoreError, CoreResult as Result};
use crate::event::{Event, Priority};
use crate::eventing::outbox::{OutboxRecord, OutboxStats, OutboxStatus, OutboxStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

/// 建表语句；索引对应中继轮询与聚合内排序两条访问路径
pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS event_outbox (
    id UUID PRIMARY KEY,
    aggregate_type TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    event_version INT NOT NULL,
    priority TEXT NOT NULL,
    trace_id TEXT,
    payload JSONB NOT NULL,
    produced_at TIMESTAMPTZ NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INT NOT NULL DEFAULT 0,
    last_error TEXT,
    claimed_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    published_at TIMESTAMPTZ,
    next_retry_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_event_outbox_due
    ON event_outbox (status, next_retry_at);
CREATE INDEX IF NOT EXISTS idx_event_outbox_aggregate
    ON event_outbox (aggregate_id, created_at);
"#;

const CLAIM_SQL: &str = r#"
WITH due AS (
    SELECT o.id FROM event_outbox o
    WHERE (o.status = 'pending'
           OR (o.status = 'failed'
               AND (o.next_retry_at IS NULL OR o.next_retry_at <= now())))
      AND NOT EXISTS (
          SELECT 1 FROM event_outbox prior
          WHERE prior.aggregate_id = o.aggregate_id
            AND prior.created_at < o.created_at
            AND prior.status IN ('pending', 'publishing', 'failed')
      )
    ORDER BY CASE o.priority
            WHEN 'critical' THEN 0
            WHEN 'high' THEN 1
            WHEN 'normal' THEN 2
            ELSE 3
        END,
        o.created_at
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
UPDATE event_outbox
SET status = 'publishing', claimed_at = now()
FROM due
WHERE event_outbox.id = due.id
RETURNING event_outbox.*
"#;

/// 基于 sqlx 连接池的发件箱实现
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 应用建表语句（幂等）
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(DDL).execute(&self.pool).await?;
        Ok(())
    }

    /// 在调用方事务内写入发件箱行
    ///
    /// 与业务变更同事务提交是防止事件丢失的唯一机制；
    /// 写入失败应使调用方事务回滚。
    pub async fn enqueue(tx: &mut Transaction<'_, Postgres>, event: &Event) -> Result<Uuid> {
        sqlx::query(
            r#"
            INSERT INTO event_outbox
                (id, aggregate_type, aggregate_id, event_type, event_version,
                 priority, trace_id, payload, produced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id())
        .bind(event.aggregate_type())
        .bind(event.aggregate_id())
        .bind(event.event_type())
        .bind(event.event_version() as i32)
        .bind(event.priority().as_str())
        .bind(event.trace_id())
        .bind(event.payload())
        .bind(event.produced_at())
        .execute(&mut **tx)
        .await?;

        Ok(event.id())
    }

    fn row_to_record(row: &PgRow) -> Result<OutboxRecord> {
        let id: Uuid = row.try_get("id")?;
        let priority: String = row.try_get("priority")?;
        let status: String = row.try_get("status")?;

        let event = Event::builder()
            .id(id)
            .event_type(row.try_get::<String, _>("event_type")?)
            .event_version(row.try_get::<i32, _>("event_version")? as usize)
            .priority(priority.parse::<Priority>()?)
            .aggregate_type(row.try_get::<String, _>("aggregate_type")?)
            .aggregate_id(row.try_get::<String, _>("aggregate_id")?)
            .maybe_trace_id(row.try_get::<Option<String>, _>("trace_id")?)
            .produced_at(row.try_get::<DateTime<Utc>, _>("produced_at")?)
            .payload(row.try_get::<serde_json::Value, _>("payload")?)
            .build();

        Ok(OutboxRecord::builder()
            .id(id)
            .aggregate_type(event.aggregate_type().to_string())
            .aggregate_id(event.aggregate_id().to_string())
            .event(event)
            .status(status.parse::<OutboxStatus>()?)
            .attempts(row.try_get::<i32, _>("attempts")? as u32)
            .maybe_last_error(row.try_get::<Option<String>, _>("last_error")?)
            .created_at(row.try_get::<DateTime<Utc>, _>("created_at")?)
            .maybe_published_at(row.try_get::<Option<DateTime<Utc>>, _>("published_at")?)
            .maybe_next_retry_at(row.try_get::<Option<DateTime<Utc>>, _>("next_retry_at")?)
            .build())
    }

    fn cutoff(older_than: Duration) -> Result<DateTime<Utc>> {
        let delta =
            chrono::Duration::from_std(older_than).map_err(|e| CoreError::outbox(e.to_string()))?;
        Ok(Utc::now() - delta)
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    /// 拉取即领取：返回的行已原子转为 `publishing`
    async fn fetch_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(CLAIM_SQL)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn mark_publishing(&self, ids: &[Uuid]) -> Result<()> {
        // fetch_batch 已完成领取，这里对漏领行做幂等补标
        sqlx::query(
            "UPDATE event_outbox SET status = 'publishing', claimed_at = now() WHERE id = ANY($1)",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_published(&self, ids: &[Uuid]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'published', published_at = now(),
                next_retry_at = NULL, last_error = NULL, claimed_at = NULL
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_pending(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE event_outbox SET status = 'pending', claimed_at = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str, next_retry_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'failed', attempts = attempts + 1,
                last_error = $2, next_retry_at = $3, claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_dead(&self, id: Uuid, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'dead', attempts = attempts + 1,
                last_error = $2, next_retry_at = NULL, claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requeue_publishing(&self, stuck_after: Duration) -> Result<u64> {
        let cutoff = Self::cutoff(stuck_after)?;
        let result = sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'pending', claimed_at = NULL
            WHERE status = 'publishing'
              AND (claimed_at IS NULL OR claimed_at <= $1)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn dead_letters(&self) -> Result<Vec<OutboxRecord>> {
        let rows =
            sqlx::query("SELECT * FROM event_outbox WHERE status = 'dead' ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM event_outbox GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.parse::<OutboxStatus>()? {
                OutboxStatus::Pending => stats.pending = n as u64,
                OutboxStatus::Publishing => stats.publishing = n as u64,
                OutboxStatus::Published => stats.published = n as u64,
                OutboxStatus::Failed => stats.failed = n as u64,
                OutboxStatus::Dead => stats.dead = n as u64,
            }
        }
        Ok(stats)
    }

    async fn purge_published(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Self::cutoff(older_than)?;
        let result = sqlx::query(
            "DELETE FROM event_outbox WHERE status = 'published' AND published_at <= $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
