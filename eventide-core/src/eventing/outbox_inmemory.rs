//! 内存版发件箱存储（InMemoryOutboxStore）
//!
//! 满足 `OutboxStore` 协议的进程内实现，适用于测试环境、示例与本地开发。
//! 入队无法参与外部事务，原子性保证由持久化实现（如 Postgres）提供。
//!
use super::outbox::{OutboxRecord, OutboxStats, OutboxStatus, OutboxStore};
use crate::error::{CoreError, CoreResult as Result};
use crate::event::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

struct Stored {
    seq: u64,
    claimed_at: Option<DateTime<Utc>>,
    record: OutboxRecord,
}

#[derive(Default)]
struct Inner {
    rows: Vec<Stored>,
    seq: u64,
}

/// 简单的内存发件箱实现
#[derive(Default)]
pub struct InMemoryOutboxStore {
    inner: Mutex<Inner>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队一个待投递事件；每个事件恰好一行
    pub fn enqueue(&self, event: Event) -> Result<Uuid> {
        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        if inner.rows.iter().any(|s| s.record.id() == event.id()) {
            return Err(CoreError::outbox(format!(
                "duplicate outbox row for event {}",
                event.id()
            )));
        }

        let id = event.id();
        let seq = inner.seq;
        inner.seq += 1;
        inner.rows.push(Stored {
            seq,
            claimed_at: None,
            record: OutboxRecord::from_event(event),
        });
        Ok(id)
    }

    /// 当前全部行的快照（监控/测试视图）
    pub fn snapshot(&self) -> Vec<OutboxRecord> {
        let inner = self.inner.lock().expect("outbox lock poisoned");
        inner.rows.iter().map(|s| s.record.clone()).collect()
    }

    pub fn get(&self, id: Uuid) -> Option<OutboxRecord> {
        let inner = self.inner.lock().expect("outbox lock poisoned");
        inner
            .rows
            .iter()
            .find(|s| s.record.id() == id)
            .map(|s| s.record.clone())
    }

    fn with_row<T>(&self, id: Uuid, f: impl FnOnce(&mut Stored) -> T) -> Result<T> {
        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        let Some(stored) = inner.rows.iter_mut().find(|s| s.record.id() == id) else {
            return Err(CoreError::NotFound {
                reason: format!("outbox row {id}"),
            });
        };
        Ok(f(stored))
    }
}

fn into_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| CoreError::outbox(e.to_string()))
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn fetch_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let inner = self.inner.lock().expect("outbox lock poisoned");
        let now = Utc::now();

        let is_due = |r: &OutboxRecord| match r.status() {
            OutboxStatus::Pending => true,
            OutboxStatus::Failed => r.next_retry_at().map(|at| at <= now).unwrap_or(true),
            _ => false,
        };

        // 按聚合分组（rows 本身即 seq 顺序），每个聚合从首个未投递行起
        // 连续取到期行，遇到未到期/投递中的行即让位
        let mut by_aggregate: BTreeMap<&str, Vec<&Stored>> = BTreeMap::new();
        for stored in inner.rows.iter().filter(|s| s.record.status().is_unresolved()) {
            by_aggregate
                .entry(stored.record.aggregate_id())
                .or_default()
                .push(stored);
        }

        let mut runs: Vec<Vec<&Stored>> = Vec::new();
        for rows in by_aggregate.values() {
            let mut run = Vec::new();
            for stored in rows {
                if is_due(&stored.record) {
                    run.push(*stored);
                } else {
                    break;
                }
            }
            if !run.is_empty() {
                runs.push(run);
            }
        }

        // 聚合间按各自首行的 (priority, created_at) 排序；聚合内保持创建顺序
        runs.sort_by_key(|run| {
            let head = &run[0].record;
            (head.event().priority().lane(), head.created_at(), run[0].seq)
        });

        let mut batch = Vec::new();
        'outer: for run in runs {
            for stored in run {
                if batch.len() >= limit {
                    break 'outer;
                }
                batch.push(stored.record.clone());
            }
        }
        Ok(batch)
    }

    async fn mark_publishing(&self, ids: &[Uuid]) -> Result<()> {
        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        let now = Utc::now();
        for stored in inner.rows.iter_mut() {
            if ids.contains(&stored.record.id()) {
                stored.record.set_status(OutboxStatus::Publishing);
                stored.claimed_at = Some(now);
            }
        }
        Ok(())
    }

    async fn mark_published(&self, ids: &[Uuid]) -> Result<()> {
        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        let now = Utc::now();
        for stored in inner.rows.iter_mut() {
            if ids.contains(&stored.record.id()) {
                stored.record.set_status(OutboxStatus::Published);
                stored.record.set_published_at(Some(now));
                stored.record.set_next_retry_at(None);
                stored.record.set_last_error(None);
                stored.claimed_at = None;
            }
        }
        Ok(())
    }

    async fn mark_pending(&self, id: Uuid) -> Result<()> {
        self.with_row(id, |stored| {
            stored.record.set_status(OutboxStatus::Pending);
            stored.claimed_at = None;
        })
    }

    async fn mark_failed(&self, id: Uuid, reason: &str, next_retry_at: DateTime<Utc>) -> Result<()> {
        self.with_row(id, |stored| {
            let attempts = stored.record.attempts() + 1;
            stored.record.set_status(OutboxStatus::Failed);
            stored.record.set_attempts(attempts);
            stored.record.set_last_error(Some(reason.to_string()));
            stored.record.set_next_retry_at(Some(next_retry_at));
            stored.claimed_at = None;
        })
    }

    async fn mark_dead(&self, id: Uuid, reason: &str) -> Result<()> {
        self.with_row(id, |stored| {
            let attempts = stored.record.attempts() + 1;
            stored.record.set_status(OutboxStatus::Dead);
            stored.record.set_attempts(attempts);
            stored.record.set_last_error(Some(reason.to_string()));
            stored.record.set_next_retry_at(None);
            stored.claimed_at = None;
        })
    }

    async fn requeue_publishing(&self, stuck_after: Duration) -> Result<u64> {
        let cutoff = Utc::now() - into_chrono(stuck_after)?;
        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        let mut count = 0;
        for stored in inner.rows.iter_mut() {
            if stored.record.status() == OutboxStatus::Publishing
                && stored.claimed_at.map(|at| at <= cutoff).unwrap_or(true)
            {
                stored.record.set_status(OutboxStatus::Pending);
                stored.claimed_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn dead_letters(&self) -> Result<Vec<OutboxRecord>> {
        let inner = self.inner.lock().expect("outbox lock poisoned");
        Ok(inner
            .rows
            .iter()
            .filter(|s| s.record.status() == OutboxStatus::Dead)
            .map(|s| s.record.clone())
            .collect())
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let inner = self.inner.lock().expect("outbox lock poisoned");
        let mut stats = OutboxStats::default();
        for stored in &inner.rows {
            match stored.record.status() {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Publishing => stats.publishing += 1,
                OutboxStatus::Published => stats.published += 1,
                OutboxStatus::Failed => stats.failed += 1,
                OutboxStatus::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }

    async fn purge_published(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now() - into_chrono(older_than)?;
        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        let before = inner.rows.len();
        inner.rows.retain(|s| {
            !(s.record.status() == OutboxStatus::Published
                && s.record.published_at().map(|at| at <= cutoff).unwrap_or(false))
        });
        Ok((before - inner.rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Priority;

    fn mk_event(ty: &str, aggregate_id: &str, priority: Priority) -> Event {
        Event::builder()
            .event_type(ty.to_string())
            .priority(priority)
            .aggregate_type("user".to_string())
            .aggregate_id(aggregate_id.to_string())
            .payload(serde_json::json!({"n": 1}))
            .build()
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_rejected() {
        let store = InMemoryOutboxStore::new();
        let event = mk_event("user.answered", "u1", Priority::Normal);
        store.enqueue(event.clone()).unwrap();
        assert!(store.enqueue(event).is_err());
    }

    #[tokio::test]
    async fn fetch_orders_aggregates_by_priority() {
        let store = InMemoryOutboxStore::new();
        store
            .enqueue(mk_event("metric.flushed", "m1", Priority::Low))
            .unwrap();
        store
            .enqueue(mk_event("safety.flagged", "s1", Priority::Critical))
            .unwrap();
        store
            .enqueue(mk_event("user.answered", "u1", Priority::Normal))
            .unwrap();

        let batch = store.fetch_batch(10).await.unwrap();
        let types: Vec<&str> = batch.iter().map(|r| r.event().event_type()).collect();
        assert_eq!(types, ["safety.flagged", "user.answered", "metric.flushed"]);
    }

    #[tokio::test]
    async fn same_aggregate_rows_stay_in_creation_order_and_gate_on_failure() {
        let store = InMemoryOutboxStore::new();
        let e1 = mk_event("user.answered", "u1", Priority::Low);
        let e2 = mk_event("user.answered", "u1", Priority::Critical);
        let id1 = store.enqueue(e1).unwrap();
        let id2 = store.enqueue(e2).unwrap();

        // 聚合内优先级不会把 e2 排到 e1 之前
        let batch = store.fetch_batch(10).await.unwrap();
        assert_eq!(
            batch.iter().map(|r| r.id()).collect::<Vec<_>>(),
            vec![id1, id2]
        );

        // e1 退避未到期时，e2 必须让位
        store
            .mark_failed(id1, "broker down", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        let batch = store.fetch_batch(10).await.unwrap();
        assert!(batch.is_empty());

        // e1 到期后两行恢复拉取，顺序不变
        store
            .mark_failed(id1, "broker down", Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        let batch = store.fetch_batch(10).await.unwrap();
        assert_eq!(
            batch.iter().map(|r| r.id()).collect::<Vec<_>>(),
            vec![id1, id2]
        );
    }

    #[tokio::test]
    async fn dead_rows_are_excluded_but_queryable() {
        let store = InMemoryOutboxStore::new();
        let id = store
            .enqueue(mk_event("user.answered", "u1", Priority::Normal))
            .unwrap();
        store.mark_dead(id, "exhausted").await.unwrap();

        assert!(store.fetch_batch(10).await.unwrap().is_empty());
        let dead = store.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error(), Some("exhausted"));
        assert_eq!(store.stats().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn stuck_publishing_rows_are_requeued() {
        let store = InMemoryOutboxStore::new();
        let id = store
            .enqueue(mk_event("user.answered", "u1", Priority::Normal))
            .unwrap();
        store.mark_publishing(&[id]).await.unwrap();
        assert!(store.fetch_batch(10).await.unwrap().is_empty());

        let requeued = store.requeue_publishing(Duration::ZERO).await.unwrap();
        assert_eq!(requeued, 1);
        assert_eq!(store.fetch_batch(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_only_old_published_rows() {
        let store = InMemoryOutboxStore::new();
        let id1 = store
            .enqueue(mk_event("user.answered", "u1", Priority::Normal))
            .unwrap();
        store
            .enqueue(mk_event("user.answered", "u2", Priority::Normal))
            .unwrap();
        store.mark_published(&[id1]).await.unwrap();

        let purged = store.purge_published(Duration::ZERO).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }
}
