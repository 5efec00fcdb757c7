//! 持久化实现（persist）
//!
//! 事务性发件箱的 Postgres 适配：入队参与调用方事务，
//! 拉取使用 `FOR UPDATE SKIP LOCKED` 实现多副本无争用领取。
//!
mod outbox_pg;

pub use outbox_pg::{DDL, PgOutboxStore};
