//! 事务性发件箱
//!
//! 业务数据与待投递事件在同一个数据库事务内写入，
//! 由后台中继异步投递到消息代理。

mod memory;
mod store;

pub use memory::{InMemoryOutboxStore, InMemoryTransaction};
pub use store::{OutboxStore, OutboxTransaction};

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// 事件头信息
pub type Headers = BTreeMap<String, String>;

/// 即将写入发件箱的记录
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxRecord {
    pub id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub created_at: DateTime<Utc>,
}

/// 发件箱中已持久化的记录
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub retries: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// 尚未处理的记录才会被中继看到
    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }
}

impl From<NewOutboxRecord> for OutboxRecord {
    fn from(record: NewOutboxRecord) -> Self {
        Self {
            id: record.id,
            event_type: record.event_type,
            aggregate_type: record.aggregate_type,
            aggregate_id: record.aggregate_id,
            payload: record.payload,
            headers: record.headers,
            retries: 0,
            last_error: None,
            created_at: record.created_at,
            processed_at: None,
        }
    }
}

/// 积压情况快照
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OutboxBacklog {
    pub pending: u64,
    pub oldest_created_at: Option<DateTime<Utc>>,
}

impl OutboxBacklog {
    /// 最老的未处理记录已等待的时长，没有积压时为零
    pub fn oldest_age(&self, now: DateTime<Utc>) -> Duration {
        self.oldest_created_at
            .and_then(|created_at| (now - created_at).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}

/// 发件箱错误
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("发件箱存储错误: {0}")]
    Storage(String),

    #[error("发件箱记录不存在: {0}")]
    NotFound(Uuid),

    #[error("事务提交失败: {0}")]
    Commit(String),
}

impl OutboxError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}
