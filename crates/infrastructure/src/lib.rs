//! 基础设施层实现。
//!
//! 提供 PostgreSQL 发件箱与仓储、Redis/Kafka 代理适配器、Redis 缓存与频道监听，
//! 实现应用层定义的接口。

pub mod db;
pub mod kafka;
pub mod membership;
pub mod outbox_store;
pub mod redis;
pub mod retry;
pub mod todo_repository;

pub use crate::db::{create_pg_pool, MIGRATOR};
pub use crate::kafka::{KafkaBroker, KafkaError};
pub use crate::membership::PgWorkspaceMembership;
pub use crate::outbox_store::{PgOutboxStore, PgOutboxTransaction};
pub use crate::redis::{RedisBroker, RedisCacheStore, RedisChannelListener, RedisError};
pub use crate::retry::Backoff;
pub use crate::todo_repository::PgTodoRepository;
