//! Redis 代理适配器
//!
//! 把事件封装为 `RealtimeEnvelope` JSON，PUBLISH 到 `{channel_prefix}{scope}` 频道，
//! 推送中心订阅这些频道并按 `room_id` 过滤。

use std::sync::atomic::{AtomicBool, Ordering};

use application::{Broker, BrokerError, BrokerMessage, RealtimeEnvelope};
use async_trait::async_trait;
use config::RedisConfig;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{debug, info};

use crate::redis::{RedisError, RedisResult};

const NAME: &str = "redis";

pub fn channel_name(channel_prefix: &str, scope: &str) -> String {
    format!("{channel_prefix}{scope}")
}

/// Redis 发布者
pub struct RedisBroker {
    connection: ConnectionManager,
    channel_prefix: String,
    closed: AtomicBool,
}

impl RedisBroker {
    /// 建立自动重连的连接
    pub async fn connect(config: &RedisConfig) -> RedisResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| RedisError::ConfigError {
            message: format!("创建 Redis 客户端失败: {}", e),
        })?;
        let connection = client.get_connection_manager().await?;

        info!("Redis 发布者创建成功，频道前缀: {}", config.channel_prefix);
        Ok(Self::with_connection(connection, config.channel_prefix.clone()))
    }

    pub fn with_connection(connection: ConnectionManager, channel_prefix: impl Into<String>) -> Self {
        Self {
            connection,
            channel_prefix: channel_prefix.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn channel_for(&self, message: &BrokerMessage) -> String {
        channel_name(&self.channel_prefix, message.scope())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &str {
        NAME
    }

    async fn publish(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed(NAME.to_string()));
        }

        let channel = self.channel_for(message);
        let payload = RealtimeEnvelope::from_message(message)?.to_bytes()?;

        let mut connection = self.connection.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(payload)
            .query_async(&mut connection)
            .await
            .map_err(|e| RedisError::PublishError {
                message: format!("发布到频道 {} 失败: {}", channel, e),
            })?;

        debug!(channel = %channel, event_id = %message.event_id, receivers, "Redis 发布成功");
        Ok(())
    }

    /// 连接由 ConnectionManager 持有，关闭后拒绝新的发布
    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Redis 发布者已关闭");
        }
        Ok(())
    }
}
