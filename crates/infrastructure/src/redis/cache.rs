// Redis 缓存存储：值用 SET PX，标签用 SET 集合，版本号用 INCR
use std::time::Duration;

use application::{CacheError, CacheStore};
use async_trait::async_trait;
use config::RedisConfig;
use redis::aio::ConnectionManager;
use redis::Client;

use crate::redis::{cache_error, RedisError, RedisResult};

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, u64::MAX as u128) as u64
}

#[derive(Clone)]
pub struct RedisCacheStore {
    connection: ConnectionManager,
}

impl RedisCacheStore {
    pub async fn connect(config: &RedisConfig) -> RedisResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| RedisError::ConfigError {
            message: format!("创建 Redis 客户端失败: {}", e),
        })?;
        Ok(Self::new(client.get_connection_manager().await?))
    }

    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(cache_error)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(cache_error)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(cache_error)
    }

    async fn add_to_tag(&self, tag: &str, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(tag)
            .arg(key)
            .ignore()
            .cmd("PEXPIRE")
            .arg(tag)
            .arg(millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(cache_error)
    }

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.connection.clone();
        redis::cmd("SMEMBERS")
            .arg(tag)
            .query_async(&mut conn)
            .await
            .map_err(cache_error)
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.connection.clone();
        redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(cache_error)
    }

    async fn counter(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.connection.clone();
        let value: Option<i64> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(value.unwrap_or(0))
    }
}
