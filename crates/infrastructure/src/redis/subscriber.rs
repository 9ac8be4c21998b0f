//! Redis 频道监听
//!
//! 推送中心只订阅一次：全局频道加上配置的作用域频道。连接断开后按指数退避重连，
//! 收到取消信号或推送中心关闭后退出。

use std::time::Duration;

use application::Hub;
use config::{HubSettings, RedisConfig};
use futures::StreamExt;
use redis::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::redis::{channel_name, RedisError, RedisResult};
use crate::retry::Backoff;

pub struct RedisChannelListener {
    client: Client,
    channels: Vec<String>,
    backoff: Backoff,
}

impl RedisChannelListener {
    pub fn new(client: Client, channels: Vec<String>) -> Self {
        Self {
            client,
            channels,
            backoff: Backoff::exponential(Duration::from_millis(500), Duration::from_secs(30)),
        }
    }

    pub fn from_config(redis: &RedisConfig, hub: &HubSettings) -> RedisResult<Self> {
        let client = Client::open(redis.url.as_str()).map_err(|e| RedisError::ConfigError {
            message: format!("创建 Redis 客户端失败: {}", e),
        })?;

        let mut channels = vec![hub.global_channel.clone()];
        for scope in &hub.scope_channels {
            let channel = channel_name(&redis.channel_prefix, scope);
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
        Ok(Self::new(client, channels))
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// 把订阅到的消息交给推送中心，直到取消
    pub async fn run(&self, hub: Hub, token: CancellationToken) {
        let mut failures = 0u32;

        loop {
            if token.is_cancelled() || hub.is_shutting_down() {
                break;
            }

            match self.listen_once(&hub, &token).await {
                Ok(()) => {
                    if token.is_cancelled() || hub.is_shutting_down() {
                        break;
                    }
                    failures = 0;
                    warn!("Redis 订阅流已结束，准备重连");
                }
                Err(e) => {
                    failures += 1;
                    error!(attempt = failures, error = %e, "Redis 订阅失败");
                }
            }

            let delay = self.backoff.delay_at(failures.max(1));
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Redis 频道监听已停止");
    }

    async fn listen_once(&self, hub: &Hub, token: &CancellationToken) -> RedisResult<()> {
        let mut pubsub =
            self.client
                .get_async_pubsub()
                .await
                .map_err(|e| RedisError::ConnectionError {
                    message: format!("获取 PubSub 连接失败: {}", e),
                })?;

        pubsub
            .subscribe(&self.channels)
            .await
            .map_err(|e| RedisError::SubscribeError {
                message: format!("订阅频道 {:?} 失败: {}", self.channels, e),
            })?;

        info!(channels = ?self.channels, "已订阅 {} 个频道", self.channels.len());

        let messages = pubsub.on_message().filter_map(|msg| async move {
            match msg.get_payload::<Vec<u8>>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    debug!(channel = msg.get_channel_name(), error = %e, "无法读取消息负载");
                    None
                }
            }
        });
        hub.listen(Box::pin(messages), token.clone()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribes_global_and_scope_channels_once() {
        let redis = RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
            channel_prefix: "taskhub:events:".to_string(),
        };
        let hub = HubSettings {
            queue_capacity: 8,
            ping_interval_secs: 30,
            pong_timeout_secs: 75,
            global_channel: "taskhub:events:todo".to_string(),
            scope_channels: vec!["todo".to_string(), "workspace".to_string()],
        };

        let listener = RedisChannelListener::from_config(&redis, &hub).unwrap();
        assert_eq!(
            listener.channels(),
            ["taskhub:events:todo", "taskhub:events:workspace"]
        );
    }
}
