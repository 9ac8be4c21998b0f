//! 消息代理抽象与多代理发布器
//!
//! 每个代理适配器只需要实现 [`Broker`]，发布器按注册顺序依次投递，
//! 遇到第一个失败即返回，由中继在下一轮重试整条记录。

mod local;

pub use local::LocalBroker;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::mapper::{HEADER_EVENT_ID, HEADER_ROOM_ID};
use crate::outbox::{Headers, OutboxRecord};
use crate::relay::OutboxHandler;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{broker} 发布失败: {message}")]
    Publish { broker: String, message: String },

    #[error("{broker} 连接失败: {message}")]
    Connection { broker: String, message: String },

    #[error("消息编码失败: {0}")]
    Encoding(String),

    #[error("{0} 已关闭")]
    Closed(String),
}

impl BrokerError {
    pub fn publish(broker: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            broker: broker.into(),
            message: message.into(),
        }
    }

    pub fn connection(broker: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            broker: broker.into(),
            message: message.into(),
        }
    }
}

/// 投递给代理的一条消息
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_id: Uuid,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl BrokerMessage {
    /// 从发件箱记录构造，补充 `event_id` 头供消费端去重
    pub fn from_record(record: &OutboxRecord) -> Self {
        let mut headers = record.headers.clone();
        headers.insert(HEADER_EVENT_ID.to_string(), record.id.to_string());

        Self {
            event_id: record.id,
            event_type: record.event_type.clone(),
            aggregate_id: record.aggregate_id,
            payload: record.payload.clone(),
            headers,
        }
    }

    /// 单聚合有序键：`{event_type}.{aggregate_id}`
    pub fn ordering_key(&self) -> String {
        format!("{}.{}", self.event_type, self.aggregate_id)
    }

    /// 事件类型的第一段，例如 `todo.created` 的 `todo`
    pub fn scope(&self) -> &str {
        self.event_type
            .split('.')
            .next()
            .filter(|scope| !scope.is_empty())
            .unwrap_or(self.event_type.as_str())
    }

    pub fn room_id(&self) -> Option<&str> {
        self.headers.get(HEADER_ROOM_ID).map(String::as_str)
    }
}

/// 频道类代理发布、实时推送中心过滤的 JSON 消息体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub data: serde_json::Value,
}

impl RealtimeEnvelope {
    pub fn from_message(message: &BrokerMessage) -> Result<Self, BrokerError> {
        let data = if message.payload.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&message.payload)
                .map_err(|err| BrokerError::Encoding(err.to_string()))?
        };

        Ok(Self {
            event_id: message.event_id,
            event_type: message.event_type.clone(),
            aggregate_id: message.aggregate_id,
            room_id: message.room_id().map(str::to_string),
            data,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(self).map_err(|err| BrokerError::Encoding(err.to_string()))
    }
}

/// 消息代理适配器
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, message: &BrokerMessage) -> Result<(), BrokerError>;

    /// 释放连接，之后不再接受发布
    async fn close(&self) -> Result<(), BrokerError>;
}

/// 多代理发布器
#[derive(Clone, Default)]
pub struct MultiBrokerPublisher {
    brokers: Vec<Arc<dyn Broker>>,
}

impl MultiBrokerPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.brokers.push(broker);
        self
    }

    pub fn broker_names(&self) -> Vec<&str> {
        self.brokers.iter().map(|b| b.name()).collect()
    }

    /// 依次发布到每个代理，遇到第一个错误立即返回
    pub async fn publish(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
        for broker in &self.brokers {
            if let Err(err) = broker.publish(message).await {
                warn!(
                    broker = broker.name(),
                    event_id = %message.event_id,
                    event_type = %message.event_type,
                    error = %err,
                    "代理发布失败，停止向后续代理投递"
                );
                return Err(err);
            }
            debug!(
                broker = broker.name(),
                event_id = %message.event_id,
                "代理发布成功"
            );
        }
        Ok(())
    }

    /// 关闭所有代理，返回第一个错误
    pub async fn close(&self) -> Result<(), BrokerError> {
        let mut first_error = None;
        for broker in &self.brokers {
            if let Err(err) = broker.close().await {
                warn!(broker = broker.name(), error = %err, "关闭代理失败");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl OutboxHandler for MultiBrokerPublisher {
    async fn handle(&self, record: &OutboxRecord) -> anyhow::Result<()> {
        let message = BrokerMessage::from_record(record);
        self.publish(&message).await?;
        Ok(())
    }
}
