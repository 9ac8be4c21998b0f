//! Kafka 代理适配器
//!
//! 主题按事件作用域划分（`{topic_prefix}.{scope}`），记录键为
//! `{event_type}.{aggregate_id}`，同一聚合的事件落在同一分区，保持顺序。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use application::{Broker, BrokerError, BrokerMessage};
use async_trait::async_trait;
use config::KafkaConfig;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, info, warn};

use crate::kafka::{KafkaError, KafkaResult};

const NAME: &str = "kafka";
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// 事件类型与聚合ID以固定头写入，其余头原样透传
pub const HEADER_EVENT_TYPE: &str = "event_type";
pub const HEADER_AGGREGATE_ID: &str = "aggregate_id";

pub fn topic_name(topic_prefix: &str, message: &BrokerMessage) -> String {
    format!("{}.{}", topic_prefix, message.scope())
}

fn record_headers(message: &BrokerMessage) -> OwnedHeaders {
    let aggregate_id = message.aggregate_id.to_string();
    let mut headers = OwnedHeaders::new_with_capacity(message.headers.len() + 2)
        .insert(Header {
            key: HEADER_EVENT_TYPE,
            value: Some(message.event_type.as_str()),
        })
        .insert(Header {
            key: HEADER_AGGREGATE_ID,
            value: Some(aggregate_id.as_str()),
        });
    for (key, value) in &message.headers {
        headers = headers.insert(Header {
            key: key.as_str(),
            value: Some(value.as_str()),
        });
    }
    headers
}

/// Kafka 代理
pub struct KafkaBroker {
    producer: FutureProducer,
    topic_prefix: String,
    send_timeout: Duration,
    closed: AtomicBool,
}

impl KafkaBroker {
    /// 创建幂等生产者。librdkafka 延迟建立连接，这里不会访问集群。
    pub fn new(config: &KafkaConfig) -> KafkaResult<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", config.brokers.join(","))
            .set("message.timeout.ms", config.send_timeout_ms.to_string())
            .set("acks", &config.acks)
            .set("compression.type", "snappy") // 启用压缩
            .set("enable.idempotence", "true") // 启用幂等性
            .set("max.in.flight.requests.per.connection", "5");

        let producer: FutureProducer =
            client_config
                .create()
                .map_err(|e| KafkaError::ConfigError {
                    message: format!("创建 Kafka 生产者失败: {}", e),
                })?;

        info!("Kafka 生产者创建成功，连接到: {}", config.brokers.join(","));

        Ok(Self {
            producer,
            topic_prefix: config.topic_prefix.clone(),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            closed: AtomicBool::new(false),
        })
    }

    pub fn topic_for(&self, message: &BrokerMessage) -> String {
        topic_name(&self.topic_prefix, message)
    }

    /// 刷新生产者缓冲区
    pub fn flush(&self) -> KafkaResult<()> {
        self.producer
            .flush(Timeout::After(FLUSH_TIMEOUT))
            .map_err(KafkaError::from)
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    fn name(&self) -> &str {
        NAME
    }

    async fn publish(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed(NAME.to_string()));
        }

        let topic = self.topic_for(message);
        let key = message.ordering_key();
        let record = FutureRecord::to(&topic)
            .payload(&message.payload)
            .key(&key)
            .headers(record_headers(message));

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok(_) => {
                debug!(topic = %topic, event_id = %message.event_id, "Kafka 投递成功");
                Ok(())
            }
            Err((err, _)) => {
                warn!(topic = %topic, event_id = %message.event_id, error = %err, "Kafka 投递失败");
                Err(KafkaError::from(err).into())
            }
        }
    }

    /// 停止接受新消息并刷新缓冲区
    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Kafka 生产者正在关闭");
        self.flush().map_err(BrokerError::from)
    }
}
