//! Kafka 错误类型定义

use application::BrokerError;
use thiserror::Error;

/// Kafka 操作错误
#[derive(Error, Debug)]
pub enum KafkaError {
    /// 连接错误
    #[error("Kafka 连接错误: {message}")]
    ConnectionError { message: String },

    /// 生产者错误
    #[error("Kafka 生产者错误: {message}")]
    ProducerError { message: String },

    /// 配置错误
    #[error("配置错误: {message}")]
    ConfigError { message: String },
}

/// Kafka 结果类型
pub type KafkaResult<T> = Result<T, KafkaError>;

impl From<rdkafka::error::KafkaError> for KafkaError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        match err {
            rdkafka::error::KafkaError::ClientConfig(..) => KafkaError::ConfigError {
                message: err.to_string(),
            },
            rdkafka::error::KafkaError::Canceled => KafkaError::ProducerError {
                message: "操作被取消".to_string(),
            },
            rdkafka::error::KafkaError::MessageProduction(_)
            | rdkafka::error::KafkaError::Flush(_) => KafkaError::ProducerError {
                message: err.to_string(),
            },
            _ => KafkaError::ConnectionError {
                message: err.to_string(),
            },
        }
    }
}

impl From<KafkaError> for BrokerError {
    fn from(err: KafkaError) -> Self {
        match err {
            KafkaError::ConnectionError { message } => BrokerError::connection("kafka", message),
            other => BrokerError::publish("kafka", other.to_string()),
        }
    }
}
