//! Kafka 消息队列模块
//!
//! 提供按聚合分区的 Kafka 代理适配器。

pub mod error;
pub mod producer;

// 重新导出
pub use error::*;
pub use producer::*;
