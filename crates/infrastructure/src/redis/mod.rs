//! Redis 模块
//!
//! 提供 Pub/Sub 代理适配器、推送中心的频道监听以及缓存存储。

pub mod cache;
pub mod error;
pub mod publisher;
pub mod subscriber;

// 重新导出
pub use cache::*;
pub use error::*;
pub use publisher::*;
pub use subscriber::*;
