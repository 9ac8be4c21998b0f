//! 任务管理系统核心领域模型
//!
//! 包含任务聚合、领域事件以及事件捕获的基础抽象。

pub mod aggregate;
pub mod entities;
pub mod errors;
pub mod events;
pub mod value_objects;

// 重新导出常用类型
pub use aggregate::*;
pub use entities::*;
pub use errors::*;
pub use events::*;
pub use value_objects::*;
