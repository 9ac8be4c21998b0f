//! 领域事件定义
//!
//! 包含任务领域的事件，聚合在变更时记录，随后经发件箱对外投递。

pub mod todo_event;

// 重新导出事件类型
pub use todo_event::*;
