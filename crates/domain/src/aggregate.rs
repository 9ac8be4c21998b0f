//! 事件捕获聚合
//!
//! 聚合在状态变更时记录领域事件，事件只保存在内存中，
//! 由工作单元在同一事务内取走并写入发件箱。

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// 领域事件。
pub trait DomainEvent: Send + Sync + 'static {
    /// 事件名称，例如 `todo.created`
    fn event_name(&self) -> &'static str;

    /// 产生事件的聚合ID
    fn aggregate_id(&self) -> Uuid;

    /// 事件发生时间
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// 会记录领域事件的聚合根。
pub trait Aggregate {
    type Event: DomainEvent;

    /// 聚合类型，写入发件箱的 aggregate_type 列
    const AGGREGATE_TYPE: &'static str;

    fn aggregate_id(&self) -> Uuid;

    /// 尚未持久化的事件
    fn pending_events(&self) -> &[Self::Event];

    /// 取走并清空尚未持久化的事件
    fn take_events(&mut self) -> Vec<Self::Event>;
}

/// 聚合内嵌的事件记录器
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecorder<E> {
    events: Vec<E>,
}

impl<E> Default for EventRecorder<E> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

impl<E> EventRecorder<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: E) {
        self.events.push(event);
    }

    pub fn pending(&self) -> &[E] {
        &self.events
    }

    pub fn take(&mut self) -> Vec<E> {
        std::mem::take(&mut self.events)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
