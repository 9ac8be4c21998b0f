//! 应用层实现。
//!
//! 这里提供事务性发件箱、工作单元、发件箱中继、多代理发布、旁路缓存
//! 以及按房间隔离的实时推送中心，并在其上实现任务用例。

pub mod broker;
pub mod cache;
pub mod clock;
pub mod error;
pub mod mapper;
pub mod outbox;
pub mod realtime;
pub mod relay;
pub mod repository;
pub mod services;
pub mod unit_of_work;

pub use broker::{
    Broker, BrokerError, BrokerMessage, LocalBroker, MultiBrokerPublisher, RealtimeEnvelope,
};
pub use cache::{CacheAside, CacheError, CacheStore, MemoryCacheStore};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{ApplicationError, ApplicationResult};
pub use mapper::{EventMapper, MappedEvent, MappingError, TodoEventMapper};
pub use outbox::{
    InMemoryOutboxStore, NewOutboxRecord, OutboxBacklog, OutboxError, OutboxRecord, OutboxStore,
    OutboxTransaction,
};
pub use realtime::{
    room_filter, ConnectionHandle, Hub, HubConfig, HubError, MessageFilter, PermissionProvider,
    StaticPermissions,
};
pub use relay::{BatchReport, HandlerRegistry, OutboxHandler, OutboxRelay, RelayConfig, RelayHandles};
pub use repository::{InMemoryTodoRepository, TodoQueries, TodoRepository};
pub use services::{CachedTodoQueries, TodoService, TodoServiceDependencies, TodoUseCases};
pub use unit_of_work::{TxScope, UnitOfWork, UnitOfWorkError};
