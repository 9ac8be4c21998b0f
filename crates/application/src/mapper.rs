//! 领域事件到发件箱负载的映射

use domain::{DomainEvent, TodoEvent};
use thiserror::Error;

use crate::outbox::Headers;

/// 头信息：事件所属房间（工作区）
pub const HEADER_ROOM_ID: &str = "room_id";
pub const HEADER_CONTENT_TYPE: &str = "content_type";
/// 由发布器补充，供消费端去重
pub const HEADER_EVENT_ID: &str = "event_id";

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// 可直接写入发件箱的事件
#[derive(Debug, Clone, PartialEq)]
pub struct MappedEvent {
    pub event_type: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("事件序列化失败: {0}")]
    Serialization(String),

    #[error("无法映射事件 {event_type}: {reason}")]
    Rejected { event_type: String, reason: String },
}

impl From<serde_json::Error> for MappingError {
    fn from(err: serde_json::Error) -> Self {
        MappingError::Serialization(err.to_string())
    }
}

/// 每种聚合各自的事件映射器。返回 `Ok(None)` 表示跳过该事件。
pub trait EventMapper<E>: Send + Sync {
    fn map_event(&self, event: &E) -> Result<Option<MappedEvent>, MappingError>;
}

/// 任务事件映射器，负载为 JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct TodoEventMapper;

impl EventMapper<TodoEvent> for TodoEventMapper {
    fn map_event(&self, event: &TodoEvent) -> Result<Option<MappedEvent>, MappingError> {
        let payload = serde_json::to_vec(event)?;

        let mut headers = Headers::new();
        headers.insert(HEADER_ROOM_ID.to_string(), event.workspace_id().to_string());
        headers.insert(HEADER_CONTENT_TYPE.to_string(), CONTENT_TYPE_JSON.to_string());

        Ok(Some(MappedEvent {
            event_type: event.event_name().to_string(),
            payload,
            headers,
        }))
    }
}
