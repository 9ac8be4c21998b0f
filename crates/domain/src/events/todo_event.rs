//! 任务事件定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::DomainEvent;
use crate::value_objects::{TodoId, WorkspaceId};

pub const TODO_CREATED: &str = "todo.created";
pub const TODO_RENAMED: &str = "todo.renamed";
pub const TODO_COMPLETED: &str = "todo.completed";
pub const TODO_REOPENED: &str = "todo.reopened";
pub const TODO_DELETED: &str = "todo.deleted";

/// 所有任务事件类型，注册发件箱处理器时使用
pub const TODO_EVENT_TYPES: [&str; 5] = [
    TODO_CREATED,
    TODO_RENAMED,
    TODO_COMPLETED,
    TODO_REOPENED,
    TODO_DELETED,
];

/// 任务事件枚举
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TodoEvent {
    /// 任务创建
    Created {
        todo_id: TodoId,
        workspace_id: WorkspaceId,
        title: String,
        timestamp: DateTime<Utc>,
    },

    /// 任务重命名
    Renamed {
        todo_id: TodoId,
        workspace_id: WorkspaceId,
        title: String,
        timestamp: DateTime<Utc>,
    },

    /// 任务完成
    Completed {
        todo_id: TodoId,
        workspace_id: WorkspaceId,
        timestamp: DateTime<Utc>,
    },

    /// 任务重新打开
    Reopened {
        todo_id: TodoId,
        workspace_id: WorkspaceId,
        timestamp: DateTime<Utc>,
    },

    /// 任务删除
    Deleted {
        todo_id: TodoId,
        workspace_id: WorkspaceId,
        timestamp: DateTime<Utc>,
    },
}

impl TodoEvent {
    /// 事件所属的工作区
    pub fn workspace_id(&self) -> WorkspaceId {
        match self {
            TodoEvent::Created { workspace_id, .. }
            | TodoEvent::Renamed { workspace_id, .. }
            | TodoEvent::Completed { workspace_id, .. }
            | TodoEvent::Reopened { workspace_id, .. }
            | TodoEvent::Deleted { workspace_id, .. } => *workspace_id,
        }
    }

    pub fn todo_id(&self) -> TodoId {
        match self {
            TodoEvent::Created { todo_id, .. }
            | TodoEvent::Renamed { todo_id, .. }
            | TodoEvent::Completed { todo_id, .. }
            | TodoEvent::Reopened { todo_id, .. }
            | TodoEvent::Deleted { todo_id, .. } => *todo_id,
        }
    }
}

impl DomainEvent for TodoEvent {
    fn event_name(&self) -> &'static str {
        match self {
            TodoEvent::Created { .. } => TODO_CREATED,
            TodoEvent::Renamed { .. } => TODO_RENAMED,
            TodoEvent::Completed { .. } => TODO_COMPLETED,
            TodoEvent::Reopened { .. } => TODO_REOPENED,
            TodoEvent::Deleted { .. } => TODO_DELETED,
        }
    }

    fn aggregate_id(&self) -> Uuid {
        self.todo_id().into()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TodoEvent::Created { timestamp, .. }
            | TodoEvent::Renamed { timestamp, .. }
            | TodoEvent::Completed { timestamp, .. }
            | TodoEvent::Reopened { timestamp, .. }
            | TodoEvent::Deleted { timestamp, .. } => *timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_registered_types() {
        let todo_id = TodoId::generate();
        let workspace_id = WorkspaceId::generate();
        let event = TodoEvent::Completed {
            todo_id,
            workspace_id,
            timestamp: Utc::now(),
        };

        assert_eq!(event.event_name(), TODO_COMPLETED);
        assert!(TODO_EVENT_TYPES.contains(&event.event_name()));
        assert_eq!(event.aggregate_id(), Uuid::from(todo_id));
        assert_eq!(event.workspace_id(), workspace_id);
    }

    #[test]
    fn serialized_form_is_tagged() {
        let event = TodoEvent::Deleted {
            todo_id: TodoId::generate(),
            workspace_id: WorkspaceId::generate(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "deleted");
    }
}
