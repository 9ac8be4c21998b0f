//! 任务实体定义
//!
//! 任务属于某个工作区，所有变更都会在聚合内部记录对应的领域事件。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{Aggregate, EventRecorder};
use crate::errors::{DomainError, DomainResult};
use crate::events::TodoEvent;
use crate::value_objects::{Timestamp, TodoId, WorkspaceId};

/// 标题最大长度
pub const MAX_TITLE_LEN: usize = 200;

/// 任务实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub id: TodoId,
    pub workspace_id: WorkspaceId,
    pub title: String,
    pub completed: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    #[serde(skip)]
    events: EventRecorder<TodoEvent>,
}

impl Todo {
    /// 创建新任务并记录 `todo.created`
    pub fn create(
        workspace_id: WorkspaceId,
        title: impl Into<String>,
        now: Timestamp,
    ) -> DomainResult<Self> {
        let title = Self::validate_title(title.into())?;
        let id = TodoId::generate();

        let mut todo = Self {
            id,
            workspace_id,
            title: title.clone(),
            completed: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
            events: EventRecorder::new(),
        };
        todo.events.record(TodoEvent::Created {
            todo_id: id,
            workspace_id,
            title,
            timestamp: now,
        });
        Ok(todo)
    }

    /// 从存储中重建任务，不产生任何事件
    pub fn restore(
        id: TodoId,
        workspace_id: WorkspaceId,
        title: String,
        completed: bool,
        created_at: Timestamp,
        updated_at: Timestamp,
        completed_at: Option<Timestamp>,
    ) -> Self {
        Self {
            id,
            workspace_id,
            title,
            completed,
            created_at,
            updated_at,
            completed_at,
            events: EventRecorder::new(),
        }
    }

    pub fn rename(&mut self, title: impl Into<String>, now: Timestamp) -> DomainResult<()> {
        let title = Self::validate_title(title.into())?;
        if title == self.title {
            return Ok(());
        }

        self.title = title.clone();
        self.updated_at = now;
        self.events.record(TodoEvent::Renamed {
            todo_id: self.id,
            workspace_id: self.workspace_id,
            title,
            timestamp: now,
        });
        Ok(())
    }

    /// 完成任务。已完成的任务再次完成不会产生事件。
    pub fn complete(&mut self, now: Timestamp) {
        if self.completed {
            return;
        }

        self.completed = true;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.events.record(TodoEvent::Completed {
            todo_id: self.id,
            workspace_id: self.workspace_id,
            timestamp: now,
        });
    }

    pub fn reopen(&mut self, now: Timestamp) {
        if !self.completed {
            return;
        }

        self.completed = false;
        self.completed_at = None;
        self.updated_at = now;
        self.events.record(TodoEvent::Reopened {
            todo_id: self.id,
            workspace_id: self.workspace_id,
            timestamp: now,
        });
    }

    /// 标记删除，真正的删除由仓储完成
    pub fn mark_deleted(&mut self, now: Timestamp) {
        self.updated_at = now;
        self.events.record(TodoEvent::Deleted {
            todo_id: self.id,
            workspace_id: self.workspace_id,
            timestamp: now,
        });
    }

    fn validate_title(title: String) -> DomainResult<String> {
        let trimmed = title.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation_error("title", "标题不能为空"));
        }
        if trimmed.chars().count() > MAX_TITLE_LEN {
            return Err(DomainError::validation_error(
                "title",
                format!("标题长度不能超过 {} 个字符", MAX_TITLE_LEN),
            ));
        }
        Ok(trimmed.to_string())
    }
}

impl Aggregate for Todo {
    type Event = TodoEvent;

    const AGGREGATE_TYPE: &'static str = "todo";

    fn aggregate_id(&self) -> Uuid {
        self.id.into()
    }

    fn pending_events(&self) -> &[TodoEvent] {
        self.events.pending()
    }

    fn take_events(&mut self) -> Vec<TodoEvent> {
        self.events.take()
    }
}
