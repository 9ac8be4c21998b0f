use std::sync::Arc;

use application::{
    ApplicationError, ApplicationResult, EventMapper, TodoEventMapper, TodoQueries, TodoRepository,
    TxScope,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{RepositoryError, RepositoryResult, Todo, TodoEvent, TodoId, WorkspaceId};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::outbox_store::PgOutboxTransaction;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    RepositoryError::storage(err.to_string())
}

const TODO_COLUMNS: &str =
    "id, workspace_id, title, completed, created_at, updated_at, completed_at";

#[derive(Debug, FromRow)]
struct TodoRecord {
    id: Uuid,
    workspace_id: Uuid,
    title: String,
    completed: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<TodoRecord> for Todo {
    fn from(value: TodoRecord) -> Self {
        Todo::restore(
            TodoId::from(value.id),
            WorkspaceId::from(value.workspace_id),
            value.title,
            value.completed,
            value.created_at,
            value.updated_at,
            value.completed_at,
        )
    }
}

/// Postgres 任务仓储。写方法运行在工作单元的事务里，读方法直接走连接池。
#[derive(Clone)]
pub struct PgTodoRepository {
    pool: PgPool,
    mapper: Arc<dyn EventMapper<TodoEvent>>,
}

impl PgTodoRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            mapper: Arc::new(TodoEventMapper),
        }
    }
}

#[async_trait]
impl TodoRepository<PgOutboxTransaction> for PgTodoRepository {
    async fn find_for_update(
        &self,
        scope: &mut TxScope<PgOutboxTransaction>,
        id: TodoId,
    ) -> RepositoryResult<Option<Todo>> {
        let record = sqlx::query_as::<_, TodoRecord>(&format!(
            "SELECT {TODO_COLUMNS} FROM todos WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(scope.transaction().connection())
        .await
        .map_err(map_sqlx_err)?;

        Ok(record.map(Todo::from))
    }

    async fn save(
        &self,
        scope: &mut TxScope<PgOutboxTransaction>,
        todo: &mut Todo,
    ) -> RepositoryResult<()> {
        sqlx::query(
            r#"INSERT INTO todos (id, workspace_id, title, completed, created_at, updated_at, completed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (id) DO UPDATE SET
                   title = EXCLUDED.title,
                   completed = EXCLUDED.completed,
                   updated_at = EXCLUDED.updated_at,
                   completed_at = EXCLUDED.completed_at"#,
        )
        .bind(todo.id.as_uuid())
        .bind(todo.workspace_id.as_uuid())
        .bind(&todo.title)
        .bind(todo.completed)
        .bind(todo.created_at)
        .bind(todo.updated_at)
        .bind(todo.completed_at)
        .execute(scope.transaction().connection())
        .await
        .map_err(map_sqlx_err)?;

        scope.collect(Arc::clone(&self.mapper), todo);
        Ok(())
    }

    async fn delete(
        &self,
        scope: &mut TxScope<PgOutboxTransaction>,
        todo: &mut Todo,
    ) -> RepositoryResult<()> {
        let result = sqlx::query("DELETE FROM todos WHERE id = $1")
            .bind(todo.id.as_uuid())
            .execute(scope.transaction().connection())
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        scope.collect(Arc::clone(&self.mapper), todo);
        Ok(())
    }
}

#[async_trait]
impl TodoQueries for PgTodoRepository {
    async fn get(&self, id: TodoId) -> ApplicationResult<Todo> {
        let record = sqlx::query_as::<_, TodoRecord>(&format!(
            "SELECT {TODO_COLUMNS} FROM todos WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record
            .map(Todo::from)
            .ok_or_else(|| ApplicationError::not_found(format!("todo {id}")))
    }

    async fn list_by_workspace(&self, workspace_id: WorkspaceId) -> ApplicationResult<Vec<Todo>> {
        let records = sqlx::query_as::<_, TodoRecord>(&format!(
            "SELECT {TODO_COLUMNS} FROM todos WHERE workspace_id = $1 ORDER BY created_at, id"
        ))
        .bind(workspace_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(records.into_iter().map(Todo::from).collect())
    }
}
