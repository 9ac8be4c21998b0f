// 内存任务仓储，写入暂存在 InMemoryTransaction 中，提交后生效
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use domain::{RepositoryResult, Todo, TodoEvent, TodoId, WorkspaceId};

use super::{TodoQueries, TodoRepository};
use crate::error::{ApplicationError, ApplicationResult};
use crate::mapper::{EventMapper, TodoEventMapper};
use crate::outbox::InMemoryTransaction;
use crate::unit_of_work::TxScope;

type Rows = Arc<Mutex<HashMap<TodoId, Todo>>>;

fn lock(rows: &Mutex<HashMap<TodoId, Todo>>) -> MutexGuard<'_, HashMap<TodoId, Todo>> {
    rows.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct InMemoryTodoRepository {
    rows: Rows,
    mapper: Arc<dyn EventMapper<TodoEvent>>,
    reads: Arc<AtomicUsize>,
}

impl Default for InMemoryTodoRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTodoRepository {
    pub fn new() -> Self {
        Self::with_mapper(Arc::new(TodoEventMapper))
    }

    pub fn with_mapper(mapper: Arc<dyn EventMapper<TodoEvent>>) -> Self {
        Self {
            rows: Arc::new(Mutex::new(HashMap::new())),
            mapper,
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 查询接口被调用的次数
    pub fn query_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TodoRepository<InMemoryTransaction> for InMemoryTodoRepository {
    async fn find_for_update(
        &self,
        _scope: &mut TxScope<InMemoryTransaction>,
        id: TodoId,
    ) -> RepositoryResult<Option<Todo>> {
        Ok(lock(&self.rows).get(&id).cloned())
    }

    async fn save(
        &self,
        scope: &mut TxScope<InMemoryTransaction>,
        todo: &mut Todo,
    ) -> RepositoryResult<()> {
        scope.collect(Arc::clone(&self.mapper), todo);

        let rows = Arc::clone(&self.rows);
        let row = todo.clone();
        scope
            .transaction()
            .stage(move || {
                lock(&rows).insert(row.id, row);
            });
        Ok(())
    }

    async fn delete(
        &self,
        scope: &mut TxScope<InMemoryTransaction>,
        todo: &mut Todo,
    ) -> RepositoryResult<()> {
        scope.collect(Arc::clone(&self.mapper), todo);

        let rows = Arc::clone(&self.rows);
        let id = todo.id;
        scope.transaction().stage(move || {
            lock(&rows).remove(&id);
        });
        Ok(())
    }
}

#[async_trait]
impl TodoQueries for InMemoryTodoRepository {
    async fn get(&self, id: TodoId) -> ApplicationResult<Todo> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        lock(&self.rows)
            .get(&id)
            .cloned()
            .ok_or_else(|| ApplicationError::not_found(format!("todo {id}")))
    }

    async fn list_by_workspace(&self, workspace_id: WorkspaceId) -> ApplicationResult<Vec<Todo>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut todos: Vec<Todo> = lock(&self.rows)
            .values()
            .filter(|todo| todo.workspace_id == workspace_id)
            .cloned()
            .collect();
        todos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(todos)
    }
}
