use std::sync::Arc;

use async_trait::async_trait;
use domain::{DomainResult, Timestamp, Todo, TodoId, WorkspaceId};
use tracing::{info, warn};

use crate::cache::CacheAside;
use crate::clock::Clock;
use crate::error::{ApplicationError, ApplicationResult};
use crate::outbox::{OutboxStore, OutboxTransaction};
use crate::repository::{TodoQueries, TodoRepository};
use crate::unit_of_work::{TxScope, UnitOfWork};

use super::cached_queries::{todo_key, workspace_tag};

/// Web 层使用的任务用例
#[async_trait]
pub trait TodoUseCases: Send + Sync {
    async fn create(&self, workspace_id: WorkspaceId, title: String) -> ApplicationResult<Todo>;
    async fn rename(&self, id: TodoId, title: String) -> ApplicationResult<Todo>;
    async fn complete(&self, id: TodoId) -> ApplicationResult<Todo>;
    async fn reopen(&self, id: TodoId) -> ApplicationResult<Todo>;
    async fn delete(&self, id: TodoId) -> ApplicationResult<()>;
    async fn get(&self, id: TodoId) -> ApplicationResult<Todo>;
    async fn list(&self, workspace_id: WorkspaceId) -> ApplicationResult<Vec<Todo>>;
    /// 工作区版本号，每次写入后递增
    async fn revision(&self, workspace_id: WorkspaceId) -> ApplicationResult<i64>;
}

pub struct TodoServiceDependencies<S, R> {
    pub unit_of_work: UnitOfWork<S>,
    pub repository: Arc<R>,
    pub queries: Arc<dyn TodoQueries>,
    pub cache: Option<Arc<CacheAside>>,
    pub clock: Arc<dyn Clock>,
}

pub struct TodoService<S, R> {
    deps: TodoServiceDependencies<S, R>,
}

/// 提交后的缓存失效
#[derive(Clone)]
struct Invalidation {
    cache: Option<Arc<CacheAside>>,
}

impl Invalidation {
    fn register<Tx: OutboxTransaction>(&self, scope: &mut TxScope<Tx>, todo: &Todo) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let entity_key = todo_key(todo.id);
        let workspace_id = todo.workspace_id;

        // 两步互不依赖，任一失败都不阻止另一步
        scope.after_commit(move || async move {
            if let Err(err) = cache
                .invalidate_entity(&entity_key, &workspace_id.to_string())
                .await
            {
                warn!(key = %entity_key, error = %err, "实体缓存失效失败");
            }
            let tag = workspace_tag(workspace_id);
            if let Err(err) = cache.invalidate_tag(&tag).await {
                warn!(tag = %tag, error = %err, "工作区缓存失效失败");
            }
            Ok(())
        });
    }
}

impl<S, R> TodoService<S, R>
where
    S: OutboxStore,
    R: TodoRepository<S::Tx>,
{
    pub fn new(deps: TodoServiceDependencies<S, R>) -> Self {
        Self { deps }
    }

    fn invalidation(&self) -> Invalidation {
        Invalidation {
            cache: self.deps.cache.clone(),
        }
    }

    /// 读取、修改、保存同一个任务
    async fn mutate<F>(&self, id: TodoId, change: F) -> ApplicationResult<Todo>
    where
        F: FnOnce(&mut Todo, Timestamp) -> DomainResult<()> + Send + 'static,
    {
        let repository = Arc::clone(&self.deps.repository);
        let clock = Arc::clone(&self.deps.clock);
        let invalidation = self.invalidation();

        self.deps
            .unit_of_work
            .execute(move |scope| {
                Box::pin(async move {
                    let mut todo = repository
                        .find_for_update(scope, id)
                        .await?
                        .ok_or_else(|| ApplicationError::not_found(format!("todo {id}")))?;

                    change(&mut todo, clock.now())?;
                    repository.save(scope, &mut todo).await?;
                    invalidation.register(scope, &todo);
                    Ok::<_, ApplicationError>(todo)
                })
            })
            .await
    }
}

#[async_trait]
impl<S, R> TodoUseCases for TodoService<S, R>
where
    S: OutboxStore,
    R: TodoRepository<S::Tx>,
{
    async fn create(&self, workspace_id: WorkspaceId, title: String) -> ApplicationResult<Todo> {
        let repository = Arc::clone(&self.deps.repository);
        let clock = Arc::clone(&self.deps.clock);
        let invalidation = self.invalidation();

        let todo = self
            .deps
            .unit_of_work
            .execute(move |scope| {
                Box::pin(async move {
                    let mut todo = Todo::create(workspace_id, title, clock.now())?;
                    repository.save(scope, &mut todo).await?;
                    invalidation.register(scope, &todo);
                    Ok::<_, ApplicationError>(todo)
                })
            })
            .await?;

        info!(todo_id = %todo.id, workspace_id = %workspace_id, "任务已创建");
        Ok(todo)
    }

    async fn rename(&self, id: TodoId, title: String) -> ApplicationResult<Todo> {
        self.mutate(id, move |todo, now| todo.rename(title, now)).await
    }

    async fn complete(&self, id: TodoId) -> ApplicationResult<Todo> {
        self.mutate(id, |todo, now| {
            todo.complete(now);
            Ok(())
        })
        .await
    }

    async fn reopen(&self, id: TodoId) -> ApplicationResult<Todo> {
        self.mutate(id, |todo, now| {
            todo.reopen(now);
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: TodoId) -> ApplicationResult<()> {
        let repository = Arc::clone(&self.deps.repository);
        let clock = Arc::clone(&self.deps.clock);
        let invalidation = self.invalidation();

        self.deps
            .unit_of_work
            .execute(move |scope| {
                Box::pin(async move {
                    let mut todo = repository
                        .find_for_update(scope, id)
                        .await?
                        .ok_or_else(|| ApplicationError::not_found(format!("todo {id}")))?;

                    todo.mark_deleted(clock.now());
                    repository.delete(scope, &mut todo).await?;
                    invalidation.register(scope, &todo);
                    Ok::<_, ApplicationError>(())
                })
            })
            .await?;

        info!(todo_id = %id, "任务已删除");
        Ok(())
    }

    async fn get(&self, id: TodoId) -> ApplicationResult<Todo> {
        self.deps.queries.get(id).await
    }

    async fn list(&self, workspace_id: WorkspaceId) -> ApplicationResult<Vec<Todo>> {
        self.deps.queries.list_by_workspace(workspace_id).await
    }

    async fn revision(&self, workspace_id: WorkspaceId) -> ApplicationResult<i64> {
        match &self.deps.cache {
            Some(cache) => Ok(cache.revision(&workspace_id.to_string()).await?),
            None => Ok(0),
        }
    }
}
