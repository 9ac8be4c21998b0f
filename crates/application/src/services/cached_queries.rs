use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{Todo, TodoId, WorkspaceId};

use crate::cache::{keys, BinaryCodec, CacheAside, JsonCodec};
use crate::error::ApplicationResult;
use crate::repository::TodoQueries;

pub const TODO_KIND: &str = "todo";
pub const WORKSPACE_KIND: &str = "workspace";
const LIST_BY_WORKSPACE: &str = "todos_by_workspace";

pub fn todo_key(id: TodoId) -> String {
    keys::entity(TODO_KIND, id)
}

pub fn workspace_list_key(workspace_id: WorkspaceId) -> String {
    keys::query(LIST_BY_WORKSPACE, [workspace_id])
}

pub fn workspace_tag(workspace_id: WorkspaceId) -> String {
    keys::tag(WORKSPACE_KIND, workspace_id)
}

/// 查询缓存装饰器。实体键与列表键都登记在所属工作区的标签下。
pub struct CachedTodoQueries<Q> {
    inner: Arc<Q>,
    cache: Arc<CacheAside>,
    entity_ttl: Duration,
    query_ttl: Duration,
}

impl<Q> CachedTodoQueries<Q> {
    pub fn new(inner: Arc<Q>, cache: Arc<CacheAside>, entity_ttl: Duration, query_ttl: Duration) -> Self {
        Self {
            inner,
            cache,
            entity_ttl,
            query_ttl,
        }
    }
}

#[async_trait]
impl<Q> TodoQueries for CachedTodoQueries<Q>
where
    Q: TodoQueries + 'static,
{
    async fn get(&self, id: TodoId) -> ApplicationResult<Todo> {
        let inner = Arc::clone(&self.inner);
        self.cache
            .get_or_fetch_with(
                &todo_key(id),
                self.entity_ttl,
                BinaryCodec::<Todo>::new(),
                move || async move { inner.get(id).await },
                |todo: &Todo| vec![workspace_tag(todo.workspace_id)],
            )
            .await
    }

    async fn list_by_workspace(&self, workspace_id: WorkspaceId) -> ApplicationResult<Vec<Todo>> {
        let inner = Arc::clone(&self.inner);
        self.cache
            .get_or_fetch(
                &workspace_list_key(workspace_id),
                self.query_ttl,
                JsonCodec::<Vec<Todo>>::new(),
                move || async move { inner.list_by_workspace(workspace_id).await },
                &[workspace_tag(workspace_id)],
            )
            .await
    }
}
