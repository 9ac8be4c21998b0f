//! 任务仓储与查询接口
//!
//! 写仓储只能在工作单元的事务作用域内调用，`save` 和 `delete`
//! 会把聚合登记到作用域，事件随业务数据一起写入发件箱。

mod memory;

pub use memory::InMemoryTodoRepository;

use async_trait::async_trait;
use domain::{RepositoryResult, Todo, TodoId, WorkspaceId};

use crate::error::ApplicationResult;
use crate::outbox::OutboxTransaction;
use crate::unit_of_work::TxScope;

#[async_trait]
pub trait TodoRepository<Tx: OutboxTransaction>: Send + Sync + 'static {
    /// 在事务内读取并锁定任务
    async fn find_for_update(
        &self,
        scope: &mut TxScope<Tx>,
        id: TodoId,
    ) -> RepositoryResult<Option<Todo>>;

    async fn save(&self, scope: &mut TxScope<Tx>, todo: &mut Todo) -> RepositoryResult<()>;

    /// 删除任务。调用前应先执行 [`Todo::mark_deleted`] 以记录删除事件。
    async fn delete(&self, scope: &mut TxScope<Tx>, todo: &mut Todo) -> RepositoryResult<()>;
}

/// 只读查询。不存在的任务返回 `NotFound`，因此不会被缓存。
#[async_trait]
pub trait TodoQueries: Send + Sync {
    async fn get(&self, id: TodoId) -> ApplicationResult<Todo>;

    async fn list_by_workspace(&self, workspace_id: WorkspaceId) -> ApplicationResult<Vec<Todo>>;
}
