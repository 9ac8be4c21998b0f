mod cached_queries;
mod todo_service;

pub use cached_queries::{todo_key, workspace_list_key, workspace_tag, CachedTodoQueries};
pub use todo_service::{TodoService, TodoServiceDependencies, TodoUseCases};
