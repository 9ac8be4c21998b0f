use std::sync::Arc;
use std::time::Duration;

use application::services::{todo_key, workspace_list_key};
use application::{CacheError, CacheStore};
use async_trait::async_trait;
use application::{
    ApplicationError, CacheAside, CachedTodoQueries, InMemoryOutboxStore, InMemoryTodoRepository,
    FixedClock, MemoryCacheStore, TodoService, TodoServiceDependencies, TodoUseCases, UnitOfWork,
};
use chrono::{TimeZone, Utc};
use domain::{DomainError, Timestamp, TodoId, WorkspaceId};

fn fixed_now() -> Timestamp {
    Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap()
}

struct Fixture {
    service: TodoService<InMemoryOutboxStore, InMemoryTodoRepository>,
    outbox: Arc<InMemoryOutboxStore>,
    repository: Arc<InMemoryTodoRepository>,
    cache_store: Arc<MemoryCacheStore>,
    cache: Arc<CacheAside>,
}

/// 版本计数器不可用，其余操作委托给内存存储
struct BrokenCounters(Arc<MemoryCacheStore>);

#[async_trait]
impl CacheStore for BrokenCounters {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.0.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.0.set(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        self.0.delete(keys).await
    }

    async fn add_to_tag(&self, tag: &str, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.0.add_to_tag(tag, key, ttl).await
    }

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>, CacheError> {
        self.0.tag_members(tag).await
    }

    async fn incr(&self, _key: &str) -> Result<i64, CacheError> {
        Err(CacheError::store("INCR unavailable"))
    }

    async fn counter(&self, key: &str) -> Result<i64, CacheError> {
        self.0.counter(key).await
    }
}

impl Fixture {
    fn new() -> Self {
        let cache_store = Arc::new(MemoryCacheStore::new());
        Self::with_store(cache_store.clone(), cache_store)
    }

    /// `cache_store` 用于断言缓存内容，`store` 是 CacheAside 实际使用的后端
    fn with_store(cache_store: Arc<MemoryCacheStore>, store: Arc<dyn CacheStore>) -> Self {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let repository = Arc::new(InMemoryTodoRepository::new());
        let cache = Arc::new(CacheAside::new(store, "taskhub"));
        let queries = Arc::new(CachedTodoQueries::new(
            Arc::clone(&repository),
            Arc::clone(&cache),
            Duration::from_secs(60),
            Duration::from_secs(30),
        ));

        let service = TodoService::new(TodoServiceDependencies {
            unit_of_work: UnitOfWork::new(Arc::clone(&outbox)),
            repository: Arc::clone(&repository),
            queries,
            cache: Some(Arc::clone(&cache)),
            clock: Arc::new(FixedClock(fixed_now())),
        });

        Self {
            service,
            outbox,
            repository,
            cache_store,
            cache,
        }
    }

    fn cached(&self, key: &str) -> bool {
        self.cache_store.contains(&self.cache.full_key(key))
    }

    async fn wait_cached(&self, key: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !self.cached(key) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("cache filled");
    }
}

#[tokio::test]
async fn create_writes_row_and_outbox_event_together() {
    let fx = Fixture::new();
    let workspace = WorkspaceId::generate();

    let todo = fx.service.create(workspace, "  ship it  ".to_string()).await.unwrap();

    assert_eq!(todo.title, "ship it");
    assert_eq!(todo.created_at, fixed_now());
    assert_eq!(fx.repository.len(), 1);
    let records = fx.outbox.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event_type, "todo.created");
    assert_eq!(records[0].aggregate_id, todo.id.as_uuid());
    assert_eq!(
        records[0].headers.get("room_id").map(String::as_str),
        Some(workspace.to_string().as_str())
    );
}

#[tokio::test]
async fn invalid_title_writes_nothing() {
    let fx = Fixture::new();

    let err = fx
        .service
        .create(WorkspaceId::generate(), "   ".to_string())
        .await
        .unwrap_err();

    assert!(matches!(err, ApplicationError::Domain(DomainError::ValidationError { .. })));
    assert!(fx.repository.is_empty());
    assert!(fx.outbox.records().is_empty());
}

#[tokio::test]
async fn mutating_missing_todo_is_not_found() {
    let fx = Fixture::new();

    let err = fx.service.complete(TodoId::generate()).await.unwrap_err();

    assert!(matches!(err, ApplicationError::NotFound(_)));
    assert!(fx.outbox.records().is_empty());
}

#[tokio::test]
async fn completing_invalidates_entity_and_workspace_list() {
    let fx = Fixture::new();
    let workspace = WorkspaceId::generate();
    let todo = fx.service.create(workspace, "write docs".to_string()).await.unwrap();

    // 读入缓存
    fx.service.get(todo.id).await.unwrap();
    fx.service.list(workspace).await.unwrap();
    fx.wait_cached(&todo_key(todo.id)).await;
    fx.wait_cached(&workspace_list_key(workspace)).await;
    let reads_after_warmup = fx.repository.query_count();
    assert_eq!(reads_after_warmup, 2);

    // 命中缓存，不访问仓储
    fx.service.get(todo.id).await.unwrap();
    fx.service.list(workspace).await.unwrap();
    assert_eq!(fx.repository.query_count(), reads_after_warmup);

    let revision_before = fx.service.revision(workspace).await.unwrap();
    let completed = fx.service.complete(todo.id).await.unwrap();
    assert!(completed.completed);

    assert!(!fx.cached(&todo_key(todo.id)));
    assert!(!fx.cached(&workspace_list_key(workspace)));
    assert_eq!(fx.service.revision(workspace).await.unwrap(), revision_before + 1);

    let listed = fx.service.list(workspace).await.unwrap();
    assert_eq!(fx.repository.query_count(), reads_after_warmup + 1);
    assert_eq!(listed.len(), 1);
    assert!(listed[0].completed);

    let types: Vec<String> = fx
        .outbox
        .records()
        .into_iter()
        .map(|record| record.event_type)
        .collect();
    assert_eq!(types, vec!["todo.created", "todo.completed"]);
}

#[tokio::test]
async fn failed_entity_invalidation_still_clears_workspace_list() {
    let inner = Arc::new(MemoryCacheStore::new());
    let fx = Fixture::with_store(inner.clone(), Arc::new(BrokenCounters(inner)));
    let workspace = WorkspaceId::generate();
    let todo = fx.service.create(workspace, "write docs".to_string()).await.unwrap();

    fx.service.get(todo.id).await.unwrap();
    fx.service.list(workspace).await.unwrap();
    fx.wait_cached(&todo_key(todo.id)).await;
    fx.wait_cached(&workspace_list_key(workspace)).await;

    let completed = fx.service.complete(todo.id).await.unwrap();
    assert!(completed.completed);

    assert!(!fx.cached(&todo_key(todo.id)));
    assert!(!fx.cached(&workspace_list_key(workspace)));
    let listed = fx.service.list(workspace).await.unwrap();
    assert!(listed[0].completed);
}

#[tokio::test]
async fn completing_twice_emits_a_single_event() {
    let fx = Fixture::new();
    let todo = fx
        .service
        .create(WorkspaceId::generate(), "once".to_string())
        .await
        .unwrap();

    fx.service.complete(todo.id).await.unwrap();
    fx.service.complete(todo.id).await.unwrap();

    assert_eq!(fx.outbox.records().len(), 2);
}

#[tokio::test]
async fn delete_removes_row_and_records_event() {
    let fx = Fixture::new();
    let workspace = WorkspaceId::generate();
    let todo = fx.service.create(workspace, "temporary".to_string()).await.unwrap();

    fx.service.delete(todo.id).await.unwrap();

    assert!(fx.repository.is_empty());
    assert!(matches!(
        fx.service.get(todo.id).await,
        Err(ApplicationError::NotFound(_))
    ));
    let last = fx.outbox.records().pop().unwrap();
    assert_eq!(last.event_type, "todo.deleted");
    assert!(fx.service.list(workspace).await.unwrap().is_empty());
}
