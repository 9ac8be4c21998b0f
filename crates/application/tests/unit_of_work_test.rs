use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use application::{
    EventMapper, InMemoryOutboxStore, InMemoryTodoRepository, MappedEvent, MappingError,
    OutboxError, TodoEventMapper, TodoRepository, UnitOfWork, UnitOfWorkError,
};
use chrono::Utc;
use domain::{DomainEvent, Todo, TodoEvent, WorkspaceId, TODO_COMPLETED};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
enum TestError {
    #[error("business rule failed")]
    Business,
    #[error(transparent)]
    UnitOfWork(#[from] UnitOfWorkError),
}

fn mapper() -> Arc<dyn EventMapper<TodoEvent>> {
    Arc::new(TodoEventMapper)
}

fn new_todo(title: &str) -> Todo {
    Todo::create(WorkspaceId::generate(), title, Utc::now()).unwrap()
}

fn counting_hook(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> futures::future::Ready<anyhow::Result<()>> {
    let counter = Arc::clone(counter);
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Ok(()))
    }
}

struct RejectingMapper;

impl EventMapper<TodoEvent> for RejectingMapper {
    fn map_event(&self, event: &TodoEvent) -> Result<Option<MappedEvent>, MappingError> {
        Err(MappingError::Rejected {
            event_type: event.event_name().to_string(),
            reason: "not supported".to_string(),
        })
    }
}

/// 只发布完成事件以外的事件
struct SkipCompletedMapper;

impl EventMapper<TodoEvent> for SkipCompletedMapper {
    fn map_event(&self, event: &TodoEvent) -> Result<Option<MappedEvent>, MappingError> {
        if event.event_name() == TODO_COMPLETED {
            return Ok(None);
        }
        TodoEventMapper.map_event(event)
    }
}

#[tokio::test]
async fn commit_persists_events_in_order_and_runs_hooks() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let uow = UnitOfWork::new(Arc::clone(&store));
    let hooks = Arc::new(AtomicUsize::new(0));

    let mapper = mapper();
    let hook = counting_hook(&hooks);
    let todo = uow
        .execute(move |scope| {
            Box::pin(async move {
                let mut todo = new_todo("write tests");
                todo.complete(Utc::now());
                scope.collect(mapper, &mut todo);
                assert_eq!(scope.collected_count(), 2);
                scope.after_commit(hook);
                Ok::<_, TestError>(todo)
            })
        })
        .await
        .unwrap();

    let records = store.records();
    let types: Vec<&str> = records.iter().map(|r| r.event_type.as_str()).collect();
    assert_eq!(types, vec!["todo.created", "todo.completed"]);
    assert!(records.iter().all(|r| r.aggregate_id == todo.id.as_uuid()));
    assert!(records.iter().all(|r| r.aggregate_type == "todo" && r.retries == 0));
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
    assert!(domain::Aggregate::pending_events(&todo).is_empty());
}

#[tokio::test]
async fn collect_takes_events_immediately_and_drops_them_on_failure() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let uow = UnitOfWork::new(Arc::clone(&store));

    let mapper = mapper();
    let result: Result<(), TestError> = uow
        .execute(move |scope| {
            Box::pin(async move {
                let mut todo = new_todo("drained");
                scope.collect(mapper, &mut todo);
                assert!(domain::Aggregate::pending_events(&todo).is_empty());
                assert_eq!(scope.collected_count(), 1);
                Err(TestError::Business)
            })
        })
        .await;

    assert!(matches!(result, Err(TestError::Business)));
    assert!(store.records().is_empty());
}

#[tokio::test]
async fn business_error_leaves_no_rows_and_fires_no_hooks() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let repository = Arc::new(InMemoryTodoRepository::new());
    let uow = UnitOfWork::new(Arc::clone(&store));
    let hooks = Arc::new(AtomicUsize::new(0));

    let repo = Arc::clone(&repository);
    let hook = counting_hook(&hooks);
    let result: Result<(), TestError> = uow
        .execute(move |scope| {
            Box::pin(async move {
                let mut todo = new_todo("doomed");
                repo.save(scope, &mut todo).await.unwrap();
                scope.after_commit(hook);
                Err(TestError::Business)
            })
        })
        .await;

    assert!(matches!(result, Err(TestError::Business)));
    assert!(store.records().is_empty());
    assert!(repository.is_empty());
    assert_eq!(hooks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn mapping_failure_rolls_back_the_transaction() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let repository = Arc::new(InMemoryTodoRepository::with_mapper(Arc::new(RejectingMapper)));
    let uow = UnitOfWork::new(Arc::clone(&store));
    let hooks = Arc::new(AtomicUsize::new(0));

    let repo = Arc::clone(&repository);
    let hook = counting_hook(&hooks);
    let result = uow
        .execute(move |scope| {
            Box::pin(async move {
                let mut todo = new_todo("unmappable");
                repo.save(scope, &mut todo).await.unwrap();
                scope.after_commit(hook);
                Ok::<_, TestError>(())
            })
        })
        .await;

    assert!(matches!(
        result,
        Err(TestError::UnitOfWork(UnitOfWorkError::Mapping(_)))
    ));
    assert!(store.records().is_empty());
    assert!(repository.is_empty());
    assert_eq!(hooks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn mapper_can_skip_events() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let uow = UnitOfWork::new(Arc::clone(&store));
    let mapper: Arc<dyn EventMapper<TodoEvent>> = Arc::new(SkipCompletedMapper);

    uow.execute(move |scope| {
        Box::pin(async move {
            let mut todo = new_todo("partially published");
            todo.complete(Utc::now());
            scope.collect(mapper, &mut todo);
            Ok::<_, TestError>(())
        })
    })
    .await
    .unwrap();

    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event_type, "todo.created");
}

#[tokio::test]
async fn panic_rolls_back_and_is_propagated() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let repository = Arc::new(InMemoryTodoRepository::new());
    let uow = UnitOfWork::new(Arc::clone(&store));
    let hooks = Arc::new(AtomicUsize::new(0));

    let repo = Arc::clone(&repository);
    let hook = counting_hook(&hooks);
    let join = tokio::spawn(async move {
        uow.execute(move |scope| {
            Box::pin(async move {
                let mut todo = new_todo("explodes");
                repo.save(scope, &mut todo).await.unwrap();
                scope.after_commit(hook);
                if todo.title == "explodes" {
                    panic!("boom");
                }
                Ok::<_, TestError>(())
            })
        })
        .await
    })
    .await;

    assert!(join.unwrap_err().is_panic());
    assert!(store.records().is_empty());
    assert!(repository.is_empty());
    assert_eq!(hooks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn commit_failure_skips_hooks() {
    let store = Arc::new(InMemoryOutboxStore::new());
    store.set_commit_failure(true);
    let uow = UnitOfWork::new(Arc::clone(&store));
    let hooks = Arc::new(AtomicUsize::new(0));

    let mapper = mapper();
    let hook = counting_hook(&hooks);
    let result = uow
        .execute(move |scope| {
            Box::pin(async move {
                let mut todo = new_todo("never committed");
                scope.collect(mapper, &mut todo);
                scope.after_commit(hook);
                Ok::<_, TestError>(())
            })
        })
        .await;

    assert!(matches!(
        result,
        Err(TestError::UnitOfWork(UnitOfWorkError::Outbox(OutboxError::Commit(_))))
    ));
    assert!(store.records().is_empty());
    assert_eq!(hooks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_before_commit_rolls_back() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let uow = UnitOfWork::new(Arc::clone(&store));
    let token = CancellationToken::new();

    let mapper = mapper();
    let cancel = token.clone();
    let result = uow
        .execute_with_cancellation(&token, move |scope| {
            Box::pin(async move {
                let mut todo = new_todo("cancelled");
                scope.collect(mapper, &mut todo);
                cancel.cancel();
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, TestError>(())
            })
        })
        .await;

    assert!(matches!(
        result,
        Err(TestError::UnitOfWork(UnitOfWorkError::Cancelled))
    ));
    assert!(store.records().is_empty());

    let again = uow
        .execute_with_cancellation(&token, |_scope| Box::pin(async { Ok::<_, TestError>(()) }))
        .await;
    assert!(matches!(
        again,
        Err(TestError::UnitOfWork(UnitOfWorkError::Cancelled))
    ));
}

#[tokio::test]
async fn nested_execute_shares_the_outer_transaction() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let uow = UnitOfWork::new(Arc::clone(&store));

    let outer_mapper = mapper();
    let inner_mapper = mapper();
    uow.execute(move |scope| {
        Box::pin(async move {
            let mut first = new_todo("outer");
            scope.collect(outer_mapper, &mut first);

            scope
                .execute(move |inner| {
                    Box::pin(async move {
                        let mut second = new_todo("inner");
                        inner.collect(inner_mapper, &mut second);
                        Ok::<_, TestError>(())
                    })
                })
                .await?;

            assert_eq!(scope.collected_count(), 2);
            Ok::<_, TestError>(())
        })
    })
    .await
    .unwrap();

    assert_eq!(store.records().len(), 2);
}

#[tokio::test]
async fn nested_failure_discards_everything() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let uow = UnitOfWork::new(Arc::clone(&store));

    let outer_mapper = mapper();
    let result = uow
        .execute(move |scope| {
            Box::pin(async move {
                let mut first = new_todo("outer");
                scope.collect(outer_mapper, &mut first);
                scope
                    .execute(|_inner| Box::pin(async { Err::<(), _>(TestError::Business) }))
                    .await
            })
        })
        .await;

    assert!(matches!(result, Err(TestError::Business)));
    assert!(store.records().is_empty());
}

#[tokio::test]
async fn failing_hook_does_not_affect_result_or_other_hooks() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let uow = UnitOfWork::new(Arc::clone(&store));
    let hooks = Arc::new(AtomicUsize::new(0));

    let hook = counting_hook(&hooks);
    let result = uow
        .execute(move |scope| {
            Box::pin(async move {
                scope.after_commit(|| async { Err(anyhow::anyhow!("cache unreachable")) });
                scope.after_commit(hook);
                Ok::<_, TestError>(42)
            })
        })
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
}
