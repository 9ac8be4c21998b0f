use std::sync::Arc;
use std::time::Duration;

use application::{
    room_filter, CacheAside, CachedTodoQueries, HandlerRegistry, Hub, HubConfig,
    InMemoryOutboxStore, InMemoryTodoRepository, LocalBroker, MemoryCacheStore,
    MultiBrokerPublisher, OutboxRelay, RelayConfig, RelayHandles, StaticPermissions, SystemClock,
    TodoService, TodoServiceDependencies, UnitOfWork,
};
use axum::Router;
use domain::{UserId, WorkspaceId, TODO_EVENT_TYPES};
use tokio_util::sync::CancellationToken;
use web_api::{router, AppState, JwtConfig, JwtService};

pub struct TestApp {
    pub router: Router,
    pub jwt: Arc<JwtService>,
    pub hub: Hub,
    pub outbox: Arc<InMemoryOutboxStore>,
    /// workspace 的成员
    pub member: UserId,
    /// other_workspace 的成员
    pub neighbour: UserId,
    /// 没有任何工作区
    pub outsider: UserId,
    pub workspace: WorkspaceId,
    pub other_workspace: WorkspaceId,
}

impl TestApp {
    pub fn token(&self, user: UserId) -> String {
        self.jwt.generate_token(user).expect("token")
    }

    /// 启动发件箱转发：relay → LocalBroker → hub
    pub fn start_relay(&self, token: &CancellationToken) -> RelayHandles {
        let local = Arc::new(LocalBroker::new(64));
        let publisher = Arc::new(MultiBrokerPublisher::new().with_broker(local.clone()));
        let registry = HandlerRegistry::new().register_many(TODO_EVENT_TYPES, publisher);

        let hub = self.hub.clone();
        let listen_token = token.clone();
        let stream = local.stream();
        self.hub
            .track(async move { hub.listen(stream, listen_token).await });

        let relay = Arc::new(OutboxRelay::new(
            Arc::clone(&self.outbox),
            registry,
            RelayConfig {
                poll_interval: Duration::from_millis(10),
                batch_size: 50,
                metrics_interval: Duration::from_millis(100),
            },
        ));
        relay.spawn(token.clone())
    }
}

pub fn test_app() -> TestApp {
    test_app_with_hub(HubConfig {
        queue_capacity: 16,
        ping_interval: Duration::from_secs(30),
        pong_timeout: Duration::from_secs(75),
    })
}

pub fn test_app_with_hub(hub_config: HubConfig) -> TestApp {
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let repository = Arc::new(InMemoryTodoRepository::new());
    let cache = Arc::new(CacheAside::new(Arc::new(MemoryCacheStore::new()), "taskhub"));
    let queries = Arc::new(CachedTodoQueries::new(
        Arc::clone(&repository),
        Arc::clone(&cache),
        Duration::from_secs(60),
        Duration::from_secs(30),
    ));
    let todos = Arc::new(TodoService::new(TodoServiceDependencies {
        unit_of_work: UnitOfWork::new(Arc::clone(&outbox)),
        repository,
        queries,
        cache: Some(cache),
        clock: Arc::new(SystemClock),
    }));

    let member = UserId::generate();
    let neighbour = UserId::generate();
    let outsider = UserId::generate();
    let workspace = WorkspaceId::generate();
    let other_workspace = WorkspaceId::generate();
    let permissions = StaticPermissions::new()
        .grant(member, workspace.to_string())
        .grant(neighbour, other_workspace.to_string());

    let jwt = Arc::new(JwtService::new(JwtConfig {
        secret: "test_jwt_secret_key_for_testing_purposes_only".to_string(),
        expiration_hours: 1,
    }));
    let hub = Hub::new(hub_config, room_filter());

    let state = AppState::new(todos, hub.clone(), Arc::new(permissions), Arc::clone(&jwt));

    TestApp {
        router: router(state),
        jwt,
        hub,
        outbox,
        member,
        neighbour,
        outsider,
        workspace,
        other_workspace,
    }
}
