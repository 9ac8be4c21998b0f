//! 主应用程序入口
//!
//! 组装发件箱、转发器、缓存与实时推送中心，启动 Axum Web API 服务。
//! 收到 ctrl-c 后按顺序关闭：HTTP 服务 → 推送中心 → 转发器 → 消息代理。

use std::sync::Arc;

use anyhow::Context;
use application::{
    room_filter, Broker, CacheAside, CachedTodoQueries, HandlerRegistry, Hub, HubConfig,
    MultiBrokerPublisher, OutboxRelay, RelayConfig, SystemClock, TodoService,
    TodoServiceDependencies, UnitOfWork,
};
use config::AppConfig;
use domain::TODO_EVENT_TYPES;
use infrastructure::{
    create_pg_pool, KafkaBroker, PgOutboxStore, PgTodoRepository, PgWorkspaceMembership,
    RedisBroker, RedisCacheStore, RedisChannelListener, MIGRATOR,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load().context("加载配置失败")?;
    config.validate().context("配置校验失败")?;

    run(config).await
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    tracing::info!(
        "连接数据库: {}",
        config.database.url.split('@').last().unwrap_or("unknown")
    );
    let pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;
    MIGRATOR.run(&pool).await?;

    let metrics = web_api::metrics::init_metrics()?;

    // 写路径：工作单元 + Postgres 仓储
    let outbox = Arc::new(PgOutboxStore::new(pool.clone()));
    let repository = Arc::new(PgTodoRepository::new(pool.clone()));

    // 读路径：仓储 → 旁路缓存
    let cache = Arc::new(
        CacheAside::new(
            Arc::new(RedisCacheStore::connect(&config.redis).await?),
            config.cache.key_prefix.clone(),
        )
        .with_tag_ttl(config.cache.tag_ttl()),
    );
    let queries = Arc::new(CachedTodoQueries::new(
        Arc::clone(&repository),
        Arc::clone(&cache),
        config.cache.entity_ttl(),
        config.cache.query_ttl(),
    ));

    let todos = Arc::new(TodoService::new(TodoServiceDependencies {
        unit_of_work: UnitOfWork::new(Arc::clone(&outbox)),
        repository,
        queries,
        cache: Some(cache),
        clock: Arc::new(SystemClock),
    }));

    // 转发器：发件箱 → 各消息代理
    let mut publisher =
        MultiBrokerPublisher::new().with_broker(Arc::new(RedisBroker::connect(&config.redis).await?));
    if config.kafka.enabled {
        let kafka: Arc<dyn Broker> = Arc::new(KafkaBroker::new(&config.kafka)?);
        publisher = publisher.with_broker(kafka);
    }
    tracing::info!(brokers = ?publisher.broker_names(), "消息代理已就绪");
    let publisher = Arc::new(publisher);

    let registry = HandlerRegistry::new().register_many(TODO_EVENT_TYPES, publisher.clone());
    let relay = Arc::new(OutboxRelay::new(
        outbox,
        registry,
        RelayConfig {
            poll_interval: config.outbox.poll_interval(),
            batch_size: config.outbox.batch_size,
            metrics_interval: config.outbox.metrics_interval(),
        },
    ));
    let relay_token = CancellationToken::new();
    let relay_handles = relay.spawn(relay_token.clone());

    // 实时推送：Redis 频道 → 推送中心 → WebSocket
    let hub = Hub::new(
        HubConfig {
            queue_capacity: config.hub.queue_capacity,
            ping_interval: config.hub.ping_interval(),
            pong_timeout: config.hub.pong_timeout(),
        },
        room_filter(),
    );
    let shutdown = CancellationToken::new();
    let listener = RedisChannelListener::from_config(&config.redis, &config.hub)?;
    {
        let hub_for_listener = hub.clone();
        let token = shutdown.clone();
        hub.track(async move { listener.run(hub_for_listener, token).await });
    }

    let state = AppState::new(
        todos,
        hub.clone(),
        Arc::new(PgWorkspaceMembership::new(pool)),
        Arc::new(JwtService::new(config.jwt.clone())),
    )
    .with_metrics(metrics);

    let address = format!("{}:{}", config.server.host, config.server.port);
    let tcp = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!("任务服务启动在 http://{}", address);

    let server = {
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(tcp, router(state))
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("收到关闭信号");
    shutdown.cancel();

    hub.shutdown().await;
    server.await??;

    relay_token.cancel();
    relay_handles.join().await;

    publisher.close().await?;
    tracing::info!("服务已停止");
    Ok(())
}
