//! 按房间隔离的实时推送中心
//!
//! 连接在注册时带上一组不可变的授权房间。代理消息经过消息过滤器取出房间ID，
//! 只投递给授权集合包含该房间的连接。每个连接有自己的有界出站队列，
//! 慢消费者会被断开而不会拖慢推送中心。

mod permissions;
mod queue;

pub use permissions::{PermissionProvider, StaticPermissions};
pub use queue::{OutboundQueue, PushOutcome};

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use std::time::Duration;

use domain::UserId;
use futures::{Stream, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const HUB_CONNECTIONS: &str = "hub_connections";
pub const HUB_MESSAGES_DROPPED_TOTAL: &str = "hub_messages_dropped_total";
pub const HUB_SLOW_CONSUMERS_CLOSED_TOTAL: &str = "hub_slow_consumers_closed_total";

#[derive(Debug, Error)]
pub enum HubError {
    #[error("没有可订阅的房间")]
    NoRooms,

    #[error("推送中心正在关闭")]
    ShuttingDown,

    #[error("权限查询失败: {0}")]
    Permission(String),
}

/// 从原始消息中取出房间ID，不匹配时返回 `None`
pub type MessageFilter = Arc<dyn Fn(&[u8]) -> Option<String> + Send + Sync>;

#[derive(Deserialize)]
struct RoomProbe {
    #[serde(default)]
    room_id: Option<String>,
}

/// 读取 `RealtimeEnvelope` 中的 `room_id`
pub fn room_filter() -> MessageFilter {
    Arc::new(|raw: &[u8]| {
        serde_json::from_slice::<RoomProbe>(raw)
            .ok()
            .and_then(|probe| probe.room_id)
    })
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(75),
        }
    }
}

struct Connection {
    id: Uuid,
    user_id: UserId,
    rooms: HashSet<String>,
    queue: OutboundQueue,
    closed: CancellationToken,
}

struct HubInner {
    config: HubConfig,
    filter: MessageFilter,
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl HubInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Arc<Connection>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Arc<Connection>>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn unregister(&self, id: Uuid) -> bool {
        let (removed, remaining) = {
            let mut connections = self.write();
            let removed = connections.remove(&id);
            (removed, connections.len())
        };
        match removed {
            Some(connection) => {
                connection.queue.close();
                connection.closed.cancel();
                gauge!(HUB_CONNECTIONS).set(remaining as f64);
                true
            }
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(config: HubConfig, filter: MessageFilter) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                filter,
                connections: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// 注册连接。授权房间为空或推送中心正在关闭时拒绝。
    pub fn register<I, R>(&self, user_id: UserId, rooms: I) -> Result<ConnectionHandle, HubError>
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(HubError::ShuttingDown);
        }

        let rooms: HashSet<String> = rooms.into_iter().map(Into::into).collect();
        if rooms.is_empty() {
            return Err(HubError::NoRooms);
        }

        let connection = Arc::new(Connection {
            id: Uuid::new_v4(),
            user_id,
            rooms,
            queue: OutboundQueue::new(self.inner.config.queue_capacity),
            closed: self.inner.shutdown.child_token(),
        });

        let count = {
            let mut connections = self.inner.write();
            connections.insert(connection.id, Arc::clone(&connection));
            connections.len()
        };
        gauge!(HUB_CONNECTIONS).set(count as f64);
        info!(
            connection_id = %connection.id,
            user_id = %user_id,
            rooms = connection.rooms.len(),
            "实时连接已注册"
        );

        Ok(ConnectionHandle {
            hub: Arc::clone(&self.inner),
            connection,
        })
    }

    /// 把一条原始消息投递给授权连接，返回入队的连接数
    pub fn dispatch(&self, raw: &[u8]) -> usize {
        let Some(room) = (self.inner.filter)(raw) else {
            debug!("消息没有房间ID，忽略");
            return 0;
        };

        let targets: Vec<Arc<Connection>> = self
            .inner
            .read()
            .values()
            .filter(|connection| connection.rooms.contains(&room))
            .cloned()
            .collect();

        let mut delivered = 0;
        for connection in targets {
            match connection.queue.push(raw.to_vec()) {
                PushOutcome::Queued => delivered += 1,
                PushOutcome::DroppedOldest => {
                    counter!(HUB_MESSAGES_DROPPED_TOTAL).increment(1);
                    delivered += 1;
                }
                PushOutcome::Overflowed => {
                    counter!(HUB_MESSAGES_DROPPED_TOTAL).increment(1);
                    counter!(HUB_SLOW_CONSUMERS_CLOSED_TOTAL).increment(1);
                    warn!(
                        connection_id = %connection.id,
                        user_id = %connection.user_id,
                        "慢消费者持续溢出，断开连接"
                    );
                    self.inner.unregister(connection.id);
                }
                PushOutcome::Closed => {}
            }
        }
        delivered
    }

    /// 消费代理消息流直到取消、推送中心关闭或流结束
    pub async fn listen<St>(&self, mut stream: St, token: CancellationToken)
    where
        St: Stream<Item = Vec<u8>> + Unpin,
    {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = self.inner.shutdown.cancelled() => break,
                next = stream.next() => match next {
                    Some(raw) => {
                        self.dispatch(&raw);
                    }
                    None => break,
                },
            }
        }
    }

    /// 在推送中心的任务集合中运行，关闭时会等待它结束
    pub fn track<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.tracker.spawn(task)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// 广播停止信号并等待所有连接任务退出
    pub async fn shutdown(&self) {
        info!(connections = self.connection_count(), "实时推送中心开始关闭");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();

        let connections: Vec<Arc<Connection>> = self.inner.read().values().cloned().collect();
        for connection in connections {
            connection.queue.close();
        }

        self.inner.tracker.wait().await;
        info!("实时推送中心已关闭");
    }
}

/// 已注册连接的句柄，丢弃时自动注销
pub struct ConnectionHandle {
    hub: Arc<HubInner>,
    connection: Arc<Connection>,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.connection.id
    }

    pub fn user_id(&self) -> UserId {
        self.connection.user_id
    }

    pub fn rooms(&self) -> &HashSet<String> {
        &self.connection.rooms
    }

    /// 下一条待发送的消息，连接关闭后返回 `None`
    pub async fn next_message(&self) -> Option<Vec<u8>> {
        tokio::select! {
            biased;
            _ = self.connection.closed.cancelled() => None,
            message = self.connection.queue.next() => message,
        }
    }

    /// 连接被关闭（推送中心关闭或被判定为慢消费者）时触发
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.connection.closed.clone()
    }

    pub fn close(&self) {
        self.hub.unregister(self.connection.id);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.hub.unregister(self.connection.id) {
            info!(connection_id = %self.connection.id, "实时连接已注销");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(room: &str, n: usize) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "event_id": Uuid::new_v4(),
            "event_type": "todo.created",
            "aggregate_id": Uuid::new_v4(),
            "room_id": room,
            "data": { "n": n },
        }))
        .unwrap()
    }

    fn hub(capacity: usize) -> Hub {
        Hub::new(
            HubConfig {
                queue_capacity: capacity,
                ..HubConfig::default()
            },
            room_filter(),
        )
    }

    #[test]
    fn registration_requires_rooms() {
        let hub = hub(4);
        assert!(matches!(
            hub.register(UserId::generate(), Vec::<String>::new()),
            Err(HubError::NoRooms)
        ));
    }

    #[tokio::test]
    async fn messages_only_reach_authorized_rooms() {
        let hub = hub(16);
        let a = hub.register(UserId::generate(), ["room-a"]).unwrap();
        let b = hub.register(UserId::generate(), ["room-b"]).unwrap();

        for n in 0..5 {
            hub.dispatch(&envelope("room-a", n));
            hub.dispatch(&envelope("room-b", n));
        }

        for _ in 0..5 {
            let raw = a.next_message().await.unwrap();
            let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
            assert_eq!(value["room_id"], "room-a");

            let raw = b.next_message().await.unwrap();
            let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
            assert_eq!(value["room_id"], "room-b");
        }
    }

    #[test]
    fn unmatched_messages_are_ignored() {
        let hub = hub(4);
        let _handle = hub.register(UserId::generate(), ["room-a"]).unwrap();

        assert_eq!(hub.dispatch(b"not json"), 0);
        assert_eq!(hub.dispatch(br#"{"event_type":"x"}"#), 0);
        assert_eq!(hub.dispatch(&envelope("room-z", 0)), 0);
    }

    #[tokio::test]
    async fn slow_consumer_is_disconnected() {
        let hub = hub(2);
        let slow = hub.register(UserId::generate(), ["room-a"]).unwrap();
        let signal = slow.shutdown_signal();

        for n in 0..4 {
            hub.dispatch(&envelope("room-a", n));
        }

        assert!(signal.is_cancelled());
        assert_eq!(hub.connection_count(), 0);
        assert!(slow.next_message().await.is_none());
    }

    #[test]
    fn dropping_handle_unregisters() {
        let hub = hub(4);
        let handle = hub.register(UserId::generate(), ["room-a"]).unwrap();
        assert_eq!(hub.connection_count(), 1);
        drop(handle);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_tracked_connections() {
        let hub = hub(4);
        let handle = hub.register(UserId::generate(), ["room-a"]).unwrap();
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));

        {
            let finished = Arc::clone(&finished);
            hub.track(async move {
                while handle.next_message().await.is_some() {}
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.store(true, std::sync::atomic::Ordering::SeqCst);
            });
        }

        hub.shutdown().await;
        assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(hub.connection_count(), 0);
        assert!(matches!(
            hub.register(UserId::generate(), ["room-a"]),
            Err(HubError::ShuttingDown)
        ));
    }
}
