//! 同键并发请求合并
//!
//! 第一个调用者成为领头者并执行获取，其余调用者等待同一个成功结果。
//! 领头者失败或被取消时，跟随者各自回退为独立获取，拿到数据源自己的错误。

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

/// `None` 表示领头者失败
type Shared = Option<Arc<dyn Any + Send + Sync>>;

#[derive(Default)]
pub struct SingleFlight {
    inflight: Mutex<HashMap<String, broadcast::Sender<Shared>>>,
}

enum Role {
    Leader(broadcast::Sender<Shared>),
    Follower(broadcast::Receiver<Shared>),
}

/// 领头者退出（包括被取消）时移除登记
struct LeaderGuard<'a> {
    flight: &'a SingleFlight,
    key: &'a str,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.flight.lock().remove(self.key);
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Shared>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前进行中的键数量
    pub fn inflight(&self) -> usize {
        self.lock().len()
    }

    /// 执行或等待 `key` 上的获取。错误不在调用者之间共享
    pub async fn run<T, E, F, Fut>(&self, key: &str, fetch: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let role = {
            let mut inflight = self.lock();
            match inflight.get(key) {
                Some(sender) => Role::Follower(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), sender.clone());
                    Role::Leader(sender)
                }
            }
        };

        match role {
            Role::Leader(sender) => {
                let guard = LeaderGuard { flight: self, key };
                let result = fetch().await;
                let shared: Shared = result
                    .as_ref()
                    .ok()
                    .map(|value| Arc::new(value.clone()) as Arc<dyn Any + Send + Sync>);
                drop(guard);
                // 没有跟随者时发送失败，忽略
                let _ = sender.send(shared);
                result
            }
            Role::Follower(mut receiver) => match receiver.recv().await {
                Ok(Some(value)) => match value.downcast::<T>() {
                    Ok(value) => Ok(T::clone(&value)),
                    // 同一个键被用于不同类型，按未命中处理
                    Err(_) => fetch().await,
                },
                Ok(None) | Err(_) => fetch().await,
            },
        }
    }
}
