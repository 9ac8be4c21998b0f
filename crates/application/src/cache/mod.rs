//! 旁路缓存
//!
//! 读路径：命中直接返回；未命中（或读取、解码失败）时合并同键并发请求，
//! 只调用一次数据源，结果同步返回给调用者，缓存回填在后台进行且允许失败。
//! 写路径由提交后钩子触发：按键或按标签失效，并递增作用域版本号。

pub mod codec;
pub mod keys;
mod memory;
mod singleflight;

pub use codec::{BinaryCodec, Codec, CodecError, JsonCodec};
pub use memory::MemoryCacheStore;
pub use singleflight::SingleFlight;

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("缓存存储错误: {0}")]
    Store(String),

    #[error("缓存编解码错误: {0}")]
    Codec(#[from] CodecError),
}

impl CacheError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }
}

/// 缓存存储后端
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;

    /// 把键加入标签集合，并刷新集合自身的过期时间
    async fn add_to_tag(&self, tag: &str, key: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>, CacheError>;

    /// 计数器加一并返回新值
    async fn incr(&self, key: &str) -> Result<i64, CacheError>;

    /// 读取计数器，不存在时为 0
    async fn counter(&self, key: &str) -> Result<i64, CacheError>;
}

const CACHE_REQUESTS_TOTAL: &str = "cache_requests_total";

pub struct CacheAside {
    store: Arc<dyn CacheStore>,
    flight: SingleFlight,
    prefix: String,
    tag_ttl: Duration,
    /// 每次失效加一；未命中之后发生过失效的回填会被放弃
    epoch: Arc<AtomicU64>,
}

impl CacheAside {
    pub fn new(store: Arc<dyn CacheStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            flight: SingleFlight::new(),
            prefix: prefix.into(),
            tag_ttl: Duration::from_secs(3600),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 标签集合的过期时间，至少与成员的过期时间一样长
    pub fn with_tag_ttl(mut self, tag_ttl: Duration) -> Self {
        self.tag_ttl = tag_ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// 带前缀的完整键
    pub fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.prefix, key)
        }
    }

    /// 读取缓存，未命中时调用 `fetch` 并在后台回填，同时登记到 `tags`
    pub async fn get_or_fetch<T, E, C, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        codec: C,
        fetch: F,
        tags: &[String],
    ) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Display + From<CacheError>,
        C: Codec<T> + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let tags = tags.to_vec();
        self.get_or_fetch_with(key, ttl, codec, fetch, move |_: &T| tags)
            .await
    }

    /// 与 [`CacheAside::get_or_fetch`] 相同，但标签由获取到的值决定
    pub async fn get_or_fetch_with<T, E, C, F, Fut, G>(
        &self,
        key: &str,
        ttl: Duration,
        codec: C,
        fetch: F,
        tags_for: G,
    ) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Display + From<CacheError>,
        C: Codec<T> + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(&T) -> Vec<String>,
    {
        let full_key = self.full_key(key);

        match self.store.get(&full_key).await {
            Ok(Some(bytes)) => match codec.decode(&bytes) {
                Ok(value) => {
                    counter!(CACHE_REQUESTS_TOTAL, "result" => "hit").increment(1);
                    return Ok(value);
                }
                Err(err) => debug!(key = %full_key, error = %err, "缓存值解码失败，按未命中处理"),
            },
            Ok(None) => {}
            Err(err) => warn!(key = %full_key, error = %err, "缓存读取失败，按未命中处理"),
        }
        counter!(CACHE_REQUESTS_TOTAL, "result" => "miss").increment(1);

        let store = Arc::clone(&self.store);
        let fill_key = full_key.clone();
        let tag_ttl = self.tag_ttl.max(ttl);
        let epoch = Arc::clone(&self.epoch);
        let observed = epoch.load(Ordering::SeqCst);

        self.flight
            .run(&full_key, move || async move {
                let value = fetch().await?;
                let fill = Fill {
                    store,
                    key: fill_key,
                    ttl,
                    tags: tags_for(&value)
                        .iter()
                        .map(|tag| self.full_key(tag))
                        .collect(),
                    tag_ttl,
                    epoch,
                    observed,
                };
                fill.spawn(value.clone(), codec);
                Ok(value)
            })
            .await
    }

    /// 删除指定键
    pub async fn invalidate_keys(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        self.bump_epoch();
        let full: Vec<String> = keys.iter().map(|key| self.full_key(key)).collect();
        self.store.delete(&full).await
    }

    /// 删除标签下的所有键以及标签本身
    pub async fn invalidate_tag(&self, tag: &str) -> Result<(), CacheError> {
        self.bump_epoch();
        let full_tag = self.full_key(tag);
        let mut keys = self.store.tag_members(&full_tag).await?;
        debug!(tag = %full_tag, members = keys.len(), "按标签失效缓存");
        keys.push(full_tag);
        self.store.delete(&keys).await
    }

    /// 删除实体键并递增作用域版本号
    pub async fn invalidate_entity(&self, key: &str, scope: &str) -> Result<i64, CacheError> {
        self.bump_epoch();
        self.store.delete(&[self.full_key(key)]).await?;
        self.store.incr(&self.full_key(&keys::revision(scope))).await
    }

    /// 作用域当前版本号
    pub async fn revision(&self, scope: &str) -> Result<i64, CacheError> {
        self.store.counter(&self.full_key(&keys::revision(scope))).await
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

/// 后台回填任务的参数
struct Fill {
    store: Arc<dyn CacheStore>,
    key: String,
    ttl: Duration,
    tags: Vec<String>,
    tag_ttl: Duration,
    epoch: Arc<AtomicU64>,
    observed: u64,
}

impl Fill {
    fn spawn<T, C>(self, value: T, codec: C)
    where
        T: Send + Sync + 'static,
        C: Codec<T> + 'static,
    {
        tokio::spawn(async move {
            if let Err(err) = self.write(&value, &codec).await {
                debug!(key = %self.key, error = %err, "缓存回填失败");
            }
        });
    }

    async fn write<T, C: Codec<T>>(&self, value: &T, codec: &C) -> Result<(), CacheError> {
        if self.epoch.load(Ordering::SeqCst) != self.observed {
            debug!(key = %self.key, "读取后发生过失效，放弃回填");
            return Ok(());
        }
        let bytes = codec.encode(value)?;
        self.store.set(&self.key, bytes, self.ttl).await?;
        for tag in &self.tags {
            self.store.add_to_tag(tag, &self.key, self.tag_ttl).await?;
        }
        Ok(())
    }
}
