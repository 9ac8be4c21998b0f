// 内存缓存存储，测试与本地运行使用
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{CacheError, CacheStore};

#[derive(Default)]
struct Entries {
    values: HashMap<String, (Vec<u8>, Instant)>,
    tags: HashMap<String, (HashSet<String>, Instant)>,
    counters: HashMap<String, i64>,
}

#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<Entries>,
    failing: AtomicBool,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开后所有操作都返回存储错误
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        let entries = self.lock();
        entries
            .values
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > Instant::now())
    }

    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::store("memory cache unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.check()?;
        let mut entries = self.lock();
        let expired = match entries.values.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => {
                return Ok(Some(value.clone()))
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.values.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.lock()
            .values
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        self.check()?;
        let mut entries = self.lock();
        for key in keys {
            entries.values.remove(key);
            entries.tags.remove(key);
            entries.counters.remove(key);
        }
        Ok(())
    }

    async fn add_to_tag(&self, tag: &str, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        let mut entries = self.lock();
        let now = Instant::now();
        let entry = entries
            .tags
            .entry(tag.to_string())
            .or_insert_with(|| (HashSet::new(), now));
        if entry.1 <= now {
            entry.0.clear();
        }
        entry.0.insert(key.to_string());
        entry.1 = now + ttl;
        Ok(())
    }

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>, CacheError> {
        self.check()?;
        let entries = self.lock();
        Ok(entries
            .tags
            .get(tag)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(members, _)| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.check()?;
        let mut entries = self.lock();
        let counter = entries.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn counter(&self, key: &str) -> Result<i64, CacheError> {
        self.check()?;
        Ok(self.lock().counters.get(key).copied().unwrap_or(0))
    }
}
