//! 内存版发件箱存储，用于测试与本地运行。
//!
//! 语义与数据库实现一致：写入在提交前不可见，取出的行在事务结束前被独占。

use std::collections::HashSet;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{NewOutboxRecord, OutboxBacklog, OutboxError, OutboxRecord, OutboxStore, OutboxTransaction};

#[derive(Default)]
struct StoreState {
    records: Vec<OutboxRecord>,
    claimed: HashSet<Uuid>,
}

fn lock(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<StoreState>>,
    fail_commit: Arc<AtomicBool>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注入提交失败，之后的每次提交都会失败直到关闭
    pub fn set_commit_failure(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// 所有已提交记录的快照，按写入顺序
    pub fn records(&self) -> Vec<OutboxRecord> {
        lock(&self.state).records.clone()
    }

    pub fn pending(&self) -> Vec<OutboxRecord> {
        lock(&self.state)
            .records
            .iter()
            .filter(|record| record.is_pending())
            .cloned()
            .collect()
    }

    pub fn find(&self, id: Uuid) -> Option<OutboxRecord> {
        lock(&self.state)
            .records
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, OutboxError> {
        Ok(InMemoryTransaction {
            state: Arc::clone(&self.state),
            fail_commit: Arc::clone(&self.fail_commit),
            appended: Vec::new(),
            updates: Vec::new(),
            staged: Vec::new(),
            claimed: Vec::new(),
            finished: false,
        })
    }

    async fn backlog(&self) -> Result<OutboxBacklog, OutboxError> {
        let state = lock(&self.state);
        let pending = state.records.iter().filter(|r| r.is_pending());
        let mut backlog = OutboxBacklog::default();
        for record in pending {
            backlog.pending += 1;
            backlog.oldest_created_at = Some(match backlog.oldest_created_at {
                Some(oldest) if oldest <= record.created_at => oldest,
                _ => record.created_at,
            });
        }
        Ok(backlog)
    }
}

enum Update {
    Processed(Uuid, DateTime<Utc>),
    Failed(Uuid, String),
}

type StagedWrite = Box<dyn FnOnce() + Send>;

/// 内存事务。业务写入通过 [`InMemoryTransaction::stage`] 暂存，
/// 只有提交成功后才会生效。
pub struct InMemoryTransaction {
    state: Arc<Mutex<StoreState>>,
    fail_commit: Arc<AtomicBool>,
    appended: Vec<NewOutboxRecord>,
    updates: Vec<Update>,
    staged: Vec<StagedWrite>,
    claimed: Vec<Uuid>,
    finished: bool,
}

impl InMemoryTransaction {
    /// 暂存一次业务写入，提交时按顺序执行
    pub fn stage(&mut self, write: impl FnOnce() + Send + 'static) {
        self.staged.push(Box::new(write));
    }

    /// 本事务已追加但尚未提交的记录数
    pub fn appended_count(&self) -> usize {
        self.appended.len()
    }

    fn release_claims(&mut self) {
        if self.claimed.is_empty() {
            return;
        }
        let mut state = lock(&self.state);
        for id in self.claimed.drain(..) {
            state.claimed.remove(&id);
        }
    }

    fn ensure_known(&self, id: Uuid) -> Result<(), OutboxError> {
        let known = self.claimed.contains(&id)
            || lock(&self.state).records.iter().any(|r| r.id == id);
        if known {
            Ok(())
        } else {
            Err(OutboxError::NotFound(id))
        }
    }
}

#[async_trait]
impl OutboxTransaction for InMemoryTransaction {
    async fn append(&mut self, records: &[NewOutboxRecord]) -> Result<(), OutboxError> {
        self.appended.extend_from_slice(records);
        Ok(())
    }

    async fn fetch_pending(&mut self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let mut state = lock(&self.state);
        let mut candidates: Vec<(usize, &OutboxRecord)> = state
            .records
            .iter()
            .enumerate()
            .filter(|(_, record)| record.is_pending() && !state.claimed.contains(&record.id))
            .collect();
        // 写入顺序等价于数据库里的 seq
        candidates.sort_by(|(a_seq, a), (b_seq, b)| {
            a.created_at.cmp(&b.created_at).then(a_seq.cmp(b_seq))
        });

        let batch: Vec<OutboxRecord> = candidates
            .into_iter()
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect();

        for record in &batch {
            state.claimed.insert(record.id);
            self.claimed.push(record.id);
        }
        Ok(batch)
    }

    async fn mark_processed(&mut self, id: Uuid) -> Result<(), OutboxError> {
        self.ensure_known(id)?;
        self.updates.push(Update::Processed(id, Utc::now()));
        Ok(())
    }

    async fn mark_failed(&mut self, id: Uuid, error: &str) -> Result<(), OutboxError> {
        self.ensure_known(id)?;
        self.updates.push(Update::Failed(id, error.to_string()));
        Ok(())
    }

    async fn commit(mut self) -> Result<(), OutboxError> {
        self.finished = true;

        if self.fail_commit.load(Ordering::SeqCst) {
            self.release_claims();
            return Err(OutboxError::Commit("injected commit failure".to_string()));
        }

        let appended = mem::take(&mut self.appended);
        let updates = mem::take(&mut self.updates);
        let staged = mem::take(&mut self.staged);

        {
            let mut state = lock(&self.state);
            state
                .records
                .extend(appended.into_iter().map(OutboxRecord::from));

            for update in updates {
                match update {
                    Update::Processed(id, at) => {
                        if let Some(record) = state.records.iter_mut().find(|r| r.id == id) {
                            record.processed_at.get_or_insert(at);
                        }
                    }
                    Update::Failed(id, error) => {
                        if let Some(record) = state.records.iter_mut().find(|r| r.id == id) {
                            record.retries += 1;
                            record.last_error = Some(error);
                        }
                    }
                }
            }
        }
        self.release_claims();

        for write in staged {
            write();
        }
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), OutboxError> {
        self.finished = true;
        self.release_claims();
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.release_claims();
        }
    }
}
