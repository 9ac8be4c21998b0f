//! 工作单元
//!
//! 在一个数据库事务内执行业务操作，提交前把收集到的聚合事件写入发件箱，
//! 提交成功后再执行提交后钩子（例如缓存失效）。
//!
//! 事务句柄通过 [`TxScope`] 显式传给业务闭包，写法与
//! `sqlx::Connection::transaction` 一致：
//!
//! ```ignore
//! uow.execute(|scope| Box::pin(async move {
//!     repo.save(scope, &mut todo).await
//! })).await
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use domain::{Aggregate, DomainEvent};
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::mapper::{EventMapper, MappingError};
use crate::outbox::{NewOutboxRecord, OutboxError, OutboxStore, OutboxTransaction};

#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    #[error("发件箱错误: {0}")]
    Outbox(#[from] OutboxError),

    #[error("事件映射失败: {0}")]
    Mapping(#[from] MappingError),

    #[error("操作已取消")]
    Cancelled,
}

/// 提交后钩子
pub type AfterCommitHook = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

type FlushFn = Box<dyn FnOnce(DateTime<Utc>) -> Result<Vec<NewOutboxRecord>, MappingError> + Send>;

struct Collected {
    events: usize,
    flush: FlushFn,
}

/// 事务作用域：业务闭包的数据访问句柄
pub struct TxScope<Tx> {
    tx: Tx,
    collected: Vec<Collected>,
    hooks: Vec<AfterCommitHook>,
}

impl<Tx: OutboxTransaction> TxScope<Tx> {
    fn new(tx: Tx) -> Self {
        Self {
            tx,
            collected: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// 底层事务，仓储通过它执行业务写入
    pub fn transaction(&mut self) -> &mut Tx {
        &mut self.tx
    }

    /// 登记聚合，取走其待发布事件并在提交前写入发件箱
    ///
    /// 事件在调用时立即从聚合中取出，而不是在写入发件箱成功之后。
    /// 工作单元失败时这些事件随事务一起丢弃，不会还给聚合。
    pub fn collect<A>(&mut self, mapper: Arc<dyn EventMapper<A::Event>>, aggregate: &mut A)
    where
        A: Aggregate,
    {
        let events = aggregate.take_events();
        if events.is_empty() {
            return;
        }

        let aggregate_type = A::AGGREGATE_TYPE;
        let aggregate_id = aggregate.aggregate_id();
        let count = events.len();

        let flush: FlushFn = Box::new(move |now| {
            let mut records = Vec::with_capacity(events.len());
            for event in &events {
                if let Some(mapped) = mapper.map_event(event)? {
                    records.push(NewOutboxRecord {
                        id: Uuid::new_v4(),
                        event_type: mapped.event_type,
                        aggregate_type: aggregate_type.to_string(),
                        aggregate_id,
                        payload: mapped.payload,
                        headers: mapped.headers,
                        created_at: now,
                    });
                } else {
                    debug!(event = event.event_name(), "事件映射器跳过事件");
                }
            }
            Ok(records)
        });

        self.collected.push(Collected {
            events: count,
            flush,
        });
    }

    /// 注册提交后钩子，事务回滚时不会执行
    pub fn after_commit<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.push(Box::new(move || hook().boxed()));
    }

    /// 嵌套执行，复用当前事务
    pub async fn execute<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut TxScope<Tx>) -> BoxFuture<'s, Result<T, E>>,
    {
        f(self).await
    }

    /// 已收集、尚未写入发件箱的事件数
    pub fn collected_count(&self) -> usize {
        self.collected.iter().map(|c| c.events).sum()
    }

    fn flush(collected: Vec<Collected>) -> Result<Vec<NewOutboxRecord>, MappingError> {
        let now = Utc::now();
        let mut records = Vec::new();
        for entry in collected {
            records.extend((entry.flush)(now)?);
        }
        Ok(records)
    }
}

enum Outcome<T, E> {
    Finished(Result<T, E>),
    Panicked(Box<dyn std::any::Any + Send>),
    Cancelled,
}

pub struct UnitOfWork<S> {
    store: Arc<S>,
}

impl<S> Clone for UnitOfWork<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: OutboxStore> UnitOfWork<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// 在新事务中执行 `f`
    pub async fn execute<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut TxScope<S::Tx>) -> BoxFuture<'s, Result<T, E>> + Send,
        T: Send,
        E: From<UnitOfWorkError> + Send,
    {
        self.execute_with_cancellation(&CancellationToken::new(), f)
            .await
    }

    /// 在新事务中执行 `f`，令牌在提交前被取消时回滚
    pub async fn execute_with_cancellation<T, E, F>(
        &self,
        token: &CancellationToken,
        f: F,
    ) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut TxScope<S::Tx>) -> BoxFuture<'s, Result<T, E>> + Send,
        T: Send,
        E: From<UnitOfWorkError> + Send,
    {
        if token.is_cancelled() {
            return Err(UnitOfWorkError::Cancelled.into());
        }

        let tx = self.store.begin().await.map_err(UnitOfWorkError::from)?;
        let mut scope = TxScope::new(tx);

        let outcome = {
            let work = AssertUnwindSafe(async { f(&mut scope).await }).catch_unwind();
            tokio::select! {
                biased;
                _ = token.cancelled() => Outcome::Cancelled,
                result = work => match result {
                    Ok(result) => Outcome::Finished(result),
                    Err(panic) => Outcome::Panicked(panic),
                },
            }
        };

        let TxScope {
            mut tx,
            collected,
            hooks,
        } = scope;

        match outcome {
            Outcome::Panicked(panic) => {
                rollback(tx).await;
                std::panic::resume_unwind(panic)
            }
            Outcome::Cancelled => {
                rollback(tx).await;
                Err(UnitOfWorkError::Cancelled.into())
            }
            Outcome::Finished(Err(err)) => {
                rollback(tx).await;
                Err(err)
            }
            Outcome::Finished(Ok(value)) => {
                let records = match TxScope::<S::Tx>::flush(collected) {
                    Ok(records) => records,
                    Err(err) => {
                        rollback(tx).await;
                        return Err(UnitOfWorkError::Mapping(err).into());
                    }
                };

                if !records.is_empty() {
                    if let Err(err) = tx.append(&records).await {
                        rollback(tx).await;
                        return Err(UnitOfWorkError::Outbox(err).into());
                    }
                }

                if token.is_cancelled() {
                    rollback(tx).await;
                    return Err(UnitOfWorkError::Cancelled.into());
                }

                tx.commit().await.map_err(UnitOfWorkError::from)?;
                debug!(outbox_records = records.len(), "事务已提交");

                run_hooks(hooks).await;
                Ok(value)
            }
        }
    }
}

async fn rollback<Tx: OutboxTransaction>(tx: Tx) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, "事务回滚失败");
    }
}

/// 提交后钩子尽力执行，失败只记录日志
async fn run_hooks(hooks: Vec<AfterCommitHook>) {
    for hook in hooks {
        match AssertUnwindSafe(async move { hook().await })
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "提交后钩子执行失败"),
            Err(_) => warn!("提交后钩子发生 panic"),
        }
    }
}
