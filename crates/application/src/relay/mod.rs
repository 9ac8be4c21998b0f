//! 发件箱中继
//!
//! 后台轮询未处理的发件箱记录，按事件类型分发给处理器。
//! 每轮在一个新事务中完成：成功的行标记已处理，失败的行累加重试次数并保留，
//! 无论单行结果如何，整批事务都会提交。

mod registry;
mod telemetry;

pub use registry::HandlerRegistry;
pub use telemetry::{
    RowOutcome, OUTBOX_BACKLOG_TOTAL, OUTBOX_EVENTS_TOTAL, OUTBOX_OLDEST_PENDING_AGE_SECONDS,
};

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::outbox::{OutboxError, OutboxRecord, OutboxStore, OutboxTransaction};

/// 发件箱记录处理器
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    async fn handle(&self, record: &OutboxRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub metrics_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            metrics_interval: Duration::from_secs(15),
        }
    }
}

/// 单轮处理结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// 同一聚合的前序事件本轮失败，后续事件留到下一轮
    pub deferred: usize,
}

pub struct OutboxRelay<S> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: RelayConfig,
}

/// 中继的两个后台任务
pub struct RelayHandles {
    pub poller: JoinHandle<()>,
    pub metrics: JoinHandle<()>,
}

impl RelayHandles {
    /// 等待两个任务退出
    pub async fn join(self) {
        if let Err(err) = self.poller.await {
            error!(error = %err, "发件箱中继任务异常退出");
        }
        if let Err(err) = self.metrics.await {
            error!(error = %err, "发件箱指标任务异常退出");
        }
    }
}

impl<S: OutboxStore> OutboxRelay<S> {
    pub fn new(store: Arc<S>, registry: HandlerRegistry, config: RelayConfig) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// 处理一批记录并提交
    pub async fn process_batch(&self) -> Result<BatchReport, OutboxError> {
        let mut tx = self.store.begin().await?;
        let records = match tx.fetch_pending(self.config.batch_size).await {
            Ok(records) => records,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "发件箱事务回滚失败");
                }
                return Err(err);
            }
        };

        let mut report = BatchReport {
            fetched: records.len(),
            ..BatchReport::default()
        };
        let mut blocked: HashSet<Uuid> = HashSet::new();

        for record in &records {
            if blocked.contains(&record.aggregate_id) {
                report.deferred += 1;
                continue;
            }

            let Some(handler) = self.registry.get(&record.event_type) else {
                debug!(
                    event_id = %record.id,
                    event_type = %record.event_type,
                    "没有注册处理器，直接标记为已处理"
                );
                tx.mark_processed(record.id).await?;
                telemetry::record_outcome(RowOutcome::Skipped);
                report.skipped += 1;
                continue;
            };

            match AssertUnwindSafe(handler.handle(record)).catch_unwind().await {
                Ok(Ok(())) => {
                    tx.mark_processed(record.id).await?;
                    telemetry::record_outcome(RowOutcome::Processed);
                    report.processed += 1;
                }
                Ok(Err(err)) => {
                    let message = format!("{err:#}");
                    self.record_failure(&mut tx, record, &message).await?;
                    blocked.insert(record.aggregate_id);
                    report.failed += 1;
                }
                Err(panic) => {
                    let message = format!("handler panicked: {}", panic_message(panic.as_ref()));
                    self.record_failure(&mut tx, record, &message).await?;
                    blocked.insert(record.aggregate_id);
                    report.failed += 1;
                }
            }
        }

        tx.commit().await?;

        if report.fetched > 0 {
            debug!(
                fetched = report.fetched,
                processed = report.processed,
                failed = report.failed,
                skipped = report.skipped,
                deferred = report.deferred,
                "发件箱批次完成"
            );
        }
        Ok(report)
    }

    async fn record_failure(
        &self,
        tx: &mut S::Tx,
        record: &OutboxRecord,
        message: &str,
    ) -> Result<(), OutboxError> {
        warn!(
            event_id = %record.id,
            event_type = %record.event_type,
            retries = record.retries + 1,
            error = %message,
            "发件箱事件投递失败，等待重试"
        );
        tx.mark_failed(record.id, message).await?;
        telemetry::record_outcome(RowOutcome::Failed);
        Ok(())
    }

    /// 上报积压指标
    pub async fn report_backlog(&self) -> Result<(), OutboxError> {
        let backlog = self.store.backlog().await?;
        telemetry::record_backlog(&backlog, Utc::now());
        Ok(())
    }

    /// 轮询循环。取消后只在批次之间退出，不会中断进行中的批次。
    pub async fn run(&self, token: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "发件箱中继已启动"
        );

        loop {
            if token.is_cancelled() {
                break;
            }

            let full_batch = match self.process_batch().await {
                Ok(report) => {
                    report.fetched == self.config.batch_size
                        && report.failed == 0
                        && report.deferred == 0
                }
                Err(err) => {
                    error!(error = %err, "发件箱批次处理失败");
                    false
                }
            };

            // 积压未清空时立即进入下一轮
            if full_batch {
                continue;
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("发件箱中继已停止");
    }

    /// 指标循环
    pub async fn run_metrics(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.metrics_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.report_backlog().await {
                        warn!(error = %err, "读取发件箱积压失败");
                    }
                }
            }
        }
    }

    /// 启动轮询与指标两个后台任务
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> RelayHandles {
        let poller = {
            let relay = Arc::clone(&self);
            let token = token.clone();
            tokio::spawn(async move { relay.run(token).await })
        };
        let metrics = tokio::spawn(async move { self.run_metrics(token).await });

        RelayHandles { poller, metrics }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
