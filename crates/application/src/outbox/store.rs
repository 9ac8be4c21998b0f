use async_trait::async_trait;
use uuid::Uuid;

use super::{NewOutboxRecord, OutboxBacklog, OutboxError, OutboxRecord};

/// 发件箱存储。每个事务既承载业务写入，也承载发件箱写入。
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    type Tx: OutboxTransaction;

    /// 开启新事务
    async fn begin(&self) -> Result<Self::Tx, OutboxError>;

    /// 当前积压，只用于指标上报
    async fn backlog(&self) -> Result<OutboxBacklog, OutboxError>;
}

/// 发件箱事务句柄。
///
/// `fetch_pending` 返回的行在事务结束前被当前事务独占，
/// 其它并发事务会跳过这些行而不是等待。
#[async_trait]
pub trait OutboxTransaction: Send + 'static {
    /// 追加记录，保持传入顺序
    async fn append(&mut self, records: &[NewOutboxRecord]) -> Result<(), OutboxError>;

    /// 按创建顺序取出最多 `limit` 条未处理记录
    async fn fetch_pending(&mut self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError>;

    async fn mark_processed(&mut self, id: Uuid) -> Result<(), OutboxError>;

    /// 记录一次失败：重试次数加一并保存错误信息，记录保持未处理
    async fn mark_failed(&mut self, id: Uuid, error: &str) -> Result<(), OutboxError>;

    async fn commit(self) -> Result<(), OutboxError>;

    async fn rollback(self) -> Result<(), OutboxError>;
}
