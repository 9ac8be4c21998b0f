//! Postgres 发件箱存储
//!
//! 业务写入与发件箱写入共享同一个 `sqlx::Transaction`。仓储通过
//! [`PgOutboxTransaction::connection`] 取得连接执行自己的语句。

use application::outbox::Headers;
use application::{
    NewOutboxRecord, OutboxBacklog, OutboxError, OutboxRecord, OutboxStore, OutboxTransaction,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> OutboxError {
    OutboxError::storage(err.to_string())
}

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: Uuid,
    event_type: String,
    aggregate_type: String,
    aggregate_id: Uuid,
    payload: Vec<u8>,
    headers: Json<Headers>,
    retries: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl From<OutboxRow> for OutboxRecord {
    fn from(row: OutboxRow) -> Self {
        Self {
            id: row.id,
            event_type: row.event_type,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            payload: row.payload,
            headers: row.headers.0,
            retries: row.retries,
            last_error: row.last_error,
            created_at: row.created_at,
            processed_at: row.processed_at,
        }
    }
}

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    type Tx = PgOutboxTransaction;

    async fn begin(&self) -> Result<Self::Tx, OutboxError> {
        let tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        Ok(PgOutboxTransaction { tx })
    }

    async fn backlog(&self) -> Result<OutboxBacklog, OutboxError> {
        let (pending, oldest_created_at): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"SELECT COUNT(*), MIN(created_at) FROM outbox_events WHERE processed_at IS NULL"#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(OutboxBacklog {
            pending: pending.max(0) as u64,
            oldest_created_at,
        })
    }
}

pub struct PgOutboxTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgOutboxTransaction {
    /// 当前事务的连接，供仓储执行业务语句
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

#[async_trait]
impl OutboxTransaction for PgOutboxTransaction {
    async fn append(&mut self, records: &[NewOutboxRecord]) -> Result<(), OutboxError> {
        // 逐条插入，seq 按写入顺序递增
        for record in records {
            sqlx::query(
                r#"INSERT INTO outbox_events
                   (id, event_type, aggregate_type, aggregate_id, payload, headers, created_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            )
            .bind(record.id)
            .bind(&record.event_type)
            .bind(&record.aggregate_type)
            .bind(record.aggregate_id)
            .bind(&record.payload)
            .bind(Json(&record.headers))
            .bind(record.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_err)?;
        }
        Ok(())
    }

    async fn fetch_pending(&mut self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"SELECT id, event_type, aggregate_type, aggregate_id, payload, headers,
                      retries, last_error, created_at, processed_at
               FROM outbox_events
               WHERE processed_at IS NULL
               ORDER BY created_at, seq
               LIMIT $1
               FOR UPDATE SKIP LOCKED"#,
        )
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(OutboxRecord::from).collect())
    }

    async fn mark_processed(&mut self, id: Uuid) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"UPDATE outbox_events SET processed_at = COALESCE(processed_at, NOW()) WHERE id = $1"#,
        )
        .bind(id)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    async fn mark_failed(&mut self, id: Uuid, error: &str) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"UPDATE outbox_events SET retries = retries + 1, last_error = $2 WHERE id = $1"#,
        )
        .bind(id)
        .bind(error)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), OutboxError> {
        self.tx
            .commit()
            .await
            .map_err(|err| OutboxError::Commit(err.to_string()))
    }

    async fn rollback(self) -> Result<(), OutboxError> {
        self.tx.rollback().await.map_err(map_sqlx_err)
    }
}
