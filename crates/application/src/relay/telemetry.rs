//! 中继指标

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};

use crate::outbox::OutboxBacklog;

pub const OUTBOX_BACKLOG_TOTAL: &str = "outbox_backlog_total";
pub const OUTBOX_OLDEST_PENDING_AGE_SECONDS: &str = "outbox_oldest_pending_age_seconds";
pub const OUTBOX_EVENTS_TOTAL: &str = "outbox_events_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Processed,
    Failed,
    Skipped,
}

impl RowOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowOutcome::Processed => "processed",
            RowOutcome::Failed => "failed",
            RowOutcome::Skipped => "skipped",
        }
    }
}

pub fn record_outcome(outcome: RowOutcome) {
    counter!(OUTBOX_EVENTS_TOTAL, "outcome" => outcome.as_str()).increment(1);
}

/// 上报积压量与最老未处理记录的等待时间
pub fn record_backlog(backlog: &OutboxBacklog, now: DateTime<Utc>) {
    gauge!(OUTBOX_BACKLOG_TOTAL).set(backlog.pending as f64);
    gauge!(OUTBOX_OLDEST_PENDING_AGE_SECONDS).set(backlog.oldest_age(now).as_secs_f64());
}
