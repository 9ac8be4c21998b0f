//! Prometheus 指标导出

use application::realtime::{
    HUB_CONNECTIONS, HUB_MESSAGES_DROPPED_TOTAL, HUB_SLOW_CONSUMERS_CLOSED_TOTAL,
};
use application::relay::{
    OUTBOX_BACKLOG_TOTAL, OUTBOX_EVENTS_TOTAL, OUTBOX_OLDEST_PENDING_AGE_SECONDS,
};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// 安装全局 recorder，重复调用返回同一个句柄
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PROMETHEUS_HANDLE
        .get_or_try_init(|| {
            let handle = PrometheusBuilder::new().install_recorder()?;
            describe_metrics();
            info!("Prometheus 指标已初始化");
            Ok(handle)
        })
        .cloned()
}

fn describe_metrics() {
    describe_gauge!(OUTBOX_BACKLOG_TOTAL, "未处理的发件箱事件数");
    describe_gauge!(
        OUTBOX_OLDEST_PENDING_AGE_SECONDS,
        "最早未处理发件箱事件的等待秒数"
    );
    describe_counter!(OUTBOX_EVENTS_TOTAL, "按结果统计的发件箱事件数");
    describe_gauge!(HUB_CONNECTIONS, "当前实时连接数");
    describe_counter!(HUB_MESSAGES_DROPPED_TOTAL, "因队列已满丢弃的消息数");
    describe_counter!(HUB_SLOW_CONSUMERS_CLOSED_TOTAL, "因持续消费过慢被关闭的连接数");
}
