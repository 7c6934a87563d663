//! 追踪初始化、驱动日志接口与进程级采集指标。

mod logger;

pub use logger::{
    DriverLogger, LogCategory, LogEntry, LogLevel, MemoryDriverLogger, TracingDriverLogger,
    TransferDirection,
};

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 采集指标快照。
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub poll_cycles: u64,
    pub poll_failures: u64,
    pub data_callbacks: u64,
    pub status_changes: u64,
    pub write_success: u64,
    pub write_failure: u64,
    pub reconnect_attempts: u64,
    pub protocol_exceptions: u64,
    pub timeouts: u64,
    pub cov_notifications: u64,
}

/// 进程级采集指标（跨所有驱动累加）。
pub struct CollectorMetrics {
    poll_cycles: AtomicU64,
    poll_failures: AtomicU64,
    data_callbacks: AtomicU64,
    status_changes: AtomicU64,
    write_success: AtomicU64,
    write_failure: AtomicU64,
    reconnect_attempts: AtomicU64,
    protocol_exceptions: AtomicU64,
    timeouts: AtomicU64,
    cov_notifications: AtomicU64,
}

impl CollectorMetrics {
    pub fn new() -> Self {
        Self {
            poll_cycles: AtomicU64::new(0),
            poll_failures: AtomicU64::new(0),
            data_callbacks: AtomicU64::new(0),
            status_changes: AtomicU64::new(0),
            write_success: AtomicU64::new(0),
            write_failure: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            protocol_exceptions: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cov_notifications: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            poll_cycles: self.poll_cycles.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            data_callbacks: self.data_callbacks.load(Ordering::Relaxed),
            status_changes: self.status_changes.load(Ordering::Relaxed),
            write_success: self.write_success.load(Ordering::Relaxed),
            write_failure: self.write_failure.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            protocol_exceptions: self.protocol_exceptions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cov_notifications: self.cov_notifications.load(Ordering::Relaxed),
        }
    }
}

impl Default for CollectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<CollectorMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static CollectorMetrics {
    METRICS.get_or_init(CollectorMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    init_tracing_with("info");
}

/// 初始化 tracing：RUST_LOG 优先，否则使用给定过滤指令。
pub fn init_tracing_with(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 记录一次轮询周期（成功与否）。
pub fn record_poll_cycle(success: bool) {
    let metrics = metrics();
    metrics.poll_cycles.fetch_add(1, Ordering::Relaxed);
    if !success {
        metrics.poll_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// 记录数据回调次数。
pub fn record_data_callback() {
    metrics().data_callbacks.fetch_add(1, Ordering::Relaxed);
}

/// 记录状态变更次数。
pub fn record_status_change() {
    metrics().status_changes.fetch_add(1, Ordering::Relaxed);
}

/// 记录写入结果。
pub fn record_write(success: bool) {
    let metrics = metrics();
    if success {
        metrics.write_success.fetch_add(1, Ordering::Relaxed);
    } else {
        metrics.write_failure.fetch_add(1, Ordering::Relaxed);
    }
}

/// 记录自动重连尝试次数。
pub fn record_reconnect_attempt() {
    metrics().reconnect_attempts.fetch_add(1, Ordering::Relaxed);
}

/// 记录协议级异常（Modbus 异常码、BACnet Error/Reject/Abort）。
pub fn record_protocol_exception() {
    metrics()
        .protocol_exceptions
        .fetch_add(1, Ordering::Relaxed);
}

pub fn record_timeout() {
    metrics().timeouts.fetch_add(1, Ordering::Relaxed);
}

/// 记录 COV 通知次数。
pub fn record_cov_notification() {
    metrics()
        .cov_notifications
        .fetch_add(1, Ordering::Relaxed);
}
