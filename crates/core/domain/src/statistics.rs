//! 驱动基础统计（独立原子计数）。

use crate::now_epoch_ms;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// 统计快照；各字段分别读取，聚合值不保证事务一致。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub total_reads: u64,
    pub total_writes: u64,
    pub successful_reads: u64,
    pub successful_writes: u64,
    pub failed_reads: u64,
    pub failed_writes: u64,
    pub started_at: i64,
    pub last_activity: i64,
}

impl StatisticsSnapshot {
    /// 成功率（百分比），无操作时为 0。
    pub fn success_rate(&self) -> f64 {
        let total = self.total_reads + self.total_writes;
        if total == 0 {
            return 0.0;
        }
        (self.successful_reads + self.successful_writes) as f64 / total as f64 * 100.0
    }
}

/// 驱动基础统计：工作线程并发累加，任意线程并发读取。
#[derive(Debug, Default)]
pub struct DriverStatistics {
    total_reads: AtomicU64,
    total_writes: AtomicU64,
    successful_reads: AtomicU64,
    successful_writes: AtomicU64,
    failed_reads: AtomicU64,
    failed_writes: AtomicU64,
    started_at: AtomicI64,
    last_activity: AtomicI64,
}

impl DriverStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次读周期结果。
    pub fn record_read(&self, success: bool) {
        self.total_reads.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_reads.fetch_add(1, Ordering::Relaxed);
            self.touch();
        } else {
            self.failed_reads.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 记录一次写入结果。
    pub fn record_write(&self, success: bool) {
        self.total_writes.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_writes.fetch_add(1, Ordering::Relaxed);
            self.touch();
        } else {
            self.failed_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn mark_started(&self) {
        self.started_at.store(now_epoch_ms(), Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.last_activity.store(now_epoch_ms(), Ordering::Relaxed);
    }

    pub fn success_rate(&self) -> f64 {
        self.snapshot().success_rate()
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            total_reads: self.total_reads.load(Ordering::Relaxed),
            total_writes: self.total_writes.load(Ordering::Relaxed),
            successful_reads: self.successful_reads.load(Ordering::Relaxed),
            successful_writes: self.successful_writes.load(Ordering::Relaxed),
            failed_reads: self.failed_reads.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            started_at: self.started_at.load(Ordering::Relaxed),
            last_activity: self.last_activity.load(Ordering::Relaxed),
        }
    }

    /// 运维显式清零（started_at 保留）。
    pub fn reset(&self) {
        for counter in [
            &self.total_reads,
            &self.total_writes,
            &self.successful_reads,
            &self.successful_writes,
            &self.failed_reads,
            &self.failed_writes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.last_activity.store(0, Ordering::Relaxed);
    }
}
