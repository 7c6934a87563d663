//! Modbus 协议计数器：基础统计之外的细分视图，以及诊断开启时的按从站统计与报文条目。

use crate::packet_log::PacketDirection;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModbusStatistics {
    pub register_reads: u64,
    pub coil_reads: u64,
    pub register_writes: u64,
    pub coil_writes: u64,
    pub exceptions: u64,
    pub timeouts: u64,
    pub connections: u64,
    pub connection_failures: u64,
    pub exception_codes: BTreeMap<u8, u64>,
    /// 按从站 ID 的请求与响应时间（仅诊断开启期间记录）
    pub slaves: BTreeMap<u8, SlaveStatistics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlaveStatistics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_response_ms: u64,
    pub max_response_ms: u64,
    pub avg_response_ms: f64,
    #[serde(skip)]
    total_response_ms: u64,
}

impl SlaveStatistics {
    fn record(&mut self, success: bool, response_ms: u64) {
        self.requests += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.last_response_ms = response_ms;
        self.max_response_ms = self.max_response_ms.max(response_ms);
        self.total_response_ms = self.total_response_ms.saturating_add(response_ms);
        self.avg_response_ms = self.total_response_ms as f64 / self.requests as f64;
    }
}

/// Modbus 报文日志条目：一次请求记 TX，收到应答或失败时记 RX。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModbusPacketEntry {
    pub direction: PacketDirection,
    pub timestamp_ms: i64,
    pub slave_id: u8,
    pub function_code: u8,
    pub address: u16,
    pub count: u16,
    pub success: bool,
    pub error: Option<String>,
    pub latency_ms: f64,
    /// 应答内容（寄存器或位值）
    pub values: String,
}

#[derive(Debug, Default)]
pub(crate) struct ModbusCounters {
    register_reads: AtomicU64,
    coil_reads: AtomicU64,
    register_writes: AtomicU64,
    coil_writes: AtomicU64,
    exceptions: AtomicU64,
    timeouts: AtomicU64,
    connections: AtomicU64,
    connection_failures: AtomicU64,
    exception_codes: Mutex<BTreeMap<u8, u64>>,
    slaves: Mutex<BTreeMap<u8, SlaveStatistics>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    RegisterRead,
    CoilRead,
    RegisterWrite,
    CoilWrite,
}

impl ModbusCounters {
    pub fn record_success(&self, operation: Operation) {
        let counter = match operation {
            Operation::RegisterRead => &self.register_reads,
            Operation::CoilRead => &self.coil_reads,
            Operation::RegisterWrite => &self.register_writes,
            Operation::CoilWrite => &self.coil_writes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exception(&self, code: u8) {
        self.exceptions.fetch_add(1, Ordering::Relaxed);
        *self.exception_codes.lock().entry(code).or_insert(0) += 1;
    }

    pub fn record_slave_request(&self, slave: u8, success: bool, response_ms: u64) {
        self.slaves
            .lock()
            .entry(slave)
            .or_default()
            .record(success, response_ms);
    }

    pub fn clear_slaves(&self) {
        self.slaves.lock().clear();
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self, success: bool) {
        let counter = if success {
            &self.connections
        } else {
            &self.connection_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ModbusStatistics {
        ModbusStatistics {
            register_reads: self.register_reads.load(Ordering::Relaxed),
            coil_reads: self.coil_reads.load(Ordering::Relaxed),
            register_writes: self.register_writes.load(Ordering::Relaxed),
            coil_writes: self.coil_writes.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            exception_codes: self.exception_codes.lock().clone(),
            slaves: self.slaves.lock().clone(),
        }
    }

    /// 直方图锁内清零，读者不会看到半清零的直方图。
    pub fn reset(&self) {
        let mut codes = self.exception_codes.lock();
        for counter in [
            &self.register_reads,
            &self.coil_reads,
            &self.register_writes,
            &self.coil_writes,
            &self.exceptions,
            &self.timeouts,
            &self.connections,
            &self.connection_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        codes.clear();
        drop(codes);
        self.clear_slaves();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slave_response_times_are_averaged() {
        let counters = ModbusCounters::default();
        counters.record_slave_request(1, true, 10);
        counters.record_slave_request(1, false, 30);
        counters.record_slave_request(2, true, 5);

        let stats = counters.snapshot();
        let first = &stats.slaves[&1];
        assert_eq!((first.requests, first.successes, first.failures), (2, 1, 1));
        assert_eq!(first.last_response_ms, 30);
        assert_eq!(first.max_response_ms, 30);
        assert_eq!(first.avg_response_ms, 20.0);
        assert_eq!(stats.slaves[&2].requests, 1);

        counters.reset();
        assert!(counters.snapshot().slaves.is_empty());
    }
}
