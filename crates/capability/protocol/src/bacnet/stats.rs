//! BACnet 协议计数器与错误直方图。

use crate::error::BacnetError;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BacnetStatistics {
    pub who_is_sent: u64,
    pub i_am_received: u64,
    pub read_requests: u64,
    pub successful_reads: u64,
    pub write_requests: u64,
    pub successful_writes: u64,
    pub cov_subscriptions: u64,
    pub cov_notifications: u64,
    pub timeouts: u64,
    pub error_pdus: u64,
    pub rejects: u64,
    pub aborts: u64,
    pub socket_errors: u64,
    /// 键形如 `error:<class>:<code>`、`reject:<reason>`、`abort:<reason>`
    pub error_codes: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Read,
    Write,
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Default)]
pub(crate) struct BacnetCounters {
    who_is_sent: AtomicU64,
    i_am_received: AtomicU64,
    read_requests: AtomicU64,
    successful_reads: AtomicU64,
    write_requests: AtomicU64,
    successful_writes: AtomicU64,
    cov_subscriptions: AtomicU64,
    cov_notifications: AtomicU64,
    timeouts: AtomicU64,
    error_pdus: AtomicU64,
    rejects: AtomicU64,
    aborts: AtomicU64,
    socket_errors: AtomicU64,
    error_codes: Mutex<BTreeMap<String, u64>>,
}

impl BacnetCounters {
    pub fn record_who_is(&self) {
        self.who_is_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_i_am(&self) {
        self.i_am_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cov_notification(&self) {
        self.cov_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self, operation: Operation) {
        match operation {
            Operation::Read => self.read_requests.fetch_add(1, Ordering::Relaxed),
            Operation::Write => self.write_requests.fetch_add(1, Ordering::Relaxed),
            Operation::Subscribe | Operation::Unsubscribe => 0,
        };
    }

    pub fn record_success(&self, operation: Operation) {
        let counter = match operation {
            Operation::Read => &self.successful_reads,
            Operation::Write => &self.successful_writes,
            Operation::Subscribe => &self.cov_subscriptions,
            Operation::Unsubscribe => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// 按错误类别计数；Error/Reject/Abort 额外进入直方图。
    pub fn record_failure(&self, err: &BacnetError) {
        let key = match err {
            BacnetError::Timeout { .. } => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                return;
            }
            BacnetError::Socket(_) | BacnetError::Closed => {
                self.socket_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            BacnetError::ErrorPdu { class, code } => {
                self.error_pdus.fetch_add(1, Ordering::Relaxed);
                format!("error:{}:{}", class, code)
            }
            BacnetError::Reject(reason) => {
                self.rejects.fetch_add(1, Ordering::Relaxed);
                format!("reject:{}", reason)
            }
            BacnetError::Abort(reason) => {
                self.aborts.fetch_add(1, Ordering::Relaxed);
                format!("abort:{}", reason)
            }
            _ => return,
        };
        *self.error_codes.lock().entry(key).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> BacnetStatistics {
        BacnetStatistics {
            who_is_sent: self.who_is_sent.load(Ordering::Relaxed),
            i_am_received: self.i_am_received.load(Ordering::Relaxed),
            read_requests: self.read_requests.load(Ordering::Relaxed),
            successful_reads: self.successful_reads.load(Ordering::Relaxed),
            write_requests: self.write_requests.load(Ordering::Relaxed),
            successful_writes: self.successful_writes.load(Ordering::Relaxed),
            cov_subscriptions: self.cov_subscriptions.load(Ordering::Relaxed),
            cov_notifications: self.cov_notifications.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            error_pdus: self.error_pdus.load(Ordering::Relaxed),
            rejects: self.rejects.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            error_codes: self.error_codes.lock().clone(),
        }
    }
}
