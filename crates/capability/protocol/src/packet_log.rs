//! 报文诊断日志：有界环形缓冲，可随时开关。Modbus 与 BACnet 各自定义条目类型。

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PacketDirection {
    Tx,
    Rx,
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PacketDirection::Tx => "TX",
            PacketDirection::Rx => "RX",
        })
    }
}

pub struct PacketLog<E> {
    enabled: AtomicBool,
    capacity: AtomicUsize,
    entries: Mutex<VecDeque<E>>,
}

impl<E: Clone> PacketLog<E> {
    pub fn new(capacity: usize) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            capacity: AtomicUsize::new(capacity.max(1)),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// 调整容量，超出部分从最旧处丢弃。
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let mut entries = self.entries.lock();
        self.capacity.store(capacity, Ordering::Release);
        while entries.len() > capacity {
            entries.pop_front();
        }
    }

    /// 关闭时丢弃；满时淘汰最旧的一条。
    pub fn record(&self, entry: E) {
        if !self.is_enabled() {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity.load(Ordering::Acquire) {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<E> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
