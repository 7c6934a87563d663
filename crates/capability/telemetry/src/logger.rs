//! 驱动日志协作接口。
//!
//! 驱动核心只调用 [`DriverLogger`]；格式与落地方式由实现决定。
//! 默认实现 [`TracingDriverLogger`] 输出到 tracing，[`MemoryDriverLogger`] 保留在内存中供诊断读取。

use domain::{ConnectionStatus, now_epoch_ms};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, error, info, warn};

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        };
        f.write_str(text)
    }
}

/// 日志分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    General,
    Connection,
    Communication,
    DataProcessing,
    ErrorHandling,
    Performance,
    Security,
    ProtocolSpecific,
    Discovery,
    Subscription,
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LogCategory::General => "general",
            LogCategory::Connection => "connection",
            LogCategory::Communication => "communication",
            LogCategory::DataProcessing => "data_processing",
            LogCategory::ErrorHandling => "error_handling",
            LogCategory::Performance => "performance",
            LogCategory::Security => "security",
            LogCategory::ProtocolSpecific => "protocol_specific",
            LogCategory::Discovery => "discovery",
            LogCategory::Subscription => "subscription",
        };
        f.write_str(text)
    }
}

/// 数据传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Tx,
    Rx,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferDirection::Tx => "TX",
            TransferDirection::Rx => "RX",
        })
    }
}

/// 驱动日志接口。
pub trait DriverLogger: Send + Sync {
    fn log(&self, level: LogLevel, category: LogCategory, message: &str);

    fn debug(&self, message: &str, category: LogCategory) {
        self.log(LogLevel::Debug, category, message);
    }

    fn info(&self, message: &str, category: LogCategory) {
        self.log(LogLevel::Info, category, message);
    }

    fn warn(&self, message: &str, category: LogCategory) {
        self.log(LogLevel::Warn, category, message);
    }

    fn error(&self, message: &str, category: LogCategory) {
        self.log(LogLevel::Error, category, message);
    }

    fn fatal(&self, message: &str, category: LogCategory) {
        self.log(LogLevel::Fatal, category, message);
    }

    fn log_connection_status_change(
        &self,
        old: ConnectionStatus,
        new: ConnectionStatus,
        reason: &str,
    ) {
        let level = if new == ConnectionStatus::Error {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };
        self.log(
            level,
            LogCategory::Connection,
            &format!("connection status {} -> {}: {}", old, new, reason),
        );
    }

    fn log_data_transfer(&self, direction: TransferDirection, size: usize, detail: &str) {
        self.log(
            LogLevel::Debug,
            LogCategory::Communication,
            &format!("{} {} bytes {}", direction, size, detail),
        );
    }

    fn log_performance_metric(&self, name: &str, value: f64, unit: &str) {
        self.log(
            LogLevel::Debug,
            LogCategory::Performance,
            &format!("{}={}{}", name, value, unit),
        );
    }

    fn log_modbus_operation(
        &self,
        function_code: u8,
        address: u16,
        count: u16,
        success: bool,
        duration_ms: u64,
        error: Option<&str>,
    ) {
        let level = if success { LogLevel::Debug } else { LogLevel::Warn };
        let mut message = format!(
            "modbus fc={} addr={} count={} success={} duration={}ms",
            function_code, address, count, success, duration_ms
        );
        if let Some(error) = error {
            message.push_str(&format!(" error={}", error));
        }
        self.log(level, LogCategory::ProtocolSpecific, &message);
    }

    fn log_bacnet_operation(
        &self,
        service: &str,
        object: &str,
        success: bool,
        duration_ms: u64,
        error: Option<&str>,
    ) {
        let level = if success { LogLevel::Debug } else { LogLevel::Warn };
        let mut message = format!(
            "bacnet {} {} success={} duration={}ms",
            service, object, success, duration_ms
        );
        if let Some(error) = error {
            message.push_str(&format!(" error={}", error));
        }
        self.log(level, LogCategory::ProtocolSpecific, &message);
    }
}

/// 输出到 tracing 的默认实现。
#[derive(Debug, Clone)]
pub struct TracingDriverLogger {
    device_id: String,
}

impl TracingDriverLogger {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }
}

impl DriverLogger for TracingDriverLogger {
    fn log(&self, level: LogLevel, category: LogCategory, message: &str) {
        let device_id = self.device_id.as_str();
        match level {
            LogLevel::Debug => {
                debug!(target: "collector.driver", device_id, category = %category, "{}", message)
            }
            LogLevel::Info => {
                info!(target: "collector.driver", device_id, category = %category, "{}", message)
            }
            LogLevel::Warn => {
                warn!(target: "collector.driver", device_id, category = %category, "{}", message)
            }
            LogLevel::Error => {
                error!(target: "collector.driver", device_id, category = %category, "{}", message)
            }
            LogLevel::Fatal => error!(
                target: "collector.driver",
                device_id,
                category = %category,
                fatal = true,
                "{}",
                message
            ),
        }
    }

    fn log_modbus_operation(
        &self,
        function_code: u8,
        address: u16,
        count: u16,
        success: bool,
        duration_ms: u64,
        error: Option<&str>,
    ) {
        if success {
            debug!(
                target: "collector.modbus",
                device_id = %self.device_id,
                function_code,
                address,
                count,
                duration_ms,
                "modbus operation completed"
            );
        } else {
            warn!(
                target: "collector.modbus",
                device_id = %self.device_id,
                function_code,
                address,
                count,
                duration_ms,
                error = error.unwrap_or("unknown"),
                "modbus operation failed"
            );
        }
    }

    fn log_bacnet_operation(
        &self,
        service: &str,
        object: &str,
        success: bool,
        duration_ms: u64,
        error: Option<&str>,
    ) {
        if success {
            debug!(
                target: "collector.bacnet",
                device_id = %self.device_id,
                service,
                object,
                duration_ms,
                "bacnet operation completed"
            );
        } else {
            warn!(
                target: "collector.bacnet",
                device_id = %self.device_id,
                service,
                object,
                duration_ms,
                error = error.unwrap_or("unknown"),
                "bacnet operation failed"
            );
        }
    }
}

/// 内存日志条目
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp_ms: i64,
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
}

/// 保留最近 N 条日志的内存实现。
#[derive(Debug)]
pub struct MemoryDriverLogger {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl MemoryDriverLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// 按分类过滤。
    pub fn entries_in(&self, category: LogCategory) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.category == category)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl DriverLogger for MemoryDriverLogger {
    fn log(&self, level: LogLevel, category: LogCategory, message: &str) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            timestamp_ms: now_epoch_ms(),
            level,
            category,
            message: message.to_string(),
        });
    }
}
