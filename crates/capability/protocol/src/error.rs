//! 协议错误类型定义

use collector_driver::DriverError;
use std::io;

/// Modbus 异常码名称
pub fn exception_name(code: u8) -> &'static str {
    match code {
        1 => "illegal function",
        2 => "illegal data address",
        3 => "illegal data value",
        4 => "server device failure",
        5 => "acknowledge",
        6 => "server device busy",
        7 => "negative acknowledge",
        8 => "memory parity error",
        10 => "gateway path unavailable",
        11 => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

/// Modbus 通信错误
#[derive(Debug, thiserror::Error)]
pub enum ModbusError {
    /// 从站返回异常响应：会话仍然健康
    #[error("modbus exception {code} ({}) for function {function}", exception_name(*code))]
    Exception { function: u8, code: u8 },

    #[error("modbus request timed out: {0}")]
    Timeout(String),

    /// 传输层失败（断开、帧错位），需要重建会话
    #[error("modbus transport error: {0}")]
    Transport(String),

    #[error("invalid modbus endpoint: {0}")]
    Endpoint(String),

    #[error("modbus not connected: {0}")]
    NotConnected(String),

    #[error("unsupported modbus function code: {0}")]
    UnsupportedFunction(u8),

    /// 寄存器与点位类型之间的转换失败
    #[error("modbus value conversion failed: {0}")]
    Conversion(String),
}

impl ModbusError {
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                ModbusError::Timeout(err.to_string())
            }
            _ => ModbusError::Transport(err.to_string()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ModbusError::Timeout(_))
    }

    /// 是否需要丢弃当前会话并重连
    pub fn breaks_session(&self) -> bool {
        matches!(self, ModbusError::Timeout(_) | ModbusError::Transport(_))
    }
}

impl From<ModbusError> for DriverError {
    fn from(err: ModbusError) -> Self {
        match err {
            ModbusError::Exception { .. } => DriverError::Protocol(err.to_string()),
            ModbusError::Timeout(msg) => DriverError::Timeout(msg),
            ModbusError::Transport(msg) => DriverError::Connection(msg),
            ModbusError::Endpoint(msg) => DriverError::Config(msg),
            ModbusError::NotConnected(msg) => DriverError::NotConnected(msg),
            ModbusError::UnsupportedFunction(_) => DriverError::Config(err.to_string()),
            ModbusError::Conversion(msg) => DriverError::Conversion(msg),
        }
    }
}

/// BACnet 报文编解码错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("frame truncated: need {needed} byte(s) at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("invalid bvlc header: {0}")]
    InvalidBvlc(String),

    #[error("unsupported npdu version {0}")]
    NpduVersion(u8),

    #[error("unexpected tag: {0}")]
    UnexpectedTag(String),

    #[error("invalid encoded value: {0}")]
    InvalidValue(String),

    #[error("segmented messages are not supported")]
    Segmented,
}

/// BACnet 通信错误
#[derive(Debug, thiserror::Error)]
pub enum BacnetError {
    #[error("invalid bacnet endpoint: {0}")]
    Endpoint(String),

    /// 套接字层失败，需要重新绑定
    #[error("bacnet socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("bacnet request timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error("bacnet error pdu: class {class} code {code}")]
    ErrorPdu { class: u32, code: u32 },

    #[error("bacnet reject pdu: reason {0}")]
    Reject(u8),

    #[error("bacnet abort pdu: reason {0}")]
    Abort(u8),

    #[error("bacnet codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("unexpected bacnet response: {0}")]
    UnexpectedResponse(String),

    #[error("bacnet value conversion failed: {0}")]
    Conversion(String),

    #[error("bacnet not connected: {0}")]
    NotConnected(String),

    /// I/O 线程已退出
    #[error("bacnet transport closed")]
    Closed,

    #[error("no cov subscription for {0}")]
    NotSubscribed(String),

    /// 既未被发现也不是配置的目标设备
    #[error("unknown bacnet device {0}")]
    UnknownDevice(u32),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BacnetError {
    /// Error/Reject/Abort：请求失败，会话健康
    pub fn is_protocol_level(&self) -> bool {
        matches!(
            self,
            BacnetError::ErrorPdu { .. } | BacnetError::Reject(_) | BacnetError::Abort(_)
        )
    }
}

impl From<BacnetError> for DriverError {
    fn from(err: BacnetError) -> Self {
        match err {
            BacnetError::Endpoint(msg) | BacnetError::InvalidArgument(msg) => {
                DriverError::Config(msg)
            }
            BacnetError::Socket(err) => DriverError::Io(err),
            BacnetError::Timeout { .. } => DriverError::Timeout(err.to_string()),
            BacnetError::Conversion(msg) => DriverError::Conversion(msg),
            BacnetError::NotConnected(msg) => DriverError::NotConnected(msg),
            BacnetError::Closed => DriverError::NotConnected(err.to_string()),
            other => DriverError::Protocol(other.to_string()),
        }
    }
}
