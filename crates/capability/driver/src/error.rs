//! 驱动框架错误类型定义

/// 驱动错误
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// 配置错误（地址、必填字段等），初始化阶段同步失败
    #[error("configuration error: {0}")]
    Config(String),

    #[error("driver is not initialized")]
    NotInitialized,

    /// 运行中不允许重新初始化
    #[error("driver is running")]
    AlreadyRunning,

    /// 建立连接失败（拒绝、不可达）
    #[error("connection error: {0}")]
    Connection(String),

    /// 会话不可用（例如重连预算耗尽后处于 ERROR）
    #[error("not connected: {0}")]
    NotConnected(String),

    /// 超时错误
    #[error("timeout: {0}")]
    Timeout(String),

    /// 协议级错误（异常码、Error/Reject/Abort PDU）
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("data point not found: {0}")]
    PointNotFound(String),

    #[error("data point is read-only: {0}")]
    ReadOnly(String),

    /// 值转换失败（类型不支持或越界）
    #[error("value conversion failed: {0}")]
    Conversion(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
