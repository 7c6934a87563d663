//! 采集网关统一数据模型：所有协议驱动共享的设备、点位、统计类型。

pub mod data;
pub mod device;
pub mod point;
pub mod statistics;

pub use data::{DataQuality, DataType, DataValue};
pub use device::{
    BacnetConfig, ConnectionStatus, ModbusConfig, ProtocolType, ReconnectPolicy, SerialParity,
    UnifiedDeviceInfo,
};
pub use point::{BacnetAddress, ModbusAddress, UnifiedDataPoint};
pub use statistics::{DriverStatistics, StatisticsSnapshot};

/// 获取当前时间戳（毫秒）
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
