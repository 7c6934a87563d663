//! # 协议驱动能力模块
//!
//! 基于统一驱动框架（`collector-driver`）实现的协议驱动：
//! - **Modbus TCP / RTU**：保持/输入寄存器、线圈、离散输入、分块批量读；报文日志；支持模拟从站
//! - **BACnet/IP**：Who-Is 发现、ReadProperty / WriteProperty、COV 订阅、报文日志
//!
//! ## 架构设计
//!
//! ```text
//! 设备清单 (UnifiedDeviceInfo + UnifiedDataPoint)
//!       │
//!       ▼
//! DriverFactory ── ProtocolType → 构造函数
//!       │
//!       ├── ModbusDriver  = UnifiedDriver<ModbusProtocol>
//!       └── BacnetDriver  = UnifiedDriver<BacnetProtocol>
//!       │
//!       ▼
//! DataCallback / StatusCallback
//! ```
//!
//! ## 设备配置示例
//!
//! ```json
//! { "id": "meter-1", "protocol": "modbus_tcp", "endpoint": "192.168.1.100:502",
//!   "modbus_config": { "slave_id": 1 } }
//!
//! { "id": "ahu-1", "protocol": "bacnet_ip", "endpoint": "192.168.1.50",
//!   "bacnet_config": { "device_id": 260001, "cov_enabled": true } }
//! ```

pub mod bacnet;
pub mod error;
mod factory;
pub mod modbus;
pub mod packet_log;

pub use bacnet::{BacnetDriver, BacnetProtocol};
pub use error::{BacnetError, CodecError, ModbusError, exception_name};
pub use factory::{DriverConstructor, DriverFactory};
pub use modbus::{ModbusDriver, ModbusProtocol, SimulatedDevice};
pub use packet_log::{PacketDirection, PacketLog};
