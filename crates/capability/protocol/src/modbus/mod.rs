//! Modbus TCP / RTU 驱动
//!
//! - `target`: 端点与串口参数解析
//! - `transport`: 会话抽象（tokio-modbus 同步客户端 / 模拟从站）
//! - `registers`: 寄存器与工程值互转
//! - `driver`: 协议实现、批量读与诊断
//! - `stats`: 协议计数器、按从站统计与报文条目

mod driver;
mod registers;
mod simulated;
mod stats;
mod target;
mod transport;

pub use driver::{ModbusDriver, ModbusProtocol};
pub use registers::{decode_registers, encode_registers, register_width};
pub use simulated::{SimulatedConnector, SimulatedDevice};
pub use stats::{ModbusPacketEntry, ModbusStatistics, SlaveStatistics};
pub use target::{DEFAULT_TCP_PORT, ModbusTarget, SerialSettings, parse_tcp_endpoint};
pub use transport::{ModbusConnector, ModbusTransport, NativeConnector, bus_lock};
