//! 设备配置与连接状态。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 协议类型：构造驱动时选定，运行中不可切换。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolType {
    #[default]
    #[serde(alias = "MODBUS_TCP")]
    ModbusTcp,
    #[serde(alias = "MODBUS_RTU")]
    ModbusRtu,
    #[serde(alias = "BACNET_IP")]
    BacnetIp,
    #[serde(alias = "MQTT")]
    Mqtt,
    #[serde(alias = "OPC_UA")]
    OpcUa,
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ProtocolType::ModbusTcp => "MODBUS_TCP",
            ProtocolType::ModbusRtu => "MODBUS_RTU",
            ProtocolType::BacnetIp => "BACNET_IP",
            ProtocolType::Mqtt => "MQTT",
            ProtocolType::OpcUa => "OPC_UA",
        };
        f.write_str(text)
    }
}

/// 驱动连接状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionStatus {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Error = 4,
}

impl ConnectionStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// 未知编码按 Error 处理。
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionStatus::Disconnected,
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            3 => ConnectionStatus::Reconnecting,
            _ => ConnectionStatus::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Reconnecting => "RECONNECTING",
            ConnectionStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 串口校验位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialParity {
    #[default]
    None,
    Even,
    Odd,
}

/// Modbus 子配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// 默认从站 ID (1-247)，点位可单独覆盖
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    /// 字节间超时（毫秒），RTU 下作为串口读超时
    #[serde(default = "default_byte_timeout")]
    pub byte_timeout_ms: u64,
    /// 单次请求最多寄存器数量
    #[serde(default = "default_max_registers")]
    pub max_registers_per_request: u16,
    /// 波特率（RTU）
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// 校验位（RTU）
    #[serde(default)]
    pub parity: SerialParity,
    /// 数据位（RTU）
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// 停止位（RTU）
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// 报文日志环形缓冲容量
    #[serde(default = "default_packet_log_capacity")]
    pub packet_log_capacity: usize,
}

fn default_slave_id() -> u8 {
    1
}

fn default_byte_timeout() -> u64 {
    500
}

fn default_max_registers() -> u16 {
    125
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            slave_id: default_slave_id(),
            byte_timeout_ms: default_byte_timeout(),
            max_registers_per_request: default_max_registers(),
            baud_rate: default_baud_rate(),
            parity: SerialParity::None,
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            packet_log_capacity: default_packet_log_capacity(),
        }
    }
}

/// BACnet/IP 子配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacnetConfig {
    /// 目标设备实例号
    #[serde(default = "default_bacnet_device_id")]
    pub device_id: u32,
    /// 本地 UDP 端口（0 表示由系统分配）
    #[serde(default = "default_bacnet_port")]
    pub local_port: u16,
    /// Who-Is 广播地址
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
    /// 广播目标端口
    #[serde(default = "default_bacnet_port")]
    pub broadcast_port: u16,
    /// APDU 超时（毫秒）
    #[serde(default = "default_apdu_timeout")]
    pub apdu_timeout_ms: u64,
    /// APDU 重试次数
    #[serde(default = "default_apdu_retries")]
    pub apdu_retries: u32,
    #[serde(default = "default_true")]
    pub who_is_enabled: bool,
    /// Who-Is 广播间隔（毫秒）
    #[serde(default = "default_who_is_interval")]
    pub who_is_interval_ms: u64,
    #[serde(default)]
    pub cov_enabled: bool,
    /// COV 订阅生存期（秒）
    #[serde(default = "default_cov_lifetime")]
    pub cov_lifetime_s: u32,
    #[serde(default = "default_max_apdu")]
    pub max_apdu_length: u16,
    /// 报文日志环形缓冲容量
    #[serde(default = "default_packet_log_capacity")]
    pub packet_log_capacity: usize,
}

fn default_bacnet_device_id() -> u32 {
    260001
}

fn default_bacnet_port() -> u16 {
    47808
}

fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}

fn default_apdu_timeout() -> u64 {
    6000
}

fn default_apdu_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_who_is_interval() -> u64 {
    30000
}

fn default_cov_lifetime() -> u32 {
    3600
}

fn default_max_apdu() -> u16 {
    1476
}

fn default_packet_log_capacity() -> usize {
    1000
}

impl Default for BacnetConfig {
    fn default() -> Self {
        Self {
            device_id: default_bacnet_device_id(),
            local_port: default_bacnet_port(),
            broadcast_address: default_broadcast_address(),
            broadcast_port: default_bacnet_port(),
            apdu_timeout_ms: default_apdu_timeout(),
            apdu_retries: default_apdu_retries(),
            who_is_enabled: true,
            who_is_interval_ms: default_who_is_interval(),
            cov_enabled: false,
            cov_lifetime_s: default_cov_lifetime(),
            max_apdu_length: default_max_apdu(),
            packet_log_capacity: default_packet_log_capacity(),
        }
    }
}

/// 会话内 I/O 失败后的自动重连策略（固定间隔）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 两次重连之间的固定间隔（毫秒）
    #[serde(default = "default_reconnect_delay")]
    pub delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_reconnect_delay() -> u64 {
    1000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: default_max_attempts(),
            delay_ms: default_reconnect_delay(),
        }
    }
}

/// 统一设备信息：一个设备对应一个驱动实例。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedDeviceInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: ProtocolType,
    /// 地址串：TCP/BACnet 为 "ip:port"，RTU 为串口路径
    pub endpoint: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// 响应超时（毫秒）
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub modbus_config: ModbusConfig,
    #[serde(default)]
    pub bacnet_config: BacnetConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// 运行时状态，仅由所属驱动写入
    #[serde(default)]
    pub status: ConnectionStatus,
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_timeout() -> u64 {
    1000
}

impl UnifiedDeviceInfo {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        protocol: ProtocolType,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            protocol,
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }
}

impl Default for UnifiedDeviceInfo {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            protocol: ProtocolType::default(),
            endpoint: String::new(),
            poll_interval_ms: default_poll_interval(),
            timeout_ms: default_timeout(),
            enabled: true,
            modbus_config: ModbusConfig::default(),
            bacnet_config: BacnetConfig::default(),
            reconnect: ReconnectPolicy::default(),
            status: ConnectionStatus::Disconnected,
        }
    }
}
