//! BACnet 报文日志条目。

use crate::packet_log::PacketDirection;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketLogEntry {
    pub direction: PacketDirection,
    pub timestamp_ms: i64,
    pub device_id: u32,
    pub object_type: u16,
    pub object_instance: u32,
    pub property_id: u32,
    pub success: bool,
    pub error: Option<String>,
    pub latency_ms: f64,
    /// 解码后的值（便于现场排查）
    pub decoded_value: String,
}
