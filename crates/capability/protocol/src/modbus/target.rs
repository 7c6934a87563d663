//! 连接目标：TCP 地址或 RTU 串口参数。

use crate::error::ModbusError;
use domain::{ModbusConfig, ProtocolType, SerialParity, UnifiedDeviceInfo};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

pub const DEFAULT_TCP_PORT: u16 = 502;

/// 串口参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub parity: SerialParity,
    pub data_bits: u8,
    pub stop_bits: u8,
    /// 字符间超时
    pub byte_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusTarget {
    Tcp(SocketAddr),
    Rtu(SerialSettings),
}

impl ModbusTarget {
    /// 按设备协议解析 endpoint。
    pub fn from_device(device: &UnifiedDeviceInfo) -> Result<Self, ModbusError> {
        match device.protocol {
            ProtocolType::ModbusTcp => parse_tcp_endpoint(&device.endpoint).map(ModbusTarget::Tcp),
            ProtocolType::ModbusRtu => serial_settings(&device.endpoint, &device.modbus_config)
                .map(ModbusTarget::Rtu),
            other => Err(ModbusError::Endpoint(format!(
                "protocol {} is not a modbus protocol",
                other
            ))),
        }
    }
}

impl fmt::Display for ModbusTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModbusTarget::Tcp(addr) => write!(f, "tcp://{}", addr),
            ModbusTarget::Rtu(serial) => write!(
                f,
                "rtu://{}?baud={}&parity={:?}&data_bits={}&stop_bits={}",
                serial.path, serial.baud_rate, serial.parity, serial.data_bits, serial.stop_bits
            ),
        }
    }
}

/// "ip:port"，端口缺省 502。
pub fn parse_tcp_endpoint(endpoint: &str) -> Result<SocketAddr, ModbusError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(ModbusError::Endpoint("endpoint is empty".to_string()));
    }
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = endpoint.trim_matches(['[', ']']).parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_TCP_PORT));
    }
    Err(ModbusError::Endpoint(format!(
        "expected ip[:port], got {:?}",
        endpoint
    )))
}

fn serial_settings(endpoint: &str, config: &ModbusConfig) -> Result<SerialSettings, ModbusError> {
    let path = endpoint.trim();
    if path.is_empty() {
        return Err(ModbusError::Endpoint("serial path is empty".to_string()));
    }
    if !(5..=8).contains(&config.data_bits) {
        return Err(ModbusError::Endpoint(format!(
            "unsupported data bits {}",
            config.data_bits
        )));
    }
    if !(1..=2).contains(&config.stop_bits) {
        return Err(ModbusError::Endpoint(format!(
            "unsupported stop bits {}",
            config.stop_bits
        )));
    }
    if config.baud_rate == 0 {
        return Err(ModbusError::Endpoint("baud rate is zero".to_string()));
    }
    Ok(SerialSettings {
        path: path.to_string(),
        baud_rate: config.baud_rate,
        parity: config.parity,
        data_bits: config.data_bits,
        stop_bits: config.stop_bits,
        byte_timeout_ms: config.byte_timeout_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_endpoint_defaults_port() {
        assert_eq!(
            parse_tcp_endpoint("192.168.1.100").expect("ip only"),
            "192.168.1.100:502".parse::<SocketAddr>().expect("addr")
        );
        assert_eq!(
            parse_tcp_endpoint("10.0.0.7:1502").expect("ip and port").port(),
            1502
        );
        assert!(parse_tcp_endpoint("plc.local:502").is_err());
        assert!(parse_tcp_endpoint("10.0.0.7:99999").is_err());
        assert!(parse_tcp_endpoint("").is_err());
    }

    #[test]
    fn rtu_target_uses_serial_config() {
        let mut device =
            UnifiedDeviceInfo::new("rtu-1", "meter", ProtocolType::ModbusRtu, "/dev/ttyUSB0");
        device.modbus_config.baud_rate = 19200;
        match ModbusTarget::from_device(&device).expect("rtu target") {
            ModbusTarget::Rtu(serial) => {
                assert_eq!(serial.path, "/dev/ttyUSB0");
                assert_eq!(serial.baud_rate, 19200);
            }
            other => panic!("unexpected target {other}"),
        }

        device.modbus_config.stop_bits = 3;
        assert!(ModbusTarget::from_device(&device).is_err());
    }
}
