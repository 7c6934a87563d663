//! 采集进程运行配置加载。

use domain::UnifiedDeviceInfo;
use std::env;
use std::str::FromStr;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 采集进程运行配置。
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// 设备清单文件（JSON）
    pub devices_file: String,
    /// RUST_LOG 未设置时的日志过滤指令
    pub log_filter: String,
    /// Modbus 设备使用模拟传输
    pub simulation: bool,
    /// 统计日志输出间隔（秒），0 表示关闭
    pub stats_interval_secs: u64,
    pub overrides: DeviceOverrides,
}

/// 对所有设备生效的环境变量覆盖项（未设置则保留设备自身配置）。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceOverrides {
    pub poll_interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub auto_reconnect: Option<bool>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_delay_ms: Option<u64>,
    pub bacnet_local_port: Option<u16>,
    pub packet_log_capacity: Option<usize>,
}

impl DeviceOverrides {
    /// 把覆盖项写入设备配置。
    pub fn apply(&self, device: &mut UnifiedDeviceInfo) {
        if let Some(value) = self.poll_interval_ms {
            device.poll_interval_ms = value;
        }
        if let Some(value) = self.timeout_ms {
            device.timeout_ms = value;
        }
        if let Some(value) = self.auto_reconnect {
            device.reconnect.auto_reconnect = value;
        }
        if let Some(value) = self.max_reconnect_attempts {
            device.reconnect.max_attempts = value;
        }
        if let Some(value) = self.reconnect_delay_ms {
            device.reconnect.delay_ms = value;
        }
        if let Some(value) = self.bacnet_local_port {
            device.bacnet_config.local_port = value;
        }
        if let Some(value) = self.packet_log_capacity {
            device.bacnet_config.packet_log_capacity = value;
        }
    }
}

impl CollectorConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let devices_file = env::var("COLLECTOR_DEVICES_FILE")
            .map_err(|_| ConfigError::Missing("COLLECTOR_DEVICES_FILE".to_string()))?;
        let log_filter = env::var("COLLECTOR_LOG_FILTER").unwrap_or_else(|_| "info".to_string());
        let simulation = read_bool_with_default("COLLECTOR_SIMULATION", false);
        let stats_interval_secs = read_u64_with_default("COLLECTOR_STATS_INTERVAL_SECS", 60)?;

        let overrides = DeviceOverrides {
            poll_interval_ms: read_optional_positive("COLLECTOR_POLL_INTERVAL_MS")?,
            timeout_ms: read_optional_positive("COLLECTOR_TIMEOUT_MS")?,
            auto_reconnect: read_optional("COLLECTOR_AUTO_RECONNECT")
                .map(|value| parse_bool(&value)),
            max_reconnect_attempts: read_optional_parsed("COLLECTOR_MAX_RECONNECT_ATTEMPTS")?,
            reconnect_delay_ms: read_optional_parsed("COLLECTOR_RECONNECT_DELAY_MS")?,
            bacnet_local_port: read_optional_parsed("COLLECTOR_BACNET_LOCAL_PORT")?,
            packet_log_capacity: read_optional_positive("COLLECTOR_PACKET_LOG_CAPACITY")?,
        };

        Ok(Self {
            devices_file,
            log_filter,
            simulation,
            stats_interval_secs,
            overrides,
        })
    }
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_optional_parsed<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match read_optional(key) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key.to_string(), value)),
        None => Ok(None),
    }
}

/// 0 视为非法（间隔、超时、容量均必须为正）。
fn read_optional_positive<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    match read_optional_parsed::<T>(key)? {
        Some(value) if value == T::default() => {
            Err(ConfigError::Invalid(key.to_string(), "0".to_string()))
        }
        other => Ok(other),
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on")
}
