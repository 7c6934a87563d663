//! 设备清单加载：JSON 数组，每项为 `{ "device": {...}, "points": [...] }`。

use collector_config::DeviceOverrides;
use domain::{UnifiedDataPoint, UnifiedDeviceInfo};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DeviceFileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid device file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate device id: {0}")]
    DuplicateDevice(String),
}

/// 一台设备及其点位。
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub device: UnifiedDeviceInfo,
    #[serde(default)]
    pub points: Vec<UnifiedDataPoint>,
}

pub fn load(path: &str, overrides: &DeviceOverrides) -> Result<Vec<DeviceEntry>, DeviceFileError> {
    let text = std::fs::read_to_string(Path::new(path)).map_err(|source| DeviceFileError::Io {
        path: path.to_string(),
        source,
    })?;
    parse(&text, overrides)
}

/// 解析设备清单：缺省 ID 以 UUID 补齐，点位归属补齐为所属设备，再应用环境覆盖项。
pub fn parse(text: &str, overrides: &DeviceOverrides) -> Result<Vec<DeviceEntry>, DeviceFileError> {
    let mut raw: Vec<Value> = serde_json::from_str(text)?;
    for entry in &mut raw {
        if let Some(device) = entry.get_mut("device").and_then(Value::as_object_mut) {
            let missing_id = device
                .get("id")
                .and_then(Value::as_str)
                .is_none_or(|id| id.trim().is_empty());
            if missing_id {
                device.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
            }
        }
    }

    let mut entries = Vec::with_capacity(raw.len());
    for value in raw {
        let mut entry: DeviceEntry = serde_json::from_value(value)?;
        if entries
            .iter()
            .any(|existing: &DeviceEntry| existing.device.id == entry.device.id)
        {
            return Err(DeviceFileError::DuplicateDevice(entry.device.id));
        }
        overrides.apply(&mut entry.device);
        for point in &mut entry.points {
            if point.device_id.is_empty() {
                point.device_id = entry.device.id.clone();
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}
