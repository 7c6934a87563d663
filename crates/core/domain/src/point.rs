//! 数据点位配置与运行时字段。

use crate::data::{DataQuality, DataType, DataValue};
use serde::{Deserialize, Serialize};

/// Modbus 点位地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusAddress {
    /// 寄存器起始地址
    pub register_address: u16,
    /// 功能码（读：1/2/3/4，写：5/6/15/16）
    #[serde(default = "default_function_code")]
    pub function_code: u8,
    /// 寄存器数量
    #[serde(default = "default_count")]
    pub count: u16,
    /// 覆盖设备默认从站 ID
    #[serde(default)]
    pub slave_id: Option<u8>,
}

fn default_function_code() -> u8 {
    3
}

fn default_count() -> u16 {
    1
}

/// BACnet 点位地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacnetAddress {
    pub object_type: u16,
    pub object_instance: u32,
    /// 属性 ID（默认 present-value = 85）
    #[serde(default = "default_property_id")]
    pub property_id: u32,
    #[serde(default)]
    pub array_index: Option<u32>,
}

fn default_property_id() -> u32 {
    85
}

/// 统一数据点位。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedDataPoint {
    pub id: String,
    /// 所属设备 ID（非拥有引用）
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub modbus_address: Option<ModbusAddress>,
    #[serde(default)]
    pub bacnet_address: Option<BacnetAddress>,
    #[serde(default = "default_scale")]
    pub scale_factor: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub current_value: DataValue,
    #[serde(default)]
    pub quality: DataQuality,
    /// 最后更新时间（毫秒）
    #[serde(default)]
    pub last_update: i64,
}

fn default_scale() -> f64 {
    1.0
}

impl UnifiedDataPoint {
    pub fn new(
        id: impl Into<String>,
        device_id: impl Into<String>,
        name: impl Into<String>,
        data_type: DataType,
    ) -> Self {
        Self {
            id: id.into(),
            device_id: device_id.into(),
            name: name.into(),
            data_type,
            modbus_address: None,
            bacnet_address: None,
            scale_factor: default_scale(),
            offset: 0.0,
            unit: String::new(),
            read_only: false,
            current_value: data_type.default_value(),
            quality: DataQuality::Uncertain,
            last_update: 0,
        }
    }

    /// 附加 Modbus 地址。
    pub fn with_modbus(mut self, function_code: u8, register_address: u16) -> Self {
        self.modbus_address = Some(ModbusAddress {
            register_address,
            function_code,
            count: default_count(),
            slave_id: None,
        });
        self
    }

    /// 附加 BACnet 地址（present-value）。
    pub fn with_bacnet(mut self, object_type: u16, object_instance: u32) -> Self {
        self.bacnet_address = Some(BacnetAddress {
            object_type,
            object_instance,
            property_id: default_property_id(),
            array_index: None,
        });
        self
    }

    pub fn with_scaling(mut self, scale_factor: f64, offset: f64) -> Self {
        self.scale_factor = scale_factor;
        self.offset = offset;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn has_identity_scaling(&self) -> bool {
        self.scale_factor == 1.0 && self.offset == 0.0
    }

    /// 原始值换算为工程值：非恒等缩放时数值统一为 Double。
    pub fn engineering_value(&self, raw: DataValue) -> DataValue {
        if self.has_identity_scaling() {
            return raw;
        }
        match raw {
            DataValue::Bool(_) | DataValue::String(_) => raw,
            other => match other.as_f64() {
                Some(v) => DataValue::Double(v * self.scale_factor + self.offset),
                None => other,
            },
        }
    }

    /// 工程值反算原始值；缩放系数为 0 或值不是数值时返回 None。
    pub fn raw_value(&self, value: &DataValue) -> Option<f64> {
        let engineering = value.as_f64()?;
        if self.has_identity_scaling() || matches!(value, DataValue::Bool(_)) {
            return Some(engineering);
        }
        if self.scale_factor == 0.0 {
            return None;
        }
        Some((engineering - self.offset) / self.scale_factor)
    }

    /// 写入一次读取结果。
    pub fn update(&mut self, value: DataValue, quality: DataQuality, timestamp_ms: i64) {
        self.current_value = value;
        self.quality = quality;
        self.last_update = timestamp_ms;
    }

    /// 标记读取失败：保留旧值，质量置 BAD。
    pub fn mark_bad(&mut self, timestamp_ms: i64) {
        self.quality = DataQuality::Bad;
        self.last_update = timestamp_ms;
    }
}
