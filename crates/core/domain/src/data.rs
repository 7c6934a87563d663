//! 点位运行时值、质量码与数据类型。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 点位运行时值（封闭的标签联合）。
///
/// 所有协议转换器必须显式处理每个分支，无法表示时返回错误而不是截断。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DataValue {
    Bool(bool),
    Int32(i32),
    #[serde(rename = "uint32")]
    UInt32(u32),
    Float(f32),
    Double(f64),
    String(String),
}

impl DataValue {
    /// 数值视图（布尔按 0/1），字符串返回 None。
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            DataValue::Int32(v) => Some(f64::from(*v)),
            DataValue::UInt32(v) => Some(f64::from(*v)),
            DataValue::Float(v) => Some(f64::from(*v)),
            DataValue::Double(v) => Some(*v),
            DataValue::String(_) => None,
        }
    }

    /// 布尔视图：数值非零即为 true，字符串返回 None。
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Bool(v) => Some(*v),
            DataValue::String(_) => None,
            other => other.as_f64().map(|v| v != 0.0),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DataValue::Bool(_) => "bool",
            DataValue::Int32(_) => "int32",
            DataValue::UInt32(_) => "uint32",
            DataValue::Float(_) => "float",
            DataValue::Double(_) => "double",
            DataValue::String(_) => "string",
        }
    }
}

impl Default for DataValue {
    fn default() -> Self {
        DataValue::Double(0.0)
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Bool(v) => write!(f, "{}", v),
            DataValue::Int32(v) => write!(f, "{}", v),
            DataValue::UInt32(v) => write!(f, "{}", v),
            DataValue::Float(v) => write!(f, "{}", v),
            DataValue::Double(v) => write!(f, "{}", v),
            DataValue::String(v) => f.write_str(v),
        }
    }
}

/// 点位质量码，与数值本身独立。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    Good,
    Bad,
    #[default]
    Uncertain,
}

impl fmt::Display for DataQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DataQuality::Good => "GOOD",
            DataQuality::Bad => "BAD",
            DataQuality::Uncertain => "UNCERTAIN",
        };
        f.write_str(text)
    }
}

/// 点位数据类型（决定寄存器宽度与值转换方式）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[serde(alias = "boolean")]
    Bool,
    /// 16位有符号整数
    #[serde(alias = "int")]
    Int16,
    /// 16位无符号整数
    #[default]
    Uint16,
    /// 32位有符号整数（2个寄存器）
    Int32,
    /// 32位无符号整数（2个寄存器）
    Uint32,
    /// 32位浮点数（2个寄存器）
    #[serde(alias = "float")]
    Float32,
    /// 64位浮点数（4个寄存器）
    #[serde(alias = "double")]
    Float64,
    String,
}

impl DataType {
    /// 占用的 Modbus 寄存器数量；字符串不支持寄存器映射。
    pub fn register_count(self) -> Option<u16> {
        match self {
            DataType::Bool | DataType::Int16 | DataType::Uint16 => Some(1),
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => Some(2),
            DataType::Float64 => Some(4),
            DataType::String => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, DataType::Bool | DataType::String)
    }

    /// 首次读取前的占位值。
    pub fn default_value(self) -> DataValue {
        match self {
            DataType::Bool => DataValue::Bool(false),
            DataType::Int16 | DataType::Int32 => DataValue::Int32(0),
            DataType::Uint16 | DataType::Uint32 => DataValue::UInt32(0),
            DataType::Float32 => DataValue::Float(0.0),
            DataType::Float64 => DataValue::Double(0.0),
            DataType::String => DataValue::String(String::new()),
        }
    }

    /// 按数据类型把原始数值包装为运行时值；整数类型四舍五入后再做范围检查，
    /// 越界或非有限值返回 None。
    pub fn wrap_raw(self, raw: f64) -> Option<DataValue> {
        if !raw.is_finite() {
            return None;
        }
        let whole = raw.round();
        let value = match self {
            DataType::Bool => DataValue::Bool(raw != 0.0),
            DataType::Int16 if whole >= f64::from(i16::MIN) && whole <= f64::from(i16::MAX) => {
                DataValue::Int32(whole as i32)
            }
            DataType::Int32 if whole >= f64::from(i32::MIN) && whole <= f64::from(i32::MAX) => {
                DataValue::Int32(whole as i32)
            }
            DataType::Uint16 if whole >= 0.0 && whole <= f64::from(u16::MAX) => {
                DataValue::UInt32(whole as u32)
            }
            DataType::Uint32 if whole >= 0.0 && whole <= f64::from(u32::MAX) => {
                DataValue::UInt32(whole as u32)
            }
            DataType::Float32 => DataValue::Float(raw as f32),
            DataType::Float64 => DataValue::Double(raw),
            _ => return None,
        };
        Some(value)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DataType::Bool => "bool",
            DataType::Int16 => "int16",
            DataType::Uint16 => "uint16",
            DataType::Int32 => "int32",
            DataType::Uint32 => "uint32",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::String => "string",
        };
        f.write_str(text)
    }
}
