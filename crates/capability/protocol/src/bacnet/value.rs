//! BACnet 应用层数据值及其与 [`DataValue`] 的转换。

use super::codec::{ObjectId, object_type};
use crate::error::BacnetError;
use domain::{DataType, DataValue, UnifiedDataPoint};
use std::fmt;

/// BACnet 应用标签值
#[derive(Debug, Clone, PartialEq)]
pub enum BacnetValue {
    Null,
    Boolean(bool),
    Unsigned(u32),
    Signed(i32),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    BitString { unused_bits: u8, bytes: Vec<u8> },
    Enumerated(u32),
    /// 年(-1900) / 月 / 日 / 星期
    Date([u8; 4]),
    /// 时 / 分 / 秒 / 百分秒
    Time([u8; 4]),
    ObjectId(ObjectId),
}

impl BacnetValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            BacnetValue::Null => "null",
            BacnetValue::Boolean(_) => "boolean",
            BacnetValue::Unsigned(_) => "unsigned",
            BacnetValue::Signed(_) => "signed",
            BacnetValue::Real(_) => "real",
            BacnetValue::Double(_) => "double",
            BacnetValue::OctetString(_) => "octet-string",
            BacnetValue::CharacterString(_) => "character-string",
            BacnetValue::BitString { .. } => "bit-string",
            BacnetValue::Enumerated(_) => "enumerated",
            BacnetValue::Date(_) => "date",
            BacnetValue::Time(_) => "time",
            BacnetValue::ObjectId(_) => "object-identifier",
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            BacnetValue::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            BacnetValue::Unsigned(v) | BacnetValue::Enumerated(v) => Some(f64::from(*v)),
            BacnetValue::Signed(v) => Some(f64::from(*v)),
            BacnetValue::Real(v) => Some(f64::from(*v)),
            BacnetValue::Double(v) => Some(*v),
            BacnetValue::CharacterString(text) => text.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for BacnetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BacnetValue::Null => f.write_str("null"),
            BacnetValue::Boolean(v) => write!(f, "{}", v),
            BacnetValue::Unsigned(v) | BacnetValue::Enumerated(v) => write!(f, "{}", v),
            BacnetValue::Signed(v) => write!(f, "{}", v),
            BacnetValue::Real(v) => write!(f, "{}", v),
            BacnetValue::Double(v) => write!(f, "{}", v),
            BacnetValue::OctetString(bytes) | BacnetValue::BitString { bytes, .. } => {
                for byte in bytes {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            BacnetValue::CharacterString(text) => f.write_str(text),
            BacnetValue::Date([year, month, day, _]) => {
                write!(f, "{:04}-{:02}-{:02}", 1900 + u32::from(*year), month, day)
            }
            BacnetValue::Time([hour, minute, second, hundredths]) => {
                write!(f, "{:02}:{:02}:{:02}.{:02}", hour, minute, second, hundredths)
            }
            BacnetValue::ObjectId(id) => write!(f, "{}", id),
        }
    }
}

/// 读取结果按点位数据类型转为运行时值（原始值，不含工程换算）。
pub fn to_data_value(value: &BacnetValue, data_type: DataType) -> Result<DataValue, BacnetError> {
    if data_type == DataType::String {
        return match value {
            BacnetValue::Null => Err(unsupported(value, data_type)),
            other => Ok(DataValue::String(other.to_string())),
        };
    }
    let raw = value
        .as_f64()
        .ok_or_else(|| unsupported(value, data_type))?;
    data_type.wrap_raw(raw).ok_or_else(|| {
        BacnetError::Conversion(format!("{} {} is out of range for {}", value.type_name(), value, data_type))
    })
}

/// 写入值按对象类型选择应用标签：二值对象写枚举，多态对象写无符号，模拟量写 Real。
pub fn from_data_value(
    point: &UnifiedDataPoint,
    object_type_id: u16,
    value: &DataValue,
) -> Result<BacnetValue, BacnetError> {
    if let DataValue::String(text) = value
        && point.data_type == DataType::String
    {
        return Ok(BacnetValue::CharacterString(text.clone()));
    }
    let raw = point.raw_value(value).ok_or_else(|| {
        BacnetError::Conversion(format!(
            "cannot write {} to point {} ({})",
            value.type_name(),
            point.id,
            point.data_type
        ))
    })?;

    match object_type_id {
        object_type::BINARY_INPUT | object_type::BINARY_OUTPUT | object_type::BINARY_VALUE => {
            Ok(BacnetValue::Enumerated(u32::from(raw != 0.0)))
        }
        object_type::MULTI_STATE_INPUT
        | object_type::MULTI_STATE_OUTPUT
        | object_type::MULTI_STATE_VALUE => unsigned(raw).map(BacnetValue::Unsigned),
        object_type::ANALOG_INPUT | object_type::ANALOG_OUTPUT | object_type::ANALOG_VALUE => {
            Ok(BacnetValue::Real(raw as f32))
        }
        _ => match point.data_type {
            DataType::Bool => Ok(BacnetValue::Boolean(raw != 0.0)),
            DataType::Int16 | DataType::Int32 => signed(raw).map(BacnetValue::Signed),
            DataType::Uint16 | DataType::Uint32 => unsigned(raw).map(BacnetValue::Unsigned),
            DataType::Float32 => Ok(BacnetValue::Real(raw as f32)),
            DataType::Float64 => Ok(BacnetValue::Double(raw)),
            DataType::String => Ok(BacnetValue::CharacterString(value.to_string())),
        },
    }
}

fn unsigned(raw: f64) -> Result<u32, BacnetError> {
    let rounded = raw.round();
    if rounded.is_finite() && rounded >= 0.0 && rounded <= f64::from(u32::MAX) {
        Ok(rounded as u32)
    } else {
        Err(BacnetError::Conversion(format!("{} does not fit an unsigned value", raw)))
    }
}

fn signed(raw: f64) -> Result<i32, BacnetError> {
    let rounded = raw.round();
    if rounded.is_finite() && rounded >= f64::from(i32::MIN) && rounded <= f64::from(i32::MAX) {
        Ok(rounded as i32)
    } else {
        Err(BacnetError::Conversion(format!("{} does not fit a signed value", raw)))
    }
}

fn unsupported(value: &BacnetValue, data_type: DataType) -> BacnetError {
    BacnetError::Conversion(format!("cannot convert {} to {}", value.type_name(), data_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(data_type: DataType) -> UnifiedDataPoint {
        UnifiedDataPoint::new("p", "dev", "p", data_type)
    }

    #[test]
    fn reads_follow_point_type() {
        assert_eq!(
            to_data_value(&BacnetValue::Real(21.5), DataType::Float32).expect("real"),
            DataValue::Float(21.5)
        );
        assert_eq!(
            to_data_value(&BacnetValue::Enumerated(1), DataType::Bool).expect("enum"),
            DataValue::Bool(true)
        );
        assert_eq!(
            to_data_value(&BacnetValue::Unsigned(3), DataType::String).expect("text"),
            DataValue::String("3".to_string())
        );
        assert!(to_data_value(&BacnetValue::Signed(-1), DataType::Uint16).is_err());
        assert!(to_data_value(&BacnetValue::Null, DataType::Float64).is_err());
    }

    #[test]
    fn writes_pick_tag_from_object_type() {
        let p = point(DataType::Float32);
        assert_eq!(
            from_data_value(&p, object_type::ANALOG_VALUE, &DataValue::Double(12.25))
                .expect("analog"),
            BacnetValue::Real(12.25)
        );
        assert_eq!(
            from_data_value(&p, object_type::BINARY_OUTPUT, &DataValue::Bool(true))
                .expect("binary"),
            BacnetValue::Enumerated(1)
        );
        assert_eq!(
            from_data_value(&p, object_type::MULTI_STATE_VALUE, &DataValue::UInt32(4))
                .expect("multi-state"),
            BacnetValue::Unsigned(4)
        );
        assert!(
            from_data_value(&p, object_type::MULTI_STATE_VALUE, &DataValue::Int32(-2)).is_err()
        );
        assert!(
            from_data_value(&p, object_type::ANALOG_VALUE, &DataValue::String("x".into()))
                .is_err()
        );
    }

    #[test]
    fn writes_reverse_scaling() {
        let p = point(DataType::Int32).with_scaling(0.1, 0.0);
        assert_eq!(
            from_data_value(&p, 40, &DataValue::Double(12.3)).expect("scaled"),
            BacnetValue::Signed(123)
        );
    }
}
