//! 寄存器与点位值之间的转换（大端字序，高位寄存器在前）。

use crate::error::ModbusError;
use domain::{DataType, DataValue, UnifiedDataPoint};

/// 点位读取需要的寄存器数量；字符串类型使用配置的 count。
pub fn register_width(point: &UnifiedDataPoint) -> u16 {
    let configured = point.modbus_address.as_ref().map_or(1, |addr| addr.count.max(1));
    point.data_type.register_count().unwrap_or(configured)
}

/// 解析寄存器数据为原始数值
fn parse_registers(registers: &[u16], data_type: DataType) -> Result<f64, ModbusError> {
    let needed = data_type.register_count().unwrap_or(1) as usize;
    if registers.len() < needed {
        return Err(ModbusError::Conversion(format!(
            "need {} register(s) for {}, got {}",
            needed,
            data_type,
            registers.len()
        )));
    }

    let value = match data_type {
        DataType::Bool => f64::from(u8::from(registers[0] != 0)),
        DataType::Int16 => f64::from(registers[0] as i16),
        DataType::Uint16 => f64::from(registers[0]),
        DataType::Int32 => f64::from(join_u32(registers) as i32),
        DataType::Uint32 => f64::from(join_u32(registers)),
        DataType::Float32 => f64::from(f32::from_bits(join_u32(registers))),
        DataType::Float64 => {
            let bits = registers[..4]
                .iter()
                .fold(0u64, |acc, &reg| (acc << 16) | u64::from(reg));
            f64::from_bits(bits)
        }
        DataType::String => {
            return Err(ModbusError::Conversion(
                "string registers have no numeric value".to_string(),
            ));
        }
    };
    Ok(value)
}

fn join_u32(registers: &[u16]) -> u32 {
    (u32::from(registers[0]) << 16) | u32::from(registers[1])
}

/// 寄存器 -> 原始类型值（未缩放）
pub fn decode_registers(registers: &[u16], data_type: DataType) -> Result<DataValue, ModbusError> {
    if registers.is_empty() {
        return Err(ModbusError::Conversion("empty registers".to_string()));
    }
    if data_type == DataType::String {
        let bytes: Vec<u8> = registers.iter().flat_map(|reg| reg.to_be_bytes()).collect();
        let text = String::from_utf8_lossy(&bytes);
        return Ok(DataValue::String(text.trim_end_matches('\0').to_string()));
    }

    let raw = parse_registers(registers, data_type)?;
    let value = match data_type {
        DataType::Bool => DataValue::Bool(raw != 0.0),
        DataType::Int16 | DataType::Int32 => DataValue::Int32(raw as i32),
        DataType::Uint16 | DataType::Uint32 => DataValue::UInt32(raw as u32),
        DataType::Float32 => DataValue::Float(raw as f32),
        _ => DataValue::Double(raw),
    };
    Ok(value)
}

/// 工程值 -> 寄存器：反向缩放并按点位类型做范围检查。
pub fn encode_registers(point: &UnifiedDataPoint, value: &DataValue) -> Result<Vec<u16>, ModbusError> {
    if point.data_type == DataType::String {
        let DataValue::String(text) = value else {
            return Err(ModbusError::Conversion(format!(
                "point {} expects a string, got {}",
                point.id,
                value.type_name()
            )));
        };
        let width = usize::from(register_width(point));
        if text.len() > width * 2 {
            return Err(ModbusError::Conversion(format!(
                "string of {} bytes does not fit {} register(s)",
                text.len(),
                width
            )));
        }
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(width * 2, 0);
        return Ok(bytes
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect());
    }

    let raw = point.raw_value(value).ok_or_else(|| {
        ModbusError::Conversion(format!(
            "cannot convert {} value for point {}",
            value.type_name(),
            point.id
        ))
    })?;
    let checked = point.data_type.wrap_raw(raw).ok_or_else(|| {
        ModbusError::Conversion(format!(
            "value {} out of range for {} point {}",
            raw, point.data_type, point.id
        ))
    })?;

    let registers = match (point.data_type, checked) {
        (DataType::Bool, DataValue::Bool(on)) => vec![u16::from(on)],
        (DataType::Int16, DataValue::Int32(v)) => vec![v as i16 as u16],
        (DataType::Uint16, DataValue::UInt32(v)) => vec![v as u16],
        (DataType::Int32, DataValue::Int32(v)) => split_u32(v as u32),
        (DataType::Uint32, DataValue::UInt32(v)) => split_u32(v),
        (DataType::Float32, DataValue::Float(v)) => split_u32(v.to_bits()),
        (DataType::Float64, DataValue::Double(v)) => {
            let bits = v.to_bits();
            (0..4).rev().map(|word| (bits >> (word * 16)) as u16).collect()
        }
        (data_type, other) => {
            return Err(ModbusError::Conversion(format!(
                "unexpected {} for {} point",
                other.type_name(),
                data_type
            )));
        }
    };
    Ok(registers)
}

fn split_u32(value: u32) -> Vec<u16> {
    vec![(value >> 16) as u16, value as u16]
}
