//! BACnet/IP 报文编解码
//!
//! 覆盖 BVLC / NPDU / APDU 三层以及驱动用到的服务：
//! Who-Is、I-Am、ReadProperty、WriteProperty、SubscribeCOV 与 COV 通知。
//! 不支持分段报文。

use super::value::BacnetValue;
use crate::error::CodecError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::fmt;

pub const BVLC_TYPE: u8 = 0x81;
pub const BVLC_FORWARDED_NPDU: u8 = 0x04;
pub const BVLC_DISTRIBUTE_BROADCAST: u8 = 0x09;
pub const BVLC_ORIGINAL_UNICAST: u8 = 0x0A;
pub const BVLC_ORIGINAL_BROADCAST: u8 = 0x0B;

const BVLC_HEADER_LEN: usize = 4;
const NPDU_VERSION: u8 = 0x01;
const NPDU_NETWORK_MESSAGE: u8 = 0x80;
const NPDU_DNET: u8 = 0x20;
const NPDU_SNET: u8 = 0x08;
const NPDU_EXPECTING_REPLY: u8 = 0x04;

/// 实例号上限（22 位）
pub const MAX_INSTANCE: u32 = 0x3F_FFFF;
const MAX_OBJECT_TYPE: u16 = 0x3FF;

pub mod service {
    pub const CONFIRMED_COV_NOTIFICATION: u8 = 1;
    pub const SUBSCRIBE_COV: u8 = 5;
    pub const READ_PROPERTY: u8 = 12;
    pub const WRITE_PROPERTY: u8 = 15;

    pub const I_AM: u8 = 0;
    pub const UNCONFIRMED_COV_NOTIFICATION: u8 = 2;
    pub const WHO_IS: u8 = 8;
}

pub mod property {
    pub const OBJECT_LIST: u32 = 76;
    pub const OBJECT_NAME: u32 = 77;
    pub const PRESENT_VALUE: u32 = 85;
}

pub mod object_type {
    pub const ANALOG_INPUT: u16 = 0;
    pub const ANALOG_OUTPUT: u16 = 1;
    pub const ANALOG_VALUE: u16 = 2;
    pub const BINARY_INPUT: u16 = 3;
    pub const BINARY_OUTPUT: u16 = 4;
    pub const BINARY_VALUE: u16 = 5;
    pub const DEVICE: u16 = 8;
    pub const MULTI_STATE_INPUT: u16 = 13;
    pub const MULTI_STATE_OUTPUT: u16 = 14;
    pub const MULTI_STATE_VALUE: u16 = 19;
}

pub mod reject_reason {
    pub const INVALID_TAG: u8 = 4;
    pub const UNRECOGNIZED_SERVICE: u8 = 9;
}

/// 对象标识（类型 + 实例）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectId {
    pub object_type: u16,
    pub instance: u32,
}

impl ObjectId {
    pub fn new(object_type: u16, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    pub fn device(instance: u32) -> Self {
        Self::new(object_type::DEVICE, instance)
    }

    pub fn to_raw(self) -> Result<u32, CodecError> {
        if self.object_type > MAX_OBJECT_TYPE || self.instance > MAX_INSTANCE {
            return Err(CodecError::InvalidValue(format!(
                "object identifier {} out of range",
                self
            )));
        }
        Ok((u32::from(self.object_type) << 22) | self.instance)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self::new((raw >> 22) as u16, raw & MAX_INSTANCE)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

// ---------------------------------------------------------------------------
// 标签写入
// ---------------------------------------------------------------------------

fn put_tag(buf: &mut BytesMut, number: u8, context: bool, lvt: u32) {
    let class = if context { 0x08 } else { 0x00 };
    let head = if number <= 14 { number << 4 } else { 0xF0 };
    let small = lvt <= 4;
    buf.put_u8(head | class | if small { lvt as u8 } else { 5 });
    if number > 14 {
        buf.put_u8(number);
    }
    if small {
        return;
    }
    if lvt <= 253 {
        buf.put_u8(lvt as u8);
    } else if lvt <= u32::from(u16::MAX) {
        buf.put_u8(254);
        buf.put_u16(lvt as u16);
    } else {
        buf.put_u8(255);
        buf.put_u32(lvt);
    }
}

fn put_opening(buf: &mut BytesMut, number: u8) {
    buf.put_u8((number << 4) | 0x0E);
}

fn put_closing(buf: &mut BytesMut, number: u8) {
    buf.put_u8((number << 4) | 0x0F);
}

fn unsigned_len(value: u32) -> u32 {
    match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

fn signed_len(value: i32) -> u32 {
    match value {
        -0x80..=0x7F => 1,
        -0x8000..=0x7FFF => 2,
        -0x80_0000..=0x7F_FFFF => 3,
        _ => 4,
    }
}

fn put_unsigned_body(buf: &mut BytesMut, value: u32) {
    let len = unsigned_len(value) as usize;
    buf.put_slice(&value.to_be_bytes()[4 - len..]);
}

fn put_context_unsigned(buf: &mut BytesMut, number: u8, value: u32) {
    put_tag(buf, number, true, unsigned_len(value));
    put_unsigned_body(buf, value);
}

fn put_context_object_id(buf: &mut BytesMut, number: u8, id: ObjectId) -> Result<(), CodecError> {
    let raw = id.to_raw()?;
    put_tag(buf, number, true, 4);
    buf.put_u32(raw);
    Ok(())
}

/// 应用标签编码
pub fn put_application_value(buf: &mut BytesMut, value: &BacnetValue) -> Result<(), CodecError> {
    match value {
        BacnetValue::Null => put_tag(buf, 0, false, 0),
        BacnetValue::Boolean(v) => put_tag(buf, 1, false, u32::from(*v)),
        BacnetValue::Unsigned(v) => {
            put_tag(buf, 2, false, unsigned_len(*v));
            put_unsigned_body(buf, *v);
        }
        BacnetValue::Signed(v) => {
            let len = signed_len(*v) as usize;
            put_tag(buf, 3, false, len as u32);
            buf.put_slice(&v.to_be_bytes()[4 - len..]);
        }
        BacnetValue::Real(v) => {
            put_tag(buf, 4, false, 4);
            buf.put_f32(*v);
        }
        BacnetValue::Double(v) => {
            put_tag(buf, 5, false, 8);
            buf.put_f64(*v);
        }
        BacnetValue::OctetString(bytes) => {
            put_tag(buf, 6, false, bytes.len() as u32);
            buf.put_slice(bytes);
        }
        BacnetValue::CharacterString(text) => {
            // 字符集 0 = UTF-8
            put_tag(buf, 7, false, text.len() as u32 + 1);
            buf.put_u8(0);
            buf.put_slice(text.as_bytes());
        }
        BacnetValue::BitString { unused_bits, bytes } => {
            put_tag(buf, 8, false, bytes.len() as u32 + 1);
            buf.put_u8(*unused_bits);
            buf.put_slice(bytes);
        }
        BacnetValue::Enumerated(v) => {
            put_tag(buf, 9, false, unsigned_len(*v));
            put_unsigned_body(buf, *v);
        }
        BacnetValue::Date(bytes) => {
            put_tag(buf, 10, false, 4);
            buf.put_slice(bytes);
        }
        BacnetValue::Time(bytes) => {
            put_tag(buf, 11, false, 4);
            buf.put_slice(bytes);
        }
        BacnetValue::ObjectId(id) => {
            let raw = id.to_raw()?;
            put_tag(buf, 12, false, 4);
            buf.put_u32(raw);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// 标签读取
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    /// 长度（应用布尔标签时为值本身）
    Length(u32),
    Opening,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tag {
    number: u8,
    context: bool,
    kind: TagKind,
}

impl Tag {
    fn is_opening(&self, number: u8) -> bool {
        self.context && self.number == number && self.kind == TagKind::Opening
    }

    fn is_closing(&self, number: u8) -> bool {
        self.context && self.number == number && self.kind == TagKind::Closing
    }

    fn is_context(&self, number: u8) -> bool {
        self.context && self.number == number && matches!(self.kind, TagKind::Length(_))
    }
}

/// 带偏移检查的只读游标
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(CodecError::Truncated {
                offset: self.pos,
                needed: len,
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn tag(&mut self) -> Result<Tag, CodecError> {
        let head = self.u8()?;
        let mut number = head >> 4;
        if number == 0x0F {
            number = self.u8()?;
        }
        let context = head & 0x08 != 0;
        let lvt = head & 0x07;
        let kind = match lvt {
            6 if context => TagKind::Opening,
            7 if context => TagKind::Closing,
            5 => {
                let first = self.u8()?;
                let len = match first {
                    254 => u32::from(self.u16()?),
                    255 => self.u32()?,
                    short => u32::from(short),
                };
                TagKind::Length(len)
            }
            short => TagKind::Length(u32::from(short)),
        };
        Ok(Tag {
            number,
            context,
            kind,
        })
    }

    fn peek_tag(&self) -> Option<Tag> {
        let mut probe = Reader {
            buf: self.buf,
            pos: self.pos,
        };
        probe.tag().ok()
    }

    fn unsigned(&mut self, len: u32) -> Result<u32, CodecError> {
        if !(1..=4).contains(&len) {
            return Err(CodecError::InvalidValue(format!(
                "unsigned length {} not supported",
                len
            )));
        }
        Ok(self
            .take(len as usize)?
            .iter()
            .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte)))
    }

    fn signed(&mut self, len: u32) -> Result<i32, CodecError> {
        let raw = self.unsigned(len)?;
        let shift = 32 - len * 8;
        Ok(((raw << shift) as i32) >> shift)
    }

    fn expect_context(&mut self, number: u8) -> Result<u32, CodecError> {
        let offset = self.pos;
        let tag = self.tag()?;
        match tag.kind {
            TagKind::Length(len) if tag.context && tag.number == number => Ok(len),
            _ => Err(CodecError::UnexpectedTag(format!(
                "expected context tag {} at offset {}",
                number, offset
            ))),
        }
    }

    fn expect_opening(&mut self, number: u8) -> Result<(), CodecError> {
        let offset = self.pos;
        if self.tag()?.is_opening(number) {
            Ok(())
        } else {
            Err(CodecError::UnexpectedTag(format!(
                "expected opening tag {} at offset {}",
                number, offset
            )))
        }
    }

    fn context_unsigned(&mut self, number: u8) -> Result<u32, CodecError> {
        let len = self.expect_context(number)?;
        self.unsigned(len)
    }

    fn optional_context_unsigned(&mut self, number: u8) -> Result<Option<u32>, CodecError> {
        match self.peek_tag() {
            Some(tag) if tag.is_context(number) => self.context_unsigned(number).map(Some),
            _ => Ok(None),
        }
    }

    fn context_object_id(&mut self, number: u8) -> Result<ObjectId, CodecError> {
        let len = self.expect_context(number)?;
        if len != 4 {
            return Err(CodecError::InvalidValue(format!(
                "object identifier length {}",
                len
            )));
        }
        Ok(ObjectId::from_raw(self.u32()?))
    }

    fn application_value(&mut self) -> Result<BacnetValue, CodecError> {
        let offset = self.pos;
        let tag = self.tag()?;
        let TagKind::Length(len) = tag.kind else {
            return Err(CodecError::UnexpectedTag(format!(
                "expected application tag at offset {}",
                offset
            )));
        };
        if tag.context {
            return Err(CodecError::UnexpectedTag(format!(
                "context tag {} where application value expected",
                tag.number
            )));
        }
        let value = match tag.number {
            0 => BacnetValue::Null,
            1 => BacnetValue::Boolean(len != 0),
            2 => BacnetValue::Unsigned(self.unsigned(len)?),
            3 => BacnetValue::Signed(self.signed(len)?),
            4 => {
                fixed_len(len, 4, "real")?;
                BacnetValue::Real(f32::from_bits(self.u32()?))
            }
            5 => {
                fixed_len(len, 8, "double")?;
                let bytes = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                BacnetValue::Double(f64::from_be_bytes(raw))
            }
            6 => BacnetValue::OctetString(self.take(len as usize)?.to_vec()),
            7 => {
                let bytes = self.take(len as usize)?;
                let (charset, text) = bytes.split_first().ok_or_else(|| {
                    CodecError::InvalidValue("empty character string".to_string())
                })?;
                if *charset != 0 {
                    return Err(CodecError::InvalidValue(format!(
                        "character set {} not supported",
                        charset
                    )));
                }
                BacnetValue::CharacterString(String::from_utf8_lossy(text).into_owned())
            }
            8 => {
                let bytes = self.take(len as usize)?;
                let (unused_bits, bytes) = bytes
                    .split_first()
                    .ok_or_else(|| CodecError::InvalidValue("empty bit string".to_string()))?;
                BacnetValue::BitString {
                    unused_bits: *unused_bits,
                    bytes: bytes.to_vec(),
                }
            }
            9 => BacnetValue::Enumerated(self.unsigned(len)?),
            10 | 11 => {
                fixed_len(len, 4, "date/time")?;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(self.take(4)?);
                if tag.number == 10 {
                    BacnetValue::Date(raw)
                } else {
                    BacnetValue::Time(raw)
                }
            }
            12 => {
                fixed_len(len, 4, "object identifier")?;
                BacnetValue::ObjectId(ObjectId::from_raw(self.u32()?))
            }
            other => {
                return Err(CodecError::UnexpectedTag(format!(
                    "unknown application tag {}",
                    other
                )));
            }
        };
        Ok(value)
    }

    /// 读取包围在 opening/closing 标签内的应用值列表
    fn enclosed_values(&mut self, number: u8) -> Result<Vec<BacnetValue>, CodecError> {
        self.expect_opening(number)?;
        let mut values = Vec::new();
        loop {
            match self.peek_tag() {
                Some(tag) if tag.is_closing(number) => {
                    self.tag()?;
                    return Ok(values);
                }
                Some(_) => values.push(self.application_value()?),
                None => {
                    return Err(CodecError::Truncated {
                        offset: self.pos,
                        needed: 1,
                    });
                }
            }
        }
    }
}

fn fixed_len(len: u32, expected: u32, what: &str) -> Result<(), CodecError> {
    if len == expected {
        Ok(())
    } else {
        Err(CodecError::InvalidValue(format!(
            "{} length {} (expected {})",
            what, len, expected
        )))
    }
}

// ---------------------------------------------------------------------------
// BVLC / NPDU
// ---------------------------------------------------------------------------

/// 封装 BVLC + NPDU 头。
pub fn encode_frame(apdu: &[u8], broadcast: bool, expecting_reply: bool) -> Bytes {
    let total = BVLC_HEADER_LEN + 2 + apdu.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(BVLC_TYPE);
    buf.put_u8(if broadcast {
        BVLC_ORIGINAL_BROADCAST
    } else {
        BVLC_ORIGINAL_UNICAST
    });
    buf.put_u16(total as u16);
    buf.put_u8(NPDU_VERSION);
    buf.put_u8(if expecting_reply {
        NPDU_EXPECTING_REPLY
    } else {
        0
    });
    buf.put_slice(apdu);
    buf.freeze()
}

/// 拆解数据报；非应用层报文（网络层消息、BVLC 管理报文）返回 None。
pub fn decode_frame(datagram: &[u8]) -> Result<Option<Apdu>, CodecError> {
    let mut reader = Reader::new(datagram);
    if reader.u8()? != BVLC_TYPE {
        return Err(CodecError::InvalidBvlc("not a BACnet/IP frame".to_string()));
    }
    let function = reader.u8()?;
    let length = usize::from(reader.u16()?);
    if length < BVLC_HEADER_LEN || length > datagram.len() {
        return Err(CodecError::InvalidBvlc(format!(
            "length {} does not match datagram of {} byte(s)",
            length,
            datagram.len()
        )));
    }
    let mut reader = Reader {
        buf: &datagram[..length],
        pos: BVLC_HEADER_LEN,
    };
    match function {
        BVLC_ORIGINAL_UNICAST | BVLC_ORIGINAL_BROADCAST | BVLC_DISTRIBUTE_BROADCAST => {}
        BVLC_FORWARDED_NPDU => {
            reader.take(6)?;
        }
        _ => return Ok(None),
    }

    let version = reader.u8()?;
    if version != NPDU_VERSION {
        return Err(CodecError::NpduVersion(version));
    }
    let control = reader.u8()?;
    if control & NPDU_DNET != 0 {
        reader.u16()?;
        let len = reader.u8()?;
        reader.take(usize::from(len))?;
    }
    if control & NPDU_SNET != 0 {
        reader.u16()?;
        let len = reader.u8()?;
        reader.take(usize::from(len))?;
    }
    if control & NPDU_DNET != 0 {
        reader.u8()?;
    }
    if control & NPDU_NETWORK_MESSAGE != 0 {
        return Ok(None);
    }
    Apdu::decode(reader.rest()).map(Some)
}

// ---------------------------------------------------------------------------
// APDU
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    ConfirmedRequest {
        invoke_id: u8,
        service: u8,
        max_apdu: u16,
        data: Bytes,
    },
    UnconfirmedRequest {
        service: u8,
        data: Bytes,
    },
    SimpleAck {
        invoke_id: u8,
        service: u8,
    },
    ComplexAck {
        invoke_id: u8,
        service: u8,
        data: Bytes,
    },
    SegmentAck {
        invoke_id: u8,
    },
    Error {
        invoke_id: u8,
        service: u8,
        class: u32,
        code: u32,
    },
    Reject {
        invoke_id: u8,
        reason: u8,
    },
    Abort {
        invoke_id: u8,
        reason: u8,
        server: bool,
    },
}

fn max_apdu_code(max_apdu: u16) -> u8 {
    match max_apdu {
        0..=127 => 0,
        128..=205 => 1,
        206..=479 => 2,
        480..=1023 => 3,
        1024..=1475 => 4,
        _ => 5,
    }
}

fn max_apdu_from_code(code: u8) -> u16 {
    match code & 0x0F {
        0 => 50,
        1 => 128,
        2 => 206,
        3 => 480,
        4 => 1024,
        _ => 1476,
    }
}

impl Apdu {
    /// 响应类 PDU 的 invoke id
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest { invoke_id, .. }
            | Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
            Apdu::UnconfirmedRequest { .. } => None,
        }
    }

    pub fn is_response(&self) -> bool {
        !matches!(
            self,
            Apdu::ConfirmedRequest { .. } | Apdu::UnconfirmedRequest { .. }
        )
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Apdu::ConfirmedRequest {
                invoke_id,
                service,
                max_apdu,
                data,
            } => {
                buf.put_u8(0x00);
                buf.put_u8(max_apdu_code(*max_apdu));
                buf.put_u8(*invoke_id);
                buf.put_u8(*service);
                buf.put_slice(data);
            }
            Apdu::UnconfirmedRequest { service, data } => {
                buf.put_u8(0x10);
                buf.put_u8(*service);
                buf.put_slice(data);
            }
            Apdu::SimpleAck { invoke_id, service } => {
                buf.put_u8(0x20);
                buf.put_u8(*invoke_id);
                buf.put_u8(*service);
            }
            Apdu::ComplexAck {
                invoke_id,
                service,
                data,
            } => {
                buf.put_u8(0x30);
                buf.put_u8(*invoke_id);
                buf.put_u8(*service);
                buf.put_slice(data);
            }
            Apdu::SegmentAck { invoke_id } => {
                buf.put_u8(0x40);
                buf.put_u8(*invoke_id);
                buf.put_u8(0);
                buf.put_u8(1);
            }
            Apdu::Error {
                invoke_id,
                service,
                class,
                code,
            } => {
                buf.put_u8(0x50);
                buf.put_u8(*invoke_id);
                buf.put_u8(*service);
                for value in [*class, *code] {
                    put_tag(&mut buf, 9, false, unsigned_len(value));
                    put_unsigned_body(&mut buf, value);
                }
            }
            Apdu::Reject { invoke_id, reason } => {
                buf.put_u8(0x60);
                buf.put_u8(*invoke_id);
                buf.put_u8(*reason);
            }
            Apdu::Abort {
                invoke_id,
                reason,
                server,
            } => {
                buf.put_u8(0x70 | u8::from(*server));
                buf.put_u8(*invoke_id);
                buf.put_u8(*reason);
            }
        }
        buf.freeze()
    }

    pub fn decode(apdu: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(apdu);
        let head = reader.u8()?;
        let pdu = match head >> 4 {
            0x0 => {
                if head & 0x08 != 0 {
                    return Err(CodecError::Segmented);
                }
                let max_apdu = max_apdu_from_code(reader.u8()?);
                let invoke_id = reader.u8()?;
                let service = reader.u8()?;
                Apdu::ConfirmedRequest {
                    invoke_id,
                    service,
                    max_apdu,
                    data: Bytes::copy_from_slice(reader.rest()),
                }
            }
            0x1 => Apdu::UnconfirmedRequest {
                service: reader.u8()?,
                data: Bytes::copy_from_slice(reader.rest()),
            },
            0x2 => Apdu::SimpleAck {
                invoke_id: reader.u8()?,
                service: reader.u8()?,
            },
            0x3 => {
                if head & 0x08 != 0 {
                    return Err(CodecError::Segmented);
                }
                Apdu::ComplexAck {
                    invoke_id: reader.u8()?,
                    service: reader.u8()?,
                    data: Bytes::copy_from_slice(reader.rest()),
                }
            }
            0x4 => Apdu::SegmentAck {
                invoke_id: reader.u8()?,
            },
            0x5 => {
                let invoke_id = reader.u8()?;
                let service = reader.u8()?;
                // 部分服务的错误参数包在上下文标签 0 内
                if reader.peek_tag().is_some_and(|tag| tag.is_opening(0)) {
                    reader.tag()?;
                }
                let class = enumerated(reader.application_value()?)?;
                let code = enumerated(reader.application_value()?)?;
                Apdu::Error {
                    invoke_id,
                    service,
                    class,
                    code,
                }
            }
            0x6 => Apdu::Reject {
                invoke_id: reader.u8()?,
                reason: reader.u8()?,
            },
            0x7 => Apdu::Abort {
                invoke_id: reader.u8()?,
                reason: reader.u8()?,
                server: head & 0x01 != 0,
            },
            other => {
                return Err(CodecError::InvalidValue(format!(
                    "unknown apdu type {}",
                    other
                )));
            }
        };
        Ok(pdu)
    }
}

fn enumerated(value: BacnetValue) -> Result<u32, CodecError> {
    match value {
        BacnetValue::Enumerated(v) => Ok(v),
        other => Err(CodecError::UnexpectedTag(format!(
            "expected enumerated, found {}",
            other.type_name()
        ))),
    }
}

// ---------------------------------------------------------------------------
// 服务
// ---------------------------------------------------------------------------

/// Who-Is 服务参数；`None` 表示不限范围。
pub fn encode_who_is(range: Option<(u32, u32)>) -> Bytes {
    let mut buf = BytesMut::new();
    if let Some((low, high)) = range {
        put_context_unsigned(&mut buf, 0, low);
        put_context_unsigned(&mut buf, 1, high);
    }
    buf.freeze()
}

pub fn decode_who_is(data: &[u8]) -> Result<Option<(u32, u32)>, CodecError> {
    let mut reader = Reader::new(data);
    if reader.is_empty() {
        return Ok(None);
    }
    let low = reader.context_unsigned(0)?;
    let high = reader.context_unsigned(1)?;
    Ok(Some((low, high)))
}

/// I-Am 广播
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAm {
    pub device: ObjectId,
    pub max_apdu: u32,
    /// 0 = both, 1 = transmit, 2 = receive, 3 = none
    pub segmentation: u32,
    pub vendor_id: u32,
}

impl IAm {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        put_application_value(&mut buf, &BacnetValue::ObjectId(self.device))?;
        put_application_value(&mut buf, &BacnetValue::Unsigned(self.max_apdu))?;
        put_application_value(&mut buf, &BacnetValue::Enumerated(self.segmentation))?;
        put_application_value(&mut buf, &BacnetValue::Unsigned(self.vendor_id))?;
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(data);
        let device = match reader.application_value()? {
            BacnetValue::ObjectId(id) if id.object_type == object_type::DEVICE => id,
            other => {
                return Err(CodecError::InvalidValue(format!(
                    "i-am carries {} instead of a device identifier",
                    other
                )));
            }
        };
        let max_apdu = unsigned(reader.application_value()?)?;
        let segmentation = enumerated(reader.application_value()?)?;
        let vendor_id = unsigned(reader.application_value()?)?;
        Ok(Self {
            device,
            max_apdu,
            segmentation,
            vendor_id,
        })
    }
}

fn unsigned(value: BacnetValue) -> Result<u32, CodecError> {
    match value {
        BacnetValue::Unsigned(v) => Ok(v),
        other => Err(CodecError::UnexpectedTag(format!(
            "expected unsigned, found {}",
            other.type_name()
        ))),
    }
}

/// 属性引用（对象、属性、数组下标）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyRef {
    pub object: ObjectId,
    pub property: u32,
    pub array_index: Option<u32>,
}

impl PropertyRef {
    pub fn new(object: ObjectId, property: u32) -> Self {
        Self {
            object,
            property,
            array_index: None,
        }
    }

    pub fn at(mut self, index: u32) -> Self {
        self.array_index = Some(index);
        self
    }

    fn put(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        put_context_object_id(buf, 0, self.object)?;
        put_context_unsigned(buf, 1, self.property);
        if let Some(index) = self.array_index {
            put_context_unsigned(buf, 2, index);
        }
        Ok(())
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            object: reader.context_object_id(0)?,
            property: reader.context_unsigned(1)?,
            array_index: reader.optional_context_unsigned(2)?,
        })
    }

    /// ReadProperty 请求参数
    pub fn encode_read(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(12);
        self.put(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode_read(data: &[u8]) -> Result<Self, CodecError> {
        Self::read(&mut Reader::new(data))
    }
}

impl fmt::Display for PropertyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.object, self.property)?;
        if let Some(index) = self.array_index {
            write!(f, "[{}]", index)?;
        }
        Ok(())
    }
}

/// ReadProperty 复杂应答
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyAck {
    pub property: PropertyRef,
    pub values: Vec<BacnetValue>,
}

impl ReadPropertyAck {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.property.put(&mut buf)?;
        put_opening(&mut buf, 3);
        for value in &self.values {
            put_application_value(&mut buf, value)?;
        }
        put_closing(&mut buf, 3);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(data);
        let property = PropertyRef::read(&mut reader)?;
        let values = reader.enclosed_values(3)?;
        Ok(Self { property, values })
    }
}

/// WriteProperty 请求
#[derive(Debug, Clone, PartialEq)]
pub struct WritePropertyRequest {
    pub property: PropertyRef,
    pub value: BacnetValue,
    /// 1..=16，缺省由设备决定
    pub priority: Option<u8>,
}

impl WritePropertyRequest {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.property.put(&mut buf)?;
        put_opening(&mut buf, 3);
        put_application_value(&mut buf, &self.value)?;
        put_closing(&mut buf, 3);
        if let Some(priority) = self.priority {
            put_context_unsigned(&mut buf, 4, u32::from(priority));
        }
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(data);
        let property = PropertyRef::read(&mut reader)?;
        let value = reader
            .enclosed_values(3)?
            .into_iter()
            .next()
            .ok_or_else(|| CodecError::InvalidValue("write without a value".to_string()))?;
        let priority = reader
            .optional_context_unsigned(4)?
            .map(|p| p.min(u32::from(u8::MAX)) as u8);
        Ok(Self {
            property,
            value,
            priority,
        })
    }
}

/// SubscribeCOV 请求；`lifetime` 为 None 时表示取消订阅。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeCov {
    pub process_id: u32,
    pub object: ObjectId,
    /// (是否确认型通知, 生存期秒)
    pub lifetime: Option<(bool, u32)>,
}

impl SubscribeCov {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        put_context_unsigned(&mut buf, 0, self.process_id);
        put_context_object_id(&mut buf, 1, self.object)?;
        if let Some((confirmed, lifetime)) = self.lifetime {
            put_tag(&mut buf, 2, true, 1);
            buf.put_u8(u8::from(confirmed));
            put_context_unsigned(&mut buf, 3, lifetime);
        }
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(data);
        let process_id = reader.context_unsigned(0)?;
        let object = reader.context_object_id(1)?;
        let lifetime = if reader.is_empty() {
            None
        } else {
            let len = reader.expect_context(2)?;
            fixed_len(len, 1, "boolean")?;
            let confirmed = reader.u8()? != 0;
            Some((confirmed, reader.context_unsigned(3)?))
        };
        Ok(Self {
            process_id,
            object,
            lifetime,
        })
    }
}

/// COV 通知中的单个属性值
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyValue {
    pub property: u32,
    pub array_index: Option<u32>,
    pub values: Vec<BacnetValue>,
}

impl PropertyValue {
    pub fn new(property: u32, value: BacnetValue) -> Self {
        Self {
            property,
            array_index: None,
            values: vec![value],
        }
    }
}

/// COV 通知（确认型与非确认型共用）
#[derive(Debug, Clone, PartialEq)]
pub struct CovNotification {
    pub process_id: u32,
    pub initiating_device: ObjectId,
    pub monitored_object: ObjectId,
    pub time_remaining: u32,
    pub values: Vec<PropertyValue>,
}

impl CovNotification {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        put_context_unsigned(&mut buf, 0, self.process_id);
        put_context_object_id(&mut buf, 1, self.initiating_device)?;
        put_context_object_id(&mut buf, 2, self.monitored_object)?;
        put_context_unsigned(&mut buf, 3, self.time_remaining);
        put_opening(&mut buf, 4);
        for entry in &self.values {
            put_context_unsigned(&mut buf, 0, entry.property);
            if let Some(index) = entry.array_index {
                put_context_unsigned(&mut buf, 1, index);
            }
            put_opening(&mut buf, 2);
            for value in &entry.values {
                put_application_value(&mut buf, value)?;
            }
            put_closing(&mut buf, 2);
        }
        put_closing(&mut buf, 4);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(data);
        let process_id = reader.context_unsigned(0)?;
        let initiating_device = reader.context_object_id(1)?;
        let monitored_object = reader.context_object_id(2)?;
        let time_remaining = reader.context_unsigned(3)?;
        reader.expect_opening(4)?;

        let mut values = Vec::new();
        loop {
            match reader.peek_tag() {
                Some(tag) if tag.is_closing(4) => {
                    reader.tag()?;
                    break;
                }
                Some(_) => {
                    let property = reader.context_unsigned(0)?;
                    let array_index = reader.optional_context_unsigned(1)?;
                    let entry_values = reader.enclosed_values(2)?;
                    // 优先级（可选）
                    reader.optional_context_unsigned(3)?;
                    values.push(PropertyValue {
                        property,
                        array_index,
                        values: entry_values,
                    });
                }
                None => {
                    return Err(CodecError::Truncated {
                        offset: reader.pos,
                        needed: 1,
                    });
                }
            }
        }
        Ok(Self {
            process_id,
            initiating_device,
            monitored_object,
            time_remaining,
            values,
        })
    }
}
