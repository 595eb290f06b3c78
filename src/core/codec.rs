//! Schema-driven encoder and decoder.
//!
//! [`encode_into`] and [`decode`] walk a [`MessageSchema`] field by field; there is no
//! per-message code. [`measure`] inspects a partially received frame and reports how many
//! bytes the whole message needs, validating count fields as soon as they are visible.

use crate::core::message::{FieldValue, Message};
use crate::core::schema::{
    FieldDescriptor, FieldKind, MessageSchema, MESSAGE_ID_SIZE, VAR_COUNT_SIZE,
    WIDE_STRING_LEN_SIZE,
};
use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Size requirement of a frame as far as the buffered bytes reveal it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measure {
    /// Total encoded length (message id included) is known
    Complete { len: usize, variable: bool },
    /// At least `len` bytes must be buffered before the total length is known
    Partial { len: usize, variable: bool },
}

/// Read the little-endian message id at the start of a frame
#[inline]
pub fn peek_id(frame: &[u8]) -> Option<u16> {
    match frame {
        [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}

/// Encode a message, returning a fresh buffer
pub fn encode(schema: &MessageSchema, message: &Message) -> Result<BytesMut> {
    let mut dst = BytesMut::with_capacity(schema.min_encoded_len());
    encode_into(schema, message, &mut dst)?;
    Ok(dst)
}

/// Append the encoded message to `dst`. On error `dst` is left as it was.
pub fn encode_into(schema: &MessageSchema, message: &Message, dst: &mut BytesMut) -> Result<()> {
    let start = dst.len();
    let result = write_fields(schema, message, dst);
    if result.is_err() {
        dst.truncate(start);
    }
    result
}

fn write_fields(schema: &MessageSchema, message: &Message, dst: &mut BytesMut) -> Result<()> {
    if message.id != schema.id() {
        return Err(ProtocolError::InvalidValue(format!(
            "message id {} encoded with schema {} ({})",
            message.id,
            schema.id(),
            schema.name()
        )));
    }
    if message.fields.len() != schema.fields().len() {
        return Err(ProtocolError::InvalidValue(format!(
            "{}: {} ({} values for {} fields)",
            schema.name(),
            constants::ERR_FIELD_COUNT_MISMATCH,
            message.fields.len(),
            schema.fields().len()
        )));
    }

    dst.put_u16_le(schema.id());

    let mut pending_len: usize = 0;
    for (field, value) in schema.fields().iter().zip(&message.fields) {
        match (field.kind, value) {
            (FieldKind::UInt { width }, FieldValue::UInt(v)) => {
                put_uint(schema, field, dst, width, *v)?;
            }
            (FieldKind::Float32, FieldValue::F32(v)) => dst.put_f32_le(*v),
            (FieldKind::Float64, FieldValue::F64(v)) => dst.put_f64_le(*v),
            (FieldKind::UIntArray { width, count }, FieldValue::UIntArray(values)) => {
                check_array_len(schema, field, values.len(), count)?;
                for v in values {
                    put_uint(schema, field, dst, width, *v)?;
                }
            }
            (FieldKind::FloatArray { width, count }, FieldValue::FloatArray(values)) => {
                check_array_len(schema, field, values.len(), count)?;
                for v in values {
                    if width == 4 {
                        dst.put_f32_le(*v as f32);
                    } else {
                        dst.put_f64_le(*v);
                    }
                }
            }
            (FieldKind::FixedString { width }, FieldValue::Str(s)) => {
                let bytes = truncate_utf8(s, width);
                dst.put_slice(bytes);
                dst.put_bytes(0, width - bytes.len());
            }
            (FieldKind::FixedData { len }, FieldValue::Data(data)) => {
                if data.len() != len {
                    return Err(invalid(schema, field, format!("{} bytes, expected {len}", data.len())));
                }
                dst.put_slice(data);
            }
            (FieldKind::WideString { max_chars }, FieldValue::WideStr(s)) => {
                let units: Vec<u16> = s.encode_utf16().collect();
                if units.len() >= usize::from(max_chars) {
                    return Err(invalid(
                        schema,
                        field,
                        format!("{} code units, capacity {max_chars}", units.len()),
                    ));
                }
                dst.put_u16_le(units.len() as u16);
                for unit in units {
                    dst.put_u16_le(unit);
                }
            }
            (
                FieldKind::VarCount {
                    element_size,
                    min,
                    max,
                },
                FieldValue::Count(count),
            ) => {
                if *count < min || *count > max {
                    return Err(invalid(schema, field, format!("count {count} outside [{min}, {max}]")));
                }
                pending_len = (*count as usize)
                    .checked_mul(element_size)
                    .ok_or_else(|| invalid(schema, field, constants::ERR_COUNT_OVERFLOW.into()))?;
                dst.put_u32_le(*count);
            }
            (FieldKind::VarBytes | FieldKind::VarPtr, FieldValue::Data(data)) => {
                if data.len() != pending_len {
                    return Err(invalid(
                        schema,
                        field,
                        format!(
                            "{} ({} bytes, expected {pending_len})",
                            constants::ERR_COUNT_PAYLOAD_MISMATCH,
                            data.len()
                        ),
                    ));
                }
                pending_len = 0;
                dst.put_slice(data);
            }
            (kind, value) => {
                return Err(invalid(
                    schema,
                    field,
                    format!("{kind:?} cannot hold a {} value", value.kind_name()),
                ));
            }
        }
    }
    Ok(())
}

fn put_uint(
    schema: &MessageSchema,
    field: &FieldDescriptor,
    dst: &mut BytesMut,
    width: u8,
    v: u64,
) -> Result<()> {
    if width < 8 && v >> (u32::from(width) * 8) != 0 {
        return Err(invalid(schema, field, format!("{v} does not fit in {width} bytes")));
    }
    match width {
        1 => dst.put_u8(v as u8),
        2 => dst.put_u16_le(v as u16),
        4 => dst.put_u32_le(v as u32),
        _ => dst.put_u64_le(v),
    }
    Ok(())
}

fn check_array_len(
    schema: &MessageSchema,
    field: &FieldDescriptor,
    len: usize,
    count: usize,
) -> Result<()> {
    if len != count {
        return Err(invalid(schema, field, format!("{len} elements, expected {count}")));
    }
    Ok(())
}

fn get_uint(buf: &mut &[u8], width: u8) -> u64 {
    match width {
        1 => u64::from(buf.get_u8()),
        2 => u64::from(buf.get_u16_le()),
        4 => u64::from(buf.get_u32_le()),
        _ => buf.get_u64_le(),
    }
}

fn invalid(schema: &MessageSchema, field: &FieldDescriptor, detail: String) -> ProtocolError {
    ProtocolError::InvalidValue(format!("{}.{}: {detail}", schema.name(), field.name))
}

fn truncate_utf8(s: &str, width: usize) -> &[u8] {
    if s.len() <= width {
        return s.as_bytes();
    }
    let mut end = width;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s.as_bytes()[..end]
}

/// Decode one complete frame (message id included).
///
/// # Errors
/// Returns `ProtocolError::Framing` when the frame is truncated, has trailing bytes, carries
/// a count outside its declared bounds, or holds text that is not valid UTF-8/UTF-16.
pub fn decode(schema: &MessageSchema, frame: &[u8]) -> Result<Message> {
    let mut buf = frame;
    need(buf, MESSAGE_ID_SIZE)?;
    let id = buf.get_u16_le();
    if id != schema.id() {
        return Err(ProtocolError::Framing(format!(
            "frame id {id} decoded with schema {} ({})",
            schema.id(),
            schema.name()
        )));
    }

    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut pending_len: usize = 0;
    for field in schema.fields() {
        let value = match field.kind {
            FieldKind::UInt { width } => {
                need(buf, width as usize)?;
                FieldValue::UInt(get_uint(&mut buf, width))
            }
            FieldKind::UIntArray { width, count } => {
                need(buf, (width as usize).saturating_mul(count))?;
                FieldValue::UIntArray((0..count).map(|_| get_uint(&mut buf, width)).collect())
            }
            FieldKind::FloatArray { width, count } => {
                need(buf, (width as usize).saturating_mul(count))?;
                let values = (0..count)
                    .map(|_| {
                        if width == 4 {
                            f64::from(buf.get_f32_le())
                        } else {
                            buf.get_f64_le()
                        }
                    })
                    .collect();
                FieldValue::FloatArray(values)
            }
            FieldKind::Float32 => {
                need(buf, 4)?;
                FieldValue::F32(buf.get_f32_le())
            }
            FieldKind::Float64 => {
                need(buf, 8)?;
                FieldValue::F64(buf.get_f64_le())
            }
            FieldKind::FixedString { width } => {
                need(buf, width)?;
                let raw = &buf[..width];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
                let text = std::str::from_utf8(&raw[..end])
                    .map_err(|_| framing(schema, field, constants::ERR_INVALID_UTF8))?
                    .to_owned();
                buf.advance(width);
                FieldValue::Str(text)
            }
            FieldKind::FixedData { len } => {
                need(buf, len)?;
                let data = buf[..len].to_vec();
                buf.advance(len);
                FieldValue::Data(data)
            }
            FieldKind::WideString { max_chars } => {
                need(buf, WIDE_STRING_LEN_SIZE)?;
                let chars = buf.get_u16_le();
                check_wide_len(schema, field, chars, max_chars)?;
                need(buf, usize::from(chars) * 2)?;
                let units: Vec<u16> = (0..chars).map(|_| buf.get_u16_le()).collect();
                let text = String::from_utf16(&units)
                    .map_err(|_| framing(schema, field, constants::ERR_INVALID_UTF16))?;
                FieldValue::WideStr(text)
            }
            FieldKind::VarCount {
                element_size,
                min,
                max,
            } => {
                need(buf, VAR_COUNT_SIZE)?;
                let count = buf.get_u32_le();
                pending_len = checked_var_len(schema, field, count, element_size, min, max)?;
                FieldValue::Count(count)
            }
            FieldKind::VarBytes | FieldKind::VarPtr => {
                need(buf, pending_len)?;
                let data = buf[..pending_len].to_vec();
                buf.advance(pending_len);
                pending_len = 0;
                FieldValue::Data(data)
            }
        };
        fields.push(value);
    }

    if buf.has_remaining() {
        return Err(ProtocolError::Framing(format!(
            "{}: {} ({} bytes)",
            schema.name(),
            constants::ERR_TRAILING_BYTES,
            buf.remaining()
        )));
    }

    Ok(Message::new(id, fields))
}

/// Work out how long the frame at the start of `frame` is.
///
/// Only reads the count and string-length fields needed to size the message; those are
/// validated against their declared bounds as soon as they are buffered.
pub fn measure(schema: &MessageSchema, frame: &[u8]) -> Result<Measure> {
    let mut pos = MESSAGE_ID_SIZE;
    let mut pending_len: usize = 0;
    let mut variable = false;

    for field in schema.fields() {
        match field.kind {
            FieldKind::VarCount {
                element_size,
                min,
                max,
            } => {
                let Some(mut raw) = frame.get(pos..pos + VAR_COUNT_SIZE) else {
                    return Ok(Measure::Partial {
                        len: pos + VAR_COUNT_SIZE,
                        variable,
                    });
                };
                let count = raw.get_u32_le();
                pending_len = checked_var_len(schema, field, count, element_size, min, max)?;
                pos += VAR_COUNT_SIZE;
                variable = true;
            }
            FieldKind::VarBytes | FieldKind::VarPtr => {
                pos = pos
                    .checked_add(std::mem::take(&mut pending_len))
                    .ok_or_else(|| framing(schema, field, constants::ERR_COUNT_OVERFLOW))?;
            }
            FieldKind::WideString { max_chars } => {
                let Some(mut raw) = frame.get(pos..pos + WIDE_STRING_LEN_SIZE) else {
                    return Ok(Measure::Partial {
                        len: pos + WIDE_STRING_LEN_SIZE,
                        variable,
                    });
                };
                let chars = raw.get_u16_le();
                check_wide_len(schema, field, chars, max_chars)?;
                pos += WIDE_STRING_LEN_SIZE + usize::from(chars) * 2;
                variable = true;
            }
            kind => pos += kind.fixed_size().unwrap_or(0),
        }
    }

    Ok(Measure::Complete { len: pos, variable })
}

fn checked_var_len(
    schema: &MessageSchema,
    field: &FieldDescriptor,
    count: u32,
    element_size: usize,
    min: u32,
    max: u32,
) -> Result<usize> {
    if count < min || count > max {
        return Err(ProtocolError::Framing(format!(
            "{}.{}: count {count} outside [{min}, {max}]",
            schema.name(),
            field.name
        )));
    }
    (count as usize)
        .checked_mul(element_size)
        .ok_or_else(|| framing(schema, field, constants::ERR_COUNT_OVERFLOW))
}

fn check_wide_len(
    schema: &MessageSchema,
    field: &FieldDescriptor,
    chars: u16,
    max_chars: u16,
) -> Result<()> {
    // one slot is reserved for the terminator
    if chars >= max_chars {
        return Err(ProtocolError::Framing(format!(
            "{}.{}: string length {chars} exceeds capacity {max_chars}",
            schema.name(),
            field.name
        )));
    }
    Ok(())
}

fn framing(schema: &MessageSchema, field: &FieldDescriptor, detail: &str) -> ProtocolError {
    ProtocolError::Framing(format!("{}.{}: {detail}", schema.name(), field.name))
}

#[inline]
fn need(buf: &[u8], len: usize) -> Result<()> {
    if buf.len() < len {
        return Err(ProtocolError::Framing(constants::ERR_TRUNCATED_FRAME.into()));
    }
    Ok(())
}
