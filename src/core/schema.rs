//! # Message Schemas
//!
//! Immutable descriptors that drive the codec. A [`MessageSchema`] is an ordered list of
//! [`FieldDescriptor`]s plus the numeric id written in front of every encoded message.
//!
//! ## Field Layout
//! ```text
//! UInt{w}          w bytes, little-endian
//! Float32/Float64  4/8 bytes, little-endian IEEE 754
//! UIntArray{w,n}   n * w bytes, each element little-endian
//! FloatArray{w,n}  n * w bytes, each element little-endian IEEE 754 (w = 4 or 8)
//! FixedString{w}   w bytes, UTF-8, zero-padded
//! FixedData{n}     n raw bytes
//! WideString{max}  u16 char count + count UTF-16LE code units (count < max)
//! VarCount{e,..}   u32 element count
//! VarBytes/VarPtr  count * e raw bytes (must follow a VarCount)
//! ```

use crate::error::{ProtocolError, Result};

/// Width in bytes of the message id header
pub const MESSAGE_ID_SIZE: usize = 2;

/// Width in bytes of a `VarCount` field on the wire
pub const VAR_COUNT_SIZE: usize = 4;

/// Width in bytes of the character count in front of a wide string
pub const WIDE_STRING_LEN_SIZE: usize = 2;

/// Which way a schema travels from the point of view of the side registering it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Recv,
}

/// Wire representation of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Unsigned integer of 1, 2, 4 or 8 bytes
    UInt { width: u8 },
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// Exactly `count` unsigned integers of `width` bytes each
    UIntArray { width: u8, count: usize },
    /// Exactly `count` floats of `width` (4 or 8) bytes each
    FloatArray { width: u8, count: usize },
    /// UTF-8 text written at exactly `width` bytes
    FixedString { width: usize },
    /// Raw block of exactly `len` bytes
    FixedData { len: usize },
    /// Length-prefixed UTF-16 text holding fewer than `max_chars` code units
    WideString { max_chars: u16 },
    /// Element count for the variable field that follows
    VarCount { element_size: usize, min: u32, max: u32 },
    /// Raw byte payload sized by the preceding count
    VarBytes,
    /// Typed array payload (`count * element_size` bytes) sized by the preceding count
    VarPtr,
}

impl FieldKind {
    /// Encoded size of the field when it does not depend on the message contents
    pub fn fixed_size(&self) -> Option<usize> {
        match *self {
            FieldKind::UInt { width } => Some(width as usize),
            FieldKind::Float32 => Some(4),
            FieldKind::Float64 => Some(8),
            FieldKind::UIntArray { width, count } | FieldKind::FloatArray { width, count } => {
                Some((width as usize).saturating_mul(count))
            }
            FieldKind::FixedString { width } => Some(width),
            FieldKind::FixedData { len } => Some(len),
            FieldKind::VarCount { .. } => Some(VAR_COUNT_SIZE),
            FieldKind::WideString { .. } | FieldKind::VarBytes | FieldKind::VarPtr => None,
        }
    }

    fn is_variable_payload(&self) -> bool {
        matches!(self, FieldKind::VarBytes | FieldKind::VarPtr)
    }
}

/// A named field in a message schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldDescriptor {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }

    pub const fn u8(name: &'static str) -> Self {
        Self::new(name, FieldKind::UInt { width: 1 })
    }

    pub const fn u16(name: &'static str) -> Self {
        Self::new(name, FieldKind::UInt { width: 2 })
    }

    pub const fn u32(name: &'static str) -> Self {
        Self::new(name, FieldKind::UInt { width: 4 })
    }

    pub const fn u64(name: &'static str) -> Self {
        Self::new(name, FieldKind::UInt { width: 8 })
    }

    pub const fn f32(name: &'static str) -> Self {
        Self::new(name, FieldKind::Float32)
    }

    pub const fn f64(name: &'static str) -> Self {
        Self::new(name, FieldKind::Float64)
    }

    pub const fn uint_array(name: &'static str, width: u8, count: usize) -> Self {
        Self::new(name, FieldKind::UIntArray { width, count })
    }

    pub const fn float_array(name: &'static str, width: u8, count: usize) -> Self {
        Self::new(name, FieldKind::FloatArray { width, count })
    }

    pub const fn fixed_string(name: &'static str, width: usize) -> Self {
        Self::new(name, FieldKind::FixedString { width })
    }

    pub const fn fixed_data(name: &'static str, len: usize) -> Self {
        Self::new(name, FieldKind::FixedData { len })
    }

    pub const fn wide_string(name: &'static str, max_chars: u16) -> Self {
        Self::new(name, FieldKind::WideString { max_chars })
    }

    pub const fn var_count(name: &'static str, element_size: usize, min: u32, max: u32) -> Self {
        Self::new(
            name,
            FieldKind::VarCount {
                element_size,
                min,
                max,
            },
        )
    }

    pub const fn var_bytes(name: &'static str) -> Self {
        Self::new(name, FieldKind::VarBytes)
    }

    pub const fn var_ptr(name: &'static str) -> Self {
        Self::new(name, FieldKind::VarPtr)
    }
}

/// Descriptor for one message type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSchema {
    id: u16,
    name: &'static str,
    direction: Direction,
    fields: Vec<FieldDescriptor>,
}

impl MessageSchema {
    /// Build a schema, checking the field layout invariants.
    ///
    /// # Errors
    /// Returns `ProtocolError::InvalidSchema` when a variable payload is not preceded by
    /// exactly one count, a count is not followed by its payload, an integer width is not
    /// 1/2/4/8, a float array width is not 4/8, a fixed array is empty, a count range is
    /// inverted, or a `VarBytes` count has an element size other than one.
    pub fn new(
        id: u16,
        name: &'static str,
        direction: Direction,
        fields: Vec<FieldDescriptor>,
    ) -> Result<Self> {
        validate_fields(name, &fields)?;
        Ok(Self {
            id,
            name,
            direction,
            fields,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Whether any field's encoded size depends on the message contents
    pub fn has_variable_fields(&self) -> bool {
        self.fields.iter().any(|f| f.kind.fixed_size().is_none())
    }

    /// Smallest legal encoded size, message id included
    pub fn min_encoded_len(&self) -> usize {
        self.encoded_len_bound(|min, _| min as u64) as usize
    }

    /// Largest legal encoded size, message id included, saturating at `u64::MAX`
    pub fn max_encoded_len(&self) -> u64 {
        self.encoded_len_bound(|_, max| max as u64)
    }

    fn encoded_len_bound(&self, pick: impl Fn(u32, u32) -> u64) -> u64 {
        let mut total = MESSAGE_ID_SIZE as u64;
        let mut pending_elements: u64 = 0;
        for field in &self.fields {
            let size = match field.kind {
                FieldKind::VarCount {
                    element_size,
                    min,
                    max,
                } => {
                    pending_elements = pick(min, max).saturating_mul(element_size as u64);
                    VAR_COUNT_SIZE as u64
                }
                FieldKind::VarBytes | FieldKind::VarPtr => std::mem::take(&mut pending_elements),
                FieldKind::WideString { max_chars } => {
                    let chars = pick(0, u32::from(max_chars.saturating_sub(1)));
                    WIDE_STRING_LEN_SIZE as u64 + chars * 2
                }
                ref kind => kind.fixed_size().unwrap_or(0) as u64,
            };
            total = total.saturating_add(size);
        }
        total
    }
}

fn validate_fields(name: &str, fields: &[FieldDescriptor]) -> Result<()> {
    let invalid = |msg: String| Err(ProtocolError::InvalidSchema(format!("{name}: {msg}")));

    for (index, field) in fields.iter().enumerate() {
        let previous = index.checked_sub(1).map(|i| fields[i].kind);
        let next = fields.get(index + 1).map(|f| f.kind);

        match field.kind {
            FieldKind::UInt { width } | FieldKind::UIntArray { width, .. }
                if !matches!(width, 1 | 2 | 4 | 8) =>
            {
                return invalid(format!("field '{}' has integer width {width}", field.name));
            }
            FieldKind::FloatArray { width, .. } if !matches!(width, 4 | 8) => {
                return invalid(format!("field '{}' has float width {width}", field.name));
            }
            FieldKind::UIntArray { count: 0, .. } | FieldKind::FloatArray { count: 0, .. } => {
                return invalid(format!("array '{}' has no elements", field.name));
            }
            FieldKind::WideString { max_chars: 0 } => {
                return invalid(format!("field '{}' has zero capacity", field.name));
            }
            FieldKind::VarCount {
                element_size,
                min,
                max,
            } => {
                if element_size == 0 {
                    return invalid(format!("count '{}' has zero element size", field.name));
                }
                if min > max {
                    return invalid(format!("count '{}' has min {min} > max {max}", field.name));
                }
                match next {
                    Some(FieldKind::VarBytes) if element_size != 1 => {
                        return invalid(format!(
                            "count '{}' sizes a byte payload with element size {element_size}",
                            field.name
                        ));
                    }
                    Some(kind) if kind.is_variable_payload() => {}
                    _ => {
                        return invalid(format!(
                            "count '{}' is not followed by a variable payload",
                            field.name
                        ));
                    }
                }
            }
            FieldKind::VarBytes | FieldKind::VarPtr => {
                if !matches!(previous, Some(FieldKind::VarCount { .. })) {
                    return invalid(format!(
                        "variable field '{}' is not preceded by a count",
                        field.name
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(fields: Vec<FieldDescriptor>) -> Result<MessageSchema> {
        MessageSchema::new(1, "Test", Direction::Send, fields)
    }

    #[test]
    fn test_valid_layouts() {
        assert!(schema(vec![FieldDescriptor::u32("timeMs")]).is_ok());
        assert!(schema(vec![
            FieldDescriptor::u32("transId"),
            FieldDescriptor::var_count("count", 1, 0, 1024),
            FieldDescriptor::var_bytes("data"),
            FieldDescriptor::var_count("ids", 4, 1, 16),
            FieldDescriptor::var_ptr("idArray"),
        ])
        .is_ok());
    }

    #[test]
    fn test_payload_without_count_rejected() {
        let err = schema(vec![FieldDescriptor::var_bytes("data")]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSchema(_)));

        let err = schema(vec![
            FieldDescriptor::var_count("count", 1, 0, 4),
            FieldDescriptor::u8("gap"),
            FieldDescriptor::var_bytes("data"),
        ])
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSchema(_)));
    }

    #[test]
    fn test_double_count_rejected() {
        let err = schema(vec![
            FieldDescriptor::var_count("a", 1, 0, 4),
            FieldDescriptor::var_count("b", 1, 0, 4),
            FieldDescriptor::var_bytes("data"),
        ])
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSchema(_)));
    }

    #[test]
    fn test_bad_widths_rejected() {
        assert!(schema(vec![FieldDescriptor::new("x", FieldKind::UInt { width: 3 })]).is_err());
        assert!(schema(vec![
            FieldDescriptor::var_count("count", 4, 0, 4),
            FieldDescriptor::var_bytes("data"),
        ])
        .is_err());
        assert!(schema(vec![
            FieldDescriptor::var_count("count", 1, 5, 4),
            FieldDescriptor::var_bytes("data"),
        ])
        .is_err());
    }

    #[test]
    fn test_fixed_arrays() {
        let s = schema(vec![
            FieldDescriptor::uint_array("ids", 2, 3),
            FieldDescriptor::float_array("pos", 4, 3),
        ])
        .unwrap();
        assert!(!s.has_variable_fields());
        assert_eq!(s.max_encoded_len(), 2 + 6 + 12);

        assert!(schema(vec![FieldDescriptor::uint_array("x", 3, 2)]).is_err());
        assert!(schema(vec![FieldDescriptor::float_array("x", 2, 2)]).is_err());
        assert!(schema(vec![FieldDescriptor::uint_array("x", 4, 0)]).is_err());
    }

    #[test]
    fn test_size_bounds() {
        let s = schema(vec![
            FieldDescriptor::u32("transId"),
            FieldDescriptor::var_count("count", 2, 1, 10),
            FieldDescriptor::var_ptr("values"),
            FieldDescriptor::wide_string("name", 8),
        ])
        .unwrap();
        assert!(s.has_variable_fields());
        assert_eq!(s.min_encoded_len(), 2 + 4 + 4 + 2 + 2);
        assert_eq!(s.max_encoded_len(), 2 + 4 + 4 + 20 + 2 + 14);
    }

    #[test]
    fn test_fixed_schema_bounds_match() {
        let s = schema(vec![FieldDescriptor::u32("timeMs"), FieldDescriptor::f64("pos")]).unwrap();
        assert!(!s.has_variable_fields());
        assert_eq!(s.min_encoded_len() as u64, s.max_encoded_len());
        assert_eq!(s.min_encoded_len(), 14);
    }
}
