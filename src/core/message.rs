//! Tagged message values.
//!
//! A [`Message`] is a message id plus one [`FieldValue`] per schema field, in schema
//! order. The codec checks each value against its [`FieldKind`](crate::core::schema::FieldKind)
//! so no untyped pointer/length pairs ever reach the wire.

use crate::error::{ProtocolError, Result};

/// Value of a single message field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// `UInt` fields of any width
    UInt(u64),
    F32(f32),
    F64(f64),
    /// `UIntArray` fields
    UIntArray(Vec<u64>),
    /// `FloatArray` fields of either width
    FloatArray(Vec<f64>),
    /// `FixedString` fields
    Str(String),
    /// `WideString` fields
    WideStr(String),
    /// `FixedData`, `VarBytes` and `VarPtr` payloads
    Data(Vec<u8>),
    /// `VarCount` fields
    Count(u32),
}

impl FieldValue {
    /// Short name of the variant for error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::UInt(_) => "UInt",
            FieldValue::F32(_) => "F32",
            FieldValue::F64(_) => "F64",
            FieldValue::UIntArray(_) => "UIntArray",
            FieldValue::FloatArray(_) => "FloatArray",
            FieldValue::Str(_) => "Str",
            FieldValue::WideStr(_) => "WideStr",
            FieldValue::Data(_) => "Data",
            FieldValue::Count(_) => "Count",
        }
    }
}

/// A decoded or to-be-encoded message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: u16,
    pub fields: Vec<FieldValue>,
}

impl Message {
    pub fn new(id: u16, fields: Vec<FieldValue>) -> Self {
        Self { id, fields }
    }

    /// Start building a message field by field
    pub fn builder(id: u16) -> MessageBuilder {
        MessageBuilder {
            message: Self::new(id, Vec::new()),
        }
    }

    pub fn field(&self, index: usize) -> Option<&FieldValue> {
        self.fields.get(index)
    }

    pub fn uint(&self, index: usize) -> Option<u64> {
        match self.fields.get(index) {
            Some(FieldValue::UInt(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn count(&self, index: usize) -> Option<u32> {
        match self.fields.get(index) {
            Some(FieldValue::Count(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn uint_array(&self, index: usize) -> Option<&[u64]> {
        match self.fields.get(index) {
            Some(FieldValue::UIntArray(v)) => Some(v),
            _ => None,
        }
    }

    pub fn float_array(&self, index: usize) -> Option<&[f64]> {
        match self.fields.get(index) {
            Some(FieldValue::FloatArray(v)) => Some(v),
            _ => None,
        }
    }

    pub fn data(&self, index: usize) -> Option<&[u8]> {
        match self.fields.get(index) {
            Some(FieldValue::Data(v)) => Some(v),
            _ => None,
        }
    }

    pub fn str(&self, index: usize) -> Option<&str> {
        match self.fields.get(index) {
            Some(FieldValue::Str(v)) | Some(FieldValue::WideStr(v)) => Some(v),
            _ => None,
        }
    }

    /// Field accessor that reports a missing or mistyped field as an error
    pub fn require_uint(&self, index: usize) -> Result<u64> {
        self.uint(index).ok_or_else(|| mistyped(self.id, index, "UInt"))
    }

    pub fn require_data(&self, index: usize) -> Result<&[u8]> {
        self.data(index).ok_or_else(|| mistyped(self.id, index, "Data"))
    }

    pub fn require_str(&self, index: usize) -> Result<&str> {
        self.str(index).ok_or_else(|| mistyped(self.id, index, "string"))
    }
}

fn mistyped(id: u16, index: usize, expected: &str) -> ProtocolError {
    ProtocolError::InvalidValue(format!("message {id} field {index}: expected {expected}"))
}

/// Incremental constructor for [`Message`]
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn push(mut self, value: FieldValue) -> Self {
        self.message.fields.push(value);
        self
    }

    pub fn uint(self, value: u64) -> Self {
        self.push(FieldValue::UInt(value))
    }

    pub fn f32(self, value: f32) -> Self {
        self.push(FieldValue::F32(value))
    }

    pub fn f64(self, value: f64) -> Self {
        self.push(FieldValue::F64(value))
    }

    pub fn uint_array(self, values: impl Into<Vec<u64>>) -> Self {
        self.push(FieldValue::UIntArray(values.into()))
    }

    pub fn float_array(self, values: impl Into<Vec<f64>>) -> Self {
        self.push(FieldValue::FloatArray(values.into()))
    }

    pub fn string(self, value: impl Into<String>) -> Self {
        self.push(FieldValue::Str(value.into()))
    }

    pub fn wide_string(self, value: impl Into<String>) -> Self {
        self.push(FieldValue::WideStr(value.into()))
    }

    pub fn data(self, value: impl Into<Vec<u8>>) -> Self {
        self.push(FieldValue::Data(value.into()))
    }

    /// Push a `VarCount`/`VarBytes` pair sized from the payload
    pub fn var_bytes(self, value: impl Into<Vec<u8>>) -> Self {
        let value = value.into();
        let count = value.len() as u32;
        self.push(FieldValue::Count(count))
            .push(FieldValue::Data(value))
    }

    /// Push a `VarCount`/`VarPtr` pair holding `count` elements
    pub fn var_array(self, count: u32, value: impl Into<Vec<u8>>) -> Self {
        self.push(FieldValue::Count(count))
            .push(FieldValue::Data(value.into()))
    }

    pub fn build(self) -> Message {
        self.message
    }
}

/// A strongly typed message with a fixed id and a conversion to and from [`Message`].
///
/// Upper protocol layers implement this for their message structs so they can send and
/// receive typed values while the codec stays schema-driven.
pub trait NetMessage: Sized {
    const ID: u16;

    fn to_message(&self) -> Message;

    fn from_message(message: &Message) -> Result<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_pairs_counts() {
        let msg = Message::builder(7)
            .uint(1)
            .var_bytes(vec![1, 2, 3])
            .var_array(2, vec![0; 8])
            .build();
        assert_eq!(msg.id, 7);
        assert_eq!(msg.count(1), Some(3));
        assert_eq!(msg.data(2), Some(&[1u8, 2, 3][..]));
        assert_eq!(msg.count(3), Some(2));
        assert_eq!(msg.data(4).map(<[u8]>::len), Some(8));
    }

    #[test]
    fn test_accessors_check_types() {
        let msg = Message::builder(1).uint(42).string("hi").build();
        assert_eq!(msg.require_uint(0).unwrap(), 42);
        assert!(msg.require_uint(1).is_err());
        assert_eq!(msg.require_str(1).unwrap(), "hi");
        assert!(msg.require_data(5).is_err());

        let msg = Message::builder(2).uint_array(vec![1, 2]).float_array(vec![0.5]).build();
        assert_eq!(msg.uint_array(0), Some(&[1u64, 2][..]));
        assert_eq!(msg.float_array(1), Some(&[0.5][..]));
        assert_eq!(msg.float_array(0), None);
    }
}
