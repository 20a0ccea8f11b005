//! Dynamic data values.
//!
//! A [`DynValue`] is one partially or fully materialised structured
//! value not backed by a generated native layout. Leaves either own
//! their storage or borrow from the buffer they were decoded from; a
//! borrowed tree cannot outlive that buffer, and [`DynValue::into_owned`]
//! detaches it.

use std::borrow::Cow;

/// One materialised struct field: the member's declaration index plus
/// its value. Absent optional members are simply not present.
#[derive(Debug, Clone, PartialEq)]
pub struct StructField<'a> {
    pub index: usize,
    pub value: DynValue<'a>,
}

/// A dynamic data node.
#[derive(Debug, Clone, PartialEq)]
pub enum DynValue<'a> {
    Bool(bool),
    Octet(u8),
    Char8(u8),
    Char32(char),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Float128([u8; 16]),
    Enum(i32),
    BitSet(u64),
    Str(Cow<'a, str>),
    Struct(Vec<StructField<'a>>),
    Union {
        discriminant: i64,
        arm: usize,
        value: Box<DynValue<'a>>,
    },
    Array(Vec<DynValue<'a>>),
    Sequence(Vec<DynValue<'a>>),
}

impl<'a> DynValue<'a> {
    /// Deep-copy every borrowed leaf, detaching the tree from its
    /// source buffer.
    pub fn into_owned(self) -> DynValue<'static> {
        match self {
            DynValue::Bool(v) => DynValue::Bool(v),
            DynValue::Octet(v) => DynValue::Octet(v),
            DynValue::Char8(v) => DynValue::Char8(v),
            DynValue::Char32(v) => DynValue::Char32(v),
            DynValue::Int16(v) => DynValue::Int16(v),
            DynValue::UInt16(v) => DynValue::UInt16(v),
            DynValue::Int32(v) => DynValue::Int32(v),
            DynValue::UInt32(v) => DynValue::UInt32(v),
            DynValue::Int64(v) => DynValue::Int64(v),
            DynValue::UInt64(v) => DynValue::UInt64(v),
            DynValue::Float32(v) => DynValue::Float32(v),
            DynValue::Float64(v) => DynValue::Float64(v),
            DynValue::Float128(v) => DynValue::Float128(v),
            DynValue::Enum(v) => DynValue::Enum(v),
            DynValue::BitSet(v) => DynValue::BitSet(v),
            DynValue::Str(s) => DynValue::Str(Cow::Owned(s.into_owned())),
            DynValue::Struct(fields) => DynValue::Struct(
                fields
                    .into_iter()
                    .map(|f| StructField {
                        index: f.index,
                        value: f.value.into_owned(),
                    })
                    .collect(),
            ),
            DynValue::Union {
                discriminant,
                arm,
                value,
            } => DynValue::Union {
                discriminant,
                arm,
                value: Box::new(value.into_owned()),
            },
            DynValue::Array(v) => {
                DynValue::Array(v.into_iter().map(DynValue::into_owned).collect())
            }
            DynValue::Sequence(v) => {
                DynValue::Sequence(v.into_iter().map(DynValue::into_owned).collect())
            }
        }
    }

    /// Whether any leaf still borrows from a source buffer.
    pub fn is_foreign(&self) -> bool {
        match self {
            DynValue::Str(Cow::Borrowed(_)) => true,
            DynValue::Struct(fields) => fields.iter().any(|f| f.value.is_foreign()),
            DynValue::Union { value, .. } => value.is_foreign(),
            DynValue::Array(v) | DynValue::Sequence(v) => v.iter().any(DynValue::is_foreign),
            _ => false,
        }
    }

    /// Struct field lookup by declaration index.
    pub fn field(&self, index: usize) -> Option<&DynValue<'a>> {
        match self {
            DynValue::Struct(fields) => fields
                .iter()
                .find(|f| f.index == index)
                .map(|f| &f.value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            DynValue::Int32(v) => Some(*v),
            DynValue::Enum(v) => Some(*v),
            _ => None,
        }
    }

    /// Integral view used for union discriminants.
    pub fn as_discriminant(&self) -> Option<i64> {
        match self {
            DynValue::Bool(v) => Some(*v as i64),
            DynValue::Octet(v) | DynValue::Char8(v) => Some(*v as i64),
            DynValue::Int16(v) => Some(*v as i64),
            DynValue::UInt16(v) => Some(*v as i64),
            DynValue::Int32(v) => Some(*v as i64),
            DynValue::UInt32(v) => Some(*v as i64),
            DynValue::Int64(v) => Some(*v),
            DynValue::UInt64(v) => Some(*v as i64),
            DynValue::Enum(v) => Some(*v as i64),
            _ => None,
        }
    }
}

/// Convenience constructor for struct values.
pub fn struct_value<'a>(fields: Vec<(usize, DynValue<'a>)>) -> DynValue<'a> {
    DynValue::Struct(
        fields
            .into_iter()
            .map(|(index, value)| StructField { index, value })
            .collect(),
    )
}
