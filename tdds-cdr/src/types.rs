//! The runtime type tree.
//!
//! Types form a directed acyclic graph: children are reference counted
//! and construction is bottom-up, so cycles cannot be built. Aggregates
//! carry their extensibility mode; struct members carry the native
//! offset used by the static (generated-meta) data path.

use std::sync::Arc;

use tdds_kernel::error::{DdsError, Result};

/// Member identifier used by the parameter-list (mutable) encoding.
pub type MemberId = u32;

/// Wire-format family of an aggregate.
///
/// `Appendable` is encoded identically to `Final` by this codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Extensibility {
    #[default]
    Final,
    Appendable,
    Mutable,
}

/// Primitive type kinds with their CDR size and alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Bool,
    Octet,
    Char8,
    Char32,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    Float128,
}

impl PrimitiveKind {
    /// Encoded size in bytes.
    pub fn size(self) -> usize {
        match self {
            PrimitiveKind::Bool | PrimitiveKind::Octet | PrimitiveKind::Char8 => 1,
            PrimitiveKind::Int16 | PrimitiveKind::UInt16 => 2,
            PrimitiveKind::Char32
            | PrimitiveKind::Int32
            | PrimitiveKind::UInt32
            | PrimitiveKind::Float32 => 4,
            PrimitiveKind::Int64 | PrimitiveKind::UInt64 | PrimitiveKind::Float64 => 8,
            PrimitiveKind::Float128 => 16,
        }
    }

    /// Natural alignment; 128-bit floats align to 8 like the original.
    pub fn alignment(self) -> usize {
        self.size().min(8)
    }
}

/// One aggregate member.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub id: MemberId,
    pub ty: Arc<Type>,
    pub is_key: bool,
    pub is_optional: bool,
    pub is_shareable: bool,
    pub must_understand: bool,
    /// Native field offset for the static data path.
    pub offset: usize,
}

impl Member {
    pub fn new(name: impl Into<String>, id: MemberId, ty: Arc<Type>) -> Self {
        Member {
            name: name.into(),
            id,
            ty,
            is_key: false,
            is_optional: false,
            is_shareable: false,
            must_understand: false,
            offset: 0,
        }
    }

    pub fn key(mut self) -> Self {
        self.is_key = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    pub fn must_understand(mut self) -> Self {
        self.must_understand = true;
        self
    }

    pub fn at_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Structure type.
#[derive(Debug, Clone)]
pub struct StructType {
    pub name: String,
    pub extensibility: Extensibility,
    pub members: Vec<Member>,
    /// Native size of the generated struct; 0 for dynamic-only types.
    pub native_size: usize,
}

impl StructType {
    /// Whether any member carries the key flag. An unkeyed struct
    /// treats every member as key material.
    pub fn keyed(&self) -> bool {
        self.members.iter().any(|m| m.is_key)
    }
}

/// One union arm: its label set and the member it selects.
#[derive(Debug, Clone)]
pub struct UnionArm {
    pub labels: Vec<i64>,
    pub is_default: bool,
    pub member: Member,
}

/// Union type. The discriminant is encoded first, then only the
/// selected arm.
#[derive(Debug, Clone)]
pub struct UnionType {
    pub name: String,
    pub extensibility: Extensibility,
    pub discriminant: Arc<Type>,
    pub arms: Vec<UnionArm>,
    pub native_size: usize,
    /// Native offset of the arm storage (discriminant sits at 0).
    pub value_offset: usize,
}

impl UnionType {
    /// Select the arm for a discriminant value, falling back to the
    /// default arm.
    pub fn select(&self, disc: i64) -> Option<usize> {
        self.arms
            .iter()
            .position(|a| a.labels.contains(&disc))
            .or_else(|| self.arms.iter().position(|a| a.is_default))
    }
}

/// Fixed-size array; multi-dimensional bounds multiply out.
#[derive(Debug, Clone)]
pub struct ArrayType {
    pub element: Arc<Type>,
    pub bounds: Vec<u32>,
}

impl ArrayType {
    pub fn total_elements(&self) -> usize {
        self.bounds.iter().product::<u32>() as usize
    }
}

/// Sequence with an optional bound (0 = unbounded).
#[derive(Debug, Clone)]
pub struct SequenceType {
    pub element: Arc<Type>,
    pub bound: u32,
}

/// String with an optional bound (0 = unbounded). The serialised
/// length field counts payload bytes including the NUL terminator.
#[derive(Debug, Clone, Copy)]
pub struct StringType {
    pub bound: u32,
}

/// Enumeration; encoded as a 32-bit value.
#[derive(Debug, Clone)]
pub struct EnumType {
    pub name: String,
    pub constants: Vec<(String, i32)>,
}

/// Bit set; stored in the smallest unsigned holding `bits`.
#[derive(Debug, Clone)]
pub struct BitSetType {
    pub name: String,
    pub bits: u32,
}

impl BitSetType {
    pub fn storage_size(&self) -> usize {
        if self.bits <= 8 {
            1
        } else if self.bits <= 16 {
            2
        } else if self.bits <= 32 {
            4
        } else {
            8
        }
    }
}

/// A node in the type tree.
#[derive(Debug, Clone)]
pub enum Type {
    Primitive(PrimitiveKind),
    String(StringType),
    Enum(EnumType),
    BitSet(BitSetType),
    Struct(StructType),
    Union(UnionType),
    Array(ArrayType),
    Sequence(SequenceType),
}

impl Type {
    pub fn name(&self) -> &str {
        match self {
            Type::Struct(s) => &s.name,
            Type::Union(u) => &u.name,
            Type::Enum(e) => &e.name,
            Type::BitSet(b) => &b.name,
            Type::Primitive(_) => "primitive",
            Type::String(_) => "string",
            Type::Array(_) => "array",
            Type::Sequence(_) => "sequence",
        }
    }

    /// Extensibility of the aggregate, `Final` for everything else.
    pub fn extensibility(&self) -> Extensibility {
        match self {
            Type::Struct(s) => s.extensibility,
            Type::Union(u) => u.extensibility,
            _ => Extensibility::Final,
        }
    }

    pub fn is_mutable(&self) -> bool {
        self.extensibility() == Extensibility::Mutable
    }

    pub fn as_struct(&self) -> Result<&StructType> {
        match self {
            Type::Struct(s) => Ok(s),
            _ => Err(DdsError::bad_parameter("struct type expected")),
        }
    }

    /// Native in-memory size of a value of this type (static path).
    pub fn native_size(&self) -> usize {
        match self {
            Type::Primitive(p) => p.size(),
            Type::Enum(_) => 4,
            Type::BitSet(b) => b.storage_size(),
            // Bounded strings embed `bound + 1` bytes; unbounded ones
            // are a pointer field.
            Type::String(s) => {
                if s.bound > 0 {
                    s.bound as usize + 1
                } else {
                    std::mem::size_of::<*const u8>()
                }
            }
            Type::Struct(s) => s.native_size,
            Type::Union(u) => u.native_size,
            Type::Array(a) => a.total_elements() * a.element.native_size(),
            Type::Sequence(_) => crate::native::RAW_SEQ_SIZE,
        }
    }

    /// Natural alignment of the encoded discriminant/leaf forms.
    pub fn cdr_alignment(&self) -> usize {
        match self {
            Type::Primitive(p) => p.alignment(),
            Type::Enum(_) => 4,
            Type::BitSet(b) => b.storage_size().min(8),
            Type::String(_) | Type::Sequence(_) => 4,
            _ => 1,
        }
    }
}

/// Shorthand constructors used by tests and the meta builder.
pub mod build {
    use super::*;

    pub fn primitive(kind: PrimitiveKind) -> Arc<Type> {
        Arc::new(Type::Primitive(kind))
    }

    pub fn string(bound: u32) -> Arc<Type> {
        Arc::new(Type::String(StringType { bound }))
    }

    pub fn sequence(element: Arc<Type>, bound: u32) -> Arc<Type> {
        Arc::new(Type::Sequence(SequenceType { element, bound }))
    }

    pub fn array(element: Arc<Type>, bounds: Vec<u32>) -> Arc<Type> {
        Arc::new(Type::Array(ArrayType { element, bounds }))
    }

    pub fn enumeration(name: &str, constants: &[(&str, i32)]) -> Arc<Type> {
        Arc::new(Type::Enum(EnumType {
            name: name.into(),
            constants: constants
                .iter()
                .map(|(n, v)| (n.to_string(), *v))
                .collect(),
        }))
    }

    pub fn structure(
        name: &str,
        extensibility: Extensibility,
        members: Vec<Member>,
    ) -> Arc<Type> {
        Arc::new(Type::Struct(StructType {
            name: name.into(),
            extensibility,
            members,
            native_size: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_sizes() {
        assert_eq!(PrimitiveKind::Bool.size(), 1);
        assert_eq!(PrimitiveKind::Int16.size(), 2);
        assert_eq!(PrimitiveKind::Float32.size(), 4);
        assert_eq!(PrimitiveKind::UInt64.size(), 8);
        assert_eq!(PrimitiveKind::Float128.size(), 16);
        assert_eq!(PrimitiveKind::Float128.alignment(), 8);
    }

    #[test]
    fn union_arm_selection() {
        let u = UnionType {
            name: "u".into(),
            extensibility: Extensibility::Final,
            discriminant: build::primitive(PrimitiveKind::Int32),
            arms: vec![
                UnionArm {
                    labels: vec![1, 2],
                    is_default: false,
                    member: Member::new("a", 0, build::primitive(PrimitiveKind::Int32)),
                },
                UnionArm {
                    labels: vec![],
                    is_default: true,
                    member: Member::new("b", 1, build::primitive(PrimitiveKind::Octet)),
                },
            ],
            native_size: 0,
            value_offset: 0,
        };
        assert_eq!(u.select(2), Some(0));
        assert_eq!(u.select(99), Some(1));
    }

    #[test]
    fn keyed_struct_detection() {
        let st = build::structure(
            "s",
            Extensibility::Final,
            vec![
                Member::new("k", 0, build::primitive(PrimitiveKind::Int32)).key(),
                Member::new("v", 1, build::primitive(PrimitiveKind::Int32)),
            ],
        );
        assert!(st.as_struct().unwrap().keyed());
    }

    #[test]
    fn bitset_storage() {
        let b = BitSetType {
            name: "flags".into(),
            bits: 12,
        };
        assert_eq!(b.storage_size(), 2);
    }

    #[test]
    fn array_bounds_multiply() {
        let a = ArrayType {
            element: build::primitive(PrimitiveKind::Octet),
            bounds: vec![2, 3, 4],
        };
        assert_eq!(a.total_elements(), 24);
    }
}
