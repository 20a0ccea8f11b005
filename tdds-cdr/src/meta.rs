//! Static type descriptors.
//!
//! Generated type support is authored as a flat array of [`TsmEntry`]
//! records: a head record for the aggregate followed by one record per
//! member, with nested aggregates inlined or referenced through
//! `TypeRef`. The builder lowers such an array into the runtime type
//! tree; member ids are taken from the entry, derived from the member
//! name when the aggregate carries the gen-id flag, or defaulted to the
//! declaration index.

use crate::types::{
    ArrayType, BitSetType, EnumType, Extensibility, Member, SequenceType, StringType,
    StructType, Type, UnionArm, UnionType,
};
use bitflags::bitflags;
use std::sync::Arc;
use tdds_kernel::error::{DdsError, Result};

bitflags! {
    /// Flags on a descriptor record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TsmFlags: u32 {
        /// Heap-backed member (unbounded string, sequence buffer).
        const DYNAMIC         = 0x0001;
        /// Aggregate uses the parameter-list (mutable) encoding.
        const MUTABLE         = 0x0002;
        /// Member is part of the key.
        const KEY             = 0x0004;
        /// Derive member ids from member names.
        const GENID           = 0x0008;
        /// Optional member.
        const OPTIONAL        = 0x0010;
        /// Shareable member.
        const SHAREABLE       = 0x0020;
        /// Consumer must understand this member.
        const MUST_UNDERSTAND = 0x0040;
        /// Default union arm.
        const DEFAULT         = 0x0080;
    }
}

/// Type codes of descriptor records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCode {
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
    CString,
    Struct,
    Union,
    Enum,
    BitSet,
    Array,
    Sequence,
    Map,
    TypeRef,
}

/// One record of a static type descriptor.
#[derive(Debug, Clone, Copy)]
pub struct TsmEntry {
    pub tc: TypeCode,
    pub name: &'static str,
    pub flags: TsmFlags,
    /// Native size (aggregates), string bound, or bit count.
    pub size: usize,
    /// Member/arm/constant count, array or sequence bound.
    pub nelem: usize,
    /// Native field offset of the member.
    pub offset: usize,
    /// Union label or enum constant value.
    pub label: i64,
    /// Explicit member id; 0 selects automatic assignment.
    pub member_id: u32,
    /// Referenced descriptor for `TypeRef` records.
    pub tsm: Option<&'static [TsmEntry]>,
}

impl TsmEntry {
    pub const fn new(tc: TypeCode) -> TsmEntry {
        TsmEntry {
            tc,
            name: "",
            flags: TsmFlags::empty(),
            size: 0,
            nelem: 0,
            offset: 0,
            label: 0,
            member_id: 0,
            tsm: None,
        }
    }
}

/// FNV-1a hash of a member name, masked into the extended-id range.
fn member_hash(name: &str) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for b in name.bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h & 0x0fff_ffff
}

struct TsmBuilder<'e> {
    entries: &'e [TsmEntry],
    pos: usize,
}

impl<'e> TsmBuilder<'e> {
    fn next(&mut self) -> Result<&'e TsmEntry> {
        let e = self
            .entries
            .get(self.pos)
            .ok_or_else(|| DdsError::bad_parameter("truncated type descriptor"))?;
        self.pos += 1;
        Ok(e)
    }

    fn peek(&self) -> Result<&'e TsmEntry> {
        self.entries
            .get(self.pos)
            .ok_or_else(|| DdsError::bad_parameter("truncated type descriptor"))
    }

    /// Build the type rooted at the next record.
    fn build(&mut self) -> Result<Arc<Type>> {
        let head = *self.next()?;
        self.build_from(&head)
    }

    fn build_from(&mut self, head: &TsmEntry) -> Result<Arc<Type>> {
        use crate::types::PrimitiveKind as K;
        let prim = |k: K| Ok(Arc::new(Type::Primitive(k)));
        match head.tc {
            TypeCode::Bool => prim(K::Bool),
            TypeCode::Octet => prim(K::Octet),
            TypeCode::Char8 => prim(K::Char8),
            TypeCode::Char32 => prim(K::Char32),
            TypeCode::Int16 => prim(K::Int16),
            TypeCode::UInt16 => prim(K::UInt16),
            TypeCode::Int32 => prim(K::Int32),
            TypeCode::UInt32 => prim(K::UInt32),
            TypeCode::Int64 => prim(K::Int64),
            TypeCode::UInt64 => prim(K::UInt64),
            TypeCode::Float32 => prim(K::Float32),
            TypeCode::Float64 => prim(K::Float64),
            TypeCode::Float128 => prim(K::Float128),
            TypeCode::CString => Ok(Arc::new(Type::String(StringType {
                bound: head.size as u32,
            }))),
            TypeCode::Enum => {
                let mut constants = Vec::with_capacity(head.nelem);
                for _ in 0..head.nelem {
                    let c = self.next()?;
                    constants.push((c.name.to_string(), c.label as i32));
                }
                Ok(Arc::new(Type::Enum(EnumType {
                    name: head.name.to_string(),
                    constants,
                })))
            }
            TypeCode::BitSet => Ok(Arc::new(Type::BitSet(BitSetType {
                name: head.name.to_string(),
                bits: head.size as u32,
            }))),
            TypeCode::Array => {
                let element = self.build()?;
                Ok(Arc::new(Type::Array(ArrayType {
                    element,
                    bounds: vec![head.nelem as u32],
                })))
            }
            TypeCode::Sequence => {
                let element = self.build()?;
                Ok(Arc::new(Type::Sequence(SequenceType {
                    element,
                    bound: head.nelem as u32,
                })))
            }
            TypeCode::Struct => {
                let extensibility = if head.flags.contains(TsmFlags::MUTABLE) {
                    Extensibility::Mutable
                } else {
                    Extensibility::Final
                };
                let genid = head.flags.contains(TsmFlags::GENID);
                let mut members = Vec::with_capacity(head.nelem);
                for index in 0..head.nelem {
                    let e = *self.peek()?;
                    let ty = self.build()?;
                    members.push(make_member(&e, ty, index, genid));
                }
                Ok(Arc::new(Type::Struct(StructType {
                    name: head.name.to_string(),
                    extensibility,
                    members,
                    native_size: head.size,
                })))
            }
            TypeCode::Union => {
                let extensibility = if head.flags.contains(TsmFlags::MUTABLE) {
                    Extensibility::Mutable
                } else {
                    Extensibility::Final
                };
                let genid = head.flags.contains(TsmFlags::GENID);
                let discriminant = self.build()?;
                let mut arms = Vec::with_capacity(head.nelem);
                let mut value_offset = 0;
                for index in 0..head.nelem {
                    let e = *self.peek()?;
                    let ty = self.build()?;
                    value_offset = e.offset;
                    arms.push(UnionArm {
                        labels: vec![e.label],
                        is_default: e.flags.contains(TsmFlags::DEFAULT),
                        member: make_member(&e, ty, index, genid),
                    });
                }
                Ok(Arc::new(Type::Union(UnionType {
                    name: head.name.to_string(),
                    extensibility,
                    discriminant,
                    arms,
                    native_size: head.size,
                    value_offset,
                })))
            }
            TypeCode::TypeRef => {
                let target = head
                    .tsm
                    .ok_or_else(|| DdsError::bad_parameter("type ref without target"))?;
                build_tsm(target)
            }
            TypeCode::Map => Err(DdsError::Unsupported("map types".into())),
        }
    }
}

fn make_member(e: &TsmEntry, ty: Arc<Type>, index: usize, genid: bool) -> Member {
    let id = if e.member_id != 0 {
        e.member_id
    } else if genid {
        member_hash(e.name)
    } else {
        index as u32
    };
    Member {
        name: e.name.to_string(),
        id,
        ty,
        is_key: e.flags.contains(TsmFlags::KEY),
        is_optional: e.flags.contains(TsmFlags::OPTIONAL),
        is_shareable: e.flags.contains(TsmFlags::SHAREABLE),
        must_understand: e.flags.contains(TsmFlags::MUST_UNDERSTAND),
        offset: e.offset,
    }
}

/// Lower a flat descriptor array into the runtime type tree.
pub fn build_tsm(entries: &[TsmEntry]) -> Result<Arc<Type>> {
    let mut b = TsmBuilder { entries, pos: 0 };
    let ty = b.build()?;
    if b.pos != entries.len() {
        return Err(DdsError::bad_parameter("trailing descriptor records"));
    }
    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INNER: &[TsmEntry] = &[
        TsmEntry {
            nelem: 1,
            name: "Inner",
            size: 4,
            ..TsmEntry::new(TypeCode::Struct)
        },
        TsmEntry {
            name: "n",
            ..TsmEntry::new(TypeCode::Int32)
        },
    ];

    const OUTER: &[TsmEntry] = &[
        TsmEntry {
            nelem: 3,
            name: "Outer",
            size: 24,
            flags: TsmFlags::DYNAMIC,
            ..TsmEntry::new(TypeCode::Struct)
        },
        TsmEntry {
            name: "key",
            flags: TsmFlags::KEY.union(TsmFlags::DYNAMIC),
            ..TsmEntry::new(TypeCode::CString)
        },
        TsmEntry {
            name: "inner",
            offset: 8,
            tsm: Some(INNER),
            ..TsmEntry::new(TypeCode::TypeRef)
        },
        TsmEntry {
            name: "arr",
            nelem: 3,
            offset: 12,
            ..TsmEntry::new(TypeCode::Array)
        },
        TsmEntry::new(TypeCode::Int16),
    ];

    #[test]
    fn builds_nested_struct() {
        let ty = build_tsm(OUTER).unwrap();
        let st = ty.as_struct().unwrap();
        assert_eq!(st.members.len(), 3);
        assert!(st.members[0].is_key);
        assert!(matches!(*st.members[0].ty, Type::String(_)));
        assert!(matches!(*st.members[1].ty, Type::Struct(_)));
        assert!(matches!(*st.members[2].ty, Type::Array(_)));
        assert_eq!(st.native_size, 24);
        // Declaration-index member ids without GENID.
        assert_eq!(st.members[1].id, 1);
    }

    #[test]
    fn genid_hashes_member_names() {
        const T: &[TsmEntry] = &[
            TsmEntry {
                nelem: 2,
                name: "G",
                flags: TsmFlags::GENID.union(TsmFlags::MUTABLE),
                ..TsmEntry::new(TypeCode::Struct)
            },
            TsmEntry {
                name: "alpha",
                ..TsmEntry::new(TypeCode::Int32)
            },
            TsmEntry {
                name: "beta",
                ..TsmEntry::new(TypeCode::Int32)
            },
        ];
        let ty = build_tsm(T).unwrap();
        let st = ty.as_struct().unwrap();
        assert_eq!(st.extensibility, Extensibility::Mutable);
        assert_eq!(st.members[0].id, member_hash("alpha"));
        assert_ne!(st.members[0].id, st.members[1].id);
        // Stable across runs and producers.
        assert_eq!(member_hash("alpha"), member_hash("alpha"));
    }

    #[test]
    fn explicit_member_id_wins() {
        const T: &[TsmEntry] = &[
            TsmEntry {
                nelem: 1,
                name: "E",
                flags: TsmFlags::GENID,
                ..TsmEntry::new(TypeCode::Struct)
            },
            TsmEntry {
                name: "a",
                member_id: 42,
                ..TsmEntry::new(TypeCode::Int32)
            },
        ];
        let ty = build_tsm(T).unwrap();
        assert_eq!(ty.as_struct().unwrap().members[0].id, 42);
    }

    #[test]
    fn enum_constants_consumed() {
        const T: &[TsmEntry] = &[
            TsmEntry {
                nelem: 2,
                name: "Color",
                ..TsmEntry::new(TypeCode::Enum)
            },
            TsmEntry {
                name: "RED",
                label: 0,
                ..TsmEntry::new(TypeCode::Int32)
            },
            TsmEntry {
                name: "BLUE",
                label: 1,
                ..TsmEntry::new(TypeCode::Int32)
            },
        ];
        let ty = build_tsm(T).unwrap();
        match &*ty {
            Type::Enum(e) => {
                assert_eq!(e.constants.len(), 2);
                assert_eq!(e.constants[1], ("BLUE".to_string(), 1));
            }
            _ => panic!("enum expected"),
        }
    }

    #[test]
    fn truncated_descriptor_rejected() {
        const T: &[TsmEntry] = &[TsmEntry {
            nelem: 2,
            name: "Bad",
            ..TsmEntry::new(TypeCode::Struct)
        }];
        assert!(build_tsm(T).is_err());
    }

    #[test]
    fn sequence_bound_from_nelem() {
        const T: &[TsmEntry] = &[
            TsmEntry {
                nelem: 1,
                name: "S",
                ..TsmEntry::new(TypeCode::Struct)
            },
            TsmEntry {
                name: "q",
                nelem: 16,
                flags: TsmFlags::DYNAMIC,
                ..TsmEntry::new(TypeCode::Sequence)
            },
            TsmEntry::new(TypeCode::Octet),
        ];
        let ty = build_tsm(T).unwrap();
        let st = ty.as_struct().unwrap();
        match &*st.members[0].ty {
            Type::Sequence(sq) => assert_eq!(sq.bound, 16),
            _ => panic!("sequence expected"),
        }
    }
}
