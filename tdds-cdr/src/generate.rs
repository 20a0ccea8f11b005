//! Marshalling: dynamic values to CDR / PL-CDR byte streams.
//!
//! One walk serves both the sizing pre-pass (no destination) and the
//! actual encode. Mutable aggregates get parameter headers with their
//! length slot back-patched after the member value; key-only encodes
//! emit just the key members, sorted by member id for mutable types so
//! that keys hash identically regardless of the producer's layout.

use crate::types::{Extensibility, Member, StructType, Type, UnionType};
use crate::value::DynValue;
use crate::wire::{
    Sink, PID_EXTENDED, PID_LIST_END, PID_MUST_UNDERSTAND, PID_SHORT_LIMIT,
};
use tdds_kernel::error::{DdsError, Result};

#[derive(Clone, Copy, Default)]
pub(crate) struct GenOpts {
    /// Emit only key members.
    pub key_mode: bool,
    /// Pad bounded key strings to their bound (padded-key form).
    pub padded: bool,
}

/// Serialised size of `value` as `ty`, excluding the header but
/// honouring its alignment offset. Required pre-pass for sizing the
/// destination buffer exactly.
pub fn marshalled_size(
    hsize: usize,
    value: &DynValue<'_>,
    ty: &Type,
    key_only: bool,
    padded: bool,
) -> Result<usize> {
    let mut sink = Sink::sizing(hsize);
    gen(
        &mut sink,
        value,
        ty,
        GenOpts {
            key_mode: key_only,
            padded,
        },
        key_only,
    )?;
    sink.align(4);
    Ok(sink.written())
}

/// Marshall `value` into `dst`. Returns the payload length (including
/// the trailing pad to a 4-byte boundary).
pub fn marshall(
    dst: &mut Vec<u8>,
    hsize: usize,
    value: &DynValue<'_>,
    ty: &Type,
    key_only: bool,
    padded: bool,
    swap: bool,
) -> Result<usize> {
    let mut sink = Sink::writing(dst, hsize, swap);
    gen(
        &mut sink,
        value,
        ty,
        GenOpts {
            key_mode: key_only,
            padded,
        },
        key_only,
    )?;
    sink.align(4);
    Ok(sink.written())
}

pub(crate) fn gen(
    sink: &mut Sink<'_>,
    value: &DynValue<'_>,
    ty: &Type,
    opts: GenOpts,
    in_key: bool,
) -> Result<()> {
    match ty {
        Type::Primitive(p) => gen_primitive(sink, value, *p),
        Type::Enum(_) => match value {
            DynValue::Enum(v) | DynValue::Int32(v) => {
                sink.put_i32(*v);
                Ok(())
            }
            _ => Err(DdsError::bad_parameter("enum value expected")),
        },
        Type::BitSet(b) => match value {
            DynValue::BitSet(v) => {
                match b.storage_size() {
                    1 => sink.put_u8(*v as u8),
                    2 => sink.put_u16(*v as u16),
                    4 => sink.put_u32(*v as u32),
                    _ => sink.put_u64(*v),
                }
                Ok(())
            }
            _ => Err(DdsError::bad_parameter("bitset value expected")),
        },
        Type::String(st) => match value {
            DynValue::Str(s) => {
                let bytes = s.as_bytes();
                let len = bytes.len() + 1;
                if st.bound > 0 && len > st.bound as usize + 1 {
                    return Err(DdsError::bad_parameter("string exceeds bound"));
                }
                sink.put_u32(len as u32);
                sink.put_bytes(bytes);
                sink.put_u8(0);
                if in_key && opts.padded && st.bound > 0 && len <= st.bound as usize {
                    // Pad to the bound so keys are directly comparable.
                    sink.put_zeros(st.bound as usize + 1 - len);
                }
                Ok(())
            }
            _ => Err(DdsError::bad_parameter("string value expected")),
        },
        Type::Struct(st) => gen_struct(sink, value, st, opts, in_key),
        Type::Union(ut) => gen_union(sink, value, ut, opts, in_key),
        Type::Array(at) => match value {
            DynValue::Array(items) => {
                if items.len() != at.total_elements() {
                    return Err(DdsError::bad_parameter("array length mismatch"));
                }
                for item in items {
                    gen(sink, item, &at.element, opts, in_key)?;
                }
                Ok(())
            }
            _ => Err(DdsError::bad_parameter("array value expected")),
        },
        Type::Sequence(sq) => match value {
            DynValue::Sequence(items) => {
                if sq.bound > 0 && items.len() > sq.bound as usize {
                    return Err(DdsError::bad_parameter("sequence exceeds bound"));
                }
                sink.put_u32(items.len() as u32);
                for item in items {
                    gen(sink, item, &sq.element, opts, in_key)?;
                }
                Ok(())
            }
            _ => Err(DdsError::bad_parameter("sequence value expected")),
        },
    }
}

fn gen_primitive(sink: &mut Sink<'_>, value: &DynValue<'_>, kind: crate::types::PrimitiveKind) -> Result<()> {
    use crate::types::PrimitiveKind as K;
    match (kind, value) {
        (K::Bool, DynValue::Bool(v)) => sink.put_u8(*v as u8),
        (K::Octet, DynValue::Octet(v)) | (K::Char8, DynValue::Char8(v)) => sink.put_u8(*v),
        (K::Char32, DynValue::Char32(v)) => sink.put_u32(*v as u32),
        (K::Int16, DynValue::Int16(v)) => sink.put_i16(*v),
        (K::UInt16, DynValue::UInt16(v)) => sink.put_u16(*v),
        (K::Int32, DynValue::Int32(v)) => sink.put_i32(*v),
        (K::UInt32, DynValue::UInt32(v)) => sink.put_u32(*v),
        (K::Int64, DynValue::Int64(v)) => sink.put_i64(*v),
        (K::UInt64, DynValue::UInt64(v)) => sink.put_u64(*v),
        (K::Float32, DynValue::Float32(v)) => sink.put_f32(*v),
        (K::Float64, DynValue::Float64(v)) => sink.put_f64(*v),
        (K::Float128, DynValue::Float128(v)) => {
            sink.align(8);
            sink.put_bytes(v);
        }
        _ => return Err(DdsError::bad_parameter("primitive value/type mismatch")),
    }
    Ok(())
}

fn member_value<'v, 'a>(
    value: &'v DynValue<'a>,
    index: usize,
) -> Result<Option<&'v DynValue<'a>>> {
    match value {
        DynValue::Struct(_) => Ok(value.field(index)),
        _ => Err(DdsError::bad_parameter("struct value expected")),
    }
}

fn gen_struct(
    sink: &mut Sink<'_>,
    value: &DynValue<'_>,
    st: &StructType,
    opts: GenOpts,
    in_key: bool,
) -> Result<()> {
    let keyed = st.keyed();
    if st.extensibility == Extensibility::Mutable {
        if opts.key_mode {
            return gen_mutable_key(sink, value, st, opts);
        }
        return gen_mutable(sink, value, st, opts);
    }

    for (i, m) in st.members.iter().enumerate() {
        let use_member = !opts.key_mode || m.is_key || !keyed;
        if !use_member {
            continue;
        }
        let member_key = in_key || (opts.key_mode && (m.is_key || !keyed));
        let field = member_value(value, i)?;
        match field {
            Some(v) => {
                if m.is_optional {
                    // Present optional: 4-byte length prefix, back-patched.
                    sink.put_u32(0);
                    let slot = sink.pos() - 4;
                    let start = sink.pos();
                    gen(sink, v, &m.ty, opts, member_key)?;
                    sink.patch_u32(slot, (sink.pos() - start) as u32);
                } else {
                    gen(sink, v, &m.ty, opts, member_key)?;
                }
            }
            None if m.is_optional => {
                // Absent optional: zero-length prefix only.
                sink.put_u32(0);
            }
            None => {
                return Err(DdsError::bad_parameter("missing struct member"));
            }
        }
    }
    Ok(())
}

/// Mutable encode: one `{pid, length}` header per present member, in
/// declaration order, terminated by `PID_LIST_END`.
fn gen_mutable(
    sink: &mut Sink<'_>,
    value: &DynValue<'_>,
    st: &StructType,
    opts: GenOpts,
) -> Result<()> {
    for (i, m) in st.members.iter().enumerate() {
        let Some(v) = member_value(value, i)? else {
            // Not materialised: a consumer decoding an older or newer
            // version simply never wrote this member.
            continue;
        };
        gen_member_header_and_value(sink, m, v, opts)?;
    }
    gen_list_end(sink);
    Ok(())
}

fn gen_member_header_and_value(
    sink: &mut Sink<'_>,
    m: &Member,
    v: &DynValue<'_>,
    opts: GenOpts,
) -> Result<()> {
    sink.align(4);
    if m.id >= PID_SHORT_LIMIT {
        let mut pid = PID_EXTENDED;
        if m.must_understand {
            pid |= PID_MUST_UNDERSTAND;
        }
        sink.put_u16(pid);
        sink.put_u16(8);
        sink.put_u32(m.id);
        sink.put_u32(0);
        let slot = sink.pos() - 4;
        let start = sink.pos();
        gen(sink, v, &m.ty, opts, false)?;
        sink.align(4);
        sink.patch_u32(slot, (sink.pos() - start) as u32);
    } else {
        let mut pid = m.id as u16;
        if m.must_understand {
            pid |= PID_MUST_UNDERSTAND;
        }
        sink.put_u16(pid);
        sink.put_u16(0);
        let slot = sink.pos() - 2;
        let start = sink.pos();
        gen(sink, v, &m.ty, opts, false)?;
        sink.align(4);
        sink.patch_u16(slot, (sink.pos() - start) as u16);
    }
    Ok(())
}

fn gen_list_end(sink: &mut Sink<'_>) {
    sink.align(4);
    sink.put_u16(PID_LIST_END);
    sink.put_u16(0);
}

/// Canonical key members of a struct: the flagged members, or all of
/// them when the type has no key; sorted by member id for mutable
/// aggregates.
pub(crate) fn key_member_indices(st: &StructType) -> Vec<usize> {
    let keyed = st.keyed();
    let mut indices: Vec<usize> = st
        .members
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_key || !keyed)
        .map(|(i, _)| i)
        .collect();
    if st.extensibility == Extensibility::Mutable && indices.len() > 1 {
        indices.sort_by_key(|&i| st.members[i].id);
    }
    indices
}

/// Key-only encode of a mutable struct: plain CDR of the key members
/// in member-id order, no parameter headers.
fn gen_mutable_key(
    sink: &mut Sink<'_>,
    value: &DynValue<'_>,
    st: &StructType,
    opts: GenOpts,
) -> Result<()> {
    for i in key_member_indices(st) {
        let m = &st.members[i];
        let v = member_value(value, i)?
            .ok_or_else(|| DdsError::bad_parameter("missing key member"))?;
        gen(sink, v, &m.ty, opts, true)?;
    }
    Ok(())
}

fn gen_union(
    sink: &mut Sink<'_>,
    value: &DynValue<'_>,
    ut: &UnionType,
    opts: GenOpts,
    in_key: bool,
) -> Result<()> {
    let DynValue::Union {
        discriminant,
        arm,
        value: inner,
    } = value
    else {
        return Err(DdsError::bad_parameter("union value expected"));
    };
    let selected = ut
        .select(*discriminant)
        .ok_or_else(|| DdsError::bad_parameter("discriminant selects no arm"))?;
    if selected != *arm {
        return Err(DdsError::bad_parameter("union arm does not match discriminant"));
    }

    // Discriminant first, encoded per its own primitive rule.
    match ut.discriminant.as_ref() {
        Type::Primitive(p) => {
            let d = *discriminant;
            use crate::types::PrimitiveKind as K;
            match p {
                K::Bool | K::Octet | K::Char8 => sink.put_u8(d as u8),
                K::Int16 | K::UInt16 => sink.put_u16(d as u16),
                K::Int64 | K::UInt64 => sink.put_u64(d as u64),
                _ => sink.put_u32(d as u32),
            }
        }
        Type::Enum(_) => sink.put_i32(*discriminant as i32),
        _ => return Err(DdsError::bad_parameter("invalid discriminant type")),
    }

    gen(sink, inner, &ut.arms[selected].member.ty, opts, in_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{build, Extensibility, Member, PrimitiveKind};
    use crate::value::struct_value;
    use std::borrow::Cow;

    fn simple_struct() -> std::sync::Arc<Type> {
        build::structure(
            "s",
            Extensibility::Final,
            vec![
                Member::new("a", 0, build::primitive(PrimitiveKind::Octet)),
                Member::new("b", 1, build::primitive(PrimitiveKind::Int32)),
            ],
        )
    }

    #[test]
    fn final_struct_layout_and_padding() {
        let ty = simple_struct();
        let v = struct_value(vec![
            (0, DynValue::Octet(0xAA)),
            (1, DynValue::Int32(1)),
        ]);
        let mut out = Vec::new();
        let n = marshall(&mut out, 0, &v, &ty, false, false, false).unwrap();
        assert_eq!(n, 8);
        assert_eq!(out[0], 0xAA);
        assert_eq!(&out[1..4], &[0, 0, 0]); // alignment pad
        assert_eq!(i32::from_ne_bytes(out[4..8].try_into().unwrap()), 1);
    }

    #[test]
    fn size_pass_matches_encode() {
        let ty = simple_struct();
        let v = struct_value(vec![
            (0, DynValue::Octet(1)),
            (1, DynValue::Int32(2)),
        ]);
        let size = marshalled_size(0, &v, &ty, false, false).unwrap();
        let mut out = Vec::new();
        let n = marshall(&mut out, 0, &v, &ty, false, false, false).unwrap();
        assert_eq!(size, n);
        assert_eq!(out.len(), n);
    }

    #[test]
    fn string_includes_nul_in_length() {
        let ty = build::structure(
            "s",
            Extensibility::Final,
            vec![Member::new("s", 0, build::string(0))],
        );
        let v = struct_value(vec![(0, DynValue::Str(Cow::Borrowed("hi")))]);
        let mut out = Vec::new();
        marshall(&mut out, 0, &v, &ty, false, false, false).unwrap();
        assert_eq!(u32::from_ne_bytes(out[0..4].try_into().unwrap()), 3);
        assert_eq!(&out[4..7], b"hi\0");
    }

    #[test]
    fn bounded_string_overflow_rejected() {
        let ty = build::structure(
            "s",
            Extensibility::Final,
            vec![Member::new("s", 0, build::string(3))],
        );
        let v = struct_value(vec![(0, DynValue::Str(Cow::Borrowed("toolong")))]);
        let mut out = Vec::new();
        assert!(marshall(&mut out, 0, &v, &ty, false, false, false).is_err());
    }

    #[test]
    fn sequence_gets_count_prefix() {
        let ty = build::structure(
            "s",
            Extensibility::Final,
            vec![Member::new(
                "q",
                0,
                build::sequence(build::primitive(PrimitiveKind::Int16), 0),
            )],
        );
        let v = struct_value(vec![(
            0,
            DynValue::Sequence(vec![DynValue::Int16(5), DynValue::Int16(6)]),
        )]);
        let mut out = Vec::new();
        marshall(&mut out, 0, &v, &ty, false, false, false).unwrap();
        assert_eq!(u32::from_ne_bytes(out[0..4].try_into().unwrap()), 2);
        assert_eq!(i16::from_ne_bytes(out[4..6].try_into().unwrap()), 5);
    }

    #[test]
    fn mutable_struct_terminates_with_list_end() {
        let ty = build::structure(
            "m",
            Extensibility::Mutable,
            vec![Member::new("a", 1, build::primitive(PrimitiveKind::Int32))],
        );
        let v = struct_value(vec![(0, DynValue::Int32(0x11223344))]);
        let mut out = Vec::new();
        let n = marshall(&mut out, 0, &v, &ty, false, false, false).unwrap();
        // header(4) + value(4) + list_end(4)
        assert_eq!(n, 12);
        assert_eq!(u16::from_ne_bytes(out[0..2].try_into().unwrap()), 1);
        assert_eq!(u16::from_ne_bytes(out[2..4].try_into().unwrap()), 4);
        assert_eq!(
            u16::from_ne_bytes(out[8..10].try_into().unwrap()),
            PID_LIST_END
        );
    }

    #[test]
    fn mutable_extended_pid_for_large_member_id() {
        let ty = build::structure(
            "m",
            Extensibility::Mutable,
            vec![Member::new("a", 0x12345, build::primitive(PrimitiveKind::Octet))],
        );
        let v = struct_value(vec![(0, DynValue::Octet(9))]);
        let mut out = Vec::new();
        marshall(&mut out, 0, &v, &ty, false, false, false).unwrap();
        assert_eq!(
            u16::from_ne_bytes(out[0..2].try_into().unwrap()),
            PID_EXTENDED
        );
        assert_eq!(u16::from_ne_bytes(out[2..4].try_into().unwrap()), 8);
        assert_eq!(u32::from_ne_bytes(out[4..8].try_into().unwrap()), 0x12345);
        // Value occupies one byte, length patched to the aligned 4.
        assert_eq!(u32::from_ne_bytes(out[8..12].try_into().unwrap()), 4);
    }

    #[test]
    fn union_emits_selected_arm_only() {
        use crate::types::{UnionArm, UnionType};
        let ty = Type::Union(UnionType {
            name: "u".into(),
            extensibility: Extensibility::Final,
            discriminant: build::primitive(PrimitiveKind::Int32),
            arms: vec![
                UnionArm {
                    labels: vec![0],
                    is_default: false,
                    member: Member::new("i", 0, build::primitive(PrimitiveKind::Int64)),
                },
                UnionArm {
                    labels: vec![1],
                    is_default: false,
                    member: Member::new("o", 1, build::primitive(PrimitiveKind::Octet)),
                },
            ],
            native_size: 0,
            value_offset: 0,
        });
        let v = DynValue::Union {
            discriminant: 1,
            arm: 1,
            value: Box::new(DynValue::Octet(7)),
        };
        let mut out = Vec::new();
        let n = marshall(&mut out, 0, &v, &ty, false, false, false).unwrap();
        // disc(4) + octet(1) + final pad to 4
        assert_eq!(n, 8);
        assert_eq!(out[4], 7);
    }

    #[test]
    fn key_only_skips_non_key_members() {
        let ty = build::structure(
            "k",
            Extensibility::Final,
            vec![
                Member::new("key", 0, build::primitive(PrimitiveKind::Int32)).key(),
                Member::new("val", 1, build::primitive(PrimitiveKind::Int64)),
            ],
        );
        let v = struct_value(vec![
            (0, DynValue::Int32(5)),
            (1, DynValue::Int64(6)),
        ]);
        let n = marshalled_size(0, &v, &ty, true, false).unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn swap_reverses_each_primitive() {
        let ty = simple_struct();
        let v = struct_value(vec![
            (0, DynValue::Octet(0x7F)),
            (1, DynValue::Int32(0x01020304)),
        ]);
        let mut straight = Vec::new();
        let mut swapped = Vec::new();
        marshall(&mut straight, 0, &v, &ty, false, false, false).unwrap();
        marshall(&mut swapped, 0, &v, &ty, false, false, true).unwrap();
        assert_eq!(straight[0], swapped[0]);
        let a = &straight[4..8];
        let mut b = swapped[4..8].to_vec();
        b.reverse();
        assert_eq!(a, b.as_slice());
    }
}
