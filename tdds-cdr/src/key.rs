//! Key extraction and conversion.
//!
//! A key stream is the concatenated CDR encoding of a type's key
//! members, in declaration order for final types and member-id order
//! for mutable ones. Two forms exist: the packed key (strings encoded
//! tightly) and the padded key (bounded strings padded to their bound,
//! suitable for direct memcmp hashing).

use crate::generate::{gen, marshalled_size, GenOpts};
use crate::parse::{dynamic_data, parse, ParseOpts};
use crate::types::Type;
use crate::value::DynValue;
use crate::wire::{Reader, Sink};
use tdds_kernel::error::{DdsError, Result};

fn emit_key(value: &DynValue<'_>, ty: &Type, padded: bool) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut sink = Sink::writing(&mut out, 0, false);
    gen(
        &mut sink,
        value,
        ty,
        GenOpts {
            key_mode: true,
            padded,
        },
        true,
    )?;
    Ok(out)
}

/// Size of the concatenated CDR-encoded key fields of `src`.
pub fn key_size(src: &[u8], hsize: usize, ty: &Type, padded: bool, swap: bool) -> Result<usize> {
    let v = dynamic_data(src, hsize, ty, true, false, swap)?;
    let n = marshalled_size(0, &v, ty, true, padded)?;
    // The key stream carries no trailing alignment; recompute exactly.
    let exact = emit_key(&v, ty, padded)?.len();
    debug_assert!(exact <= n);
    Ok(exact)
}

/// Extract the key fields of an encoded sample as a canonical key
/// stream.
pub fn key_fields(
    src: &[u8],
    hsize: usize,
    ty: &Type,
    padded: bool,
    swap: bool,
) -> Result<Vec<u8>> {
    let v = dynamic_data(src, hsize, ty, true, false, swap)?;
    emit_key(&v, ty, padded)
}

/// Rewrite a key stream between its packed and padded forms.
pub fn key_convert(
    key: &[u8],
    ty: &Type,
    from_padded: bool,
    to_padded: bool,
) -> Result<Vec<u8>> {
    if from_padded == to_padded {
        return Ok(key.to_vec());
    }
    let mut rd = Reader::new(key, 0, false);
    let opts = ParseOpts {
        key_mode: true,
        from_key: true,
        padded: from_padded,
    };
    let v = parse(&mut rd, ty, opts, true, true)?
        .ok_or_else(|| DdsError::bad_parameter("empty key stream"))?;
    emit_key(&v, ty, to_padded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::marshall;
    use crate::types::{build, Extensibility, Member, PrimitiveKind};
    use crate::value::struct_value;
    use std::borrow::Cow;

    fn keyed_type(bound: u32) -> std::sync::Arc<Type> {
        build::structure(
            "k",
            Extensibility::Final,
            vec![
                Member::new("name", 0, build::string(bound)).key(),
                Member::new("id", 1, build::primitive(PrimitiveKind::Int32)).key(),
                Member::new("val", 2, build::primitive(PrimitiveKind::Int64)),
            ],
        )
    }

    fn sample() -> DynValue<'static> {
        struct_value(vec![
            (0, DynValue::Str(Cow::Borrowed("ab"))),
            (1, DynValue::Int32(9)),
            (2, DynValue::Int64(1234)),
        ])
    }

    #[test]
    fn packed_key_extraction() {
        let ty = keyed_type(0);
        let mut out = Vec::new();
        marshall(&mut out, 0, &sample(), &ty, false, false, false).unwrap();
        let key = key_fields(&out, 0, &ty, false, false).unwrap();
        // len(4) + "ab\0"(3) + pad(1) + i32(4)
        assert_eq!(key.len(), 12);
        assert_eq!(u32::from_ne_bytes(key[0..4].try_into().unwrap()), 3);
        assert_eq!(&key[4..7], b"ab\0");
        assert_eq!(i32::from_ne_bytes(key[8..12].try_into().unwrap()), 9);
        assert_eq!(key_size(&out, 0, &ty, false, false).unwrap(), key.len());
    }

    #[test]
    fn padded_key_pads_bounded_strings() {
        let ty = keyed_type(7);
        let mut out = Vec::new();
        marshall(&mut out, 0, &sample(), &ty, false, false, false).unwrap();
        let key = key_fields(&out, 0, &ty, true, false).unwrap();
        // len(4) + 8 bytes (bound + NUL) + i32(4)
        assert_eq!(key.len(), 16);
        assert_eq!(&key[4..7], b"ab\0");
        assert!(key[7..12].iter().all(|&b| b == 0));
    }

    #[test]
    fn key_convert_round_trip() {
        let ty = keyed_type(7);
        let mut out = Vec::new();
        marshall(&mut out, 0, &sample(), &ty, false, false, false).unwrap();
        let packed = key_fields(&out, 0, &ty, false, false).unwrap();
        let padded = key_fields(&out, 0, &ty, true, false).unwrap();
        assert_eq!(key_convert(&packed, &ty, false, true).unwrap(), padded);
        assert_eq!(key_convert(&padded, &ty, true, false).unwrap(), packed);
    }

    #[test]
    fn mutable_keys_are_member_id_sorted() {
        // Same members, different declaration order and ids chosen so
        // id order differs from declaration order.
        let a = build::structure(
            "m",
            Extensibility::Mutable,
            vec![
                Member::new("x", 5, build::primitive(PrimitiveKind::Int32)).key(),
                Member::new("y", 2, build::primitive(PrimitiveKind::Int32)).key(),
            ],
        );
        let b = build::structure(
            "m",
            Extensibility::Mutable,
            vec![
                Member::new("y", 2, build::primitive(PrimitiveKind::Int32)).key(),
                Member::new("x", 5, build::primitive(PrimitiveKind::Int32)).key(),
            ],
        );
        let va = struct_value(vec![
            (0, DynValue::Int32(50)),
            (1, DynValue::Int32(20)),
        ]);
        let vb = struct_value(vec![
            (0, DynValue::Int32(20)),
            (1, DynValue::Int32(50)),
        ]);
        let mut out_a = Vec::new();
        let mut out_b = Vec::new();
        marshall(&mut out_a, 0, &va, &a, false, false, false).unwrap();
        marshall(&mut out_b, 0, &vb, &b, false, false, false).unwrap();
        // Wire streams differ (member order differs) but the canonical
        // keys are identical.
        let ka = key_fields(&out_a, 0, &a, false, false).unwrap();
        let kb = key_fields(&out_b, 0, &b, false, false).unwrap();
        assert_eq!(ka, kb);
        let v = i32::from_ne_bytes(ka[0..4].try_into().unwrap());
        assert_eq!(v, 20); // id 2 first
    }

    #[test]
    fn unkeyed_type_uses_all_members() {
        let ty = build::structure(
            "u",
            Extensibility::Final,
            vec![
                Member::new("a", 0, build::primitive(PrimitiveKind::Int32)),
                Member::new("b", 1, build::primitive(PrimitiveKind::Int32)),
            ],
        );
        let v = struct_value(vec![
            (0, DynValue::Int32(1)),
            (1, DynValue::Int32(2)),
        ]);
        let mut out = Vec::new();
        marshall(&mut out, 0, &v, &ty, false, false, false).unwrap();
        let key = key_fields(&out, 0, &ty, false, false).unwrap();
        assert_eq!(key.len(), 8);
    }
}
