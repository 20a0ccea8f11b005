//! Unmarshalling: CDR / PL-CDR byte streams to dynamic values.
//!
//! The same walk drives full decodes, key-only decodes, the native-size
//! computation and the field-offset lookup. Mutable aggregates are
//! parsed header by header; the decoder never trusts its own
//! consumption and seeks by the header length instead. Key-only reads
//! on mutable data collect the key parameters first and replay them in
//! member-id order, so keys produced by different senders hash
//! identically.

use crate::generate::key_member_indices;
use crate::types::{Extensibility, Member, StructType, Type, UnionType};
use crate::value::{DynValue, StructField};
use crate::wire::{
    Reader, PID_EXT_ID_MASK, PID_EXTENDED, PID_ID_MASK, PID_IGNORE, PID_LIST_END,
    PID_MUST_UNDERSTAND,
};
use arrayvec::ArrayVec;
use tdds_kernel::error::{DdsError, Result};

/// Inline capacity for mutable key-field descriptors before spilling
/// to the heap.
const MAX_INLINE_KEY_FIELDS: usize = 8;

#[derive(Clone, Copy, Default)]
pub(crate) struct ParseOpts {
    /// Materialise only key members.
    pub key_mode: bool,
    /// The source is a concatenated key stream, not a full sample.
    pub from_key: bool,
    /// Key-stream strings are padded to their bound.
    pub padded: bool,
}

/// Decode a full sample. String leaves borrow from `src`.
pub fn unmarshall<'a>(
    src: &'a [u8],
    hsize: usize,
    ty: &Type,
    swap: bool,
) -> Result<DynValue<'a>> {
    let mut rd = Reader::new(src, hsize, swap);
    parse(&mut rd, ty, ParseOpts::default(), false, true)?
        .ok_or_else(|| DdsError::bad_parameter("nothing decoded"))
}

/// Decode a sample into a dynamic node tree. With `key` set only key
/// members materialise; with `copy` set every leaf allocates, detaching
/// the result from `src`.
pub fn dynamic_data<'a>(
    src: &'a [u8],
    hsize: usize,
    ty: &Type,
    key: bool,
    copy: bool,
    swap: bool,
) -> Result<DynValue<'a>> {
    let mut rd = Reader::new(src, hsize, swap);
    let opts = ParseOpts {
        key_mode: key,
        ..ParseOpts::default()
    };
    let v = parse(&mut rd, ty, opts, key, true)?
        .ok_or_else(|| DdsError::bad_parameter("nothing decoded"))?;
    Ok(if copy { v.into_owned() } else { v })
}

/// Total native size of the decoded sample, including `prefix` bytes
/// reserved by the caller and the heap storage of unbounded members.
pub fn unmarshalled_size(
    src: &[u8],
    hsize: usize,
    ty: &Type,
    swap: bool,
    prefix: usize,
) -> Result<usize> {
    let v = unmarshall(src, hsize, ty, swap)?;
    Ok(prefix + ty.native_size() + native_extra(&v, ty)?)
}

/// Heap bytes needed beyond the flat native size.
pub(crate) fn native_extra(value: &DynValue<'_>, ty: &Type) -> Result<usize> {
    Ok(match (value, ty) {
        (DynValue::Str(s), Type::String(st)) if st.bound == 0 => s.len() + 1,
        (DynValue::Struct(fields), Type::Struct(st)) => {
            let mut n = 0;
            for f in fields {
                let m = st
                    .members
                    .get(f.index)
                    .ok_or_else(|| DdsError::bad_parameter("field index out of range"))?;
                n += native_extra(&f.value, &m.ty)?;
            }
            n
        }
        (DynValue::Union { arm, value, .. }, Type::Union(ut)) => {
            let a = ut
                .arms
                .get(*arm)
                .ok_or_else(|| DdsError::bad_parameter("union arm out of range"))?;
            native_extra(value, &a.member.ty)?
        }
        (DynValue::Array(items), Type::Array(at)) => {
            let mut n = 0;
            for item in items {
                n += native_extra(item, &at.element)?;
            }
            n
        }
        (DynValue::Sequence(items), Type::Sequence(sq)) => {
            let mut n = items.len() * sq.element.native_size();
            for item in items {
                n += native_extra(item, &sq.element)?;
            }
            n
        }
        _ => 0,
    })
}

/// Parse one parameter header. Returns `(member id, value length,
/// must-understand)`.
fn parse_pid_header(rd: &mut Reader<'_>) -> Result<(u32, usize, bool)> {
    rd.align(4)?;
    let raw = rd.get_u16()?;
    let raw_len = rd.get_u16()?;
    let id = (raw & PID_ID_MASK) as u32;
    let understand = raw & PID_MUST_UNDERSTAND != 0;
    if id < PID_EXTENDED as u32 || id == PID_LIST_END as u32 || id == PID_IGNORE as u32 {
        Ok((id, raw_len as usize, understand))
    } else if id == PID_EXTENDED as u32 {
        if raw_len != 8 {
            return Err(DdsError::bad_parameter("bad extended parameter header"));
        }
        let long_id = rd.get_u32()? & PID_EXT_ID_MASK;
        let long_len = rd.get_u32()?;
        Ok((long_id, long_len as usize, understand))
    } else {
        Err(DdsError::bad_parameter("reserved parameter id"))
    }
}

pub(crate) fn parse<'a>(
    rd: &mut Reader<'a>,
    ty: &Type,
    opts: ParseOpts,
    in_key: bool,
    materialize: bool,
) -> Result<Option<DynValue<'a>>> {
    use crate::types::PrimitiveKind as K;
    Ok(match ty {
        Type::Primitive(p) => {
            let v = match p {
                K::Bool => DynValue::Bool(rd.get_u8()? != 0),
                K::Octet => DynValue::Octet(rd.get_u8()?),
                K::Char8 => DynValue::Char8(rd.get_u8()?),
                K::Char32 => {
                    let raw = rd.get_u32()?;
                    DynValue::Char32(
                        char::from_u32(raw)
                            .ok_or_else(|| DdsError::bad_parameter("invalid char32"))?,
                    )
                }
                K::Int16 => DynValue::Int16(rd.get_i16()?),
                K::UInt16 => DynValue::UInt16(rd.get_u16()?),
                K::Int32 => DynValue::Int32(rd.get_i32()?),
                K::UInt32 => DynValue::UInt32(rd.get_u32()?),
                K::Int64 => DynValue::Int64(rd.get_i64()?),
                K::UInt64 => DynValue::UInt64(rd.get_u64()?),
                K::Float32 => DynValue::Float32(rd.get_f32()?),
                K::Float64 => DynValue::Float64(rd.get_f64()?),
                K::Float128 => {
                    rd.align(8)?;
                    let raw = rd.take(16)?;
                    let mut b = [0u8; 16];
                    b.copy_from_slice(raw);
                    DynValue::Float128(b)
                }
            };
            materialize.then_some(v)
        }
        Type::Enum(_) => {
            let v = rd.get_i32()?;
            materialize.then_some(DynValue::Enum(v))
        }
        Type::BitSet(b) => {
            let v = match b.storage_size() {
                1 => rd.get_u8()? as u64,
                2 => rd.get_u16()? as u64,
                4 => rd.get_u32()? as u64,
                _ => rd.get_u64()?,
            };
            materialize.then_some(DynValue::BitSet(v))
        }
        Type::String(st) => {
            let len = rd.get_u32()? as usize;
            if st.bound > 0 && len > st.bound as usize + 1 {
                return Err(DdsError::bad_parameter("string exceeds bound"));
            }
            let bytes = rd.take(len)?;
            if in_key && opts.from_key && opts.padded && st.bound > 0 && len <= st.bound as usize
            {
                rd.skip(st.bound as usize + 1 - len)?;
            }
            if !materialize {
                None
            } else {
                let text = if len == 0 { &bytes[..0] } else { &bytes[..len - 1] };
                let s = std::str::from_utf8(text)
                    .map_err(|_| DdsError::bad_parameter("invalid utf-8 in string"))?;
                Some(DynValue::Str(std::borrow::Cow::Borrowed(s)))
            }
        }
        Type::Struct(st) => parse_struct(rd, st, opts, in_key, materialize)?,
        Type::Union(ut) => parse_union(rd, ut, opts, in_key, materialize)?,
        Type::Array(at) => {
            let n = at.total_elements();
            let mut items = Vec::with_capacity(if materialize { n } else { 0 });
            for _ in 0..n {
                if let Some(v) = parse(rd, &at.element, opts, in_key, materialize)? {
                    items.push(v);
                }
            }
            materialize.then_some(DynValue::Array(items))
        }
        Type::Sequence(sq) => {
            let n = rd.get_u32()? as usize;
            if sq.bound > 0 && n > sq.bound as usize {
                return Err(DdsError::bad_parameter("sequence exceeds bound"));
            }
            let mut items = Vec::with_capacity(if materialize { n.min(4096) } else { 0 });
            for _ in 0..n {
                if let Some(v) = parse(rd, &sq.element, opts, in_key, materialize)? {
                    items.push(v);
                }
            }
            materialize.then_some(DynValue::Sequence(items))
        }
    })
}

fn parse_member<'a>(
    rd: &mut Reader<'a>,
    m: &Member,
    opts: ParseOpts,
    in_key: bool,
    materialize: bool,
    mutable: bool,
) -> Result<Option<DynValue<'a>>> {
    if !mutable && m.is_optional && !opts.from_key {
        let len = rd.get_u32()? as usize;
        if len == 0 {
            return Ok(None);
        }
    }
    parse(rd, &m.ty, opts, in_key, materialize)
}

fn parse_struct<'a>(
    rd: &mut Reader<'a>,
    st: &StructType,
    opts: ParseOpts,
    in_key: bool,
    materialize: bool,
) -> Result<Option<DynValue<'a>>> {
    if opts.from_key {
        return parse_struct_from_key(rd, st, opts, materialize);
    }
    if st.extensibility == Extensibility::Mutable {
        return parse_struct_mutable(rd, st, opts, materialize);
    }

    let keyed = st.keyed();
    let mut fields = Vec::new();
    for (i, m) in st.members.iter().enumerate() {
        let key_member = m.is_key || !keyed;
        let mat = materialize && (!opts.key_mode || key_member);
        let v = parse_member(rd, m, opts, in_key || key_member, mat, false)?;
        if let Some(v) = v {
            if mat {
                fields.push(StructField { index: i, value: v });
            }
        }
    }
    Ok(materialize.then_some(DynValue::Struct(fields)))
}

/// Key-stream decode: only the canonical key members are present, in
/// member-id order for mutable types.
fn parse_struct_from_key<'a>(
    rd: &mut Reader<'a>,
    st: &StructType,
    opts: ParseOpts,
    materialize: bool,
) -> Result<Option<DynValue<'a>>> {
    let mut fields = Vec::new();
    for i in key_member_indices(st) {
        let m = &st.members[i];
        if let Some(v) = parse(rd, &m.ty, opts, true, materialize)? {
            fields.push(StructField { index: i, value: v });
        }
    }
    Ok(materialize.then_some(DynValue::Struct(fields)))
}

struct KeyFieldDesc {
    id: u32,
    member: usize,
    pos: usize,
    found: bool,
}

fn parse_struct_mutable<'a>(
    rd: &mut Reader<'a>,
    st: &StructType,
    opts: ParseOpts,
    materialize: bool,
) -> Result<Option<DynValue<'a>>> {
    let keyed = st.keyed();

    if opts.key_mode && materialize {
        let indices = key_member_indices(st);
        if indices.len() > 1 {
            return parse_mutable_key_ordered(rd, st, &indices, opts);
        }
    }

    let mut fields = Vec::new();
    loop {
        let (id, len, understand) = parse_pid_header(rd)?;
        if id == PID_LIST_END as u32 {
            break;
        }
        if id == PID_IGNORE as u32 {
            rd.skip(len)?;
            continue;
        }
        let value_start = rd.pos();
        match st.members.iter().position(|m| m.id == id) {
            Some(i) => {
                let m = &st.members[i];
                let key_member = m.is_key || !keyed;
                let mat = materialize && (!opts.key_mode || key_member);
                let v = parse_member(rd, m, opts, key_member, mat, true)?;
                if let (Some(v), true) = (v, mat) {
                    fields.push(StructField { index: i, value: v });
                }
                // Seek by the header length: never trust our own
                // consumption across producer versions.
                rd.seek(value_start + len)?;
            }
            None => {
                if understand {
                    return Err(DdsError::bad_parameter(
                        "unknown must-understand parameter",
                    ));
                }
                rd.skip(len)?;
            }
        }
    }
    fields.sort_by_key(|f| f.index);
    Ok(materialize.then_some(DynValue::Struct(fields)))
}

/// Ordered key decode of a mutable struct: scan all parameter headers
/// first, then replay the key members sorted by member id.
fn parse_mutable_key_ordered<'a>(
    rd: &mut Reader<'a>,
    st: &StructType,
    key_indices: &[usize],
    opts: ParseOpts,
) -> Result<Option<DynValue<'a>>> {
    let mut descs: ArrayVec<KeyFieldDesc, MAX_INLINE_KEY_FIELDS> = ArrayVec::new();
    let mut spill: Vec<KeyFieldDesc> = Vec::new();
    let use_spill = key_indices.len() > MAX_INLINE_KEY_FIELDS;
    for &i in key_indices {
        let d = KeyFieldDesc {
            id: st.members[i].id,
            member: i,
            pos: 0,
            found: false,
        };
        if use_spill {
            spill.push(d);
        } else {
            descs.push(d);
        }
    }
    let fds: &mut [KeyFieldDesc] = if use_spill { &mut spill } else { &mut descs };

    // Pass 1: headers only.
    let mut found = 0usize;
    loop {
        let (id, len, understand) = parse_pid_header(rd)?;
        if id == PID_LIST_END as u32 {
            break;
        }
        if id == PID_IGNORE as u32 {
            rd.skip(len)?;
            continue;
        }
        if let Some(fp) = fds.iter_mut().find(|f| f.id == id) {
            if fp.found {
                return Err(DdsError::bad_parameter("duplicate key parameter"));
            }
            fp.pos = rd.pos();
            fp.found = true;
            found += 1;
        } else if st.members.iter().all(|m| m.id != id) && understand {
            return Err(DdsError::bad_parameter("unknown must-understand parameter"));
        }
        rd.skip(len)?;
    }
    if found != fds.len() {
        return Err(DdsError::bad_parameter("missing key parameter"));
    }
    let end = rd.pos();

    // Pass 2: replay in member-id order (the descriptor list is already
    // sorted by id via the canonical key ordering).
    let mut fields = Vec::with_capacity(fds.len());
    for fp in fds.iter() {
        rd.seek(fp.pos)?;
        let m = &st.members[fp.member];
        if let Some(v) = parse(rd, &m.ty, opts, true, true)? {
            fields.push(StructField {
                index: fp.member,
                value: v,
            });
        }
    }
    rd.seek(end)?;
    Ok(Some(DynValue::Struct(fields)))
}

fn parse_union<'a>(
    rd: &mut Reader<'a>,
    ut: &UnionType,
    opts: ParseOpts,
    in_key: bool,
    materialize: bool,
) -> Result<Option<DynValue<'a>>> {
    use crate::types::PrimitiveKind as K;
    let disc: i64 = match ut.discriminant.as_ref() {
        Type::Primitive(p) => match p {
            K::Bool | K::Octet | K::Char8 => rd.get_u8()? as i64,
            K::Int16 => rd.get_i16()? as i64,
            K::UInt16 => rd.get_u16()? as i64,
            K::Int64 | K::UInt64 => rd.get_i64()?,
            _ => rd.get_i32()? as i64,
        },
        Type::Enum(_) => rd.get_i32()? as i64,
        _ => return Err(DdsError::bad_parameter("invalid discriminant type")),
    };
    let arm = ut
        .select(disc)
        .ok_or_else(|| DdsError::bad_parameter("discriminant selects no arm"))?;
    let v = parse(rd, &ut.arms[arm].member.ty, opts, in_key, materialize)?;
    Ok(match (materialize, v) {
        (true, Some(v)) => Some(DynValue::Union {
            discriminant: disc,
            arm,
            value: Box::new(v),
        }),
        _ => None,
    })
}

/// Byte offset of the `field_index`-th top-level member within the
/// encoded sample, without copying. For mutable types the offset is
/// the value position after the matching parameter header.
pub fn field_offset(
    src: &[u8],
    hsize: usize,
    field_index: usize,
    ty: &Type,
    swap: bool,
) -> Result<usize> {
    let st = ty.as_struct()?;
    if field_index >= st.members.len() {
        return Err(DdsError::bad_parameter("field index out of range"));
    }
    let mut rd = Reader::new(src, hsize, swap);

    if st.extensibility == Extensibility::Mutable {
        let want = st.members[field_index].id;
        loop {
            let (id, len, _understand) = parse_pid_header(&mut rd)?;
            if id == PID_LIST_END as u32 {
                return Err(DdsError::bad_parameter("field not present"));
            }
            if id == want {
                return Ok(rd.pos());
            }
            rd.skip(len)?;
        }
    }

    let opts = ParseOpts::default();
    for (i, m) in st.members.iter().enumerate() {
        if i == field_index {
            rd.align(first_alignment(&m.ty))?;
            return Ok(rd.pos());
        }
        parse_member(&mut rd, m, opts, false, false, false)?;
    }
    unreachable!("field index validated above")
}

/// Alignment of the first encoded leaf of a type.
fn first_alignment(ty: &Type) -> usize {
    match ty {
        Type::Primitive(p) => p.alignment(),
        Type::Enum(_) => 4,
        Type::BitSet(b) => b.storage_size().min(8),
        Type::String(_) | Type::Sequence(_) => 4,
        Type::Struct(st) => {
            if st.extensibility == Extensibility::Mutable {
                4
            } else {
                st.members
                    .first()
                    .map(|m| first_alignment(&m.ty))
                    .unwrap_or(1)
            }
        }
        Type::Union(ut) => first_alignment(&ut.discriminant),
        Type::Array(at) => first_alignment(&at.element),
    }
}
