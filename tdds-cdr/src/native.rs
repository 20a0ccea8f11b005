//! Native (generated-layout) data access.
//!
//! The static data path reads and writes `#[repr(C)]` samples through
//! the offsets recorded in their type descriptors. This is the one
//! module that touches raw sample memory.
//!
//! SAFETY CONTRACT:
//! - `data` must point at a live allocation whose layout matches the
//!   type descriptor the caller passes: every member offset in bounds,
//!   unbounded strings stored as NUL-terminated `*const c_char`,
//!   sequences stored as a [`RawSeq`] header.
//! - Pointers written by [`value_to_native`] are owned by the sample
//!   and must be released with [`native_free`], nothing else.
//! - Unions and optional members have no native form here; they are
//!   dynamic-path only, as in the generated static codec this module
//!   descends from.

use crate::types::{PrimitiveKind, Type};
use crate::value::{DynValue, StructField};
use libc::{c_char, c_void};
use std::borrow::Cow;
use tdds_kernel::error::{DdsError, Result};

/// C-layout sequence header used by generated samples.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawSeq {
    pub maximum: u32,
    pub length: u32,
    pub esize: u32,
    pub own: u32,
    pub buffer: *mut c_void,
}

pub const RAW_SEQ_SIZE: usize = std::mem::size_of::<RawSeq>();

unsafe fn read_prim(data: *const u8, kind: PrimitiveKind) -> DynValue<'static> {
    match kind {
        PrimitiveKind::Bool => DynValue::Bool(*data != 0),
        PrimitiveKind::Octet => DynValue::Octet(*data),
        PrimitiveKind::Char8 => DynValue::Char8(*data),
        PrimitiveKind::Char32 => {
            let raw = (data as *const u32).read_unaligned();
            DynValue::Char32(char::from_u32(raw).unwrap_or('\u{fffd}'))
        }
        PrimitiveKind::Int16 => DynValue::Int16((data as *const i16).read_unaligned()),
        PrimitiveKind::UInt16 => DynValue::UInt16((data as *const u16).read_unaligned()),
        PrimitiveKind::Int32 => DynValue::Int32((data as *const i32).read_unaligned()),
        PrimitiveKind::UInt32 => DynValue::UInt32((data as *const u32).read_unaligned()),
        PrimitiveKind::Int64 => DynValue::Int64((data as *const i64).read_unaligned()),
        PrimitiveKind::UInt64 => DynValue::UInt64((data as *const u64).read_unaligned()),
        PrimitiveKind::Float32 => DynValue::Float32((data as *const f32).read_unaligned()),
        PrimitiveKind::Float64 => DynValue::Float64((data as *const f64).read_unaligned()),
        PrimitiveKind::Float128 => {
            let mut b = [0u8; 16];
            std::ptr::copy_nonoverlapping(data, b.as_mut_ptr(), 16);
            DynValue::Float128(b)
        }
    }
}

unsafe fn write_prim(data: *mut u8, kind: PrimitiveKind, v: &DynValue<'_>) -> Result<()> {
    use PrimitiveKind as K;
    match (kind, v) {
        (K::Bool, DynValue::Bool(x)) => *data = *x as u8,
        (K::Octet, DynValue::Octet(x)) | (K::Char8, DynValue::Char8(x)) => *data = *x,
        (K::Char32, DynValue::Char32(x)) => (data as *mut u32).write_unaligned(*x as u32),
        (K::Int16, DynValue::Int16(x)) => (data as *mut i16).write_unaligned(*x),
        (K::UInt16, DynValue::UInt16(x)) => (data as *mut u16).write_unaligned(*x),
        (K::Int32, DynValue::Int32(x)) => (data as *mut i32).write_unaligned(*x),
        (K::UInt32, DynValue::UInt32(x)) => (data as *mut u32).write_unaligned(*x),
        (K::Int64, DynValue::Int64(x)) => (data as *mut i64).write_unaligned(*x),
        (K::UInt64, DynValue::UInt64(x)) => (data as *mut u64).write_unaligned(*x),
        (K::Float32, DynValue::Float32(x)) => (data as *mut f32).write_unaligned(*x),
        (K::Float64, DynValue::Float64(x)) => (data as *mut f64).write_unaligned(*x),
        (K::Float128, DynValue::Float128(x)) => {
            std::ptr::copy_nonoverlapping(x.as_ptr(), data, 16)
        }
        _ => return Err(DdsError::bad_parameter("primitive value/type mismatch")),
    }
    Ok(())
}

/// Materialise a native sample into a dynamic value tree.
///
/// # Safety
/// See the module safety contract; `data` must match `ty`.
pub unsafe fn native_to_value(data: *const u8, ty: &Type) -> Result<DynValue<'static>> {
    Ok(match ty {
        Type::Primitive(p) => read_prim(data, *p),
        Type::Enum(_) => DynValue::Enum((data as *const i32).read_unaligned()),
        Type::BitSet(b) => {
            let v = match b.storage_size() {
                1 => *data as u64,
                2 => (data as *const u16).read_unaligned() as u64,
                4 => (data as *const u32).read_unaligned() as u64,
                _ => (data as *const u64).read_unaligned(),
            };
            DynValue::BitSet(v)
        }
        Type::String(st) => {
            let text = if st.bound > 0 {
                // Inline char array, NUL-terminated within the bound.
                let max = st.bound as usize + 1;
                let bytes = std::slice::from_raw_parts(data, max);
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(max - 1);
                String::from_utf8_lossy(&bytes[..end]).into_owned()
            } else {
                let ptr = (data as *const *const c_char).read_unaligned();
                if ptr.is_null() {
                    String::new()
                } else {
                    std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
                }
            };
            DynValue::Str(Cow::Owned(text))
        }
        Type::Struct(st) => {
            let mut fields = Vec::with_capacity(st.members.len());
            for (i, m) in st.members.iter().enumerate() {
                if m.is_optional || m.is_shareable {
                    return Err(DdsError::Unsupported(
                        "optional members on the native path".into(),
                    ));
                }
                let v = native_to_value(data.add(m.offset), &m.ty)?;
                fields.push(StructField { index: i, value: v });
            }
            DynValue::Struct(fields)
        }
        Type::Union(_) => {
            return Err(DdsError::Unsupported("unions on the native path".into()))
        }
        Type::Array(at) => {
            let stride = at.element.native_size();
            let n = at.total_elements();
            let mut items = Vec::with_capacity(n);
            for i in 0..n {
                items.push(native_to_value(data.add(i * stride), &at.element)?);
            }
            DynValue::Array(items)
        }
        Type::Sequence(sq) => {
            let hdr = (data as *const RawSeq).read_unaligned();
            if sq.bound > 0 && hdr.length > sq.bound {
                return Err(DdsError::bad_parameter("sequence exceeds bound"));
            }
            let stride = sq.element.native_size();
            let mut items = Vec::with_capacity(hdr.length as usize);
            for i in 0..hdr.length as usize {
                let p = (hdr.buffer as *const u8).add(i * stride);
                items.push(native_to_value(p, &sq.element)?);
            }
            DynValue::Sequence(items)
        }
    })
}

/// Write a dynamic value into a native sample, allocating heap storage
/// for unbounded strings and sequence buffers.
///
/// # Safety
/// See the module safety contract; `data` must match `ty` and have no
/// live heap fields (use [`native_free`] first when reusing a sample).
pub unsafe fn value_to_native(value: &DynValue<'_>, ty: &Type, data: *mut u8) -> Result<()> {
    match (ty, value) {
        (Type::Primitive(p), v) => write_prim(data, *p, v)?,
        (Type::Enum(_), DynValue::Enum(v)) => (data as *mut i32).write_unaligned(*v),
        (Type::BitSet(b), DynValue::BitSet(v)) => match b.storage_size() {
            1 => *data = *v as u8,
            2 => (data as *mut u16).write_unaligned(*v as u16),
            4 => (data as *mut u32).write_unaligned(*v as u32),
            _ => (data as *mut u64).write_unaligned(*v),
        },
        (Type::String(st), DynValue::Str(s)) => {
            let bytes = s.as_bytes();
            if st.bound > 0 {
                if bytes.len() > st.bound as usize {
                    return Err(DdsError::bad_parameter("string exceeds bound"));
                }
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
                *data.add(bytes.len()) = 0;
            } else {
                let buf = libc::malloc(bytes.len() + 1) as *mut u8;
                if buf.is_null() {
                    return Err(DdsError::NoMemory);
                }
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len());
                *buf.add(bytes.len()) = 0;
                (data as *mut *mut c_char).write_unaligned(buf as *mut c_char);
            }
        }
        (Type::Struct(st), DynValue::Struct(_)) => {
            for (i, m) in st.members.iter().enumerate() {
                if m.is_optional || m.is_shareable {
                    return Err(DdsError::Unsupported(
                        "optional members on the native path".into(),
                    ));
                }
                let v = value
                    .field(i)
                    .ok_or_else(|| DdsError::bad_parameter("missing struct member"))?;
                value_to_native(v, &m.ty, data.add(m.offset))?;
            }
        }
        (Type::Array(at), DynValue::Array(items)) => {
            if items.len() != at.total_elements() {
                return Err(DdsError::bad_parameter("array length mismatch"));
            }
            let stride = at.element.native_size();
            for (i, item) in items.iter().enumerate() {
                value_to_native(item, &at.element, data.add(i * stride))?;
            }
        }
        (Type::Sequence(sq), DynValue::Sequence(items)) => {
            if sq.bound > 0 && items.len() > sq.bound as usize {
                return Err(DdsError::bad_parameter("sequence exceeds bound"));
            }
            let stride = sq.element.native_size();
            let buffer = if items.is_empty() {
                std::ptr::null_mut()
            } else {
                let buf = libc::malloc(items.len() * stride) as *mut u8;
                if buf.is_null() {
                    return Err(DdsError::NoMemory);
                }
                std::ptr::write_bytes(buf, 0, items.len() * stride);
                for (i, item) in items.iter().enumerate() {
                    value_to_native(item, &sq.element, buf.add(i * stride))?;
                }
                buf
            };
            (data as *mut RawSeq).write_unaligned(RawSeq {
                maximum: items.len() as u32,
                length: items.len() as u32,
                esize: stride as u32,
                own: 1,
                buffer: buffer as *mut c_void,
            });
        }
        (Type::Union(_), _) => {
            return Err(DdsError::Unsupported("unions on the native path".into()))
        }
        _ => return Err(DdsError::bad_parameter("value/type mismatch")),
    }
    Ok(())
}

/// Release the heap fields of a native sample produced by
/// [`value_to_native`]. The flat sample storage itself stays with the
/// caller.
///
/// # Safety
/// `data` must have been filled by [`value_to_native`] with the same
/// type and not freed since.
pub unsafe fn native_free(ty: &Type, data: *mut u8) {
    match ty {
        Type::String(st) if st.bound == 0 => {
            let ptr = (data as *mut *mut c_char).read_unaligned();
            if !ptr.is_null() {
                libc::free(ptr as *mut c_void);
                (data as *mut *mut c_char).write_unaligned(std::ptr::null_mut());
            }
        }
        Type::Struct(st) => {
            for m in &st.members {
                native_free(&m.ty, data.add(m.offset));
            }
        }
        Type::Array(at) => {
            let stride = at.element.native_size();
            for i in 0..at.total_elements() {
                native_free(&at.element, data.add(i * stride));
            }
        }
        Type::Sequence(sq) => {
            let hdr = (data as *mut RawSeq).read_unaligned();
            if !hdr.buffer.is_null() {
                let stride = sq.element.native_size();
                for i in 0..hdr.length as usize {
                    native_free(&sq.element, (hdr.buffer as *mut u8).add(i * stride));
                }
                if hdr.own != 0 {
                    libc::free(hdr.buffer);
                }
                (data as *mut RawSeq).write_unaligned(RawSeq {
                    maximum: 0,
                    length: 0,
                    esize: hdr.esize,
                    own: 0,
                    buffer: std::ptr::null_mut(),
                });
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{build_tsm, TsmEntry, TsmFlags, TypeCode};
    use std::mem::offset_of;

    #[repr(C)]
    struct Inner {
        n: i32,
    }

    #[repr(C)]
    struct Sample {
        key: *const c_char,
        inner: Inner,
        arr: [i16; 3],
        tag: [u8; 5], // bounded string, bound 4
    }

    fn sample_meta() -> &'static [TsmEntry] {
        use std::sync::OnceLock;
        static META: OnceLock<Vec<TsmEntry>> = OnceLock::new();
        static INNER_META: OnceLock<Vec<TsmEntry>> = OnceLock::new();
        let inner: &'static [TsmEntry] = INNER_META.get_or_init(|| {
            vec![
                TsmEntry {
                    nelem: 1,
                    name: "Inner",
                    size: std::mem::size_of::<Inner>(),
                    ..TsmEntry::new(TypeCode::Struct)
                },
                TsmEntry {
                    name: "n",
                    offset: offset_of!(Inner, n),
                    ..TsmEntry::new(TypeCode::Int32)
                },
            ]
        });
        META.get_or_init(|| {
            vec![
                TsmEntry {
                    nelem: 4,
                    name: "Sample",
                    size: std::mem::size_of::<Sample>(),
                    flags: TsmFlags::DYNAMIC,
                    ..TsmEntry::new(TypeCode::Struct)
                },
                TsmEntry {
                    name: "key",
                    flags: TsmFlags::KEY.union(TsmFlags::DYNAMIC),
                    offset: offset_of!(Sample, key),
                    ..TsmEntry::new(TypeCode::CString)
                },
                TsmEntry {
                    name: "inner",
                    offset: offset_of!(Sample, inner),
                    tsm: Some(inner),
                    ..TsmEntry::new(TypeCode::TypeRef)
                },
                TsmEntry {
                    name: "arr",
                    nelem: 3,
                    offset: offset_of!(Sample, arr),
                    ..TsmEntry::new(TypeCode::Array)
                },
                TsmEntry::new(TypeCode::Int16),
                TsmEntry {
                    name: "tag",
                    size: 4,
                    offset: offset_of!(Sample, tag),
                    ..TsmEntry::new(TypeCode::CString)
                },
            ]
        })
    }

    #[test]
    fn native_round_trip_through_value() {
        let ty = build_tsm(sample_meta()).unwrap();
        let sample = Sample {
            key: c"hello".as_ptr(),
            inner: Inner { n: 42 },
            arr: [1, 2, 3],
            tag: *b"abc\0\0",
        };
        let v = unsafe { native_to_value(&sample as *const Sample as *const u8, &ty) }.unwrap();
        assert_eq!(v.field(0).and_then(|f| f.as_str()), Some("hello"));
        assert_eq!(
            v.field(1).and_then(|f| f.field(0)).and_then(|f| f.as_i32()),
            Some(42)
        );
        assert_eq!(v.field(3).and_then(|f| f.as_str()), Some("abc"));

        let mut out: Sample = unsafe { std::mem::zeroed() };
        unsafe { value_to_native(&v, &ty, &mut out as *mut Sample as *mut u8) }.unwrap();
        assert_eq!(out.inner.n, 42);
        assert_eq!(out.arr, [1, 2, 3]);
        let s = unsafe { std::ffi::CStr::from_ptr(out.key) };
        assert_eq!(s.to_str().unwrap(), "hello");
        unsafe { native_free(&ty, &mut out as *mut Sample as *mut u8) };
        assert!(out.key.is_null());
    }

    #[test]
    fn sequence_native_round_trip() {
        #[repr(C)]
        struct SeqSample {
            q: RawSeq,
        }
        static META: &[TsmEntry] = &[
            TsmEntry {
                nelem: 1,
                name: "SeqSample",
                size: std::mem::size_of::<SeqSample>(),
                ..TsmEntry::new(TypeCode::Struct)
            },
            TsmEntry {
                name: "q",
                nelem: 0,
                flags: TsmFlags::DYNAMIC,
                ..TsmEntry::new(TypeCode::Sequence)
            },
            TsmEntry::new(TypeCode::Int32),
        ];
        let ty = build_tsm(META).unwrap();
        let v = crate::value::struct_value(vec![(
            0,
            DynValue::Sequence(vec![
                DynValue::Int32(7),
                DynValue::Int32(8),
                DynValue::Int32(9),
            ]),
        )]);
        let mut out: SeqSample = unsafe { std::mem::zeroed() };
        unsafe { value_to_native(&v, &ty, &mut out as *mut SeqSample as *mut u8) }.unwrap();
        assert_eq!(out.q.length, 3);
        let back =
            unsafe { native_to_value(&out as *const SeqSample as *const u8, &ty) }.unwrap();
        assert_eq!(back, v);
        unsafe { native_free(&ty, &mut out as *mut SeqSample as *mut u8) };
        assert_eq!(out.q.length, 0);
    }
}
