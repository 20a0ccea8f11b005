// tdds-cdr: CDR / PL-CDR codec for the TDDS middleware
//
// Serialises, deserialises, sizes and key-extracts samples described
// either by generated static descriptors or by a runtime type tree.
// FINAL and APPENDABLE aggregates use plain CDR; MUTABLE aggregates use
// the parameter-list encoding with per-member `{pid, length}` headers.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod encaps;
pub mod generate;
pub mod key;
pub mod meta;
pub mod native;
pub mod parse;
pub mod types;
pub mod value;
pub mod wire;

use std::sync::Arc;

use tdds_kernel::error::Result;

pub use meta::{build_tsm, TsmEntry, TsmFlags, TypeCode};
pub use types::{Extensibility, Member, MemberId, PrimitiveKind, Type};
pub use value::{struct_value, DynValue, StructField};

/// Type support: one registered type with its codec operations.
#[derive(Clone)]
pub struct TypeSupport {
    ty: Arc<Type>,
}

impl TypeSupport {
    /// Register a type from its generated static descriptor.
    pub fn from_meta(entries: &[TsmEntry]) -> Result<TypeSupport> {
        Ok(TypeSupport {
            ty: build_tsm(entries)?,
        })
    }

    /// Register a runtime-built type tree.
    pub fn from_type(ty: Arc<Type>) -> TypeSupport {
        TypeSupport { ty }
    }

    pub fn ty(&self) -> &Arc<Type> {
        &self.ty
    }

    pub fn name(&self) -> &str {
        self.ty.name()
    }

    /// Serialised size of `value`, the required pre-pass before
    /// [`TypeSupport::marshall`].
    pub fn marshalled_size(
        &self,
        hsize: usize,
        value: &DynValue<'_>,
        key_only: bool,
        padded: bool,
    ) -> Result<usize> {
        generate::marshalled_size(hsize, value, &self.ty, key_only, padded)
    }

    /// Serialise `value` into `dst`; returns the payload length.
    pub fn marshall(
        &self,
        dst: &mut Vec<u8>,
        hsize: usize,
        value: &DynValue<'_>,
        key_only: bool,
        padded: bool,
        swap: bool,
    ) -> Result<usize> {
        generate::marshall(dst, hsize, value, &self.ty, key_only, padded, swap)
    }

    /// Deserialise a full sample; strings borrow from `src`.
    pub fn unmarshall<'a>(&self, src: &'a [u8], hsize: usize, swap: bool) -> Result<DynValue<'a>> {
        parse::unmarshall(src, hsize, &self.ty, swap)
    }

    /// Native size the decoded sample will need, including `prefix`.
    pub fn unmarshalled_size(
        &self,
        src: &[u8],
        hsize: usize,
        swap: bool,
        prefix: usize,
    ) -> Result<usize> {
        parse::unmarshalled_size(src, hsize, &self.ty, swap, prefix)
    }

    /// Parse into a dynamic node tree; `copy` detaches it from `src`.
    pub fn dynamic_data<'a>(
        &self,
        src: &'a [u8],
        hsize: usize,
        key: bool,
        copy: bool,
        swap: bool,
    ) -> Result<DynValue<'a>> {
        parse::dynamic_data(src, hsize, &self.ty, key, copy, swap)
    }

    /// Size of the concatenated CDR-encoded key fields.
    pub fn key_size(&self, src: &[u8], hsize: usize, padded: bool, swap: bool) -> Result<usize> {
        key::key_size(src, hsize, &self.ty, padded, swap)
    }

    /// Extract the canonical key stream of an encoded sample.
    pub fn key_fields(
        &self,
        src: &[u8],
        hsize: usize,
        padded: bool,
        swap: bool,
    ) -> Result<Vec<u8>> {
        key::key_fields(src, hsize, &self.ty, padded, swap)
    }

    /// Rewrite a key stream between packed and padded forms.
    pub fn key_convert(&self, key: &[u8], from_padded: bool, to_padded: bool) -> Result<Vec<u8>> {
        key::key_convert(key, &self.ty, from_padded, to_padded)
    }

    /// Byte offset of a top-level member in the encoded sample.
    pub fn field_offset(
        &self,
        src: &[u8],
        hsize: usize,
        field_index: usize,
        swap: bool,
    ) -> Result<usize> {
        parse::field_offset(src, hsize, field_index, &self.ty, swap)
    }

    /// Serialised size of a native sample.
    ///
    /// # Safety
    /// `data` must satisfy the [`native`] module contract for this type.
    pub unsafe fn marshalled_size_native(
        &self,
        hsize: usize,
        data: *const u8,
        key_only: bool,
        padded: bool,
    ) -> Result<usize> {
        let v = native::native_to_value(data, &self.ty)?;
        generate::marshalled_size(hsize, &v, &self.ty, key_only, padded)
    }

    /// Serialise a native sample.
    ///
    /// # Safety
    /// `data` must satisfy the [`native`] module contract for this type.
    pub unsafe fn marshall_native(
        &self,
        dst: &mut Vec<u8>,
        hsize: usize,
        data: *const u8,
        key_only: bool,
        padded: bool,
        swap: bool,
    ) -> Result<usize> {
        let v = native::native_to_value(data, &self.ty)?;
        generate::marshall(dst, hsize, &v, &self.ty, key_only, padded, swap)
    }

    /// Deserialise into a native sample, allocating heap members.
    ///
    /// # Safety
    /// `data` must satisfy the [`native`] module contract for this type
    /// and hold no live heap fields.
    pub unsafe fn unmarshall_native(
        &self,
        src: &[u8],
        hsize: usize,
        swap: bool,
        data: *mut u8,
    ) -> Result<()> {
        let v = parse::unmarshall(src, hsize, &self.ty, swap)?;
        native::value_to_native(&v, &self.ty, data)
    }
}
