//! Wire-level primitives shared by the encode and decode walks:
//! alignment, endian-aware scalar access and parameter-id constants.

use tdds_kernel::error::{DdsError, Result};

/// Extended parameter header follows.
pub const PID_EXTENDED: u16 = 0x3f01;
/// End of parameter list.
pub const PID_LIST_END: u16 = 0x3f02;
/// Parameter to be skipped.
pub const PID_IGNORE: u16 = 0x3f03;
/// Vendor-specific parameter flag.
pub const PID_VENDOR: u16 = 0x8000;
/// Must-understand flag.
pub const PID_MUST_UNDERSTAND: u16 = 0x4000;
/// Id bits of a short parameter header.
pub const PID_ID_MASK: u16 = 0x3fff;
/// Member ids below this encode as a short pid.
pub const PID_SHORT_LIMIT: u32 = 0x3f00;
/// Id bits of an extended parameter header.
pub const PID_EXT_ID_MASK: u32 = 0x0fff_ffff;

/// Round `n` up to a multiple of `boundary` (a power of two).
#[inline]
pub fn align_up(n: usize, boundary: usize) -> usize {
    (n + boundary - 1) & !(boundary - 1)
}

/// Byte sink for the marshalling walk. A sizing sink counts bytes
/// without storing them; a writing sink appends to a caller buffer.
/// Positions are absolute stream offsets: the payload begins at the
/// header size `base`, and alignment is computed on the absolute
/// offset, exactly as the wire format requires.
pub struct Sink<'b> {
    out: Option<&'b mut Vec<u8>>,
    base: usize,
    pos: usize,
    swap: bool,
}

impl<'b> Sink<'b> {
    pub fn sizing(hsize: usize) -> Sink<'static> {
        Sink {
            out: None,
            base: hsize,
            pos: hsize,
            swap: false,
        }
    }

    pub fn writing(out: &'b mut Vec<u8>, hsize: usize, swap: bool) -> Sink<'b> {
        out.clear();
        Sink {
            out: Some(out),
            base: hsize,
            pos: hsize,
            swap,
        }
    }

    /// Absolute stream position.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Payload bytes produced so far.
    pub fn written(&self) -> usize {
        self.pos - self.base
    }

    /// Pad with zeroes up to the alignment boundary.
    pub fn align(&mut self, boundary: usize) {
        let target = align_up(self.pos, boundary);
        self.put_zeros(target - self.pos);
    }

    pub fn put_zeros(&mut self, n: usize) {
        if let Some(out) = self.out.as_deref_mut() {
            out.resize(out.len() + n, 0);
        }
        self.pos += n;
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        if let Some(out) = self.out.as_deref_mut() {
            out.extend_from_slice(bytes);
        }
        self.pos += bytes.len();
    }

    /// Write a scalar given in native byte order, reversing when the
    /// consumer endianness differs.
    fn put_scalar(&mut self, bytes: &[u8]) {
        if let Some(out) = self.out.as_deref_mut() {
            if self.swap {
                out.extend(bytes.iter().rev());
            } else {
                out.extend_from_slice(bytes);
            }
        }
        self.pos += bytes.len();
    }

    pub fn put_u8(&mut self, v: u8) {
        self.put_bytes(&[v]);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.align(2);
        self.put_scalar(&v.to_ne_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.align(4);
        self.put_scalar(&v.to_ne_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.align(8);
        self.put_scalar(&v.to_ne_bytes());
    }

    pub fn put_i16(&mut self, v: i16) {
        self.put_u16(v as u16);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.put_u32(v as u32);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.put_u64(v as u64);
    }

    pub fn put_f32(&mut self, v: f32) {
        self.align(4);
        self.put_scalar(&v.to_ne_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.align(8);
        self.put_scalar(&v.to_ne_bytes());
    }

    /// Back-patch a 16-bit slot written earlier.
    pub fn patch_u16(&mut self, pos: usize, v: u16) {
        let base = self.base;
        let swap = self.swap;
        if let Some(out) = self.out.as_deref_mut() {
            let i = pos - base;
            let bytes = v.to_ne_bytes();
            if swap {
                out[i] = bytes[1];
                out[i + 1] = bytes[0];
            } else {
                out[i..i + 2].copy_from_slice(&bytes);
            }
        }
    }

    /// Back-patch a 32-bit slot written earlier.
    pub fn patch_u32(&mut self, pos: usize, v: u32) {
        let base = self.base;
        let swap = self.swap;
        if let Some(out) = self.out.as_deref_mut() {
            let i = pos - base;
            let bytes = v.to_ne_bytes();
            if swap {
                for (k, b) in bytes.iter().rev().enumerate() {
                    out[i + k] = *b;
                }
            } else {
                out[i..i + 4].copy_from_slice(&bytes);
            }
        }
    }
}

/// Bounds-checked reader over an encoded payload. `src` starts at
/// stream offset `base` (the header size); alignment is computed on
/// absolute offsets.
pub struct Reader<'a> {
    src: &'a [u8],
    base: usize,
    pos: usize,
    swap: bool,
}

impl<'a> Reader<'a> {
    pub fn new(src: &'a [u8], hsize: usize, swap: bool) -> Reader<'a> {
        Reader {
            src,
            base: hsize,
            pos: hsize,
            swap,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos < self.base || pos - self.base > self.src.len() {
            return Err(DdsError::bad_parameter("seek out of bounds"));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.src.len() - (self.pos - self.base)
    }

    pub fn align(&mut self, boundary: usize) -> Result<()> {
        let target = align_up(self.pos, boundary);
        self.skip(target - self.pos)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(DdsError::bad_parameter("truncated CDR data"));
        }
        self.pos += n;
        Ok(())
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(DdsError::bad_parameter("truncated CDR data"));
        }
        let start = self.pos - self.base;
        self.pos += n;
        Ok(&self.src[start..start + n])
    }

    fn scalar<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.align(N.min(8))?;
        let raw = self.take(N)?;
        let mut b = [0u8; N];
        if self.swap {
            for (i, v) in raw.iter().rev().enumerate() {
                b[i] = *v;
            }
        } else {
            b.copy_from_slice(raw);
        }
        Ok(b)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_ne_bytes(self.scalar::<2>()?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.scalar::<4>()?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.scalar::<8>()?))
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(self.get_u16()? as i16)
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        Ok(f32::from_ne_bytes(self.scalar::<4>()?))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_ne_bytes(self.scalar::<8>()?))
    }
}
