//! Binary encoding shared by every protocol structure.
//!
//! Integers are little-endian and fixed width. Lengths and counts are
//! `varuint32` (LEB128, at most 5 bytes). Strings and vectors are a
//! `varuint32` count followed by their elements. Fixed-size arrays are raw.

use crate::{NetworkError, NetworkResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Serialize into a byte buffer.
pub trait Pack {
    fn pack(&self, buf: &mut BytesMut);
}

/// Deserialize from a byte buffer, consuming what was read.
pub trait Unpack: Sized {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self>;
}

fn ensure(buf: &Bytes, needed: usize, what: &str) -> NetworkResult<()> {
    if buf.remaining() < needed {
        return Err(NetworkError::InvalidMessage(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Write a `varuint32`.
pub fn put_varuint32(buf: &mut BytesMut, mut value: u32) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Read a `varuint32`.
pub fn get_varuint32(buf: &mut Bytes) -> NetworkResult<u32> {
    let mut result: u64 = 0;
    let mut shift = 0;

    loop {
        ensure(buf, 1, "varuint32")?;
        let byte = buf.get_u8();
        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            break;
        }
        shift += 7;
        if shift >= 35 {
            return Err(NetworkError::InvalidMessage("varuint32 overflow".into()));
        }
    }

    u32::try_from(result).map_err(|_| NetworkError::InvalidMessage("varuint32 overflow".into()))
}

macro_rules! impl_int {
    ($ty:ty, $put:ident, $get:ident) => {
        impl Pack for $ty {
            fn pack(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }
        }

        impl Unpack for $ty {
            fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
                ensure(buf, std::mem::size_of::<$ty>(), stringify!($ty))?;
                Ok(buf.$get())
            }
        }
    };
}

impl_int!(u8, put_u8, get_u8);
impl_int!(u16, put_u16_le, get_u16_le);
impl_int!(i16, put_i16_le, get_i16_le);
impl_int!(u32, put_u32_le, get_u32_le);
impl_int!(u64, put_u64_le, get_u64_le);
impl_int!(i64, put_i64_le, get_i64_le);

impl<const N: usize> Pack for [u8; N] {
    fn pack(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }
}

impl<const N: usize> Unpack for [u8; N] {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
        ensure(buf, N, "fixed array")?;
        let mut out = [0u8; N];
        buf.copy_to_slice(&mut out);
        Ok(out)
    }
}

impl Pack for str {
    fn pack(&self, buf: &mut BytesMut) {
        put_varuint32(buf, self.len() as u32);
        buf.put_slice(self.as_bytes());
    }
}

impl Pack for String {
    fn pack(&self, buf: &mut BytesMut) {
        self.as_str().pack(buf);
    }
}

impl Unpack for String {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
        let len = get_varuint32(buf)? as usize;
        ensure(buf, len, "string")?;
        let raw = buf.copy_to_bytes(len);
        String::from_utf8(raw.to_vec())
            .map_err(|e| NetworkError::InvalidMessage(format!("invalid utf-8 string: {}", e)))
    }
}

impl<T: Pack> Pack for Vec<T> {
    fn pack(&self, buf: &mut BytesMut) {
        put_varuint32(buf, self.len() as u32);
        for item in self {
            item.pack(buf);
        }
    }
}

impl<T: Unpack> Unpack for Vec<T> {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
        let count = get_varuint32(buf)? as usize;
        // Cap the preallocation by what the buffer could possibly hold.
        let mut items = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            items.push(T::unpack(buf)?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed<T: Pack + ?Sized>(value: &T) -> Bytes {
        let mut buf = BytesMut::new();
        value.pack(&mut buf);
        buf.freeze()
    }

    #[test]
    fn test_varuint32_boundaries() {
        for (value, len) in [(0u32, 1), (127, 1), (128, 2), (16_383, 2), (16_384, 3), (u32::MAX, 5)] {
            let mut buf = BytesMut::new();
            put_varuint32(&mut buf, value);
            assert_eq!(buf.len(), len, "length of {}", value);
            assert_eq!(get_varuint32(&mut buf.freeze()).unwrap(), value);
        }
    }

    #[test]
    fn test_varuint32_overflow_rejected() {
        let mut buf = Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert!(get_varuint32(&mut buf).is_err());
    }

    #[test]
    fn test_integers_are_little_endian() {
        assert_eq!(&packed(&1206u16)[..], &[0xB6, 0x04]);
        assert_eq!(&packed(&1u32)[..], &[1, 0, 0, 0]);
        assert_eq!(&packed(&-1i16)[..], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_string_layout() {
        let bytes = packed("eos");
        assert_eq!(&bytes[..], &[3, b'e', b'o', b's']);

        let mut bytes = bytes;
        assert_eq!(String::unpack(&mut bytes).unwrap(), "eos");
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_truncated_input_errors() {
        let mut short = Bytes::from_static(&[1, 2]);
        assert!(u32::unpack(&mut short).is_err());

        let mut bad_len = Bytes::from_static(&[10, b'a']);
        assert!(String::unpack(&mut bad_len).is_err());
    }
}
