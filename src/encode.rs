//! Serialize data into the bytecode protocol.
use bytes::{BufMut, Bytes};

use crate::error::{Error, Result};

pub trait ToByte {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()>;
}

impl<'a, T: ToByte + 'a + ?Sized> ToByte for &'a T {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (*self).encode(buffer)
    }
}

/// Fixed-width integers are written big-endian with no length prefix.
macro_rules! impl_to_byte_int {
    ($($ty:ty => $put:ident),* $(,)?) => {
        $(
            impl ToByte for $ty {
                fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
                    buffer.$put(*self);
                    Ok(())
                }
            }
        )*
    };
}

impl_to_byte_int!(i8 => put_i8, i16 => put_i16, i32 => put_i32, u32 => put_u32, i64 => put_i64);

impl ToByte for str {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        let len = i16::try_from(self.len())
            .map_err(|_| Error::InvalidArgument(format!("string of {} bytes", self.len())))?;
        buffer.put_i16(len);
        buffer.put(self.as_bytes());
        Ok(())
    }
}

impl ToByte for String {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_str().encode(buffer)
    }
}

impl<V: ToByte> ToByte for [V] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        encode_as_array(buffer, self, |buffer, x| x.encode(buffer))
    }
}

impl ToByte for [u8] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        let len = i32::try_from(self.len())
            .map_err(|_| Error::InvalidArgument(format!("blob of {} bytes", self.len())))?;
        buffer.put_i32(len);
        buffer.put(self);
        Ok(())
    }
}

impl ToByte for Bytes {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.as_ref().encode(buffer)
    }
}

impl ToByte for Option<Bytes> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match self {
            Some(xs) => xs.encode(buffer),
            None => (-1i32).encode(buffer),
        }
    }
}

impl ToByte for Option<String> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match self {
            Some(xs) => xs.encode(buffer),
            None => (-1i16).encode(buffer), // NULLABLE_STRING uses i16 length prefix
        }
    }
}

/// Writes the int32 element count of `xs`, then lets `f` render each
/// element in order.
pub fn encode_as_array<T, F, W>(buffer: &mut W, xs: &[T], mut f: F) -> Result<()>
where
    F: FnMut(&mut W, &T) -> Result<()>,
    W: BufMut,
{
    let count = i32::try_from(xs.len())
        .map_err(|_| Error::InvalidArgument(format!("array of {} elements", xs.len())))?;
    buffer.put_i32(count);
    xs.iter().try_for_each(|x| f(buffer, x))
}

/// Shorthand for arrays whose elements are themselves `ToByte`.
pub fn encode_array<T: ToByte, W: BufMut>(buffer: &mut W, items: &[T]) -> Result<()> {
    encode_as_array(buffer, items, |buffer, item| item.encode(buffer))
}
