use std::{convert::TryInto, mem::size_of};

use crate::{
    error::{ErrorKind, StoreError},
    types::StoreResult,
};

pub fn read_into<T: Decodeable, R: std::io::Read>(reader: &mut R) -> Result<T, StoreError> {
    T::decode_from(reader)
}

pub fn read_exact<R: std::io::Read>(
    reader: &mut R,
    bytes_count: usize,
) -> Result<Vec<u8>, StoreError> {
    let mut buffer = vec![0u8; bytes_count];
    reader
        .read_exact(&mut buffer)
        .or_else(|_| Err(StoreError::new(ErrorKind::Serialization, "unexpected end of input")))?;
    Ok(buffer)
}

/// Append-only byte sink for building one block image.
pub struct BlockWriter {
    buf: Vec<u8>,
}

impl BlockWriter {
    pub fn new() -> Self {
        let buf = Vec::new();
        Self { buf }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// The finished image, zero-padded to `size`. Refuses input that does
    /// not fit the block.
    pub fn to_padded_bytes(self, size: usize) -> Result<Vec<u8>, StoreError> {
        let mut buf = self.buf;

        if buf.len() > size {
            return Err(StoreError::new(
                ErrorKind::Serialization,
                &format!(
                    "node image is larger than the block: {} > {}",
                    buf.len(),
                    size
                ),
            ));
        }

        buf.resize(size, 0);
        Ok(buf)
    }
}

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable: Sized {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Result<Self, StoreError>;
}

/// # Format
///
/// - 1 byte (0 for false, 1 for true)
impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Result<Self, StoreError> {
        Ok(u8::decode_from(reader)? == 1)
    }
}

impl Encodeable for &[u8] {
    fn encode(&self) -> Vec<u8> {
        self.to_vec()
    }
}

macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: std::io::Read>(reader: &mut R) -> Result<Self, StoreError> {
                    let bytes = read_exact(reader, size_of::<Self>())?;
                    Ok(Self::from_le_bytes(bytes.try_into().or_else(|_| {
                        Err(StoreError::new(ErrorKind::Serialization, "short read"))
                    })?))
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, isize, usize, f32, f64);

/// Little helper mirroring `BlockWriter` on the read side: a cursor over a
/// block image.
pub struct BlockReader<'a> {
    cursor: std::io::Cursor<&'a [u8]>,
}

impl<'a> BlockReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: std::io::Cursor::new(bytes),
        }
    }

    pub fn read<T: Decodeable>(&mut self) -> Result<T, StoreError> {
        read_into(&mut self.cursor)
    }

    pub fn skip(&mut self, bytes_count: usize) -> StoreResult {
        read_exact(&mut self.cursor, bytes_count)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_round_trip() {
        let mut w = BlockWriter::new();
        w.write(&42u16);
        w.write(&7u64);
        let bytes = w.to_padded_bytes(64).unwrap();
        assert_eq!(bytes.len(), 64);

        let mut r = BlockReader::new(&bytes);
        assert_eq!(r.read::<u16>().unwrap(), 42);
        assert_eq!(r.read::<u64>().unwrap(), 7);
    }

    #[test]
    fn test_overflowing_block_is_refused() {
        let mut w = BlockWriter::new();
        w.write_bytes(&[0u8; 65]);
        assert!(w.to_padded_bytes(64).is_err());
    }
}
