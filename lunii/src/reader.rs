use byteorder::ByteOrder;
use std::io::SeekFrom;

/// Bounds-checked cursor over an in-memory buffer.
///
/// Reads never move the cursor when they fail, so a caller can report the
/// offending offset from [`ByteReader::position`].
#[derive(Debug, Clone)]
pub struct ByteReader<'data> {
    data: &'data [u8],
    pos: usize,
}

impl<'data> ByteReader<'data> {
    pub fn new(data: &'data [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, wanted: usize) -> Result<&'data [u8], super::Error> {
        if wanted > self.remaining() {
            return Err(super::Error::OutOfBounds {
                offset: self.pos,
                wanted,
                available: self.remaining(),
            });
        }
        let span = &self.data[self.pos..self.pos + wanted];
        self.pos += wanted;
        Ok(span)
    }

    pub fn read_u8(&mut self) -> Result<u8, super::Error> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i16<E: ByteOrder>(&mut self) -> Result<i16, super::Error> {
        Ok(E::read_i16(self.take(2)?))
    }

    pub fn read_u16<E: ByteOrder>(&mut self) -> Result<u16, super::Error> {
        Ok(E::read_u16(self.take(2)?))
    }

    pub fn read_i32<E: ByteOrder>(&mut self) -> Result<i32, super::Error> {
        Ok(E::read_i32(self.take(4)?))
    }

    pub fn read_u32<E: ByteOrder>(&mut self) -> Result<u32, super::Error> {
        Ok(E::read_u32(self.take(4)?))
    }

    pub fn read_u64<E: ByteOrder>(&mut self) -> Result<u64, super::Error> {
        Ok(E::read_u64(self.take(8)?))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'data [u8], super::Error> {
        self.take(len)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], super::Error> {
        let mut buf = [0; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    /// Moves the cursor; landing exactly on the end of the buffer is allowed.
    pub fn seek(&mut self, style: SeekFrom) -> Result<usize, super::Error> {
        let target = match style {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => self.pos as i128 + i128::from(delta),
            SeekFrom::End(delta) => self.data.len() as i128 + i128::from(delta),
        };
        if target < 0 || target > self.data.len() as i128 {
            return Err(super::Error::InvalidOffset(
                i64::try_from(target).unwrap_or(i64::MAX),
            ));
        }
        self.pos = target as usize;
        Ok(self.pos)
    }
}
