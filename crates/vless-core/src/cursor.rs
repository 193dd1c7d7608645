//! Bounds-checked reader over a borrowed byte buffer.
//!
//! Every read either consumes exactly the requested bytes or fails with
//! [`RelayError::OutOfBounds`] and leaves the offset untouched.

use crate::error::{RelayError, RelayResult};

/// Forward-only cursor over a fixed buffer.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Current read position (number of bytes consumed so far).
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left after the current position.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn read_u8(&mut self) -> RelayResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16_be(&mut self) -> RelayResult<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Borrow the next `n` bytes and advance past them.
    pub fn read_bytes(&mut self, n: usize) -> RelayResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(RelayError::OutOfBounds {
                offset: self.offset,
                wanted: n,
                len: self.buf.len(),
            })?;
        let bytes = &self.buf[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    pub fn skip(&mut self, n: usize) -> RelayResult<()> {
        self.read_bytes(n).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_advance_offset() {
        let data = [0x01, 0x01, 0xbb, 0xde, 0xad, 0xbe];
        let mut cursor = ByteCursor::new(&data);

        assert_eq!(cursor.read_u8().unwrap(), 0x01);
        assert_eq!(cursor.read_u16_be().unwrap(), 443);
        assert_eq!(cursor.read_bytes(2).unwrap(), &[0xde, 0xad]);
        assert_eq!(cursor.offset(), 5);
        assert_eq!(cursor.remaining(), 1);
    }

    #[test]
    fn out_of_bounds_keeps_offset() {
        let data = [0x00, 0x50];
        let mut cursor = ByteCursor::new(&data);
        cursor.read_u8().unwrap();

        match cursor.read_u16_be() {
            Err(RelayError::OutOfBounds {
                offset,
                wanted,
                len,
            }) => {
                assert_eq!((offset, wanted, len), (1, 2, 2));
            }
            other => panic!("expected OutOfBounds, got {other:?}"),
        }
        assert_eq!(cursor.offset(), 1);
        assert_eq!(cursor.read_u8().unwrap(), 0x50);
        assert!(cursor.read_u8().is_err());
    }

    #[test]
    fn skip_and_empty_reads() {
        let data = [1, 2, 3];
        let mut cursor = ByteCursor::new(&data);
        cursor.skip(0).unwrap();
        cursor.skip(3).unwrap();
        assert_eq!(cursor.read_bytes(0).unwrap(), &[] as &[u8]);
        assert!(cursor.skip(1).is_err());
    }
}
