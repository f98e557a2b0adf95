// Copyright the cinnabar developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// Error returned when a write does not fit in the remaining capacity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncoderError {
    pub wanted: usize,
    pub available: usize,
}

impl fmt::Display for EncoderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "out of encoder capacity: wanted {}, available {}",
            self.wanted, self.available
        )
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EncoderError {}

pub type EncoderResult = Result<(), EncoderError>;

/// EncoderBuffer is a checked write cursor over a caller-provided slice
///
/// Unlike a `Vec`-backed writer it never allocates: the caller sizes the
/// buffer up front and every write is bounds-checked against what is left.
#[derive(Debug, PartialEq, Eq)]
pub struct EncoderBuffer<'a> {
    bytes: &'a mut [u8],
    position: usize,
}

impl<'a> EncoderBuffer<'a> {
    /// Creates a new `EncoderBuffer`
    #[inline]
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Returns the total capacity of the buffer
    #[inline]
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Returns the number of bytes written so far
    #[inline]
    pub fn len(&self) -> usize {
        self.position
    }

    /// Returns `true` if nothing has been written
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.position == 0
    }

    /// Returns the remaining number of bytes the buffer can accept
    #[inline]
    pub fn remaining_capacity(&self) -> usize {
        self.bytes.len() - self.position
    }

    #[inline]
    fn checked_split(&mut self, len: usize) -> Result<&mut [u8], EncoderError> {
        let available = self.remaining_capacity();
        let Some(end) = self.position.checked_add(len) else {
            return Err(EncoderError {
                wanted: len,
                available,
            });
        };
        match self.bytes.get_mut(self.position..end) {
            Some(bytes) => {
                self.position = end;
                Ok(bytes)
            }
            None => Err(EncoderError {
                wanted: len,
                available,
            }),
        }
    }

    #[inline]
    pub fn encode_u8(&mut self, value: u8) -> EncoderResult {
        self.checked_split(1)?[0] = value;
        Ok(())
    }

    #[inline]
    pub fn encode_u32(&mut self, value: u32) -> EncoderResult {
        self.checked_split(4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    #[inline]
    pub fn encode_u64(&mut self, value: u64) -> EncoderResult {
        self.checked_split(8)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    #[inline]
    pub fn encode_slice(&mut self, slice: &[u8]) -> EncoderResult {
        self.checked_split(slice.len())?.copy_from_slice(slice);
        Ok(())
    }

    /// Hands out the unwritten tail for an external writer, then commits
    /// `len` bytes of it with [`advance`]
    ///
    /// [`advance`]: Self::advance
    #[inline]
    pub fn remaining_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[self.position..]
    }

    /// Marks `len` bytes of the remaining tail as written
    #[inline]
    pub fn advance(&mut self, len: usize) -> EncoderResult {
        if len > self.remaining_capacity() {
            return Err(EncoderError {
                wanted: len,
                available: self.remaining_capacity(),
            });
        }
        self.position += len;
        Ok(())
    }

    /// Splits off the written bytes from the remaining capacity
    #[inline]
    pub fn split_off(self) -> (&'a mut [u8], &'a mut [u8]) {
        self.bytes.split_at_mut(self.position)
    }

    /// Returns the written bytes as a slice
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.position]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_in_order() {
        let mut data = [0u8; 16];
        let mut buffer = EncoderBuffer::new(&mut data);
        buffer.encode_u8(0xab).unwrap();
        buffer.encode_u32(0x0102_0304).unwrap();
        buffer.encode_u64(0x1122_3344_5566_7788).unwrap();
        buffer.encode_slice(&[9, 9]).unwrap();
        assert_eq!(buffer.len(), 15);
        assert_eq!(buffer.remaining_capacity(), 1);
        assert_eq!(
            buffer.as_slice(),
            &[0xab, 4, 3, 2, 1, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 9, 9]
        );
    }

    #[test]
    fn overflow_reports_sizes() {
        let mut data = [0u8; 2];
        let mut buffer = EncoderBuffer::new(&mut data);
        buffer.encode_u8(1).unwrap();
        let err = buffer.encode_u32(2).unwrap_err();
        assert_eq!(
            err,
            EncoderError {
                wanted: 4,
                available: 1
            }
        );
        // a failed write must not move the cursor
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn external_writer_commits_via_advance() {
        let mut data = [0u8; 8];
        let mut buffer = EncoderBuffer::new(&mut data);
        buffer.encode_u8(1).unwrap();
        buffer.remaining_mut()[..3].copy_from_slice(&[7, 8, 9]);
        buffer.advance(3).unwrap();
        assert_eq!(buffer.as_slice(), &[1, 7, 8, 9]);
        assert!(buffer.advance(5).is_err());
    }
}
