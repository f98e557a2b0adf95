// Copyright the cinnabar developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// Error returned when a read runs past the end of the buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderError {
    pub wanted: usize,
    pub available: usize,
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "unexpected end of buffer: wanted {}, available {}",
            self.wanted, self.available
        )
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecoderError {}

pub type DecoderResult<'a, T> = Result<(T, DecoderBuffer<'a>), DecoderError>;

/// DecoderBuffer is a panic-free read cursor for decoding untrusted input
///
/// Every decode consumes from the front and returns the value together with
/// the remaining buffer, so partially-decoded state can never be observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderBuffer<'a> {
    bytes: &'a [u8],
}

impl<'a> DecoderBuffer<'a> {
    /// Create a new `DecoderBuffer` from a byte slice
    #[inline]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Returns the number of bytes left to decode
    #[inline]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the buffer has been fully consumed
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    fn ensure_len(&self, len: usize) -> Result<(), DecoderError> {
        if len > self.bytes.len() {
            return Err(DecoderError {
                wanted: len,
                available: self.bytes.len(),
            });
        }
        Ok(())
    }

    #[inline]
    pub fn decode_u8(self) -> DecoderResult<'a, u8> {
        match self.bytes.split_first_chunk::<1>() {
            Some((value, remaining)) => Ok((value[0], Self::new(remaining))),
            None => Err(DecoderError {
                wanted: 1,
                available: self.bytes.len(),
            }),
        }
    }

    #[inline]
    pub fn decode_u32(self) -> DecoderResult<'a, u32> {
        match self.bytes.split_first_chunk::<4>() {
            Some((value, remaining)) => Ok((u32::from_le_bytes(*value), Self::new(remaining))),
            None => Err(DecoderError {
                wanted: 4,
                available: self.bytes.len(),
            }),
        }
    }

    #[inline]
    pub fn decode_u64(self) -> DecoderResult<'a, u64> {
        match self.bytes.split_first_chunk::<8>() {
            Some((value, remaining)) => Ok((u64::from_le_bytes(*value), Self::new(remaining))),
            None => Err(DecoderError {
                wanted: 8,
                available: self.bytes.len(),
            }),
        }
    }

    /// Splits `count` bytes off the front of the buffer
    #[inline]
    pub fn decode_slice(self, count: usize) -> DecoderResult<'a, &'a [u8]> {
        self.ensure_len(count)?;
        let (slice, remaining) = self.bytes.split_at(count);
        Ok((slice, Self::new(remaining)))
    }

    /// Views the undecoded tail without consuming it
    #[inline]
    pub fn peek(&self) -> &'a [u8] {
        self.bytes
    }
}

impl<'a> From<&'a [u8]> for DecoderBuffer<'a> {
    #[inline]
    fn from(bytes: &'a [u8]) -> Self {
        Self::new(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_in_order() {
        let data = [0xab, 4, 3, 2, 1, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 9, 9];
        let buffer = DecoderBuffer::new(&data);
        let (a, buffer) = buffer.decode_u8().unwrap();
        let (b, buffer) = buffer.decode_u32().unwrap();
        let (c, buffer) = buffer.decode_u64().unwrap();
        let (d, buffer) = buffer.decode_slice(2).unwrap();
        assert_eq!(a, 0xab);
        assert_eq!(b, 0x0102_0304);
        assert_eq!(c, 0x1122_3344_5566_7788);
        assert_eq!(d, &[9, 9]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn eof_reports_sizes() {
        let data = [1, 2];
        let buffer = DecoderBuffer::new(&data);
        let err = buffer.decode_u32().unwrap_err();
        assert_eq!(
            err,
            DecoderError {
                wanted: 4,
                available: 2
            }
        );
        // the original buffer is untouched, decoding can be retried
        assert_eq!(buffer.len(), 2);
    }
}
