// Copyright the cinnabar developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bulk descriptor metadata: permissions, mode flags, memory attributes,
//! and the fixed descriptor-info header that leads every serialized handle.

use crate::error::Result;
use bitflags::bitflags;
use cinnabar_codec::{DecoderBuffer, EncoderBuffer};
use core::sync::atomic::{AtomicU8, Ordering};

bitflags! {
    /// Descriptor mode flags, bit-compatible with the wire `flags` byte
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DescFlags: u8 {
        /// Peers may read from the described memory
        const READ_ONLY = 1 << 0;
        /// Peers may write to the described memory
        const WRITE_ONLY = 1 << 1;
        /// Segment bytes are embedded in the serialized descriptor
        const EAGER = 1 << 2;
        /// Transfers should prefer the shared-memory transport
        const SM = 1 << 3;
        /// The handle owns the segment memory (never serialized)
        const ALLOC = 1 << 4;
        /// An address and context id are attached to the handle
        const BIND = 1 << 5;
        /// One transport registration covers all segments
        const REGV = 1 << 6;
        /// Segment bases are remote cookies, not live local pointers
        const VIRT = 1 << 7;
    }
}

impl DescFlags {
    /// Readable from the peer's point of view (RO or RW)
    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(DescFlags::READ_ONLY)
    }

    /// Writable from the peer's point of view (WO or RW)
    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(DescFlags::WRITE_ONLY)
    }
}

/// Lock-free cell for a handle's mode flags
///
/// `bind` is the only mutation after construction and is an or-in, so a
/// plain atomic byte is enough.
#[derive(Debug)]
pub(crate) struct AtomicFlags(AtomicU8);

impl AtomicFlags {
    #[inline]
    pub fn new(flags: DescFlags) -> Self {
        Self(AtomicU8::new(flags.bits()))
    }

    #[inline]
    pub fn load(&self) -> DescFlags {
        DescFlags::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn insert(&self, flags: DescFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }
}

/// Access permission granted to the peer on handle creation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Permission {
    #[inline]
    pub(crate) fn as_flags(self) -> DescFlags {
        match self {
            Permission::ReadOnly => DescFlags::READ_ONLY,
            Permission::WriteOnly => DescFlags::WRITE_ONLY,
            Permission::ReadWrite => DescFlags::READ_ONLY | DescFlags::WRITE_ONLY,
        }
    }
}

/// Where the described memory lives
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MemType {
    #[default]
    Host,
    Cuda,
    Rocm,
    Ze,
}

impl MemType {
    #[inline]
    fn as_u8(self) -> u8 {
        match self {
            MemType::Host => 0,
            MemType::Cuda => 1,
            MemType::Rocm => 2,
            MemType::Ze => 3,
        }
    }

    #[inline]
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MemType::Host),
            1 => Some(MemType::Cuda),
            2 => Some(MemType::Rocm),
            3 => Some(MemType::Ze),
            _ => None,
        }
    }
}

/// Memory attributes attached to a handle at creation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemAttr {
    pub mem_type: MemType,
    pub device: u64,
}

/// Fixed header leading every serialized bulk descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DescInfo {
    pub segment_count: u32,
    pub len: u64,
    pub flags: DescFlags,
    pub mem_type: MemType,
    pub device: u64,
}

impl DescInfo {
    /// Encoded size: count + total length + flags + mem type + device id
    pub const WIRE_SIZE: usize = 4 + 8 + 1 + 1 + 8;

    pub(crate) fn encode(&self, buffer: &mut EncoderBuffer) -> Result<()> {
        buffer.encode_u32(self.segment_count)?;
        buffer.encode_u64(self.len)?;
        buffer.encode_u8(self.flags.bits())?;
        buffer.encode_u8(self.mem_type.as_u8())?;
        buffer.encode_u64(self.device)?;
        Ok(())
    }

    pub(crate) fn decode(buffer: DecoderBuffer) -> Result<(Self, DecoderBuffer)> {
        let (segment_count, buffer) = buffer.decode_u32()?;
        let (len, buffer) = buffer.decode_u64()?;
        let (flags, buffer) = buffer.decode_u8()?;
        let (mem_type, buffer) = buffer.decode_u8()?;
        let (device, buffer) = buffer.decode_u64()?;
        let info = Self {
            segment_count,
            len,
            flags: DescFlags::from_bits_retain(flags),
            mem_type: MemType::from_u8(mem_type).ok_or(crate::error::Error::Protocol)?,
            device,
        };
        Ok((info, buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_bits() {
        assert!(Permission::ReadOnly.as_flags().is_readable());
        assert!(!Permission::ReadOnly.as_flags().is_writable());
        assert!(Permission::ReadWrite.as_flags().is_readable());
        assert!(Permission::ReadWrite.as_flags().is_writable());
    }

    #[test]
    fn desc_info_round_trip() {
        let info = DescInfo {
            segment_count: 3,
            len: 4096,
            flags: DescFlags::READ_ONLY | DescFlags::REGV,
            mem_type: MemType::Cuda,
            device: 7,
        };
        let mut bytes = [0u8; DescInfo::WIRE_SIZE];
        let mut buffer = EncoderBuffer::new(&mut bytes);
        info.encode(&mut buffer).unwrap();
        assert_eq!(buffer.len(), DescInfo::WIRE_SIZE);

        let (decoded, rest) = DescInfo::decode(DecoderBuffer::new(&bytes)).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, info);
    }

    #[test]
    fn unknown_mem_type_is_a_protocol_error() {
        let mut bytes = [0u8; DescInfo::WIRE_SIZE];
        bytes[13] = 0xff;
        assert!(DescInfo::decode(DecoderBuffer::new(&bytes)).is_err());
    }
}
