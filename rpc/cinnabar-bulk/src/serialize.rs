// Copyright the cinnabar developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire serialization of bulk handles.
//!
//! Layout, in order: the fixed descriptor-info header, the segment array,
//! the transport memory-handle block (doubled when the shared-memory
//! modifier is requested), the bound-address block
//! `(addr_size, addr_bytes, context_id)` when the handle is bound, and
//! finally the raw segment bytes when eager mode applies.

use crate::{
    class::Class,
    desc::{AtomicFlags, DescFlags, DescInfo, MemAttr, MemType},
    error::{Error, Result},
    handle::{Binding, Bulk, BulkInner, MemDescs, Ownership},
    na,
    segment::{Segment, SegmentList},
};
use bitflags::bitflags;
use cinnabar_codec::{DecoderBuffer, EncoderBuffer};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

bitflags! {
    /// Optional serialization modifiers
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SerializeFlags: u8 {
        /// Embed the segment bytes in the descriptor so the peer can
        /// satisfy a pull without a network round trip
        const EAGER = DescFlags::EAGER.bits();
        /// Include the shared-memory transport descriptors
        const SM = DescFlags::SM.bits();
    }
}

impl Bulk {
    /// Flags as they will appear on the wire: the ownership bit is local
    /// and always stripped; eager and shared-memory are added when
    /// requested and applicable
    fn wire_flags(&self, request: SerializeFlags) -> DescFlags {
        let mut flags = self.flags();
        flags.remove(DescFlags::ALLOC | DescFlags::EAGER | DescFlags::SM);

        // Eager only makes sense when the bytes are really here: peers
        // must be allowed to read them, the segments must be live local
        // memory, and host-resident.
        if request.contains(SerializeFlags::EAGER)
            && flags.contains(DescFlags::READ_ONLY)
            && !flags.contains(DescFlags::VIRT)
            && self.mem_attr().mem_type == MemType::Host
        {
            flags |= DescFlags::EAGER;
        }
        if request.contains(SerializeFlags::SM) && self.inner.sm_mem_descs.is_some() {
            flags |= DescFlags::SM;
        }
        flags
    }

    /// Exact number of bytes [`serialize`](Self::serialize) will write for
    /// the same flags
    pub fn serialize_size(&self, request: SerializeFlags) -> usize {
        let flags = self.wire_flags(request);
        let inner = &self.inner;
        let single = flags.contains(DescFlags::REGV) || inner.segments.len() == 1;

        let mut size = DescInfo::WIRE_SIZE + inner.segments.len() * 16;

        size += descs_size(&inner.mem_descs, &inner.segments, single);
        if flags.contains(DescFlags::SM) {
            if let Some(descs) = &inner.sm_mem_descs {
                size += descs_size(descs, &inner.segments, single);
            }
        }

        if flags.contains(DescFlags::BIND) {
            if let Some(binding) = inner.bound.get() {
                size += 8 + binding.addr.serialize_size() + 1;
            }
        }

        if flags.contains(DescFlags::EAGER) {
            size += inner.len as usize;
        }

        size
    }

    /// Encodes the handle into `bytes`; returns the number of bytes
    /// written
    pub fn serialize(&self, request: SerializeFlags, bytes: &mut [u8]) -> Result<usize> {
        let inner = &self.inner;
        let flags = self.wire_flags(request);
        let single = flags.contains(DescFlags::REGV) || inner.segments.len() == 1;
        let info = DescInfo {
            segment_count: inner.segments.len() as u32,
            len: inner.len,
            flags,
            mem_type: inner.attr.mem_type,
            device: inner.attr.device,
        };

        debug!(
            count = inner.segments.len(),
            len = inner.len,
            ?flags,
            "serializing bulk handle"
        );

        let mut buffer = EncoderBuffer::new(bytes);
        info.encode(&mut buffer)?;

        for segment in &inner.segments {
            buffer.encode_u64(segment.base)?;
            buffer.encode_u64(segment.len)?;
        }

        encode_descs(
            inner.class.na(),
            &inner.mem_descs,
            &inner.segments,
            single,
            &mut buffer,
        )?;
        if flags.contains(DescFlags::SM) {
            let sm = inner.class.na_sm().ok_or(Error::OpNotSupported)?;
            let descs = inner.sm_mem_descs.as_ref().ok_or(Error::OpNotSupported)?;
            encode_descs(sm, descs, &inner.segments, single, &mut buffer)?;
        }

        if flags.contains(DescFlags::BIND) {
            let binding = inner.bound.get().ok_or(Error::InvalidArg)?;
            let addr_size = binding.addr.serialize_size();
            buffer.encode_u64(addr_size as u64)?;
            write_external(&mut buffer, addr_size, |bytes| binding.addr.serialize(bytes))?;
            buffer.encode_u8(binding.context_id)?;
        }

        if flags.contains(DescFlags::EAGER) {
            for segment in &inner.segments {
                if segment.len == 0 {
                    continue;
                }
                let data = unsafe {
                    // Safety: eager is only kept for non-virtual handles,
                    // whose segments are live local memory per the create
                    // contract
                    core::slice::from_raw_parts(segment.base as *const u8, segment.len as usize)
                };
                buffer.encode_slice(data)?;
            }
        }

        Ok(buffer.len())
    }

    /// Reconstructs a handle from its serialized form.
    ///
    /// The result stands in for the creator's handle: it holds decoded
    /// transport handles but no registration of its own, and its segment
    /// bases are remote cookies unless eager data was embedded, in which
    /// case local copies are allocated and filled.
    pub fn deserialize(class: &Class, bytes: &[u8]) -> Result<Self> {
        let buffer = DecoderBuffer::new(bytes);
        let (info, buffer) = DescInfo::decode(buffer)?;
        let mut flags = info.flags;
        let single = flags.contains(DescFlags::REGV) || info.segment_count == 1;

        debug!(
            count = info.segment_count,
            len = info.len,
            ?flags,
            "deserializing bulk handle"
        );

        if info.segment_count == 0 {
            return Err(Error::Protocol);
        }

        let mut segments = SegmentList::new();
        let mut buffer = buffer;
        for _ in 0..info.segment_count {
            let (base, rest) = buffer.decode_u64()?;
            let (len, rest) = rest.decode_u64()?;
            segments.push(Segment::new(base, len));
            buffer = rest;
        }

        let regv = flags.contains(DescFlags::REGV);
        let (mem_descs, buffer) = decode_descs(class.na(), &segments, single, regv, buffer)?;
        let (sm_mem_descs, buffer) = if flags.contains(DescFlags::SM) {
            let sm = class.na_sm().ok_or(Error::Protocol)?;
            let (descs, buffer) = decode_descs(sm, &segments, single, regv, buffer)?;
            (Some(descs), buffer)
        } else {
            (None, buffer)
        };

        let (bound, buffer) = if flags.contains(DescFlags::BIND) {
            let (addr_size, rest) = buffer.decode_u64()?;
            let (addr_bytes, rest) = rest.decode_slice(addr_size as usize)?;
            let addr = class.addr_deserialize(addr_bytes)?;
            let (context_id, rest) = rest.decode_u8()?;
            (Some(Binding { addr, context_id }), rest)
        } else {
            (None, buffer)
        };

        let (ownership, buffer) = if flags.contains(DescFlags::EAGER) {
            // materialize the embedded bytes into handle-owned segments
            let mut owned = Vec::new();
            let mut buffer = buffer;
            for segment in segments.iter_mut() {
                if segment.len == 0 {
                    continue;
                }
                let (data, rest) = buffer.decode_slice(segment.len as usize)?;
                let copy: Box<[u8]> = data.into();
                segment.base = copy.as_ptr() as u64;
                owned.push(copy);
                buffer = rest;
            }
            (Ownership::Owned(owned), buffer)
        } else {
            // no data embedded, the bases are cookies from the creator
            flags |= DescFlags::VIRT;
            (Ownership::Borrowed, buffer)
        };

        if !buffer.is_empty() {
            warn!(
                left = buffer.len(),
                "bytes left over after decoding bulk handle"
            );
        }

        flags.remove(DescFlags::ALLOC);
        let bound_cell = OnceLock::new();
        if let Some(binding) = bound {
            let _ = bound_cell.set(binding);
        }

        class.bulk_incr();

        Ok(Self {
            inner: Arc::new(BulkInner {
                class: class.clone(),
                segments,
                len: info.len,
                flags: AtomicFlags::new(flags),
                attr: MemAttr {
                    mem_type: info.mem_type,
                    device: info.device,
                },
                mem_descs,
                sm_mem_descs,
                bound: bound_cell,
                ownership,
                serialize_cache: Mutex::new(None),
                registered: false,
            }),
        })
    }

    /// Previously stashed serialization of this handle, if any
    ///
    /// The pair is an opaque `(pointer, length)` owned by whoever stashed
    /// it; the handle never reads through or frees it.
    pub fn serialize_cached(&self) -> Option<(u64, usize)> {
        *self.inner.serialize_cache.lock()
    }

    /// Stashes a serialization of this handle so later emitters can reuse
    /// the bytes without recomputing them
    pub fn set_serialize_cached(&self, ptr: u64, len: usize) {
        *self.inner.serialize_cache.lock() = Some((ptr, len));
    }
}

/// Encoded size of one transport's memory-handle block
fn descs_size(descs: &MemDescs, segments: &[Segment], single: bool) -> usize {
    if single {
        match descs.first() {
            Some(_) => 8 + descs.serialize_sizes[0],
            None => 0,
        }
    } else {
        let mut size = 8 * segments.len();
        for (index, segment) in segments.iter().enumerate() {
            if segment.base != 0 && segment.len != 0 {
                size += descs.serialize_sizes[index];
            }
        }
        size
    }
}

fn encode_descs(
    transport: &Arc<dyn na::Transport>,
    descs: &MemDescs,
    segments: &[Segment],
    single: bool,
    buffer: &mut EncoderBuffer,
) -> Result<()> {
    if single {
        // a lone absent handle (empty single segment) encodes as nothing
        if let Some(handle) = descs.first() {
            let size = descs.serialize_sizes[0];
            buffer.encode_u64(size as u64)?;
            write_external(buffer, size, |bytes| {
                transport.mem_handle_serialize(handle, bytes)
            })?;
        }
        return Ok(());
    }

    for size in &descs.serialize_sizes {
        buffer.encode_u64(*size as u64)?;
    }
    for (index, segment) in segments.iter().enumerate() {
        if segment.base == 0 || segment.len == 0 {
            continue;
        }
        let handle = descs.handles[index]
            .as_deref()
            .ok_or(Error::InvalidArg)?;
        write_external(buffer, descs.serialize_sizes[index], |bytes| {
            transport.mem_handle_serialize(handle, bytes)
        })?;
    }
    Ok(())
}

fn decode_descs<'a>(
    transport: &Arc<dyn na::Transport>,
    segments: &[Segment],
    single: bool,
    regv: bool,
    buffer: DecoderBuffer<'a>,
) -> Result<(MemDescs, DecoderBuffer<'a>)> {
    let mut descs = MemDescs::empty();

    if single {
        // a vectored registration always carries its handle; a lone
        // segment only if it has something registered
        let present = regv || (segments[0].base != 0 && segments[0].len != 0);
        if !present {
            descs.handles.push(None);
            descs.serialize_sizes.push(0);
            return Ok((descs, buffer));
        }
        let (size, buffer) = buffer.decode_u64()?;
        let (bytes, buffer) = buffer.decode_slice(size as usize)?;
        let handle = transport.mem_handle_deserialize(bytes)?;
        descs.handles.push(Some(handle));
        descs.serialize_sizes.push(size as usize);
        return Ok((descs, buffer));
    }

    let mut buffer = buffer;
    for _ in 0..segments.len() {
        let (size, rest) = buffer.decode_u64()?;
        descs.serialize_sizes.push(size as usize);
        buffer = rest;
    }
    for (index, segment) in segments.iter().enumerate() {
        if segment.base == 0 || segment.len == 0 {
            descs.handles.push(None);
            continue;
        }
        let (bytes, rest) = buffer.decode_slice(descs.serialize_sizes[index])?;
        descs.handles.push(Some(transport.mem_handle_deserialize(bytes)?));
        buffer = rest;
    }
    Ok((descs, buffer))
}

/// Lets an external serializer (transport or address codec) write into the
/// next `size` bytes of the buffer
fn write_external(
    buffer: &mut EncoderBuffer,
    size: usize,
    write: impl FnOnce(&mut [u8]) -> Result<()>,
) -> Result<()> {
    if buffer.remaining_capacity() < size {
        return Err(Error::Overflow);
    }
    write(&mut buffer.remaining_mut()[..size])?;
    buffer.advance(size)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{class::Context, desc::Permission, na::testing::Loopback};

    fn round_trip(bulk: &Bulk, class: &Class, request: SerializeFlags) -> Bulk {
        let size = bulk.serialize_size(request);
        let mut bytes = vec![0u8; size];
        let written = bulk.serialize(request, &mut bytes).unwrap();
        assert_eq!(written, size, "serialize_size must be byte-exact");
        Bulk::deserialize(class, &bytes).unwrap()
    }

    #[test]
    fn round_trip_preserves_shape() {
        let class = Class::new(Loopback::new());
        let data = vec![7u8; 192];
        let segments = [
            Segment::new(data.as_ptr() as u64, 64),
            Segment::new(data.as_ptr() as u64 + 64, 128),
        ];
        let bulk = unsafe { Bulk::create(&class, &segments, Permission::ReadOnly) }.unwrap();

        let decoded = round_trip(&bulk, &class, SerializeFlags::empty());
        assert_eq!(decoded.segments(), bulk.segments());
        assert_eq!(decoded.len(), bulk.len());
        assert!(decoded.flags().contains(DescFlags::READ_ONLY));
        assert!(decoded.flags().contains(DescFlags::VIRT));
        assert!(!decoded.flags().contains(DescFlags::ALLOC));
        // both handles count against the class
        assert_eq!(class.bulk_handle_count(), 2);
    }

    #[test]
    fn eager_embeds_and_rehydrates_bytes() {
        let class = Class::new(Loopback::new());
        let data: Vec<u8> = (0..100u8).collect();
        let segments = [
            Segment::new(data.as_ptr() as u64, 30),
            Segment::new(data.as_ptr() as u64 + 30, 70),
        ];
        let bulk = unsafe { Bulk::create(&class, &segments, Permission::ReadOnly) }.unwrap();

        let decoded = round_trip(&bulk, &class, SerializeFlags::EAGER);
        assert!(decoded.flags().contains(DescFlags::EAGER));
        assert!(decoded.flags().contains(DescFlags::ALLOC));
        assert!(!decoded.flags().contains(DescFlags::VIRT));

        // the copies hold the original bytes, in new local memory
        let mut out = [Segment::default(); 2];
        assert_eq!(decoded.access(0, 100, &mut out), 2);
        assert_ne!(out[0].base, segments[0].base);
        let first = unsafe { core::slice::from_raw_parts(out[0].base as *const u8, 30) };
        let second = unsafe { core::slice::from_raw_parts(out[1].base as *const u8, 70) };
        assert_eq!(first, &data[..30]);
        assert_eq!(second, &data[30..]);
    }

    #[test]
    fn eager_is_silently_dropped_when_ineligible() {
        let class = Class::new(Loopback::new());

        // writable handles must not embed data
        let bulk = Bulk::alloc(&class, &[64], Permission::WriteOnly).unwrap();
        let decoded = round_trip(&bulk, &class, SerializeFlags::EAGER);
        assert!(!decoded.flags().contains(DescFlags::EAGER));

        // device memory cannot be embedded either
        let data = vec![0u8; 64];
        let segments = [Segment::new(data.as_ptr() as u64, 64)];
        let attr = MemAttr {
            mem_type: MemType::Cuda,
            device: 1,
        };
        let bulk =
            unsafe { Bulk::create_with_attr(&class, &segments, Permission::ReadOnly, attr) }
                .unwrap();
        let decoded = round_trip(&bulk, &class, SerializeFlags::EAGER);
        assert!(!decoded.flags().contains(DescFlags::EAGER));

        // a deserialized (virtual) handle re-serializes without eager
        let virt = round_trip(&bulk, &class, SerializeFlags::empty());
        let again = round_trip(&virt, &class, SerializeFlags::EAGER);
        assert!(!again.flags().contains(DescFlags::EAGER));
    }

    #[test]
    fn bind_block_round_trips_in_canonical_order() {
        let class = Class::new(Loopback::new());
        let context = Context::new(&class, 9).unwrap();
        let bulk = Bulk::alloc(&class, &[32], Permission::ReadOnly).unwrap();
        bulk.bind(&context).unwrap();

        let size = bulk.serialize_size(SerializeFlags::empty());
        let mut bytes = vec![0u8; size];
        bulk.serialize(SerializeFlags::empty(), &mut bytes).unwrap();

        // the context id is the very last byte: (addr_size, addr, id)
        assert_eq!(bytes[size - 1], 9);

        let decoded = Bulk::deserialize(&class, &bytes).unwrap();
        assert!(decoded.flags().contains(DescFlags::BIND));
        assert_eq!(decoded.context_id(), Some(9));
        assert!(decoded.addr().unwrap().is_self());
    }

    #[test]
    fn sm_flag_doubles_the_handle_block() {
        let class = Class::with_sm(Loopback::new(), Loopback::new());
        let bulk = Bulk::alloc(&class, &[64], Permission::ReadOnly).unwrap();

        let plain = bulk.serialize_size(SerializeFlags::empty());
        let with_sm = bulk.serialize_size(SerializeFlags::SM);
        assert!(with_sm > plain);

        let decoded = round_trip(&bulk, &class, SerializeFlags::SM);
        assert!(decoded.flags().contains(DescFlags::SM));
        assert!(decoded.inner.sm_mem_descs.is_some());
    }

    #[test]
    fn sm_without_transport_is_ignored_on_encode_and_fatal_on_decode() {
        let sm_class = Class::with_sm(Loopback::new(), Loopback::new());
        let plain_class = Class::new(Loopback::new());

        // encode: requesting SM on a class without the transport drops it
        let bulk = Bulk::alloc(&plain_class, &[16], Permission::ReadOnly).unwrap();
        let decoded = round_trip(&bulk, &plain_class, SerializeFlags::SM);
        assert!(!decoded.flags().contains(DescFlags::SM));

        // decode: an SM descriptor needs the transport to exist
        let bulk = Bulk::alloc(&sm_class, &[16], Permission::ReadOnly).unwrap();
        let size = bulk.serialize_size(SerializeFlags::SM);
        let mut bytes = vec![0u8; size];
        bulk.serialize(SerializeFlags::SM, &mut bytes).unwrap();
        assert_eq!(
            Bulk::deserialize(&plain_class, &bytes).unwrap_err(),
            Error::Protocol
        );
    }

    #[test]
    fn undersized_buffer_is_an_overflow_error() {
        let class = Class::new(Loopback::new());
        let bulk = Bulk::alloc(&class, &[64], Permission::ReadOnly).unwrap();
        let size = bulk.serialize_size(SerializeFlags::empty());
        let mut bytes = vec![0u8; size - 1];
        assert_eq!(
            bulk.serialize(SerializeFlags::empty(), &mut bytes).unwrap_err(),
            Error::Overflow
        );
    }

    #[test]
    fn trailing_garbage_is_tolerated() {
        let class = Class::new(Loopback::new());
        let bulk = Bulk::alloc(&class, &[8], Permission::ReadOnly).unwrap();
        let size = bulk.serialize_size(SerializeFlags::empty());
        let mut bytes = vec![0u8; size + 5];
        bulk.serialize(SerializeFlags::empty(), &mut bytes[..size])
            .unwrap();
        let decoded = Bulk::deserialize(&class, &bytes).unwrap();
        assert_eq!(decoded.len(), 8);
    }

    #[test]
    fn serialization_cache_is_opaque() {
        let class = Class::new(Loopback::new());
        let bulk = Bulk::alloc(&class, &[8], Permission::ReadOnly).unwrap();
        assert_eq!(bulk.serialize_cached(), None);
        bulk.set_serialize_cached(0xdead_beef, 42);
        assert_eq!(bulk.serialize_cached(), Some((0xdead_beef, 42)));
    }
}
