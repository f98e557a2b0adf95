// Copyright the cinnabar developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bulk handles: reference-counted descriptors of registered memory
//! regions.

use crate::{
    class::{Addr, Class, Context},
    desc::{AtomicFlags, DescFlags, MemAttr, Permission},
    error::{Error, Result},
    na,
    segment::{offset_translate, Segment, SegmentList, INLINE_SEGMENTS},
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error};

/// A bulk descriptor over one or more memory segments
///
/// Cloning is the public reference-count increment; the registration is
/// torn down when the last clone (including the ones held by in-flight
/// transfers) drops.
#[derive(Clone, Debug)]
pub struct Bulk {
    pub(crate) inner: Arc<BulkInner>,
}

/// Per-transport registration state: one memory handle and serialize size
/// per segment, or a single pair when one registration covers everything
#[derive(Debug)]
pub(crate) struct MemDescs {
    pub handles: SmallVec<[Option<Box<dyn na::MemHandle>>; INLINE_SEGMENTS]>,
    pub serialize_sizes: SmallVec<[usize; INLINE_SEGMENTS]>,
}

impl MemDescs {
    fn single(handle: Box<dyn na::MemHandle>, serialize_size: usize) -> Self {
        let mut handles = SmallVec::new();
        let mut serialize_sizes = SmallVec::new();
        handles.push(Some(handle));
        serialize_sizes.push(serialize_size);
        Self {
            handles,
            serialize_sizes,
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            handles: SmallVec::new(),
            serialize_sizes: SmallVec::new(),
        }
    }

    /// The single handle used in the regv / one-segment layout
    pub(crate) fn first(&self) -> Option<&dyn na::MemHandle> {
        self.handles.first().and_then(|handle| handle.as_deref())
    }
}

/// Who owns the memory behind the segment list
#[derive(Debug)]
pub(crate) enum Ownership {
    /// Caller-provided buffers; the caller keeps them alive
    Borrowed,
    /// Handle-owned allocations (created from lengths, or an eager decode)
    Owned(#[allow(dead_code)] Vec<Box<[u8]>>),
}

#[derive(Debug)]
pub(crate) struct Binding {
    pub addr: Addr,
    pub context_id: u8,
}

#[derive(Debug)]
pub(crate) struct BulkInner {
    pub class: Class,
    pub segments: SegmentList,
    pub len: u64,
    pub flags: AtomicFlags,
    pub attr: MemAttr,
    pub mem_descs: MemDescs,
    pub sm_mem_descs: Option<MemDescs>,
    pub bound: OnceLock<Binding>,
    pub ownership: Ownership,
    pub serialize_cache: Mutex<Option<(u64, usize)>>,
    /// True when this side performed the registration (false on
    /// deserialized handles, which only hold decoded transport handles)
    pub registered: bool,
}

impl Bulk {
    /// Creates a handle over caller-provided memory and registers it with
    /// the class transports.
    ///
    /// # Safety
    ///
    /// Every segment with a nonzero length must reference memory valid
    /// for reads (and writes, unless `perm` is read-only) of `len` bytes
    /// for the whole lifetime of the handle, and no segment may overlap
    /// memory described by a handle used as the other side of a transfer.
    pub unsafe fn create(class: &Class, segments: &[Segment], perm: Permission) -> Result<Self> {
        Self::create_with_attr(class, segments, perm, MemAttr::default())
    }

    /// [`create`](Self::create) with explicit memory attributes, for
    /// device-resident segments.
    ///
    /// # Safety
    ///
    /// Same contract as [`create`](Self::create).
    pub unsafe fn create_with_attr(
        class: &Class,
        segments: &[Segment],
        perm: Permission,
        attr: MemAttr,
    ) -> Result<Self> {
        if segments.is_empty() {
            return Err(Error::InvalidArg);
        }
        let list: SegmentList = segments.iter().copied().collect();
        Self::build(class, list, Ownership::Borrowed, perm, attr)
    }

    /// Creates a handle over zero-filled memory the handle itself owns,
    /// one allocation per requested length
    pub fn alloc(class: &Class, lens: &[u64], perm: Permission) -> Result<Self> {
        if lens.is_empty() {
            return Err(Error::InvalidArg);
        }
        let mut owned = Vec::new();
        let mut list = SegmentList::new();
        for &len in lens {
            if len == 0 {
                list.push(Segment::default());
                continue;
            }
            let buf = vec![0u8; len as usize].into_boxed_slice();
            list.push(Segment::new(buf.as_ptr() as u64, len));
            owned.push(buf);
        }
        Self::build(class, list, Ownership::Owned(owned), perm, MemAttr::default())
    }

    fn build(
        class: &Class,
        segments: SegmentList,
        ownership: Ownership,
        perm: Permission,
        attr: MemAttr,
    ) -> Result<Self> {
        let count = segments.len();
        let len = segments.iter().map(|segment| segment.len).sum();
        let mut flags = perm.as_flags();

        debug!(count, len, "creating bulk handle");

        let na = class.na();
        // Use one registration covering all segments when the transport
        // can; the shared-memory transport must then be able to match it.
        if count > 1 && na.max_segments() > 1 {
            if count <= na.max_segments() {
                flags |= DescFlags::REGV;
            }
            if let Some(sm) = class.na_sm() {
                if sm.max_segments() < count {
                    return Err(Error::OpNotSupported);
                }
            }
        }

        let regv = flags.contains(DescFlags::REGV);
        let mem_descs = register_descs(na, &segments, regv, perm, attr)?;
        let sm_mem_descs = match class.na_sm() {
            Some(sm) => match register_descs(sm, &segments, regv, perm, attr) {
                Ok(descs) => Some(descs),
                Err(err) => {
                    deregister_descs(na, &mem_descs);
                    return Err(err);
                }
            },
            None => None,
        };

        class.bulk_incr();

        Ok(Self {
            inner: Arc::new(BulkInner {
                class: class.clone(),
                segments,
                len,
                flags: AtomicFlags::new(flags),
                attr,
                mem_descs,
                sm_mem_descs,
                bound: OnceLock::new(),
                ownership,
                serialize_cache: Mutex::new(None),
                registered: true,
            }),
        })
    }

    /// Attaches this process's own address and the context's id, so a
    /// peer can transfer against the handle without being told an address
    pub fn bind(&self, context: &Context) -> Result<()> {
        if self.inner.flags.load().contains(DescFlags::BIND) {
            return Err(Error::InvalidArg);
        }
        let addr = context.class().addr_self()?;
        let binding = Binding {
            addr,
            context_id: context.id(),
        };
        self.inner
            .bound
            .set(binding)
            .map_err(|_| Error::InvalidArg)?;
        self.inner.flags.insert(DescFlags::BIND);
        Ok(())
    }

    /// The bound address, if [`bind`](Self::bind) was called
    pub fn addr(&self) -> Option<&Addr> {
        self.inner.bound.get().map(|binding| &binding.addr)
    }

    /// The bound context id, if [`bind`](Self::bind) was called
    pub fn context_id(&self) -> Option<u8> {
        self.inner.bound.get().map(|binding| binding.context_id)
    }

    /// Total number of bytes the handle describes
    #[inline]
    pub fn len(&self) -> u64 {
        self.inner.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.inner.segments.len()
    }

    #[inline]
    pub fn mem_attr(&self) -> MemAttr {
        self.inner.attr
    }

    #[inline]
    pub(crate) fn flags(&self) -> DescFlags {
        self.inner.flags()
    }

    #[inline]
    pub(crate) fn class(&self) -> &Class {
        &self.inner.class
    }

    #[inline]
    pub(crate) fn segments(&self) -> &[Segment] {
        &self.inner.segments
    }

    /// Resolves `offset..offset + size` into up to `out.len()` contiguous
    /// `(address, length)` ranges, returning how many were written
    ///
    /// A range reaching past the end of the handle is silently truncated
    /// to the part that exists.
    pub fn access(&self, offset: u64, size: u64, out: &mut [Segment]) -> usize {
        if size == 0 || out.is_empty() {
            return 0;
        }
        let segments = self.segments();
        let (mut index, mut segment_offset) = offset_translate(segments, offset);
        let mut remaining = size;
        let mut count = 0;
        while remaining > 0 && count < out.len() && index < segments.len() {
            let segment = segments[index];
            let len = (segment.len - segment_offset).min(remaining);
            if len > 0 {
                out[count] = Segment::new(segment.base + segment_offset, len);
                count += 1;
                remaining -= len;
            }
            index += 1;
            segment_offset = 0;
        }
        count
    }
}

impl BulkInner {
    /// Current mode flags, with the ownership bit folded in
    pub(crate) fn flags(&self) -> DescFlags {
        let mut flags = self.flags.load();
        if matches!(self.ownership, Ownership::Owned(_)) {
            flags |= DescFlags::ALLOC;
        }
        flags
    }
}

impl Drop for BulkInner {
    fn drop(&mut self) {
        if self.registered {
            deregister_descs(self.class.na(), &self.mem_descs);
            if let (Some(sm), Some(descs)) = (self.class.na_sm(), self.sm_mem_descs.as_ref()) {
                deregister_descs(sm, descs);
            }
        }
        self.class.bulk_decr();
    }
}

/// Registers the segment list with one transport, either as a single
/// vectored registration or segment by segment
fn register_descs(
    transport: &Arc<dyn na::Transport>,
    segments: &[Segment],
    regv: bool,
    perm: Permission,
    attr: MemAttr,
) -> Result<MemDescs> {
    if regv || segments.len() == 1 {
        // a lone empty segment has nothing to register
        if !regv && (segments[0].base == 0 || segments[0].len == 0) {
            let mut descs = MemDescs::empty();
            descs.handles.push(None);
            descs.serialize_sizes.push(0);
            return Ok(descs);
        }
        let handle = if regv {
            transport.mem_handle_create_segments(segments, perm)?
        } else {
            transport.mem_handle_create(segments[0], perm)?
        };
        transport.mem_register(&*handle, attr)?;
        let serialize_size = transport.mem_handle_serialize_size(&*handle);
        return Ok(MemDescs::single(handle, serialize_size));
    }

    let mut descs = MemDescs::empty();
    for segment in segments {
        if segment.base == 0 || segment.len == 0 {
            descs.handles.push(None);
            descs.serialize_sizes.push(0);
            continue;
        }
        let result = transport
            .mem_handle_create(*segment, perm)
            .and_then(|handle| {
                transport.mem_register(&*handle, attr)?;
                Ok(handle)
            });
        match result {
            Ok(handle) => {
                let serialize_size = transport.mem_handle_serialize_size(&*handle);
                descs.handles.push(Some(handle));
                descs.serialize_sizes.push(serialize_size);
            }
            Err(err) => {
                // roll back what this loop already registered
                deregister_descs(transport, &descs);
                return Err(err);
            }
        }
    }
    Ok(descs)
}

/// Deregisters every registered handle; failures are logged and teardown
/// continues
fn deregister_descs(transport: &Arc<dyn na::Transport>, descs: &MemDescs) {
    for handle in descs.handles.iter().flatten() {
        if let Err(err) = transport.mem_deregister(&**handle) {
            error!(?err, "could not deregister memory handle");
        }
    }
}
