// Copyright the cinnabar developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process loopback transport for exercising the engine without real
//! network hardware.
//!
//! Registrations record the segment layout of the memory they cover and
//! PUT/GET resolve offsets straight into process memory. Completions are
//! delivered inline by default; [`Loopback::deferred`] holds them (and the
//! data copy) until [`process`] runs, which is what cancellation tests
//! need.
//!
//! [`process`]: Loopback::process

use crate::{
    desc::{MemAttr, Permission},
    error::{Error, Result},
    na::{Address, Callback, MemHandle, NaContext, OpId, Status, Transport},
    segment::{JointChunks, Segment},
};
use cinnabar_codec::{DecoderBuffer, EncoderBuffer};
use core::{
    any::Any,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};
use parking_lot::Mutex;
use std::sync::Arc;

static INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct Loopback {
    id: u64,
    max_segments: usize,
    deferred: bool,
    pending: Mutex<Vec<Pending>>,
    op_serial: AtomicU64,
    puts: AtomicUsize,
    gets: AtomicUsize,
    registrations: AtomicUsize,
}

struct Pending {
    serial: u64,
    callback: Callback,
    // (src, dst, len) triples resolved at issue time; u64 addresses keep
    // the struct Send
    copies: Vec<(u64, u64, u64)>,
    canceled: bool,
}

impl core::fmt::Debug for Pending {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pending")
            .field("serial", &self.serial)
            .field("canceled", &self.canceled)
            .finish()
    }
}

impl Loopback {
    pub fn new() -> Arc<Self> {
        Self::build(128, false)
    }

    /// A transport whose single registration covers at most one segment,
    /// forcing the engine down the per-segment path
    pub fn without_segment_support() -> Arc<Self> {
        Self::build(1, false)
    }

    /// A transport that withholds completions until [`Self::process`]
    pub fn deferred() -> Arc<Self> {
        Self::build(128, true)
    }

    /// Full control over segment support and completion delivery
    pub fn with_options(max_segments: usize, deferred: bool) -> Arc<Self> {
        Self::build(max_segments, deferred)
    }

    fn build(max_segments: usize, deferred: bool) -> Arc<Self> {
        Arc::new(Self {
            id: INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            max_segments,
            deferred,
            pending: Mutex::new(Vec::new()),
            op_serial: AtomicU64::new(1),
            puts: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            registrations: AtomicUsize::new(0),
        })
    }

    /// An address that resolves to this process but does not compare as
    /// self, so transfers against it exercise the fabric path
    pub fn peer_addr(&self) -> Arc<dyn Address> {
        Arc::new(LoopbackAddr {
            owner: self.id,
            home: 0,
        })
    }

    /// Number of PUT operations accepted so far
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::Acquire)
    }

    /// Number of GET operations accepted so far
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::Acquire)
    }

    /// Number of currently registered memory handles
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::Acquire)
    }

    /// Delivers every withheld completion; returns how many fired
    pub fn process(&self) -> usize {
        let pending: Vec<Pending> = core::mem::take(&mut *self.pending.lock());
        let count = pending.len();
        for op in pending {
            if op.canceled {
                (op.callback)(Status::Canceled);
            } else {
                run_copies(&op.copies);
                (op.callback)(Status::Success);
            }
        }
        count
    }

    fn complete(&self, serial: u64, callback: Callback, copies: Vec<(u64, u64, u64)>) {
        if self.deferred {
            self.pending.lock().push(Pending {
                serial,
                callback,
                copies,
                canceled: false,
            });
        } else {
            run_copies(&copies);
            callback(Status::Success);
        }
    }
}

fn run_copies(copies: &[(u64, u64, u64)]) {
    for &(src, dst, len) in copies {
        unsafe {
            // Safety: both addresses come out of registered segments; the
            // engine's registration contract guarantees they are valid for
            // `len` bytes and the regions do not overlap
            core::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len as usize);
        }
    }
}

/// Resolves a joint walk over two registrations into flat copy jobs
fn plan_copies(
    src: &LoopbackMemHandle,
    src_offset: u64,
    dst: &LoopbackMemHandle,
    dst_offset: u64,
    size: u64,
) -> Vec<(u64, u64, u64)> {
    JointChunks::new(&src.segments, src_offset, &dst.segments, dst_offset, size)
        .map(|chunk| {
            (
                src.segments[chunk.origin_index].base + chunk.origin_offset,
                dst.segments[chunk.local_index].base + chunk.local_offset,
                chunk.len,
            )
        })
        .collect()
}

#[derive(Debug)]
struct LoopbackContext;

impl NaContext for LoopbackContext {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct LoopbackAddr {
    owner: u64,
    home: u64,
}

impl Address for LoopbackAddr {
    fn is_self(&self) -> bool {
        self.owner == self.home
    }

    fn serialize_size(&self) -> usize {
        8
    }

    fn serialize(&self, bytes: &mut [u8]) -> Result<()> {
        let mut buffer = EncoderBuffer::new(bytes);
        buffer.encode_u64(self.owner)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct LoopbackMemHandle {
    segments: Vec<Segment>,
    #[allow(dead_code)]
    perm: Option<Permission>,
    registered: AtomicBool,
    remote: bool,
}

impl MemHandle for LoopbackMemHandle {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct LoopbackOpId {
    serial: u64,
}

impl OpId for LoopbackOpId {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn downcast_mem(handle: &dyn MemHandle) -> &LoopbackMemHandle {
    handle
        .as_any()
        .downcast_ref()
        .expect("foreign memory handle passed to loopback transport")
}

fn downcast_op(op_id: &dyn OpId) -> &LoopbackOpId {
    op_id
        .as_any()
        .downcast_ref()
        .expect("foreign op id passed to loopback transport")
}

impl Transport for Loopback {
    fn context_create(&self) -> Result<Box<dyn NaContext>> {
        Ok(Box::new(LoopbackContext))
    }

    fn addr_self(&self) -> Result<Arc<dyn Address>> {
        Ok(Arc::new(LoopbackAddr {
            owner: self.id,
            home: self.id,
        }))
    }

    fn addr_deserialize(&self, bytes: &[u8]) -> Result<Arc<dyn Address>> {
        let buffer = DecoderBuffer::new(bytes);
        let (owner, _) = buffer.decode_u64()?;
        Ok(Arc::new(LoopbackAddr {
            owner,
            home: self.id,
        }))
    }

    fn max_segments(&self) -> usize {
        self.max_segments
    }

    fn mem_handle_create(&self, segment: Segment, perm: Permission) -> Result<Box<dyn MemHandle>> {
        Ok(Box::new(LoopbackMemHandle {
            segments: vec![segment],
            perm: Some(perm),
            registered: AtomicBool::new(false),
            remote: false,
        }))
    }

    fn mem_handle_create_segments(
        &self,
        segments: &[Segment],
        perm: Permission,
    ) -> Result<Box<dyn MemHandle>> {
        if segments.len() > self.max_segments {
            return Err(Error::OpNotSupported);
        }
        Ok(Box::new(LoopbackMemHandle {
            segments: segments.to_vec(),
            perm: Some(perm),
            registered: AtomicBool::new(false),
            remote: false,
        }))
    }

    fn mem_register(&self, handle: &dyn MemHandle, _attr: MemAttr) -> Result<()> {
        let handle = downcast_mem(handle);
        assert!(!handle.registered.swap(true, Ordering::AcqRel));
        self.registrations.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn mem_deregister(&self, handle: &dyn MemHandle) -> Result<()> {
        let handle = downcast_mem(handle);
        assert!(handle.registered.swap(false, Ordering::AcqRel));
        self.registrations.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn mem_handle_serialize_size(&self, handle: &dyn MemHandle) -> usize {
        8 + 16 * downcast_mem(handle).segments.len()
    }

    fn mem_handle_serialize(&self, handle: &dyn MemHandle, bytes: &mut [u8]) -> Result<()> {
        let handle = downcast_mem(handle);
        let mut buffer = EncoderBuffer::new(bytes);
        buffer.encode_u64(handle.segments.len() as u64)?;
        for segment in &handle.segments {
            buffer.encode_u64(segment.base)?;
            buffer.encode_u64(segment.len)?;
        }
        Ok(())
    }

    fn mem_handle_deserialize(&self, bytes: &[u8]) -> Result<Box<dyn MemHandle>> {
        let buffer = DecoderBuffer::new(bytes);
        let (count, mut buffer) = buffer.decode_u64()?;
        let mut segments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (base, rest) = buffer.decode_u64()?;
            let (len, rest) = rest.decode_u64()?;
            segments.push(Segment::new(base, len));
            buffer = rest;
        }
        Ok(Box::new(LoopbackMemHandle {
            segments,
            perm: None,
            registered: AtomicBool::new(false),
            remote: true,
        }))
    }

    fn op_create(&self) -> Result<Box<dyn OpId>> {
        Ok(Box::new(LoopbackOpId {
            serial: self.op_serial.fetch_add(1, Ordering::Relaxed),
        }))
    }

    fn put(
        &self,
        _ctx: &dyn NaContext,
        callback: Callback,
        local: &dyn MemHandle,
        local_offset: u64,
        remote: &dyn MemHandle,
        remote_offset: u64,
        size: u64,
        _remote_addr: &dyn Address,
        _remote_id: u8,
        op_id: &dyn OpId,
    ) -> Result<()> {
        let local = downcast_mem(local);
        let remote = downcast_mem(remote);
        debug_assert!(local.registered.load(Ordering::Acquire) || local.remote);
        debug_assert!(remote.registered.load(Ordering::Acquire) || remote.remote);
        self.puts.fetch_add(1, Ordering::AcqRel);
        let copies = plan_copies(local, local_offset, remote, remote_offset, size);
        self.complete(downcast_op(op_id).serial, callback, copies);
        Ok(())
    }

    fn get(
        &self,
        _ctx: &dyn NaContext,
        callback: Callback,
        local: &dyn MemHandle,
        local_offset: u64,
        remote: &dyn MemHandle,
        remote_offset: u64,
        size: u64,
        _remote_addr: &dyn Address,
        _remote_id: u8,
        op_id: &dyn OpId,
    ) -> Result<()> {
        let local = downcast_mem(local);
        let remote = downcast_mem(remote);
        debug_assert!(local.registered.load(Ordering::Acquire) || local.remote);
        debug_assert!(remote.registered.load(Ordering::Acquire) || remote.remote);
        self.gets.fetch_add(1, Ordering::AcqRel);
        let copies = plan_copies(remote, remote_offset, local, local_offset, size);
        self.complete(downcast_op(op_id).serial, callback, copies);
        Ok(())
    }

    fn cancel(&self, _ctx: &dyn NaContext, op_id: &dyn OpId) -> Result<()> {
        let serial = downcast_op(op_id).serial;
        for pending in self.pending.lock().iter_mut() {
            if pending.serial == serial {
                pending.canceled = true;
            }
        }
        // an operation that already completed is not an error to cancel
        Ok(())
    }
}
