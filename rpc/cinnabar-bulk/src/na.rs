// Copyright the cinnabar developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Network-abstraction (NA) transport interface consumed by the bulk
//! engine.
//!
//! A transport provides memory registration, one-sided PUT/GET between a
//! local registration and a remote one, and a completion callback per
//! issued operation. The engine is transport-agnostic: everything is
//! reached through these object-safe traits, and a process may drive two
//! transports at once (a primary fabric plus a shared-memory fast path).

use crate::{
    desc::{MemAttr, Permission},
    error::Result,
    segment::Segment,
};
use core::{any::Any, fmt};
use std::sync::Arc;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Completion status delivered to an operation callback
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Success,
    Canceled,
    /// Transport-specific error code, propagated opaquely
    Error(u32),
}

/// Per-operation completion callback
///
/// Invoked exactly once for every accepted `put`/`get`, from whichever
/// thread drives the transport's progress.
pub type Callback = Arc<dyn Fn(Status) + Send + Sync>;

/// Progress context for issuing operations, one per engine context
pub trait NaContext: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// A transport-level peer address
pub trait Address: fmt::Debug + Send + Sync {
    /// True when the address refers to the calling process itself
    fn is_self(&self) -> bool;
    fn serialize_size(&self) -> usize;
    fn serialize(&self, bytes: &mut [u8]) -> Result<()>;
    fn as_any(&self) -> &dyn Any;
}

/// A registered (or deserialized remote) memory region
pub trait MemHandle: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Transport-owned state for one in-flight operation; reusable across
/// transfers once the previous operation completed
pub trait OpId: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// The one-sided transport consumed by the bulk engine
#[allow(clippy::too_many_arguments)]
pub trait Transport: fmt::Debug + Send + Sync {
    fn context_create(&self) -> Result<Box<dyn NaContext>>;

    /// The address other processes would use to reach this one
    fn addr_self(&self) -> Result<Arc<dyn Address>>;

    fn addr_deserialize(&self, bytes: &[u8]) -> Result<Arc<dyn Address>>;

    /// Largest segment count a single registration can cover; `1` means
    /// vectored registration is unsupported
    fn max_segments(&self) -> usize {
        1
    }

    fn mem_handle_create(&self, segment: Segment, perm: Permission) -> Result<Box<dyn MemHandle>>;

    /// One registration covering several segments; only called when
    /// [`max_segments`](Self::max_segments) allows the count
    fn mem_handle_create_segments(
        &self,
        segments: &[Segment],
        perm: Permission,
    ) -> Result<Box<dyn MemHandle>> {
        let _ = (segments, perm);
        Err(crate::error::Error::OpNotSupported)
    }

    fn mem_register(&self, handle: &dyn MemHandle, attr: MemAttr) -> Result<()>;

    fn mem_deregister(&self, handle: &dyn MemHandle) -> Result<()>;

    fn mem_handle_serialize_size(&self, handle: &dyn MemHandle) -> usize;

    fn mem_handle_serialize(&self, handle: &dyn MemHandle, bytes: &mut [u8]) -> Result<()>;

    fn mem_handle_deserialize(&self, bytes: &[u8]) -> Result<Box<dyn MemHandle>>;

    fn op_create(&self) -> Result<Box<dyn OpId>>;

    /// Writes `size` bytes from the local region into the remote one
    fn put(
        &self,
        ctx: &dyn NaContext,
        callback: Callback,
        local: &dyn MemHandle,
        local_offset: u64,
        remote: &dyn MemHandle,
        remote_offset: u64,
        size: u64,
        remote_addr: &dyn Address,
        remote_id: u8,
        op_id: &dyn OpId,
    ) -> Result<()>;

    /// Reads `size` bytes from the remote region into the local one
    fn get(
        &self,
        ctx: &dyn NaContext,
        callback: Callback,
        local: &dyn MemHandle,
        local_offset: u64,
        remote: &dyn MemHandle,
        remote_offset: u64,
        size: u64,
        remote_addr: &dyn Address,
        remote_id: u8,
        op_id: &dyn OpId,
    ) -> Result<()>;

    /// Requests cancellation of an issued operation; the operation still
    /// completes through its callback, with [`Status::Canceled`] if the
    /// cancel won the race
    fn cancel(&self, ctx: &dyn NaContext, op_id: &dyn OpId) -> Result<()>;
}
