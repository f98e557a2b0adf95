// Copyright the cinnabar developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The transfer engine: validates a request, picks the cheapest path
//! (synthetic completion, local copy, or transport PUT/GET fan-out), and
//! wires sub-operation completions back into a single user callback.

use crate::{
    class::{Addr, Context},
    desc::DescFlags,
    error::{Error, Result},
    handle::{Bulk, MemDescs},
    na,
    op::{BulkOp, BulkOpId, TransferState},
    segment::{JointChunks, Segment},
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Transfer direction, seen from the local side
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Write local bytes into the origin handle
    Push,
    /// Read origin bytes into the local handle
    Pull,
}

/// Passed to the user callback when a transfer completes
#[derive(Debug)]
pub struct TransferInfo<'a> {
    pub origin: &'a Bulk,
    pub local: &'a Bulk,
    pub direction: Direction,
    pub size: u64,
    pub status: Result<()>,
}

/// A synchronous issue failure, remembering whether any sub-operation was
/// already accepted by the transport
struct IssueFailure {
    error: Error,
    issued: bool,
}

impl IssueFailure {
    fn clean(error: Error) -> Self {
        Self {
            error,
            issued: false,
        }
    }
}

impl Context {
    /// Starts a transfer between a local handle and an origin handle
    /// whose owner is reached at `origin_addr`.
    ///
    /// Non-blocking: completion is observed by processing this context's
    /// completion queue with [`trigger`](Context::trigger), which invokes
    /// `callback` exactly once.
    ///
    /// If the transport rejects a sub-operation after accepting earlier
    /// ones, the error is returned synchronously, no callback fires, and
    /// the already-accepted sub-operations drain internally.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer(
        &self,
        direction: Direction,
        origin_addr: &Addr,
        origin: &Bulk,
        origin_offset: u64,
        local: &Bulk,
        local_offset: u64,
        size: u64,
        callback: impl FnOnce(TransferInfo<'_>) + Send + 'static,
    ) -> Result<BulkOp> {
        self.transfer_id(
            direction,
            origin_addr,
            0,
            origin,
            origin_offset,
            local,
            local_offset,
            size,
            callback,
        )
    }

    /// [`transfer`](Context::transfer) against the address and context id
    /// embedded in the origin handle by [`Bulk::bind`]
    #[allow(clippy::too_many_arguments)]
    pub fn bind_transfer(
        &self,
        direction: Direction,
        origin: &Bulk,
        origin_offset: u64,
        local: &Bulk,
        local_offset: u64,
        size: u64,
        callback: impl FnOnce(TransferInfo<'_>) + Send + 'static,
    ) -> Result<BulkOp> {
        // the handle carries the address here
        let addr = origin.addr().ok_or(Error::InvalidArg)?.clone();
        let origin_id = origin.context_id().unwrap_or(0);
        self.transfer_common(
            direction,
            &addr,
            origin_id,
            origin,
            origin_offset,
            local,
            local_offset,
            size,
            Box::new(callback),
        )
    }

    /// [`transfer`](Context::transfer) with an explicit remote context id
    #[allow(clippy::too_many_arguments)]
    pub fn transfer_id(
        &self,
        direction: Direction,
        origin_addr: &Addr,
        origin_id: u8,
        origin: &Bulk,
        origin_offset: u64,
        local: &Bulk,
        local_offset: u64,
        size: u64,
        callback: impl FnOnce(TransferInfo<'_>) + Send + 'static,
    ) -> Result<BulkOp> {
        // a bound handle carries its own address; mixing the two forms is
        // almost certainly a caller bug
        if origin.addr().is_some() {
            return Err(Error::InvalidArg);
        }
        self.transfer_common(
            direction,
            origin_addr,
            origin_id,
            origin,
            origin_offset,
            local,
            local_offset,
            size,
            Box::new(callback),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn transfer_common(
        &self,
        direction: Direction,
        origin_addr: &Addr,
        origin_id: u8,
        origin: &Bulk,
        origin_offset: u64,
        local: &Bulk,
        local_offset: u64,
        size: u64,
        callback: Box<dyn FnOnce(TransferInfo<'_>) + Send>,
    ) -> Result<BulkOp> {
        let class_id = self.class().id();
        if origin_addr.class_id != class_id
            || origin.class().id() != class_id
            || local.class().id() != class_id
        {
            return Err(Error::InvalidArg);
        }

        let origin_end = origin_offset.checked_add(size).ok_or(Error::InvalidArg)?;
        if origin_end > origin.len() {
            return Err(Error::InvalidArg);
        }
        let local_end = local_offset.checked_add(size).ok_or(Error::InvalidArg)?;
        if local_end > local.len() {
            return Err(Error::InvalidArg);
        }

        let origin_flags = origin.flags();
        let local_flags = local.flags();
        let allowed = match direction {
            Direction::Push => origin_flags.is_writable() && local_flags.is_readable(),
            Direction::Pull => origin_flags.is_readable() && local_flags.is_writable(),
        };
        if !allowed {
            return Err(Error::Permission);
        }

        let op = match self.op_pool_inner() {
            Some(pool) => pool.get()?,
            None => BulkOpId::create(self)?,
        };
        op.begin(
            callback,
            TransferState {
                origin: origin.clone(),
                local: local.clone(),
                direction,
                size,
            },
        );

        if size == 0 {
            // nothing to move; report success right away
            op.complete(true);
        } else if origin_addr.is_self()
            || (origin_flags.contains(DescFlags::EAGER) && direction == Direction::Pull)
        {
            // the data is already in this process, either genuinely local
            // or embedded by an eager serialization
            transfer_self(
                direction,
                origin.segments(),
                origin_offset,
                local.segments(),
                local_offset,
                size,
            );
            op.complete(true);
        } else if let Err(failure) = transfer_na(
            self,
            &op,
            direction,
            origin_addr,
            origin_id,
            origin,
            origin_offset,
            local,
            local_offset,
            size,
        ) {
            if failure.issued {
                // sub-operations are in flight; keep the op alive so they
                // drain into it, but make sure no user callback fires and
                // the op never returns to a pool
                op.abandon();
            } else {
                // nothing was accepted, the op can be recycled right away
                op.reset_user_state();
                op.release();
            }
            return Err(failure.error);
        }

        Ok(BulkOp { inner: op })
    }
}

/// Local copy path: same joint walk as the transport planner, executed
/// with plain memory copies
fn transfer_self(
    direction: Direction,
    origin_segments: &[Segment],
    origin_offset: u64,
    local_segments: &[Segment],
    local_offset: u64,
    size: u64,
) {
    trace!(size, "transferring data through local copy");
    for chunk in JointChunks::new(
        origin_segments,
        origin_offset,
        local_segments,
        local_offset,
        size,
    ) {
        let origin = origin_segments[chunk.origin_index].base + chunk.origin_offset;
        let local = local_segments[chunk.local_index].base + chunk.local_offset;
        unsafe {
            // Safety: the self path only runs when both handles describe
            // live memory in this process; the create contract guarantees
            // validity and non-overlap of the two sides
            match direction {
                Direction::Push => core::ptr::copy_nonoverlapping(
                    local as *const u8,
                    origin as *mut u8,
                    chunk.len as usize,
                ),
                Direction::Pull => core::ptr::copy_nonoverlapping(
                    origin as *const u8,
                    local as *mut u8,
                    chunk.len as usize,
                ),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn transfer_na(
    context: &Context,
    op: &Arc<BulkOpId>,
    direction: Direction,
    origin_addr: &Addr,
    origin_id: u8,
    origin: &Bulk,
    origin_offset: u64,
    local: &Bulk,
    local_offset: u64,
    size: u64,
) -> Result<(), IssueFailure> {
    let origin_flags = origin.flags();
    let sm = origin_flags.contains(DescFlags::SM);

    let (transport, op_ids) = op.select_na(sm).map_err(IssueFailure::clean)?;
    let inner = context.inner();
    let na_ctx: &dyn na::NaContext = if sm {
        inner
            .na_sm_ctx()
            .ok_or_else(|| IssueFailure::clean(Error::OpNotSupported))?
    } else {
        inner.na_ctx()
    };
    let na_addr: &dyn na::Address = if sm {
        origin_addr
            .na_sm
            .as_deref()
            .ok_or_else(|| IssueFailure::clean(Error::OpNotSupported))?
    } else {
        &*origin_addr.na
    };

    let origin_descs = mem_descs(origin, sm).map_err(IssueFailure::clean)?;
    let local_descs = mem_descs(local, sm).map_err(IssueFailure::clean)?;

    let origin_single =
        origin_flags.contains(DescFlags::REGV) || origin.segment_count() == 1;
    let local_single =
        local.flags().contains(DescFlags::REGV) || local.segment_count() == 1;

    let callback: na::Callback = {
        let op = op.clone();
        Arc::new(move |status| op.na_callback(status))
    };

    if origin_single && local_single {
        // both sides are one registration: a single sub-operation with
        // absolute offsets, no planning needed
        trace!("transferring data in a single operation");
        let origin_handle = origin_descs
            .first()
            .ok_or_else(|| IssueFailure::clean(Error::InvalidArg))?;
        let local_handle = local_descs
            .first()
            .ok_or_else(|| IssueFailure::clean(Error::InvalidArg))?;
        op.set_op_count(1);
        return op_ids.with_ops(1, |ids| {
            issue_one(
                &transport,
                direction,
                na_ctx,
                callback.clone(),
                local_handle,
                local_offset,
                origin_handle,
                origin_offset,
                size,
                na_addr,
                origin_id,
                &*ids[0],
            )
            .map_err(IssueFailure::clean)
        });
    }

    // A side covered by one registration plans as a single flat range so
    // its sub-op offsets stay absolute; a per-segment side keeps its real
    // list and indexes its per-segment registrations.
    let origin_flat = [Segment::new(0, origin.len())];
    let origin_plan: &[Segment] = if origin_single {
        &origin_flat
    } else {
        origin.segments()
    };
    let local_flat = [Segment::new(0, local.len())];
    let local_plan: &[Segment] = if local_single {
        &local_flat
    } else {
        local.segments()
    };

    let chunks = JointChunks::new(origin_plan, origin_offset, local_plan, local_offset, size);
    let count = chunks.clone().count();
    if count == 0 {
        return Err(IssueFailure::clean(Error::InvalidArg));
    }

    debug!(count, "transferring data through transport fan-out");
    op.set_op_count(count as u32);
    op_ids
        .provision(&transport, count)
        .map_err(IssueFailure::clean)?;

    op_ids.with_ops(count, |ids| {
        let mut issued = 0usize;
        for chunk in chunks {
            let origin_handle = handle_at(origin_descs, origin_single, chunk.origin_index)
                .ok_or(Error::InvalidArg)
                .map_err(|error| IssueFailure {
                    error,
                    issued: issued > 0,
                })?;
            let local_handle = handle_at(local_descs, local_single, chunk.local_index)
                .ok_or(Error::InvalidArg)
                .map_err(|error| IssueFailure {
                    error,
                    issued: issued > 0,
                })?;
            issue_one(
                &transport,
                direction,
                na_ctx,
                callback.clone(),
                local_handle,
                chunk.local_offset,
                origin_handle,
                chunk.origin_offset,
                chunk.len,
                na_addr,
                origin_id,
                &*ids[issued],
            )
            .map_err(|error| IssueFailure {
                error,
                issued: issued > 0,
            })?;
            issued += 1;
        }
        // the pre-pass sized the sub-op array; a disagreement here means
        // the walk is broken
        if issued != count {
            return Err(IssueFailure {
                error: Error::Protocol,
                issued: issued > 0,
            });
        }
        Ok(())
    })
}

/// The registration to use for a chunk index on one side
fn handle_at(descs: &MemDescs, single: bool, index: usize) -> Option<&dyn na::MemHandle> {
    if single {
        descs.first()
    } else {
        descs.handles.get(index)?.as_deref()
    }
}

fn mem_descs(bulk: &Bulk, sm: bool) -> Result<&MemDescs> {
    if sm {
        bulk.inner.sm_mem_descs.as_ref().ok_or(Error::OpNotSupported)
    } else {
        Ok(&bulk.inner.mem_descs)
    }
}

#[allow(clippy::too_many_arguments)]
fn issue_one(
    transport: &Arc<dyn na::Transport>,
    direction: Direction,
    na_ctx: &dyn na::NaContext,
    callback: na::Callback,
    local: &dyn na::MemHandle,
    local_offset: u64,
    origin: &dyn na::MemHandle,
    origin_offset: u64,
    len: u64,
    na_addr: &dyn na::Address,
    origin_id: u8,
    op_id: &dyn na::OpId,
) -> Result<()> {
    match direction {
        Direction::Push => transport.put(
            na_ctx,
            callback,
            local,
            local_offset,
            origin,
            origin_offset,
            len,
            na_addr,
            origin_id,
            op_id,
        ),
        Direction::Pull => transport.get(
            na_ctx,
            callback,
            local,
            local_offset,
            origin,
            origin_offset,
            len,
            na_addr,
            origin_id,
            op_id,
        ),
    }
}
