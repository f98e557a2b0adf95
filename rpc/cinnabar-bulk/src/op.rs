// Copyright the cinnabar developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transfer operation state: one `BulkOpId` aggregates the completions of
//! every transport sub-operation a transfer fans out into, and reports to
//! the caller exactly once.

use crate::{
    class::{Class, Context, ContextInner},
    error::{Error, Result, StatusCell},
    handle::Bulk,
    na,
    pool::PoolInner,
    segment::INLINE_SEGMENTS,
    transfer::{Direction, TransferInfo},
};
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{error, warn};

const OP_COMPLETED: u32 = 1 << 0;
const OP_CANCELED: u32 = 1 << 1;
const OP_ERRORED: u32 = 1 << 2;

const ACTIVE_NONE: u8 = 0;
const ACTIVE_PRIMARY: u8 = 1;
const ACTIVE_SM: u8 = 2;

/// Everything the user callback needs, retained until trigger time
///
/// Holding the two handles here is what keeps their reference counts up
/// for the duration of the transfer.
pub(crate) struct TransferState {
    pub origin: Bulk,
    pub local: Bulk,
    pub direction: Direction,
    pub size: u64,
}

pub(crate) type TransferCallback = Box<dyn FnOnce(TransferInfo<'_>) + Send>;

/// Preallocated transport sub-op ids, with a heap spill for transfers
/// that fan out wider than the inline set
pub(crate) struct OpIdArray {
    pre: Vec<Box<dyn na::OpId>>,
    extra: Mutex<Vec<Box<dyn na::OpId>>>,
}

impl OpIdArray {
    fn create(transport: &Arc<dyn na::Transport>) -> Result<Self> {
        let mut pre = Vec::with_capacity(INLINE_SEGMENTS);
        for _ in 0..INLINE_SEGMENTS {
            pre.push(transport.op_create()?);
        }
        Ok(Self {
            pre,
            extra: Mutex::new(Vec::new()),
        })
    }

    /// Ensures `count` sub-op ids exist; counts beyond the preallocated
    /// set get a fresh heap array that lives until the op is released
    pub(crate) fn provision(&self, transport: &Arc<dyn na::Transport>, count: usize) -> Result<()> {
        if count <= self.pre.len() {
            return Ok(());
        }
        let mut ops = Vec::with_capacity(count);
        for _ in 0..count {
            ops.push(transport.op_create()?);
        }
        *self.extra.lock() = ops;
        Ok(())
    }

    /// Runs `f` over the first `count` usable sub-op ids
    pub(crate) fn with_ops<R>(&self, count: usize, f: impl FnOnce(&[Box<dyn na::OpId>]) -> R) -> R {
        if count <= self.pre.len() {
            f(&self.pre[..count])
        } else {
            let extra = self.extra.lock();
            f(&extra[..count])
        }
    }

    fn clear_extra(&self) {
        self.extra.lock().clear();
    }
}

impl fmt::Debug for OpIdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpIdArray")
            .field("pre", &self.pre.len())
            .field("extra", &self.extra.lock().len())
            .finish()
    }
}

/// State of one bulk transfer, shared between the issuing thread, the
/// transport completion callbacks, and the trigger path
pub(crate) struct BulkOpId {
    context: Weak<ContextInner>,
    class: Class,
    callback: Mutex<Option<TransferCallback>>,
    state: Mutex<Option<TransferState>>,
    /// Which transport family the in-flight transfer went through
    active: AtomicU8,
    op_count: AtomicU32,
    completed: AtomicU32,
    status: AtomicU32,
    ret_status: StatusCell,
    ref_count: AtomicU32,
    reuse: AtomicBool,
    pool: OnceLock<Weak<PoolInner>>,
    na_op_ids: OpIdArray,
    na_sm_op_ids: Option<OpIdArray>,
}

impl fmt::Debug for BulkOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkOpId")
            .field("status", &self.status.load(Ordering::Relaxed))
            .field("op_count", &self.op_count.load(Ordering::Relaxed))
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl BulkOpId {
    pub(crate) fn create(context: &Context) -> Result<Arc<Self>> {
        let class = context.class().clone();
        let na_op_ids = OpIdArray::create(class.na())?;
        let na_sm_op_ids = match class.na_sm() {
            Some(sm) => Some(OpIdArray::create(sm)?),
            None => None,
        };
        Ok(Arc::new(Self {
            context: context.downgrade(),
            class,
            callback: Mutex::new(None),
            state: Mutex::new(None),
            active: AtomicU8::new(ACTIVE_NONE),
            op_count: AtomicU32::new(1),
            completed: AtomicU32::new(0),
            // completed until a transfer claims it
            status: AtomicU32::new(OP_COMPLETED),
            ret_status: StatusCell::new(),
            ref_count: AtomicU32::new(1),
            reuse: AtomicBool::new(false),
            pool: OnceLock::new(),
            na_op_ids,
            na_sm_op_ids,
        }))
    }

    /// Claims the op for a new transfer, resetting the aggregation state
    pub(crate) fn begin(&self, callback: TransferCallback, state: TransferState) {
        let size = state.size;
        *self.callback.lock() = Some(callback);
        *self.state.lock() = Some(state);
        self.active.store(ACTIVE_NONE, Ordering::Release);
        self.op_count
            .store(u32::from(size > 0), Ordering::Release);
        self.completed.store(0, Ordering::Release);
        self.status.store(0, Ordering::Release);
        self.ret_status.reset();
    }

    pub(crate) fn select_na(&self, sm: bool) -> Result<(Arc<dyn na::Transport>, &OpIdArray)> {
        if sm {
            let transport = self.class.na_sm().ok_or(Error::OpNotSupported)?.clone();
            let ops = self.na_sm_op_ids.as_ref().ok_or(Error::OpNotSupported)?;
            self.active.store(ACTIVE_SM, Ordering::Release);
            Ok((transport, ops))
        } else {
            self.active.store(ACTIVE_PRIMARY, Ordering::Release);
            Ok((self.class.na().clone(), &self.na_op_ids))
        }
    }

    pub(crate) fn set_op_count(&self, count: u32) {
        self.op_count.store(count, Ordering::Release);
    }

    pub(crate) fn mark_reusable(&self, pool: Weak<PoolInner>) {
        self.reuse.store(true, Ordering::Release);
        let _ = self.pool.set(pool);
    }

    pub(crate) fn clear_reusable(&self) {
        self.reuse.store(false, Ordering::Release);
    }

    /// Forgets the user-facing state of a failed transfer so no callback
    /// can fire and the handle references drop immediately
    pub(crate) fn reset_user_state(&self) {
        drop(self.callback.lock().take());
        drop(self.state.lock().take());
    }

    /// A mid-issue failure leaves sub-operations draining into this op;
    /// it must neither call back nor be recycled, and retires when the
    /// last transport reference drops
    pub(crate) fn abandon(&self) {
        self.clear_reusable();
        self.reset_user_state();
    }

    /// Transport completion callback, invoked once per sub-operation
    pub(crate) fn na_callback(self: &Arc<Self>, status: na::Status) {
        match status {
            na::Status::Success => {}
            na::Status::Canceled => {
                if self.status.load(Ordering::Acquire) & OP_COMPLETED != 0 {
                    warn!("cancel event on an already-completed operation");
                }
                self.ret_status.set_if_success(Error::Canceled);
            }
            na::Status::Error(code) => {
                self.status.fetch_or(OP_ERRORED, Ordering::AcqRel);
                self.ret_status.set_if_success(Error::Transport(code));
                error!(code, "transport completion returned an error");
            }
        }

        // last sub-operation in completes the bulk operation
        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        if done == self.op_count.load(Ordering::Acquire) {
            self.complete(false);
        }
    }

    /// Marks the op completed and posts it to the context's completion
    /// queue for a later trigger
    pub(crate) fn complete(self: &Arc<Self>, self_notify: bool) {
        self.status.fetch_or(OP_COMPLETED, Ordering::AcqRel);
        match self.context.upgrade() {
            Some(context) => context.completion_add(self.clone(), self_notify),
            None => {
                // the context is gone; nothing will ever trigger us, so
                // release everything here
                warn!("completion delivered after its context was dropped");
                drop(self.callback.lock().take());
                drop(self.state.lock().take());
                self.release();
            }
        }
    }

    /// Idempotent cancellation; the first caller forwards the cancel to
    /// the transport, everyone else sees success
    pub(crate) fn cancel(self: &Arc<Self>) -> Result<()> {
        let status = self.status.load(Ordering::Acquire);
        if status & (OP_COMPLETED | OP_CANCELED | OP_ERRORED) != 0 {
            return Ok(());
        }
        if self.status.fetch_or(OP_CANCELED, Ordering::AcqRel) & OP_CANCELED != 0 {
            return Ok(());
        }

        let Some(context) = self.context.upgrade() else {
            return Ok(());
        };
        let (transport, na_ctx, ops) = match self.active.load(Ordering::Acquire) {
            ACTIVE_PRIMARY => (
                self.class.na().clone(),
                context.na_ctx(),
                &self.na_op_ids,
            ),
            ACTIVE_SM => (
                self.class.na_sm().ok_or(Error::OpNotSupported)?.clone(),
                context.na_sm_ctx().ok_or(Error::OpNotSupported)?,
                self.na_sm_op_ids.as_ref().ok_or(Error::OpNotSupported)?,
            ),
            // local path: there is nothing to cancel
            _ => return Ok(()),
        };

        let count = self.op_count.load(Ordering::Acquire) as usize;
        ops.with_ops(count, |ops| {
            for op_id in ops {
                transport.cancel(na_ctx, &**op_id)?;
            }
            Ok(())
        })
    }

    /// Drops one logical reference; the last one either recycles the op
    /// into its pool or lets it tear down with the allocation
    pub(crate) fn release(self: &Arc<Self>) {
        if self.ref_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        // per-transfer oversize arrays never outlive the transfer; the
        // preallocated set is kept for the next one
        self.na_op_ids.clear_extra();
        if let Some(sm) = &self.na_sm_op_ids {
            sm.clear_extra();
        }

        if self.reuse.load(Ordering::Acquire) {
            self.ref_count.store(1, Ordering::Release);
            self.status.store(OP_COMPLETED, Ordering::Release);
            self.ret_status.reset();
            if let Some(pool) = self.pool.get().and_then(Weak::upgrade) {
                pool.reinsert(self.clone());
            }
        }
    }
}

/// Runs the user callback for a completed transfer, then returns the
/// references the transfer took: both handles and the op itself
pub(crate) fn trigger_entry(op: Arc<BulkOpId>) {
    let callback = op.callback.lock().take();
    let state = op.state.lock().take();
    if let Some(state) = state {
        if let Some(callback) = callback {
            callback(TransferInfo {
                origin: &state.origin,
                local: &state.local,
                direction: state.direction,
                size: state.size,
                status: op.ret_status.get(),
            });
        }
        // handle references drop only after the callback has returned
        drop(state);
    }
    op.release();
}

/// Caller-side token for an in-flight transfer
#[derive(Clone, Debug)]
pub struct BulkOp {
    pub(crate) inner: Arc<BulkOpId>,
}

impl BulkOp {
    /// Requests cancellation; the user callback still fires exactly once,
    /// with a canceled status if the cancel won the race
    pub fn cancel(&self) -> Result<()> {
        self.inner.cancel()
    }
}
