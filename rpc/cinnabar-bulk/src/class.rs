// Copyright the cinnabar developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The RPC-core surface the bulk engine hangs off: classes bundle the
//! transports, contexts own a completion queue and (optionally) an op
//! pool, addresses name peers.

use crate::{
    error::{Error, Result},
    na,
    op::{self, BulkOpId},
    pool::PoolInner,
};
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use crossbeam_queue::SegQueue;
use std::sync::{Arc, OnceLock, Weak};

static CLASS_ID: AtomicU64 = AtomicU64::new(1);

/// A class groups the transports a process talks through
///
/// Handles, addresses, and contexts created from different classes must
/// never be mixed; the engine enforces this with a per-class id.
#[derive(Clone, Debug)]
pub struct Class {
    inner: Arc<ClassInner>,
}

#[derive(Debug)]
pub(crate) struct ClassInner {
    id: u64,
    na: Arc<dyn na::Transport>,
    na_sm: Option<Arc<dyn na::Transport>>,
    bulk_count: AtomicI64,
}

impl Class {
    pub fn new(na: Arc<dyn na::Transport>) -> Self {
        Self::build(na, None)
    }

    /// A class with a shared-memory fast-path transport alongside the
    /// primary one
    pub fn with_sm(na: Arc<dyn na::Transport>, na_sm: Arc<dyn na::Transport>) -> Self {
        Self::build(na, Some(na_sm))
    }

    fn build(na: Arc<dyn na::Transport>, na_sm: Option<Arc<dyn na::Transport>>) -> Self {
        Self {
            inner: Arc::new(ClassInner {
                id: CLASS_ID.fetch_add(1, Ordering::Relaxed),
                na,
                na_sm,
                bulk_count: AtomicI64::new(0),
            }),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub(crate) fn na(&self) -> &Arc<dyn na::Transport> {
        &self.inner.na
    }

    #[inline]
    pub(crate) fn na_sm(&self) -> Option<&Arc<dyn na::Transport>> {
        self.inner.na_sm.as_ref()
    }

    /// Number of live bulk handles created from this class
    pub fn bulk_handle_count(&self) -> i64 {
        self.inner.bulk_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn bulk_incr(&self) {
        self.inner.bulk_count.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn bulk_decr(&self) {
        self.inner.bulk_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// The address peers would use to reach this process
    pub fn addr_self(&self) -> Result<Addr> {
        let na = self.inner.na.addr_self()?;
        let na_sm = match &self.inner.na_sm {
            Some(sm) => Some(sm.addr_self()?),
            None => None,
        };
        Ok(Addr {
            class_id: self.inner.id,
            na,
            na_sm,
        })
    }

    /// Wraps transport addresses (e.g. from an address database) into an
    /// engine address belonging to this class
    pub fn make_addr(
        &self,
        na: Arc<dyn na::Address>,
        na_sm: Option<Arc<dyn na::Address>>,
    ) -> Addr {
        Addr {
            class_id: self.inner.id,
            na,
            na_sm,
        }
    }

    pub(crate) fn addr_deserialize(&self, bytes: &[u8]) -> Result<Addr> {
        let na = self.inner.na.addr_deserialize(bytes)?;
        Ok(Addr {
            class_id: self.inner.id,
            na,
            na_sm: None,
        })
    }
}

/// A peer address, bound to the class that produced it
#[derive(Clone, Debug)]
pub struct Addr {
    pub(crate) class_id: u64,
    pub(crate) na: Arc<dyn na::Address>,
    pub(crate) na_sm: Option<Arc<dyn na::Address>>,
}

impl Addr {
    /// True when the address refers to the calling process
    #[inline]
    pub fn is_self(&self) -> bool {
        self.na.is_self()
    }

    #[inline]
    pub(crate) fn serialize_size(&self) -> usize {
        self.na.serialize_size()
    }

    #[inline]
    pub(crate) fn serialize(&self, bytes: &mut [u8]) -> Result<()> {
        self.na.serialize(bytes)
    }
}

/// An execution context: transport progress state, the completion queue
/// transfers report into, and an optional op pool
#[derive(Clone, Debug)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
pub(crate) struct ContextInner {
    class: Class,
    id: u8,
    na_ctx: Box<dyn na::NaContext>,
    na_sm_ctx: Option<Box<dyn na::NaContext>>,
    completion: SegQueue<CompletionEntry>,
    pool: OnceLock<Arc<PoolInner>>,
}

#[derive(Debug)]
pub(crate) struct CompletionEntry {
    pub op: Arc<BulkOpId>,
    /// Completion was produced on the caller's own thread, without any
    /// transport callback; progress loops can skip their wakeup path
    #[allow(dead_code)]
    pub self_notify: bool,
}

impl Context {
    pub fn new(class: &Class, id: u8) -> Result<Self> {
        let na_ctx = class.na().context_create()?;
        let na_sm_ctx = match class.na_sm() {
            Some(sm) => Some(sm.context_create()?),
            None => None,
        };
        Ok(Self {
            inner: Arc::new(ContextInner {
                class: class.clone(),
                id,
                na_ctx,
                na_sm_ctx,
                completion: SegQueue::new(),
                pool: OnceLock::new(),
            }),
        })
    }

    #[inline]
    pub fn class(&self) -> &Class {
        &self.inner.class
    }

    #[inline]
    pub fn id(&self) -> u8 {
        self.inner.id
    }

    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Arc::downgrade(&self.inner)
    }

    /// Attaches a pool of `init_count` recycled transfer operations;
    /// fails if one is already installed
    pub fn install_op_pool(&self, init_count: usize) -> Result<()> {
        let pool = PoolInner::create(self, init_count)?;
        self.inner
            .pool
            .set(pool)
            .map_err(|_| Error::InvalidArg)
    }

    /// The installed op pool, if any
    pub fn op_pool(&self) -> Option<crate::pool::OpPool> {
        self.inner.pool.get().map(|inner| crate::pool::OpPool {
            inner: inner.clone(),
        })
    }

    pub(crate) fn op_pool_inner(&self) -> Option<&Arc<PoolInner>> {
        self.inner.pool.get()
    }

    /// Number of completions waiting for [`trigger`](Self::trigger)
    pub fn pending_completions(&self) -> usize {
        self.inner.completion.len()
    }

    /// Runs user callbacks for up to `max_count` queued completions;
    /// returns how many fired
    pub fn trigger(&self, max_count: usize) -> usize {
        let mut count = 0;
        while count < max_count {
            let Some(entry) = self.inner.completion.pop() else {
                break;
            };
            op::trigger_entry(entry.op);
            count += 1;
        }
        count
    }
}

impl ContextInner {
    #[inline]
    pub(crate) fn na_ctx(&self) -> &dyn na::NaContext {
        &*self.na_ctx
    }

    pub(crate) fn na_sm_ctx(&self) -> Option<&dyn na::NaContext> {
        self.na_sm_ctx.as_deref()
    }

    pub(crate) fn completion_add(&self, op: Arc<BulkOpId>, self_notify: bool) {
        self.completion.push(CompletionEntry { op, self_notify });
    }
}
