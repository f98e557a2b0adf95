// Copyright the cinnabar developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pool of recycled transfer operations.
//!
//! Steady-state transfers pop a preallocated op from a LIFO free-list and
//! push it back on release. An empty list grows by doubling; a dedicated
//! mutex/condvar pair makes sure only one thread extends while the others
//! wait and then retry the list.

use crate::{
    class::{Context, ContextInner},
    error::{Error, Result},
    op::BulkOpId,
};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Handle to a context's op pool, mainly for observability
#[derive(Clone, Debug)]
pub struct OpPool {
    pub(crate) inner: Arc<PoolInner>,
}

impl OpPool {
    /// Total ops allocated over the pool's lifetime
    pub fn count(&self) -> usize {
        self.inner.extend.lock().count
    }

    /// Ops currently sitting on the free-list
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }
}

#[derive(Debug)]
pub(crate) struct PoolInner {
    context: Weak<ContextInner>,
    free: Mutex<Vec<Arc<BulkOpId>>>,
    extend: Mutex<ExtendState>,
    extend_cond: Condvar,
}

#[derive(Debug)]
struct ExtendState {
    extending: bool,
    count: usize,
}

impl PoolInner {
    pub(crate) fn create(context: &Context, init_count: usize) -> Result<Arc<Self>> {
        if init_count == 0 {
            return Err(Error::InvalidArg);
        }

        debug!(init_count, "creating bulk op pool");

        let pool = Arc::new(Self {
            context: context.downgrade(),
            free: Mutex::new(Vec::with_capacity(init_count)),
            extend: Mutex::new(ExtendState {
                extending: false,
                count: init_count,
            }),
            extend_cond: Condvar::new(),
        });

        for _ in 0..init_count {
            let op = BulkOpId::create(context)?;
            op.mark_reusable(Arc::downgrade(&pool));
            pool.free.lock().push(op);
        }

        Ok(pool)
    }

    /// Pops a recycled op, extending the pool when the free-list is dry
    pub(crate) fn get(self: &Arc<Self>) -> Result<Arc<BulkOpId>> {
        loop {
            if let Some(op) = self.free.lock().pop() {
                return Ok(op);
            }

            let mut extend = self.extend.lock();
            if extend.extending {
                // someone else is extending; wait, then re-try the list
                self.extend_cond.wait(&mut extend);
                continue;
            }
            extend.extending = true;
            let count = extend.count;
            drop(extend);

            debug!(count, "extending bulk op pool");
            let mut created = Ok(());
            for _ in 0..count {
                match self.create_op() {
                    Ok(op) => self.free.lock().push(op),
                    Err(err) => {
                        created = Err(err);
                        break;
                    }
                }
            }

            let mut extend = self.extend.lock();
            extend.extending = false;
            if created.is_ok() {
                extend.count *= 2;
            }
            // wake waiters even on failure, or they hang forever
            self.extend_cond.notify_all();
            drop(extend);
            created?;
        }
    }

    /// Accepts a released op back onto the free-list
    pub(crate) fn reinsert(&self, op: Arc<BulkOpId>) {
        self.free.lock().push(op);
    }

    fn create_op(self: &Arc<Self>) -> Result<Arc<BulkOpId>> {
        let inner = self.context.upgrade().ok_or(Error::InvalidArg)?;
        let context = Context::from_inner(inner);
        let op = BulkOpId::create(&context)?;
        op.mark_reusable(Arc::downgrade(self));
        Ok(op)
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // drained ops must tear down fully instead of re-inserting
        // themselves into a dying pool
        for op in self.free.get_mut().drain(..) {
            op.clear_reusable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{class::Class, na::testing::Loopback};
    use std::thread;

    fn pool_context() -> (Context, Arc<PoolInner>) {
        let class = Class::new(Loopback::new());
        let context = Context::new(&class, 0).unwrap();
        let pool = PoolInner::create(&context, 2).unwrap();
        (context, pool)
    }

    #[test]
    fn get_pops_and_release_reinserts() {
        let (_context, pool) = pool_context();
        assert_eq!(pool.free.lock().len(), 2);

        let op = pool.get().unwrap();
        assert_eq!(pool.free.lock().len(), 1);

        op.release();
        assert_eq!(pool.free.lock().len(), 2);
    }

    #[test]
    fn empty_pool_doubles() {
        let (_context, pool) = pool_context();
        let ops: Vec<_> = (0..3).map(|_| pool.get().unwrap()).collect();
        // 2 -> 4 after the first extension
        assert_eq!(pool.extend.lock().count, 4);
        for op in &ops {
            op.release();
        }
        assert_eq!(pool.free.lock().len(), 4);
    }

    #[test]
    fn concurrent_getters_see_distinct_ops() {
        let (_context, pool) = pool_context();

        let ops = thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let pool = &pool;
                    scope.spawn(move || {
                        [pool.get().unwrap(), pool.get().unwrap()]
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert_eq!(ops.len(), 8);
        for (index, op) in ops.iter().enumerate() {
            for other in &ops[index + 1..] {
                assert!(!Arc::ptr_eq(op, other), "pool handed out the same op twice");
            }
        }
        // doubled at least twice to satisfy 8 concurrent claims
        assert!(pool.extend.lock().count >= 8);

        let expected = pool.free.lock().len() + ops.len();
        for op in &ops {
            op.release();
        }
        assert_eq!(pool.free.lock().len(), expected);
    }
}
