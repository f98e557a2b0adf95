// Copyright the cinnabar developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bulk data transfer engine for the cinnabar RPC runtime.
//!
//! This crate exposes local memory regions to remote peers and moves byte
//! ranges between them with one-sided PUT/GET operations. The pieces fit
//! together as follows:
//!
//! * [`handle::Bulk`] describes a set of memory segments, registered with
//!   the underlying transport and shareable with a peer through its wire
//!   serialization ([`serialize`]).
//! * [`class::Context::transfer`] plans the minimum set of transport
//!   sub-operations needed to move a byte range between two handles,
//!   issues them, and aggregates their completions into a single entry on
//!   the context's completion queue.
//! * [`pool::OpPool`] recycles transfer operation state so steady-state
//!   transfers allocate nothing.
//! * [`na`] defines the transport interface the engine drives; transfers
//!   between handles in the same process never touch it.

pub mod class;
pub mod desc;
pub mod error;
pub mod handle;
pub mod na;
pub mod op;
pub mod pool;
pub mod segment;
pub mod serialize;
pub mod transfer;

pub use class::{Addr, Class, Context};
pub use desc::{MemAttr, MemType, Permission};
pub use error::{Error, Result};
pub use handle::Bulk;
pub use op::BulkOp;
pub use segment::Segment;
pub use serialize::SerializeFlags;
pub use transfer::{Direction, TransferInfo};
