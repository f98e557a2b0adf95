// Copyright the cinnabar developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::sync::atomic::{AtomicU32, Ordering};

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors surfaced by the bulk engine
///
/// Synchronous API failures return these directly; asynchronous sub-op
/// failures are captured into the owning operation's sticky return status
/// and surfaced once through the aggregated completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("allocation failed")]
    NoMem,
    #[error("invalid argument")]
    InvalidArg,
    #[error("handle permissions do not allow the requested transfer")]
    Permission,
    #[error("serialization buffer too small")]
    Overflow,
    #[error("operation not supported by transport")]
    OpNotSupported,
    #[error("operation canceled")]
    Canceled,
    #[error("protocol error in serialized descriptor")]
    Protocol,
    #[error("transport error (code {0})")]
    Transport(u32),
}

impl From<cinnabar_codec::EncoderError> for Error {
    #[inline]
    fn from(_: cinnabar_codec::EncoderError) -> Self {
        Error::Overflow
    }
}

impl From<cinnabar_codec::DecoderError> for Error {
    #[inline]
    fn from(_: cinnabar_codec::DecoderError) -> Self {
        Error::Protocol
    }
}

const STATUS_SUCCESS: u32 = 0;
const TRANSPORT_BASE: u32 = 1 << 16;

impl Error {
    #[inline]
    fn code(self) -> u32 {
        match self {
            Error::NoMem => 1,
            Error::InvalidArg => 2,
            Error::Permission => 3,
            Error::Overflow => 4,
            Error::OpNotSupported => 5,
            Error::Canceled => 6,
            Error::Protocol => 7,
            Error::Transport(code) => TRANSPORT_BASE | (code & (TRANSPORT_BASE - 1)),
        }
    }

    #[inline]
    fn from_code(code: u32) -> Option<Self> {
        match code {
            STATUS_SUCCESS => None,
            1 => Some(Error::NoMem),
            2 => Some(Error::InvalidArg),
            3 => Some(Error::Permission),
            4 => Some(Error::Overflow),
            5 => Some(Error::OpNotSupported),
            6 => Some(Error::Canceled),
            7 => Some(Error::Protocol),
            code => Some(Error::Transport(code & (TRANSPORT_BASE - 1))),
        }
    }
}

/// Sticky "first non-success wins" status word
///
/// Shared between the issuing thread and transport completion callbacks;
/// the first failure recorded is the one reported, later ones are dropped.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU32);

impl StatusCell {
    #[inline]
    pub fn new() -> Self {
        Self(AtomicU32::new(STATUS_SUCCESS))
    }

    /// Records `error` only if the cell still holds success
    #[inline]
    pub fn set_if_success(&self, error: Error) -> bool {
        self.0
            .compare_exchange(
                STATUS_SUCCESS,
                error.code(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline]
    pub fn get(&self) -> Result<()> {
        match Error::from_code(self.0.load(Ordering::Acquire)) {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    #[inline]
    pub fn reset(&self) {
        self.0.store(STATUS_SUCCESS, Ordering::Release);
    }
}
