//! Error taxonomy for the cache's public, per-call API.
//!
//! Fatal invariant violations (state-machine or index corruption) are *not*
//! part of this type — see [`crate::buffer::FatalReason`]. Those terminate
//! the caller and must never be absorbed.

use thiserror::Error;

/// Errors returned from the cache's public operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A bad block number, bad size, or invalid ioctl code was supplied.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No buffer descriptor or raw buffer is currently available; the
    /// caller should wait or retry per the calling API's contract.
    #[error("no buffer available")]
    ResourceUnavailable,

    /// The named device is not registered.
    #[error("device not found: {0}")]
    NotFound(String),

    /// A device with this name is already registered.
    #[error("device already exists: {0}")]
    AlreadyExists(String),

    /// The driver reported a non-success status for a transfer.
    #[error("I/O error: {0}")]
    Io(&'static str),

    /// A reconfiguration was attempted while the resource was in use.
    #[error("device busy")]
    Busy,
}

/// Encodes a fatal state-machine or index-integrity violation.
///
/// These are raised via [`panic!`] carrying this value; they must never be
/// caught and converted into an [`Error`]. See spec §5, §7, §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatalReason {
    pub state: crate::buffer::BufferState,
    pub code: FatalCode,
}

impl core::fmt::Display for FatalReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "fatal cache invariant violation: state={:?} code={:?}", self.state, self.code)
    }
}

/// What kind of fatal violation occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalCode {
    /// A buffer transitioned from a state the operation did not expect.
    UnexpectedState,
    /// An index insert found an existing entry for the same key.
    DuplicateIndexEntry,
    /// An index remove could not find the entry it was asked to remove.
    MissingIndexEntry,
}

/// Panics with an encoded fatal reason. Centralized so every call site logs
/// identically before aborting the caller.
#[cold]
#[track_caller]
pub fn fatal(state: crate::buffer::BufferState, code: FatalCode) -> ! {
    let reason = FatalReason { state, code };
    tracing::warn!(?reason, "fatal cache invariant violation");
    panic!("{reason}");
}
