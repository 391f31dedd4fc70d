//! Transfer request protocol (spec.md §4.7).
//!
//! A request carries a dynamic array of per-buffer scatter/gather entries
//! (Design Notes §9: "prefer a plain dynamic array of entries owned by the
//! request object" over the source's trailing-array-in-struct layout) and a
//! one-shot completion the core waits on.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use smallvec::SmallVec;

use crate::error::Error;

/// Request operation kind (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOp {
    Read,
    Write,
    Sync,
}

/// One buffer's worth of a transfer: its media block, byte length, the
/// memory it reads into / writes out of, and a back-pointer to the buffer
/// slab index that owns that memory (spec.md §4.7).
///
/// The raw pointer the spec describes is realized here as an owned,
/// borrowed-for-the-duration `&'static mut [u8]` obtained from the group
/// pool's single backing allocation; see `crate::cache` for the safety
/// argument (buffers are protocol-guaranteed to have at most one holder
/// while a transfer touching them is in flight).
pub struct ScatterEntry {
    pub media_block: u64,
    pub len: usize,
    pub data: &'static mut [u8],
    pub buf: usize,
    pub had_waiters: bool,
}

/// A one-shot completion handle. The driver must call `complete` exactly
/// once; the core's submitting thread blocks on `recv` until it does.
pub struct Completion {
    tx: Option<Sender<Result<(), Error>>>,
    rx: Receiver<Result<(), Error>>,
}

impl Completion {
    pub fn new() -> (Self, CompletionHandle) {
        let (tx, rx) = bounded(1);
        let handle = CompletionHandle { tx: tx.clone() };
        (Self { tx: Some(tx), rx }, handle)
    }

    pub fn wait(self) -> Result<(), Error> {
        self.rx.recv().unwrap_or(Err(Error::Io("driver dropped completion without signaling")))
    }
}

/// The half of the completion a driver holds and calls exactly once.
#[derive(Clone)]
pub struct CompletionHandle {
    tx: Sender<Result<(), Error>>,
}

impl CompletionHandle {
    pub fn complete(self, status: Result<(), Error>) {
        // A full channel here means `complete` was called twice, which
        // violates the completion-exactly-once contract (spec.md §4.7,
        // §9); we log and drop the second call rather than panic in driver
        // code we don't control.
        if self.tx.try_send(status).is_err() {
            tracing::warn!("driver completion invoked more than once");
        }
    }
}

/// A transfer request submitted to a driver (spec.md §4.7).
pub struct TransferRequest {
    pub op: TransferOp,
    pub entries: SmallVec<[ScatterEntry; 8]>,
    completion: Arc<parking_lot::Mutex<Option<CompletionHandle>>>,
}

impl TransferRequest {
    pub fn new(op: TransferOp, entries: SmallVec<[ScatterEntry; 8]>) -> (Self, Completion) {
        let (completion, handle) = Completion::new();
        let req = Self { op, entries, completion: Arc::new(parking_lot::Mutex::new(Some(handle))) };
        (req, completion)
    }

    pub fn buffer_count(&self) -> usize {
        self.entries.len()
    }

    /// Invoked by the driver exactly once, from any context (spec.md
    /// §4.7). A second call is a contract violation, logged and ignored.
    pub fn complete(&self, status: Result<(), Error>) {
        match self.completion.lock().take() {
            Some(handle) => handle.complete(status),
            None => tracing::warn!("driver completion invoked more than once"),
        }
    }
}
