//! Per-buffer state machine and descriptor (spec.md §4.5, §3).

use std::time::Instant;

use crate::list::{Link, Linked};

/// The eleven states a buffer can occupy. See spec.md §4.5 for the full
/// membership matrix; [`BufferState::list_membership`] below encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    Free,
    Empty,
    Cached,
    AccessCached,
    AccessModified,
    AccessEmpty,
    AccessPurged,
    Modified,
    Sync,
    Transfer,
    TransferPurged,
}

/// Which auxiliary list (if any) a buffer in this state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMembership {
    None,
    Lru,
    Modified,
    Sync,
}

impl BufferState {
    /// Table from spec.md §4.5 ("Index" / "LRU" / "Modified" / "Sync" /
    /// "Group user" / "External user" columns), minus the Index column
    /// (every non-`Free` state is indexed; callers that need that fact use
    /// `self != BufferState::Free` directly).
    pub const fn list_membership(self) -> ListMembership {
        match self {
            BufferState::Free => ListMembership::Lru,
            BufferState::Empty => ListMembership::None,
            BufferState::Cached => ListMembership::Lru,
            BufferState::AccessCached
            | BufferState::AccessModified
            | BufferState::AccessEmpty
            | BufferState::AccessPurged => ListMembership::None,
            BufferState::Modified => ListMembership::Modified,
            BufferState::Sync => ListMembership::Sync,
            BufferState::Transfer | BufferState::TransferPurged => ListMembership::None,
        }
    }

    pub const fn has_group_user(self) -> bool {
        !matches!(self, BufferState::Free | BufferState::Empty | BufferState::Cached)
    }

    pub const fn has_external_user(self) -> bool {
        matches!(
            self,
            BufferState::AccessCached
                | BufferState::AccessModified
                | BufferState::AccessEmpty
                | BufferState::AccessPurged
                | BufferState::Transfer
                | BufferState::TransferPurged
        )
    }

    pub const fn is_access(self) -> bool {
        matches!(
            self,
            BufferState::AccessCached
                | BufferState::AccessModified
                | BufferState::AccessEmpty
                | BufferState::AccessPurged
        )
    }

    pub const fn is_transfer_family(self) -> bool {
        matches!(self, BufferState::Sync | BufferState::Transfer | BufferState::TransferPurged)
    }

    pub const fn is_indexed(self) -> bool {
        !matches!(self, BufferState::Free)
    }
}

/// Intrusive AVL tree linkage, present when the tree-backed index is built.
#[cfg(feature = "index-avl")]
#[derive(Debug, Clone, Copy, Default)]
pub struct AvlLink {
    pub parent: Link,
    pub left: Link,
    pub right: Link,
    pub balance: i8,
}

/// Intrusive hash-bucket chain linkage, present when the hash-backed index
/// is built.
#[cfg(feature = "index-hash")]
#[derive(Debug, Clone, Copy, Default)]
pub struct HashLink {
    pub next: Link,
}

/// Sentinel device id meaning "no device" — the invariant state for `Free`
/// buffers (spec.md §3).
pub const NO_DEVICE: u32 = u32::MAX;

/// The cache's in-memory representation of a block: state, list linkage,
/// index linkage, and a non-owning view into the group pool's memory.
pub struct BufferSlot {
    pub device: u32,
    pub block: u64,
    pub state: BufferState,
    /// Number of threads currently blocked waiting on this specific buffer
    /// (access-set waiters that rechecked and found this one still busy).
    pub waiters: u32,
    pub group: usize,
    /// Byte offset and length of this buffer's storage inside the group
    /// pool's single backing allocation (see `crate::group`).
    pub mem_offset: usize,
    pub mem_len: usize,
    /// Remaining hold time before swapout may write this buffer back, once
    /// `Modified`. `None` outside that state.
    pub hold_until: Option<Instant>,
    /// Opaque caller tag (spec.md §3: "user tag").
    pub tag: u64,

    list_prev: Link,
    list_next: Link,

    #[cfg(feature = "index-avl")]
    pub avl: AvlLink,
    #[cfg(feature = "index-hash")]
    pub hash: HashLink,
}

impl BufferSlot {
    pub fn new_free(group: usize, mem_offset: usize, mem_len: usize) -> Self {
        Self {
            device: NO_DEVICE,
            block: 0,
            state: BufferState::Free,
            waiters: 0,
            group,
            mem_offset,
            mem_len,
            hold_until: None,
            tag: 0,
            list_prev: None,
            list_next: None,
            #[cfg(feature = "index-avl")]
            avl: AvlLink::default(),
            #[cfg(feature = "index-hash")]
            hash: HashLink::default(),
        }
    }
}

impl Linked for BufferSlot {
    fn links(&self) -> (Link, Link) {
        (self.list_prev, self.list_next)
    }

    fn set_links(&mut self, prev: Link, next: Link) {
        self.list_prev = prev;
        self.list_next = next;
    }
}
