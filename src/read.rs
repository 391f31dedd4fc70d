//! Read/access path (spec.md §4.3): `get`, `read`, `peek`, and the buffer
//! acquisition loop shared by both.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::buffer::BufferState;
use crate::cache::{Cache, Inner};
use crate::device::Device;
use crate::error::Error;
use crate::index::Key;
use crate::transfer::{ScatterEntry, TransferOp, TransferRequest};

/// A buffer on loan to a caller in one of the four `ACCESS_*` states.
/// Callers must end the loan with exactly one of `release`,
/// `release_modified`, or `sync` (spec.md §4.4).
pub struct Buf {
    pub(crate) cache: Arc<Cache>,
    pub(crate) id: usize,
}

impl Buf {
    pub fn device(&self) -> u32 {
        self.cache.lock().slots[self.id].device
    }

    pub fn block(&self) -> u64 {
        self.cache.lock().slots[self.id].block
    }

    /// Reads the buffer's current contents. Safe because a buffer on loan
    /// to exactly one caller (an `ACCESS_*` state) is never touched by the
    /// swapout engine or another accessor until released.
    pub fn as_slice(&self) -> &[u8] {
        let inner = self.cache.lock();
        let slot = &inner.slots[self.id];
        unsafe { std::slice::from_raw_parts(inner.pool.storage.as_ptr().add(slot.mem_offset), slot.mem_len) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn as_mut_slice(&self) -> &mut [u8] {
        let mut inner = self.cache.lock();
        let slot = &inner.slots[self.id];
        let offset = slot.mem_offset;
        let len = slot.mem_len;
        unsafe { std::slice::from_raw_parts_mut(inner.pool.storage.as_mut_ptr().add(offset), len) }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().slots[self.id].mem_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Moves a freshly acquired buffer into the right `ACCESS_*` state based on
/// what state it was found in, unlinking it from any list and counting one
/// group user (spec.md §4.3 step 2, §4.5).
fn begin_access(inner: &mut Inner, id: usize) -> BufferState {
    let prior = inner.slots[id].state;
    let new_state = match prior {
        BufferState::Free | BufferState::Empty => BufferState::AccessEmpty,
        BufferState::Cached => BufferState::AccessCached,
        BufferState::Modified => BufferState::AccessModified,
        other => crate::error::fatal(other, crate::error::FatalCode::UnexpectedState),
    };

    match prior {
        BufferState::Free | BufferState::Cached => inner.lru.remove(&mut inner.slots, id),
        BufferState::Modified => inner.modified.remove(&mut inner.slots, id),
        _ => {}
    }

    inner.slots[id].state = new_state;
    inner.inc_group_user(id);
    tracing::debug!(buf = id, ?prior, ?new_state, "buffer access begins");
    new_state
}

impl Inner {
    /// Strips every currently active buffer of `group` out of the index
    /// and LRU list ahead of a repartition. Caller has already verified
    /// `group.users == 0`.
    fn reclaim_group(&mut self, group: usize) {
        for id in self.pool.groups[group].active_range() {
            if self.slots[id].state.is_indexed() {
                self.index.remove(&mut self.slots, id);
            }
            if matches!(self.slots[id].state, BufferState::Free | BufferState::Cached) {
                self.lru.remove(&mut self.slots, id);
            }
        }
    }
}

impl Cache {
    /// The buffer acquisition loop (spec.md §4.3).
    pub(crate) fn acquire(self: &Arc<Self>, device: &Device, block: u64) -> Result<usize, Error> {
        device.validate_block(block)?;
        let key = Key { device: device.id, block };
        let target_bds = device.bds_per_group.load(std::sync::atomic::Ordering::Acquire);

        loop {
            let mut inner = self.lock();

            if let Some(id) = inner.index.lookup(&inner.slots, key) {
                let group = inner.slots[id].group;
                if inner.pool.groups[group].bds_per_group == target_bds {
                    // Step 2: wait for access/transfer, then obtain.
                    loop {
                        let state = inner.slots[id].state;
                        if state.is_access() {
                            inner.slots[id].waiters += 1;
                            self.waiters.access.wait(&mut inner);
                            inner.slots[id].waiters -= 1;
                        } else if state.is_transfer_family() {
                            self.waiters.transfer.wait(&mut inner);
                        } else {
                            break;
                        }
                    }
                    begin_access(&mut inner, id);
                    return Ok(id);
                }

                // Step 3: group mismatch — wait for recycle, then restart.
                self.wait_for_recycle(&mut inner, id);
                continue;
            }

            // Step 4: not found — scan the LRU list for a recyclable
            // buffer, preferring an exact group-size match.
            let candidates: SmallVec<[usize; 64]> = inner.lru.iter(&inner.slots).collect();
            let mut recycled = None;
            for cand in candidates {
                if inner.slots[cand].waiters != 0 {
                    continue;
                }
                let g = inner.slots[cand].group;
                if inner.pool.groups[g].bds_per_group == target_bds {
                    recycled = Some((cand, g, false));
                    break;
                }
                if inner.pool.groups[g].users == 0 && recycled.is_none() {
                    recycled = Some((cand, g, true));
                }
            }

            let Some((cand, group, needs_repartition)) = recycled else {
                self.waiters.buffer.wait(&mut inner);
                continue;
            };

            let new_id = if needs_repartition {
                inner.reclaim_group(group);
                inner
                    .pool
                    .repartition(group, target_bds, &mut inner.slots)
                    .expect("eligibility already checked by the recycle scan above");

                let first = inner.pool.groups[group].first_buf;
                // The rest of the repartitioned group's freshly active
                // buffers go onto the LRU free list (spec.md §4.2:
                // "resulting buffers are prepended as free").
                for extra in inner.pool.groups[group].active_range() {
                    if extra != first {
                        inner.lru.push_back(&mut inner.slots, extra);
                    }
                }
                first
            } else {
                if inner.slots[cand].state.is_indexed() {
                    inner.index.remove(&mut inner.slots, cand);
                }
                inner.lru.remove(&mut inner.slots, cand);
                cand
            };

            inner.slots[new_id].device = device.id;
            inner.slots[new_id].block = block;
            inner.slots[new_id].state = BufferState::Empty;
            inner.index.insert(&mut inner.slots, new_id);

            begin_access(&mut inner, new_id);
            return Ok(new_id);
        }
    }

    /// Step 3 of the acquisition loop: wait for a mismatched-group buffer
    /// to become recyclable, routing a still-`Modified` buffer through
    /// sync first, then return it to the LRU free list so the caller's
    /// restart of the loop sees a clean miss.
    fn wait_for_recycle(self: &Arc<Self>, inner: &mut parking_lot::MutexGuard<'_, Inner>, id: usize) {
        loop {
            let state = inner.slots[id].state;
            if state.is_access() {
                inner.slots[id].waiters += 1;
                self.waiters.access.wait(inner);
                inner.slots[id].waiters -= 1;
                continue;
            }
            if state.is_transfer_family() {
                self.waiters.transfer.wait(inner);
                continue;
            }
            if state == BufferState::Modified {
                inner.modified.remove(&mut inner.slots, id);
                inner.sync_list.push_back(&mut inner.slots, id);
                inner.slots[id].state = BufferState::Sync;
                self.wake_swapout();
                self.waiters.transfer.wait(inner);
                continue;
            }
            break;
        }

        inner.index.remove(&mut inner.slots, id);
        if matches!(inner.slots[id].state, BufferState::Cached) {
            inner.lru.remove(&mut inner.slots, id);
        }
        inner.free(id);
        self.waiters.buffer.wake_all();
    }

    /// `get(device, block)` (spec.md §4.3): acquire without reading from
    /// media.
    pub fn get(self: &Arc<Self>, device: &Device, block: u64) -> Result<Buf, Error> {
        let id = self.acquire(device, block)?;
        Ok(Buf { cache: self.clone(), id })
    }

    /// `read(device, block)` (spec.md §4.3): acquire, issuing a synchronous
    /// read if the buffer was empty.
    pub fn read(self: &Arc<Self>, device: &Device, block: u64) -> Result<Buf, Error> {
        let id = self.acquire(device, block)?;

        let needs_read = {
            let inner = self.lock();
            inner.slots[id].state == BufferState::AccessEmpty
        };

        if !needs_read {
            device.stats.lock().record_read_hit();
            return Ok(Buf { cache: self.clone(), id });
        }

        device.stats.lock().record_read_miss();

        #[cfg(feature = "read-ahead")]
        self.maybe_schedule_read_ahead(device, block);

        match self.issue_read(device, id, block) {
            Ok(()) => {
                {
                    let mut inner = self.lock();
                    inner.slots[id].state = BufferState::AccessCached;
                }
                self.waiters.transfer.wake_all();
                device.stats.lock().record_read(1, false);
                Ok(Buf { cache: self.clone(), id })
            }
            Err(e) => {
                {
                    let mut inner = self.lock();
                    inner.dec_group_user(id);
                    inner.discard(id);
                }
                self.waiters.transfer.wake_all();
                self.waiters.access.wake_all();
                self.waiters.buffer.wake_all();
                device.stats.lock().record_read(1, true);
                Err(e)
            }
        }
    }

    /// Issues a single-block synchronous read request for `id` (spec.md
    /// §4.7), blocking the calling thread on its completion.
    pub(crate) fn issue_read(self: &Arc<Self>, device: &Device, id: usize, block: u64) -> Result<(), Error> {
        let media_block = device.to_media_block(block);

        let data: &'static mut [u8] = {
            let mut inner = self.lock();
            inner.slots[id].state = BufferState::Transfer;
            let offset = inner.slots[id].mem_offset;
            let len = inner.slots[id].mem_len;
            // Safe because a buffer in `Transfer` has exactly one active
            // reference to its memory region — this call's — until the
            // driver signals completion and the state moves on.
            unsafe { std::slice::from_raw_parts_mut(inner.pool.storage.as_mut_ptr().add(offset), len) }
        };

        let len = data.len();
        let mut entries = SmallVec::new();
        entries.push(ScatterEntry { media_block, len, data, buf: id, had_waiters: false });
        let (request, completion) = TransferRequest::new(TransferOp::Read, entries);

        device.driver.submit(request);
        completion.wait()
    }

    /// `peek(device, block, count)` (spec.md §4.3): advisory read-ahead
    /// scheduling, overriding any linear trigger.
    #[cfg(feature = "read-ahead")]
    pub fn peek(self: &Arc<Self>, device: &Device, block: u64, count: usize) -> Result<(), Error> {
        if self.config.max_read_ahead_blocks == 0 || count == 0 {
            return Ok(());
        }

        {
            let mut ra = device.read_ahead.lock();
            ra.next = block;
            ra.count = count.min(self.config.max_read_ahead_blocks);
        }
        device.stats.lock().record_read_ahead_peek();
        self.schedule_read_ahead(device);
        Ok(())
    }
}
