//! Swapout engine (spec.md §4.6): the main swapout thread drains the
//! modified/sync lists into ordered transfer batches, optionally handing
//! each batch to a worker thread, and applies completion handling.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;

use crate::buffer::BufferState;
use crate::cache::{Cache, Inner, SyncScope};
use crate::device::{Device, DriverCaps, IoctlArg, IoctlCode};
use crate::error::{fatal, Error, FatalCode};
use crate::transfer::{Completion, ScatterEntry, TransferOp, TransferRequest};

/// A batch of same-device, block-ordered transfers ready to submit.
struct PendingBatch {
    device: Device,
    ids: Vec<usize>,
    request: TransferRequest,
    completion: Completion,
    /// Spec.md §4.6: batches touched by an active sync always run on the
    /// main thread, since the sync requester is signaled from there.
    is_sync: bool,
}

/// Spawns the main swapout thread and its worker pool (spec.md §4.6,
/// Design Notes §9's task+channel delegation). Workers share one bounded
/// MPMC channel rather than the source's per-worker channel + free-list —
/// `crossbeam-channel` already gives every idle worker first crack at the
/// next batch, which is the same load-balancing the free-list produced.
pub(crate) fn spawn(cache: &Arc<Cache>) {
    let worker_count = cache.config.swapout_workers;
    let (tx, rx) = crossbeam_channel::bounded::<PendingBatch>(worker_count.max(1));

    for idx in 0..worker_count {
        let worker_rx = rx.clone();
        let worker_cache = cache.clone();
        std::thread::Builder::new()
            .name(format!("bcache-swapout-worker-{idx}"))
            .stack_size(cache.config.task_stack_size)
            .spawn(move || worker_loop(worker_cache, worker_rx))
            .expect("failed to spawn swapout worker thread");
    }
    drop(rx);

    let main_cache = cache.clone();
    std::thread::Builder::new()
        .name("bcache-swapout".into())
        .stack_size(cache.config.task_stack_size)
        .spawn(move || main_loop(main_cache, tx, worker_count))
        .expect("failed to spawn swapout thread");
}

fn worker_loop(cache: Arc<Cache>, rx: crossbeam_channel::Receiver<PendingBatch>) {
    while let Ok(batch) = rx.recv() {
        execute_batch(&cache, batch);
    }
}

fn main_loop(cache: Arc<Cache>, tx: crossbeam_channel::Sender<PendingBatch>, worker_count: usize) {
    loop {
        {
            let mut woken = cache.swapout_wake_lock.lock();
            if !*woken {
                cache.swapout_wake.wait_for(&mut woken, cache.config.swapout_period);
            }
            *woken = false;
        }

        loop {
            let batches = build_batches(&cache);
            if batches.is_empty() {
                break;
            }
            for batch in batches {
                if batch.is_sync || worker_count == 0 {
                    execute_batch(&cache, batch);
                } else if tx.send(batch).is_err() {
                    break;
                }
            }
        }
    }
}

/// One full scan of the sync and modified lists (spec.md §4.6 step 2),
/// producing every batch that's currently eligible, grouped by device and
/// ordered by ascending block number.
fn build_batches(cache: &Arc<Cache>) -> Vec<PendingBatch> {
    let mut inner = cache.lock();

    let sync_active = inner.sync_state.active;
    let scope = inner.sync_state.scope;
    let force_all = cache.waiters.buffer.waiting() > 0;
    let now = Instant::now();

    let matches_scope = |device: u32| match scope {
        Some(SyncScope::All) => true,
        Some(SyncScope::Device(d)) => d == device,
        None => false,
    };

    let from_sync_list: HashSet<usize> = inner.sync_list.iter(&inner.slots).collect();
    let mut pending: Vec<usize> = from_sync_list.iter().copied().collect();

    for id in inner.modified.iter(&inner.slots).collect::<SmallVec<[usize; 64]>>() {
        let device = inner.slots[id].device;
        let forced = (sync_active && matches_scope(device)) || force_all;
        let eligible = forced
            || match inner.slots[id].hold_until {
                Some(deadline) => now >= deadline,
                None => true,
            };
        if eligible {
            pending.push(id);
        }
    }

    if pending.is_empty() {
        return Vec::new();
    }

    let mut batches = Vec::new();
    while !pending.is_empty() {
        let device_id = inner.slots[pending[0]].device;

        let mut same_device = Vec::new();
        let mut rest = Vec::new();
        for id in pending.drain(..) {
            if inner.slots[id].device == device_id && same_device.len() < cache.config.max_write_blocks {
                same_device.push(id);
            } else {
                rest.push(id);
            }
        }
        pending = rest;
        same_device.sort_by_key(|&id| inner.slots[id].block);

        let Some(device) = cache.devices.by_id(device_id) else {
            // Device vanished underneath us (should not happen; devices are
            // never removed while buffers reference them). Drop silently.
            continue;
        };
        let multisector = device.capabilities().contains(DriverCaps::MULTISECTOR_CONT);

        for run in split_contiguous_runs(&inner, &same_device, multisector) {
            if run.is_empty() {
                continue;
            }
            let is_sync = (sync_active && matches_scope(device_id)) || run.iter().any(|id| from_sync_list.contains(id));
            batches.push(start_batch(&mut inner, &device, run, is_sync));
        }
    }

    batches
}

/// Splits a block-ordered, same-device run into contiguous sub-runs when
/// the driver advertises `MULTISECTOR_CONT` (spec.md §4.6, §4.7).
fn split_contiguous_runs(inner: &Inner, ids: &[usize], multisector: bool) -> Vec<Vec<usize>> {
    if !multisector {
        return vec![ids.to_vec()];
    }

    let mut runs = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut expect_next: Option<u64> = None;

    for &id in ids {
        let block = inner.slots[id].block;
        if expect_next.is_some_and(|exp| exp != block) {
            runs.push(std::mem::take(&mut current));
        }
        expect_next = Some(block + 1);
        current.push(id);
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

/// Transitions every id in `ids` to `TRANSFER` and builds the request to
/// submit for them. Called with the cache lock held.
fn start_batch(inner: &mut Inner, device: &Device, ids: Vec<usize>, is_sync: bool) -> PendingBatch {
    let mut entries = SmallVec::new();

    for &id in &ids {
        match inner.slots[id].state {
            BufferState::Modified => inner.modified.remove(&mut inner.slots, id),
            BufferState::Sync => inner.sync_list.remove(&mut inner.slots, id),
            other => fatal(other, FatalCode::UnexpectedState),
        }
        inner.slots[id].state = BufferState::Transfer;

        let slot = &inner.slots[id];
        let offset = slot.mem_offset;
        let len = slot.mem_len;
        let media_block = device.to_media_block(slot.block);
        // Safe because every id here just left `MODIFIED`/`SYNC` into
        // `TRANSFER`, the only active reference to its memory region until
        // this batch's completion moves it on.
        let data: &'static mut [u8] =
            unsafe { std::slice::from_raw_parts_mut(inner.pool.storage.as_mut_ptr().add(offset), len) };
        entries.push(ScatterEntry { media_block, len, data, buf: id, had_waiters: slot.waiters > 0 });
    }

    let (request, completion) = TransferRequest::new(TransferOp::Write, entries);
    PendingBatch { device: device.clone(), ids, request, completion, is_sync }
}

fn execute_batch(cache: &Arc<Cache>, batch: PendingBatch) {
    let PendingBatch { device, ids, request, completion, is_sync } = batch;
    device.driver.submit(request);
    let result = completion.wait();
    complete_batch(cache, &device, &ids, result, is_sync);

    // Spec.md §4.6: after a syncing batch, nudge a `SYNC`-capable driver
    // with its own device-level sync ioctl. Best-effort — an
    // unimplemented ioctl (the trait's default) is not a transfer error.
    if is_sync && device.capabilities().contains(DriverCaps::SYNC) {
        let _ = device.driver.ioctl(IoctlCode::SyncDevice, IoctlArg::None);
    }
}

/// Completion handling (spec.md §4.6): per entry, drop the group user and
/// move `TRANSFER`/`TRANSFER_PURGED` to its resting state; then wake the
/// right waiter set and, if this batch belonged to an active sync, check
/// whether the sync can now finish.
fn complete_batch(cache: &Arc<Cache>, device: &Device, ids: &[usize], result: Result<(), Error>, is_sync: bool) {
    let mut inner = cache.lock();
    let mut had_waiters = false;

    for &id in ids {
        inner.dec_group_user(id);
        if inner.slots[id].waiters > 0 {
            had_waiters = true;
        }

        match inner.slots[id].state {
            BufferState::Transfer => {
                if result.is_ok() {
                    inner.slots[id].state = BufferState::Cached;
                    inner.lru.push_back(&mut inner.slots, id);
                } else {
                    inner.discard(id);
                }
            }
            BufferState::TransferPurged => {
                inner.discard(id);
            }
            other => fatal(other, FatalCode::UnexpectedState),
        }
    }

    device.stats.lock().record_write(ids.len() as u64, result.is_err());

    if had_waiters {
        cache.waiters.transfer.wake_all();
    } else {
        cache.waiters.buffer.wake_all();
    }

    if is_sync {
        cache.maybe_finish_sync(&mut inner);
    }
}

impl Cache {
    /// Checks whether the active sync (if any) has nothing left to wait
    /// for — no matching entries on the modified/sync lists and no
    /// in-flight transfer for a matching device — and if so clears it and
    /// wakes the `sync_device` requester (spec.md §4.6 "Sync completion").
    pub(crate) fn maybe_finish_sync(&self, inner: &mut Inner) {
        if !inner.sync_state.active {
            return;
        }
        let scope = inner.sync_state.scope;
        let matches_scope = |device: u32| match scope {
            Some(SyncScope::All) => true,
            Some(SyncScope::Device(d)) => d == device,
            None => false,
        };

        let still_pending = inner.modified.iter(&inner.slots).any(|id| matches_scope(inner.slots[id].device))
            || inner.sync_list.iter(&inner.slots).any(|id| matches_scope(inner.slots[id].device))
            || inner
                .slots
                .iter()
                .any(|s| matches!(s.state, BufferState::Transfer | BufferState::TransferPurged) && matches_scope(s.device));

        if !still_pending {
            inner.sync_state.active = false;
            inner.sync_state.scope = None;
            self.sync_done.notify_all();
        }
    }
}
