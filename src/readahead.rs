//! Linear read-ahead (spec.md §4.3, feature `read-ahead`).
//!
//! A dedicated thread drains a FIFO queue of devices with pending
//! read-ahead work, each entry describing a contiguous run of blocks to
//! pull in as one batched transfer. Sequential-access detection lives in
//! [`Cache::maybe_schedule_read_ahead`]; `peek` bypasses detection and
//! schedules directly.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::buffer::BufferState;
use crate::cache::Cache;
use crate::device::Device;
use crate::read::Buf;
use crate::transfer::{ScatterEntry, TransferOp, TransferRequest};

pub(crate) fn spawn(cache: &Arc<Cache>) {
    let thread_cache = cache.clone();
    std::thread::Builder::new()
        .name("bcache-read-ahead".into())
        .stack_size(cache.config.task_stack_size)
        .spawn(move || main_loop(thread_cache))
        .expect("failed to spawn read-ahead thread");
}

fn main_loop(cache: Arc<Cache>) {
    loop {
        let device = next_device(&cache);
        service_device(&cache, device);
    }
}

/// Blocks until a device is waiting on the read-ahead chain, then pops it.
fn next_device(cache: &Arc<Cache>) -> Device {
    loop {
        {
            let mut inner = cache.lock();
            if let Some(device) = inner.read_ahead_chain.pop_front() {
                return device;
            }
        }
        let mut woken = cache.read_ahead_wake_lock.lock();
        if !*woken {
            cache.read_ahead_wake.wait(&mut woken);
        }
        *woken = false;
    }
}

/// Services one device's scheduled read-ahead run: acquires every block in
/// range, batches a single transfer for the ones that were actually empty,
/// and releases everything back to the cache (spec.md §4.3).
fn service_device(cache: &Arc<Cache>, device: Device) {
    let (start, count) = {
        let mut ra = device.read_ahead.lock();
        ra.scheduled = false;
        (ra.next, ra.count)
    };
    if count == 0 {
        return;
    }
    let end = (start + count as u64).min(device.block_count());
    if end <= start {
        return;
    }

    let mut resident: SmallVec<[usize; 16]> = SmallVec::new();
    let mut fetch: SmallVec<[usize; 16]> = SmallVec::new();

    for block in start..end {
        let Ok(id) = cache.acquire(&device, block) else { continue };
        let state = cache.lock().slots[id].state;
        if state == BufferState::AccessEmpty {
            fetch.push(id);
        } else {
            resident.push(id);
        }
    }

    for &id in &resident {
        let _ = cache.release(Buf { cache: cache.clone(), id });
    }

    if fetch.is_empty() {
        return;
    }

    let mut entries = SmallVec::new();
    {
        let mut inner = cache.lock();
        for &id in &fetch {
            inner.slots[id].state = BufferState::Transfer;
            let offset = inner.slots[id].mem_offset;
            let len = inner.slots[id].mem_len;
            let media_block = device.to_media_block(inner.slots[id].block);
            // Safe for the same reason as a single-block read: each id just
            // left `ACCESS_EMPTY` into `TRANSFER` under this same lock, with
            // no other holder of its memory region.
            let data: &'static mut [u8] =
                unsafe { std::slice::from_raw_parts_mut(inner.pool.storage.as_mut_ptr().add(offset), len) };
            entries.push(ScatterEntry { media_block, len, data, buf: id, had_waiters: false });
        }
    }

    let (request, completion) = TransferRequest::new(TransferOp::Read, entries);
    device.driver.submit(request);
    let result = completion.wait();

    device.stats.lock().record_read_ahead_transfer();
    device.stats.lock().record_read(fetch.len() as u64, result.is_err());

    match result {
        Ok(()) => {
            {
                let mut inner = cache.lock();
                for &id in &fetch {
                    inner.slots[id].state = BufferState::AccessCached;
                }
            }
            cache.waiters.transfer.wake_all();
            for &id in &fetch {
                let _ = cache.release(Buf { cache: cache.clone(), id });
            }
        }
        Err(_) => {
            {
                let mut inner = cache.lock();
                for &id in &fetch {
                    inner.dec_group_user(id);
                    inner.discard(id);
                }
            }
            cache.waiters.transfer.wake_all();
            cache.waiters.access.wake_all();
            cache.waiters.buffer.wake_all();
        }
    }
}

impl Cache {
    /// Called on every read miss (spec.md §4.3): if `block` matches the
    /// device's linear trigger, schedule the next run and advance the
    /// trigger; otherwise just arm the trigger for the following block.
    pub(crate) fn maybe_schedule_read_ahead(self: &Arc<Self>, device: &Device, block: u64) {
        if self.config.max_read_ahead_blocks == 0 {
            return;
        }

        let hit = {
            let mut ra = device.read_ahead.lock();
            let hit = ra.trigger == Some(block);
            if hit {
                ra.next = block + 1;
                ra.count = self.config.max_read_ahead_blocks;
            }
            ra.trigger = Some(block + 1);
            hit
        };

        if hit {
            self.schedule_read_ahead(device);
        }
    }

    /// Links `device` onto the read-ahead chain if it isn't already pending
    /// (spec.md §3 "read-ahead chain") and wakes the read-ahead thread.
    pub(crate) fn schedule_read_ahead(self: &Arc<Self>, device: &Device) {
        let already_scheduled = {
            let mut ra = device.read_ahead.lock();
            let already = ra.scheduled;
            ra.scheduled = true;
            already
        };
        if already_scheduled {
            return;
        }

        self.lock().read_ahead_chain.push_back(device.clone());
        self.wake_read_ahead();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::CacheConfig;
    use crate::device::{BlockDriver, DriverCaps};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct MemDriver {
        backing: StdMutex<Vec<u8>>,
        block_size: usize,
    }

    impl MemDriver {
        fn new(blocks: usize, block_size: usize) -> Self {
            Self { backing: StdMutex::new(vec![0u8; blocks * block_size]), block_size }
        }
    }

    impl BlockDriver for MemDriver {
        fn capabilities(&self) -> DriverCaps {
            DriverCaps::empty()
        }

        fn submit(&self, mut request: TransferRequest) {
            let mut backing = self.backing.lock().unwrap();
            for entry in request.entries.iter_mut() {
                let off = entry.media_block as usize * self.block_size;
                match request.op {
                    TransferOp::Read => entry.data.copy_from_slice(&backing[off..off + entry.len]),
                    TransferOp::Write => backing[off..off + entry.len].copy_from_slice(entry.data),
                    TransferOp::Sync => {}
                }
            }
            request.complete(Ok(()));
        }
    }

    fn wait_until(mut pred: impl FnMut() -> bool) {
        for _ in 0..200 {
            if pred() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition never became true");
    }

    #[test]
    fn sequential_reads_trigger_one_ahead_transfer() {
        let cache = Cache::new(CacheConfig {
            size: 64 * 1024,
            buffer_min: 512,
            buffer_max: 512,
            max_read_ahead_blocks: 4,
            ..Default::default()
        })
        .unwrap();
        let driver = Arc::new(MemDriver::new(64, 512));
        let dev = cache.device_create("d0", 512, 64, driver).unwrap();

        let buf = cache.read(&dev, 0).unwrap();
        cache.release(buf).unwrap();
        let buf = cache.read(&dev, 1).unwrap();
        cache.release(buf).unwrap();

        wait_until(|| dev.stats.lock().read_ahead_transfers >= 1);
    }

    #[test]
    fn peek_schedules_without_waiting_for_trigger() {
        let cache = Cache::new(CacheConfig {
            size: 64 * 1024,
            buffer_min: 512,
            buffer_max: 512,
            max_read_ahead_blocks: 4,
            ..Default::default()
        })
        .unwrap();
        let driver = Arc::new(MemDriver::new(64, 512));
        let dev = cache.device_create("d0", 512, 64, driver).unwrap();

        cache.peek(&dev, 10, 3).unwrap();
        wait_until(|| dev.stats.lock().read_ahead_transfers >= 1);
        assert_eq!(dev.stats.lock().read_ahead_peeks, 1);
    }
}
