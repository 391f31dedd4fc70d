//! Release path (spec.md §4.4): `release`, `release_modified`, `sync`.

use std::sync::Arc;
use std::time::Instant;

use crate::buffer::BufferState;
use crate::cache::{Cache, Inner};
use crate::error::{fatal, Error, FatalCode};
use crate::read::Buf;

impl Cache {
    /// `release(buffer)`: ends a loan without declaring it modified.
    pub fn release(self: &Arc<Self>, buf: Buf) -> Result<(), Error> {
        let id = buf.id;
        let mut inner = self.lock();
        let prior = inner.slots[id].state;

        match prior {
            BufferState::AccessCached => {
                inner.dec_group_user(id);
                inner.slots[id].state = BufferState::Cached;
                inner.lru.push_back(&mut inner.slots, id);
                self.wake_access_or_buffer(&inner);
            }
            BufferState::AccessEmpty | BufferState::AccessPurged => {
                inner.dec_group_user(id);
                inner.discard(id);
                self.waiters.buffer.wake_all();
            }
            BufferState::AccessModified => self.enter_modified(&mut inner, id, prior),
            other => fatal(other, FatalCode::UnexpectedState),
        }

        Ok(())
    }

    /// `release_modified(buffer)`: ends a loan, declaring its contents
    /// dirty.
    pub fn release_modified(self: &Arc<Self>, buf: Buf) -> Result<(), Error> {
        let id = buf.id;
        let mut inner = self.lock();
        let prior = inner.slots[id].state;

        match prior {
            BufferState::AccessCached | BufferState::AccessEmpty | BufferState::AccessModified => {
                self.enter_modified(&mut inner, id, prior)
            }
            BufferState::AccessPurged => {
                inner.dec_group_user(id);
                inner.discard(id);
                self.waiters.buffer.wake_all();
            }
            other => fatal(other, FatalCode::UnexpectedState),
        }

        Ok(())
    }

    /// Shared `MODIFIED`-entry transition for `release(ACCESS_MODIFIED)` and
    /// `release_modified` (spec.md §4.4): drop the group user, start or
    /// preserve the hold timer, append to the modified list, and wake
    /// whichever waiter set can make progress.
    fn enter_modified(&self, inner: &mut Inner, id: usize, prior: BufferState) {
        inner.dec_group_user(id);
        if prior != BufferState::AccessModified {
            inner.slots[id].hold_until = Some(Instant::now() + self.config.swap_block_hold);
        }
        inner.slots[id].state = BufferState::Modified;
        inner.modified.push_back(&mut inner.slots, id);

        if self.waiters.access.waiting() > 0 {
            self.waiters.access.wake_all();
        } else {
            self.wake_swapout();
        }
    }

    fn wake_access_or_buffer(&self, inner: &Inner) {
        let _ = inner;
        if self.waiters.access.waiting() > 0 {
            self.waiters.access.wake_all();
        } else {
            self.waiters.buffer.wake_all();
        }
    }

    /// `sync(buffer)`: force this specific buffer to `CACHED`/`EMPTY`/
    /// `MODIFIED` immediately rather than waiting for the swapout timer,
    /// blocking until it gets there (spec.md §4.4).
    pub fn sync(self: &Arc<Self>, buf: Buf) -> Result<(), Error> {
        let id = buf.id;
        let mut inner = self.lock();
        let prior = inner.slots[id].state;

        if prior == BufferState::AccessPurged {
            inner.dec_group_user(id);
            inner.discard(id);
            self.waiters.buffer.wake_all();
            return Ok(());
        }

        if !prior.is_access() {
            fatal(prior, FatalCode::UnexpectedState);
        }

        inner.slots[id].state = BufferState::Sync;
        inner.sync_list.push_back(&mut inner.slots, id);
        self.waiters.access.wake_all();
        self.wake_swapout();

        loop {
            self.waiters.transfer.wait(&mut inner);
            if matches!(inner.slots[id].state, BufferState::Cached | BufferState::Empty | BufferState::Modified) {
                break;
            }
        }

        if inner.slots[id].state == BufferState::Empty {
            inner.index.remove(&mut inner.slots, id);
            inner.free(id);
            self.waiters.buffer.wake_all();
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::CacheConfig;
    use crate::device::{BlockDriver, DriverCaps};
    use crate::transfer::{TransferOp, TransferRequest};
    use std::sync::Mutex as StdMutex;

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

    fn cache_with(buffer_min: usize, buffer_max: usize, total: usize) -> Arc<Cache> {
        Cache::new(CacheConfig { size: total, buffer_min, buffer_max, swapout_period: std::time::Duration::from_millis(20), ..Default::default() }).unwrap()
    }

    #[test]
    fn write_then_sync_reaches_driver() {
        let cache = cache_with(512, 512, 8192);
        let driver = Arc::new(MemDriver::new(1024, 512));
        let dev = cache.device_create("d0", 512, 1024, driver.clone()).unwrap();

        let buf = cache.get(&dev, 20).unwrap();
        buf.as_mut_slice().fill(b'B');
        cache.release_modified(buf).unwrap();

        assert_eq!(driver.backing.lock().unwrap()[20 * 512], 0);

        let buf = cache.get(&dev, 20).unwrap();
        cache.sync(buf).unwrap();

        assert_eq!(driver.backing.lock().unwrap()[20 * 512], b'B');
        assert_eq!(dev.stats.lock().write_blocks, 1);
    }

    #[test]
    fn release_unmodified_returns_to_lru() {
        let cache = cache_with(512, 512, 8192);
        let driver = Arc::new(MemDriver::new(4, 512));
        let dev = cache.device_create("d0", 512, 4, driver).unwrap();

        let buf = cache.read(&dev, 0).unwrap();
        cache.release(buf).unwrap();

        let inner = cache.lock();
        assert_eq!(inner.lru.len(), inner.pool.active_buffer_count());
    }
}
