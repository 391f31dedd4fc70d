//! The `Cache`: owns the buffer slab, group pool, index, auxiliary lists,
//! waiter sets, device registry, and swapout/read-ahead machinery, and
//! serializes all of it behind one cache lock (spec.md §2, §5).

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::buffer::{BufferSlot, BufferState, NO_DEVICE};
use crate::config::CacheConfig;
use crate::device::{Device, DeviceInner, DeviceRegistry};
use crate::error::Error;
use crate::group::GroupPool;
use crate::index::BufferIndex;
use crate::list::IntrusiveList;
use crate::waiter::Waiter;

/// Which devices an in-progress sync covers (spec.md §3 "Sync context").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncScope {
    All,
    Device(u32),
}

#[derive(Debug, Default)]
pub struct SyncState {
    pub active: bool,
    pub scope: Option<SyncScope>,
}

impl SyncState {
    pub fn covers(&self, device: u32) -> bool {
        if !self.active {
            return false;
        }
        match self.scope {
            Some(SyncScope::All) => true,
            Some(SyncScope::Device(d)) => d == device,
            None => false,
        }
    }
}

/// Everything the cache lock protects.
pub struct Inner {
    pub slots: Vec<BufferSlot>,
    pub pool: GroupPool,
    pub index: BufferIndex,
    pub lru: IntrusiveList,
    pub modified: IntrusiveList,
    pub sync_list: IntrusiveList,
    pub sync_state: SyncState,
    /// Devices currently scheduled for read-ahead service, in FIFO order
    /// (spec.md §3 "Read-ahead chain"). A plain queue of device handles
    /// stands in for the spec's intrusive list of device descriptors,
    /// since devices here are `Arc`-held handles rather than slab entries
    /// (see DESIGN.md).
    #[cfg(feature = "read-ahead")]
    pub read_ahead_chain: std::collections::VecDeque<Device>,
}

/// The three named waiter sets (spec.md §3, §4.3).
#[derive(Default)]
pub struct Waiters {
    pub access: Waiter,
    pub transfer: Waiter,
    pub buffer: Waiter,
}

/// The shared write-back block buffer cache.
pub struct Cache {
    pub config: CacheConfig,
    pub devices: DeviceRegistry,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) waiters: Waiters,
    /// Held for the whole duration of a `sync_device` call, serializing
    /// concurrent syncs cache-wide (spec.md §5's "sync lock").
    pub(crate) sync_lock: Mutex<()>,
    pub(crate) sync_done: Condvar,
    pub(crate) swapout_wake: Condvar,
    pub(crate) swapout_wake_lock: Mutex<bool>,
    #[cfg(feature = "read-ahead")]
    pub(crate) read_ahead_wake: Condvar,
    #[cfg(feature = "read-ahead")]
    pub(crate) read_ahead_wake_lock: Mutex<bool>,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Result<Arc<Self>, Error> {
        config.validate()?;

        let total = config.total_buffers();
        let max_bds = config.max_bds_per_group();
        let (pool, slots) = GroupPool::new(total, config.buffer_min, max_bds);

        let mut inner = Inner {
            slots,
            pool,
            index: BufferIndex::new(),
            lru: IntrusiveList::new(),
            modified: IntrusiveList::new(),
            sync_list: IntrusiveList::new(),
            sync_state: SyncState::default(),
            #[cfg(feature = "read-ahead")]
            read_ahead_chain: std::collections::VecDeque::new(),
        };

        // Every slot starts `Free` and belongs on the LRU free list.
        for id in 0..inner.slots.len() {
            let list = &mut inner.lru;
            let slots = &mut inner.slots;
            list.push_back(slots, id);
        }

        let cache = Arc::new(Self {
            config,
            devices: DeviceRegistry::new(),
            inner: Mutex::new(inner),
            waiters: Waiters::default(),
            sync_lock: Mutex::new(()),
            sync_done: Condvar::new(),
            swapout_wake: Condvar::new(),
            swapout_wake_lock: Mutex::new(false),
            #[cfg(feature = "read-ahead")]
            read_ahead_wake: Condvar::new(),
            #[cfg(feature = "read-ahead")]
            read_ahead_wake_lock: Mutex::new(false),
        });

        crate::swapout::spawn(&cache);
        #[cfg(feature = "read-ahead")]
        if cache.config.max_read_ahead_blocks > 0 {
            crate::readahead::spawn(&cache);
        }

        Ok(cache)
    }

    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    /// Registers a physical device, computing its initial
    /// buffers-per-group from the pool's current `buffer_max`/`buffer_min`
    /// (spec.md §4.2, §6).
    pub fn device_create(
        &self,
        name: impl Into<String>,
        media_block_size: u32,
        media_block_count: u64,
        driver: Arc<dyn crate::device::BlockDriver>,
    ) -> Result<Device, Error> {
        let bds_per_group = {
            let inner = self.lock();
            let bds = inner.pool.bds_per_group_for(media_block_size as usize);
            if bds == 0 {
                return Err(Error::InvalidArgument("media_block_size exceeds buffer_max"));
            }
            bds
        };

        self.devices.device_create(name, media_block_size, media_block_count, driver, bds_per_group)
    }

    pub(crate) fn wake_swapout(&self) {
        *self.swapout_wake_lock.lock() = true;
        self.swapout_wake.notify_all();
    }

    #[cfg(feature = "read-ahead")]
    pub(crate) fn wake_read_ahead(&self) {
        *self.read_ahead_wake_lock.lock() = true;
        self.read_ahead_wake.notify_all();
    }
}

impl Inner {
    /// Discards a buffer: transitions it to `Empty`; if nobody is waiting
    /// on it, removes it from the index and returns it to the LRU free
    /// list (spec.md §4.4 "Discard").
    pub fn discard(&mut self, id: usize) {
        let had_waiters = self.slots[id].waiters > 0;
        self.slots[id].state = BufferState::Empty;

        if !had_waiters {
            self.index.remove(&mut self.slots, id);
            self.free(id);
        }
    }

    /// Fully frees a buffer: drops its group-user accounting (if any was
    /// still held), marks it `Free`, clears its device/block identity, and
    /// appends it to the LRU free list.
    pub fn free(&mut self, id: usize) {
        self.slots[id].state = BufferState::Free;
        self.slots[id].device = NO_DEVICE;
        self.slots[id].block = 0;
        self.lru.push_back(&mut self.slots, id);
    }

    pub fn group_of(&self, id: usize) -> usize {
        self.slots[id].group
    }

    pub fn inc_group_user(&mut self, id: usize) {
        let g = self.slots[id].group;
        self.pool.groups[g].users += 1;
    }

    pub fn dec_group_user(&mut self, id: usize) {
        let g = self.slots[id].group;
        self.pool.groups[g].users -= 1;
    }
}
