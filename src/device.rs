//! Device descriptors, the driver callback trait, and the process-wide
//! device registry (spec.md §3, §6).

use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::error::Error;
use crate::stats::DeviceStats;
use crate::transfer::TransferRequest;

bitflags! {
    /// Capability flags a driver advertises (spec.md §6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverCaps: u32 {
        /// Driver prefers contiguous multi-sector requests and will flush
        /// rather than accept a gap in a batch.
        const MULTISECTOR_CONT = 1 << 0;
        /// Driver supports an explicit device-level sync ioctl.
        const SYNC = 1 << 1;
    }
}

/// ioctl request codes (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCode {
    GetMediaBlockSize,
    GetBlockSize,
    SetBlockSize,
    GetSize,
    SyncDevice,
    Deleted,
    Capabilities,
    GetDiskDev,
    PurgeDevice,
    GetDevStats,
    ResetDevStats,
}

/// Argument/result payload for [`BlockDriver::ioctl`].
#[derive(Debug, Clone)]
pub enum IoctlArg {
    None,
    U64(u64),
    Caps(DriverCaps),
    Stats(DeviceStats),
}

/// The driver callback contract (spec.md §6, §4.7).
///
/// `submit` must invoke the request's completion exactly once, from any
/// context — see [`crate::transfer::TransferRequest::complete`].
pub trait BlockDriver: Send + Sync {
    fn capabilities(&self) -> DriverCaps;

    /// Submits a transfer request. Must call `request.complete(status)`
    /// exactly once before returning or from another thread later.
    fn submit(&self, request: TransferRequest);

    fn ioctl(&self, code: IoctlCode, arg: IoctlArg) -> Result<IoctlArg, Error> {
        let _ = (code, arg);
        Err(Error::InvalidArgument("driver does not implement this ioctl"))
    }
}

/// Read-ahead bookkeeping for one device (spec.md §4.3).
#[cfg(feature = "read-ahead")]
#[derive(Debug, Clone, Copy)]
pub struct ReadAheadState {
    /// Block at which crossing triggers the next read-ahead. `None` is the
    /// "no trigger" sentinel (spec.md §4.3).
    pub trigger: Option<u64>,
    pub next: u64,
    pub count: usize,
    /// True while this device is linked into the read-ahead chain awaiting
    /// service.
    pub scheduled: bool,
}

#[cfg(feature = "read-ahead")]
impl Default for ReadAheadState {
    fn default() -> Self {
        Self { trigger: None, next: 0, count: 0, scheduled: false }
    }
}

/// A device or a logical window into one (spec.md §3).
pub struct DeviceInner {
    pub id: u32,
    pub name: String,
    /// `None` for a physical device (self); `Some` for a logical window.
    pub physical: Option<Arc<DeviceInner>>,
    pub start_offset: u64,
    pub length: u64,
    pub media_block_size: u32,
    pub driver: Arc<dyn BlockDriver>,

    pub block_size: std::sync::atomic::AtomicU32,
    pub block_size_shift: std::sync::atomic::AtomicU32,
    pub media_blocks_per_block: std::sync::atomic::AtomicU64,
    /// `-1` sentinel (stored as `i32`) when the ratio isn't a clean power
    /// of two (spec.md §3, Open Question in §9).
    pub block_to_media_block_shift: std::sync::atomic::AtomicI32,
    pub bds_per_group: std::sync::atomic::AtomicUsize,

    pub stats: Mutex<DeviceStats>,

    #[cfg(feature = "read-ahead")]
    pub read_ahead: Mutex<ReadAheadState>,
}

pub type Device = Arc<DeviceInner>;

impl DeviceInner {
    pub fn block_size(&self) -> u32 {
        self.block_size.load(AtomicOrdering::Acquire)
    }

    pub fn block_size_shift(&self) -> u32 {
        self.block_size_shift.load(AtomicOrdering::Acquire)
    }

    pub fn media_blocks_per_block(&self) -> u64 {
        self.media_blocks_per_block.load(AtomicOrdering::Acquire)
    }

    /// Total number of logical blocks addressable on this device.
    pub fn block_count(&self) -> u64 {
        self.length / self.media_blocks_per_block().max(1)
    }

    pub fn validate_block(&self, block: u64) -> Result<(), Error> {
        if block >= self.block_count() {
            return Err(Error::InvalidArgument("block number out of range"));
        }
        Ok(())
    }

    /// Converts a logical block to its starting media block.
    pub fn to_media_block(&self, block: u64) -> u64 {
        self.start_offset + block * self.media_blocks_per_block()
    }

    pub fn capabilities(&self) -> DriverCaps {
        self.driver.capabilities()
    }
}

fn log2_exact(value: u32) -> Option<u32> {
    if value.is_power_of_two() {
        Some(value.trailing_zeros())
    } else {
        None
    }
}

/// Process-wide registry mapping device names (and ids) to descriptors
/// (spec.md §6).
#[derive(Default)]
pub struct DeviceRegistry {
    inner: Mutex<std::collections::HashMap<String, Device>>,
    by_id: Mutex<std::collections::HashMap<u32, Device>>,
    next_id: AtomicU32,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(std::collections::HashMap::new()),
            by_id: Mutex::new(std::collections::HashMap::new()),
            next_id: AtomicU32::new(0),
        }
    }

    /// Creates and registers a physical device (spec.md §6:
    /// `device_create`). `media_block_size` must be a positive power of
    /// two and `media_block_count` must be positive; `name` must be
    /// unique among currently-registered devices.
    pub fn device_create(
        &self,
        name: impl Into<String>,
        media_block_size: u32,
        media_block_count: u64,
        driver: Arc<dyn BlockDriver>,
        bds_per_group: usize,
    ) -> Result<Device, Error> {
        let name = name.into();

        if media_block_size == 0 || !media_block_size.is_power_of_two() {
            return Err(Error::InvalidArgument("media_block_size must be a positive power of two"));
        }
        if media_block_count == 0 {
            return Err(Error::InvalidArgument("media_block_count must be positive"));
        }

        let mut registry = self.inner.lock();
        if registry.contains_key(&name) {
            return Err(Error::AlreadyExists(name));
        }

        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let shift = log2_exact(media_block_size).unwrap();

        let device = Arc::new(DeviceInner {
            id,
            name: name.clone(),
            physical: None,
            start_offset: 0,
            length: media_block_count,
            media_block_size,
            driver,
            block_size: std::sync::atomic::AtomicU32::new(media_block_size),
            block_size_shift: std::sync::atomic::AtomicU32::new(shift),
            media_blocks_per_block: std::sync::atomic::AtomicU64::new(1),
            block_to_media_block_shift: std::sync::atomic::AtomicI32::new(0),
            bds_per_group: std::sync::atomic::AtomicUsize::new(bds_per_group),
            stats: Mutex::new(DeviceStats::default()),
            #[cfg(feature = "read-ahead")]
            read_ahead: Mutex::new(ReadAheadState::default()),
        });

        registry.insert(name, device.clone());
        self.by_id.lock().insert(id, device.clone());
        tracing::debug!(device = %device.name, id, "device registered");
        Ok(device)
    }

    pub fn lookup(&self, name: &str) -> Result<Device, Error> {
        self.inner.lock().get(name).cloned().ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn by_id(&self, id: u32) -> Option<Device> {
        self.by_id.lock().get(&id).cloned()
    }

    pub fn remove(&self, name: &str) -> Result<(), Error> {
        let device = self.inner.lock().remove(name).ok_or_else(|| Error::NotFound(name.to_string()))?;
        self.by_id.lock().remove(&device.id);
        Ok(())
    }
}

/// Recomputes `media_blocks_per_block` and `block_to_media_block_shift` for
/// a new logical block size (spec.md §4.8, `set_block_size`).
pub fn apply_block_size(device: &DeviceInner, size: u32) -> Result<(), Error> {
    if size == 0 {
        return Err(Error::InvalidArgument("block size must be positive"));
    }
    if size % device.media_block_size != 0 {
        return Err(Error::InvalidArgument("block size must be a multiple of the media block size"));
    }

    let ratio = size / device.media_block_size;
    let shift = log2_exact(ratio).map(|s| s as i32).unwrap_or(-1);

    device.block_size.store(size, AtomicOrdering::Release);
    device.media_blocks_per_block.store(ratio as u64, AtomicOrdering::Release);
    device.block_to_media_block_shift.store(shift, AtomicOrdering::Release);
    device.block_size_shift.store(log2_exact(size).unwrap_or(0), AtomicOrdering::Release);

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transfer::TransferRequest;

    struct NullDriver;
    impl BlockDriver for NullDriver {
        fn capabilities(&self) -> DriverCaps {
            DriverCaps::empty()
        }
        fn submit(&self, request: TransferRequest) {
            request.complete(Ok(()));
        }
    }

    #[test]
    fn device_create_rejects_non_power_of_two_media_block_size() {
        let registry = DeviceRegistry::new();
        let err = registry.device_create("d0", 500, 1024, Arc::new(NullDriver), 8).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn device_create_rejects_duplicate_names() {
        let registry = DeviceRegistry::new();
        registry.device_create("d0", 512, 1024, Arc::new(NullDriver), 8).unwrap();
        let err = registry.device_create("d0", 512, 1024, Arc::new(NullDriver), 8).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn block_count_boundary_matches_spec() {
        let registry = DeviceRegistry::new();
        let dev = registry.device_create("d0", 512, 1024, Arc::new(NullDriver), 8).unwrap();
        assert!(dev.validate_block(1023).is_ok());
        assert!(dev.validate_block(1024).is_err());
    }

    #[test]
    fn apply_block_size_sets_minus_one_sentinel_for_non_power_of_two_ratio() {
        let registry = DeviceRegistry::new();
        let dev = registry.device_create("d0", 512, 1024, Arc::new(NullDriver), 8).unwrap();
        apply_block_size(&dev, 512 * 3).unwrap();
        assert_eq!(dev.block_to_media_block_shift.load(AtomicOrdering::Acquire), -1);
    }
}
