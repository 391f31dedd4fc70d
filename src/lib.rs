//! A shared, write-back block buffer cache for embedded and RTOS-class
//! systems (spec.md).
//!
//! The cache sits between block-oriented callers and a driver layer: it
//! hands out loaned buffers backed by a fixed memory pool, tracks which
//! ones are dirty, and schedules their write-back through a small pool of
//! background threads. A single lock serializes every mutation of shared
//! state; callers never see partial updates. See `DESIGN.md` for how each
//! piece maps back to its source.
//!
//! ```no_run
//! use std::sync::Arc;
//! use bcache::{Cache, CacheConfig};
//!
//! # fn driver() -> Arc<dyn bcache::BlockDriver> { unimplemented!() }
//! let cache = Cache::new(CacheConfig::default()).unwrap();
//! let dev = cache.device_create("disk0", 512, 1_000_000, driver()).unwrap();
//! let buf = cache.read(&dev, 0).unwrap();
//! let _first_byte = buf.as_slice()[0];
//! cache.release(buf).unwrap();
//! ```

mod buffer;
mod cache;
mod config;
mod control;
mod device;
mod error;
mod group;
mod index;
#[cfg(test)]
mod invariants;
mod list;
#[cfg(feature = "read-ahead")]
mod readahead;
mod read;
mod release;
mod stats;
mod swapout;
mod transfer;
mod waiter;

pub use cache::{Cache, SyncScope};
pub use config::CacheConfig;
pub use device::{BlockDriver, Device, DeviceInner, DriverCaps, IoctlArg, IoctlCode};
pub use error::{fatal, Error, FatalCode, FatalReason};
pub use read::Buf;
pub use stats::DeviceStats;
pub use transfer::{ScatterEntry, TransferOp, TransferRequest};
