//! Property-based structural invariants (spec.md §8, invariants 1, 2, 4),
//! checked against the crate's private state directly rather than through
//! the public API.
#![cfg(test)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use proptest::prelude::*;

use crate::buffer::ListMembership;
use crate::cache::Cache;
use crate::config::CacheConfig;
use crate::device::{BlockDriver, DriverCaps};
use crate::index::Key;
use crate::transfer::{TransferOp, TransferRequest};

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

#[derive(Debug, Clone)]
enum Op {
    Get(u64),
    ReleaseClean,
    ReleaseModified,
    Sync,
    SyncDevice,
    Purge,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..8).prop_map(Op::Get),
        Just(Op::ReleaseClean),
        Just(Op::ReleaseModified),
        Just(Op::Sync),
        Just(Op::SyncDevice),
        Just(Op::Purge),
    ]
}

/// Checks invariant 1 (state/list-membership matrix) and invariant 4
/// (at most one index entry per key) against the cache's current state.
fn check_structural_invariants(cache: &Arc<Cache>) -> Result<(), TestCaseError> {
    let inner = cache.lock();

    let lru: HashSet<usize> = inner.lru.iter(&inner.slots).collect();
    let modified: HashSet<usize> = inner.modified.iter(&inner.slots).collect();
    let sync_list: HashSet<usize> = inner.sync_list.iter(&inner.slots).collect();

    for (id, slot) in inner.slots.iter().enumerate() {
        let expected = slot.state.list_membership();
        let actual_lru = lru.contains(&id);
        let actual_modified = modified.contains(&id);
        let actual_sync = sync_list.contains(&id);

        prop_assert_eq!(actual_lru, matches!(expected, ListMembership::Lru), "lru membership mismatch for slot {} in state {:?}", id, slot.state);
        prop_assert_eq!(actual_modified, matches!(expected, ListMembership::Modified), "modified membership mismatch for slot {} in state {:?}", id, slot.state);
        prop_assert_eq!(actual_sync, matches!(expected, ListMembership::Sync), "sync membership mismatch for slot {} in state {:?}", id, slot.state);

        // A buffer is in at most one of the three lists.
        prop_assert!((actual_lru as u8 + actual_modified as u8 + actual_sync as u8) <= 1);
    }

    // Invariant 4: at most one buffer descriptor per (device, block) key,
    // and the index agrees with every indexed slot's own idea of its key.
    let mut seen: HashMap<Key, usize> = HashMap::new();
    let mut indexed_count = 0usize;
    for (id, slot) in inner.slots.iter().enumerate() {
        if !slot.state.is_indexed() {
            continue;
        }
        indexed_count += 1;
        let key = Key { device: slot.device, block: slot.block };
        if let Some(&other) = seen.get(&key) {
            prop_assert!(false, "duplicate index entry for {:?}: slots {} and {}", key, other, id);
        }
        seen.insert(key, id);
        prop_assert_eq!(inner.index.lookup(&inner.slots, key), Some(id));
    }
    prop_assert_eq!(inner.index.len(), indexed_count);

    Ok(())
}

/// Invariant 2 (as realized here): the physical slab never changes size,
/// and no group's current buffer count ever exceeds the group's reserved
/// capacity, regardless of how many times it has been repartitioned.
fn check_slab_invariant(cache: &Arc<Cache>) -> Result<(), TestCaseError> {
    let inner = cache.lock();
    let total = cache.config.total_buffers();
    prop_assert_eq!(inner.slots.len(), total);
    prop_assert_eq!(inner.pool.groups.len() * inner.pool.max_bds_per_group, total);
    for group in &inner.pool.groups {
        prop_assert!(group.bds_per_group <= inner.pool.max_bds_per_group);
        prop_assert!(group.bds_per_group.is_power_of_two());
    }
    Ok(())
}

fn cache_with_driver() -> (Arc<Cache>, Arc<MemDriver>) {
    let cache = Cache::new(CacheConfig {
        size: 8 * 512,
        buffer_min: 512,
        buffer_max: 512,
        swapout_period: Duration::from_secs(3600),
        ..Default::default()
    })
    .unwrap();
    let driver = Arc::new(MemDriver::new(8, 512));
    cache.device_create("d0", 512, 8, driver.clone()).unwrap();
    (cache, driver)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn invariants_hold_after_random_operations(ops in prop::collection::vec(op_strategy(), 1..30)) {
        let (cache, _driver) = cache_with_driver();
        let dev = cache.devices.lookup("d0").unwrap();

        let mut held: Option<crate::read::Buf> = None;

        for op in ops {
            match op {
                Op::Get(block) => {
                    if held.is_none() {
                        if let Ok(buf) = cache.get(&dev, block) {
                            held = Some(buf);
                        }
                    }
                }
                Op::ReleaseClean => {
                    if let Some(buf) = held.take() {
                        let _ = cache.release(buf);
                    }
                }
                Op::ReleaseModified => {
                    if let Some(buf) = held.take() {
                        let _ = cache.release_modified(buf);
                    }
                }
                Op::Sync => {
                    if let Some(buf) = held.take() {
                        let _ = cache.sync(buf);
                    }
                }
                Op::SyncDevice => {
                    if held.is_none() {
                        let _ = cache.sync_device("d0");
                    }
                }
                Op::Purge => {
                    if held.is_none() {
                        let _ = cache.purge_device(&dev);
                    }
                }
            }

            check_structural_invariants(&cache)?;
            check_slab_invariant(&cache)?;
        }

        if let Some(buf) = held.take() {
            let _ = cache.release(buf);
        }
        check_structural_invariants(&cache)?;
    }
}
