//! Waiter sets (spec.md §3, §5): named wait queues bound to the cache lock.
//!
//! Each wait increments a counter under the lock, sleeps on a `Condvar`
//! bound to that same lock (releasing it across the wait), and rechecks on
//! wake. `wake` is always a broadcast — every current waiter reevaluates
//! its own condition, matching Design Notes §9's "condition-style
//! primitive... counter remains because broadcasts are used to wake all
//! rechecking waiters."

use parking_lot::{Condvar, MutexGuard};

/// One named wait queue. Carries no data of its own beyond the live waiter
/// count; the condition being waited for lives in the caller's guarded
/// state.
#[derive(Default)]
pub struct Waiter {
    condvar: Condvar,
    count: std::cell::Cell<u32>,
}

// `Cell` is only ever touched while the caller holds the cache's `Mutex`
// guard, so this is as `Sync` as the lock it's nested under.
unsafe impl Sync for Waiter {}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waiting(&self) -> u32 {
        self.count.get()
    }

    /// Blocks the caller on this waiter set until woken, releasing `guard`
    /// across the sleep and re-acquiring it before returning. Callers must
    /// recheck their condition in a loop (spec.md §4.3's "wait for access"
    /// etc. loops) since wake is a broadcast, not a targeted signal.
    pub fn wait<'a, T>(&self, guard: &mut MutexGuard<'a, T>) {
        self.count.set(self.count.get() + 1);
        self.condvar.wait(guard);
        self.count.set(self.count.get() - 1);
    }

    /// Wakes every current waiter on this set.
    pub fn wake_all(&self) {
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Barrier;

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn wait_releases_lock_and_wakes_on_broadcast() {
        struct State {
            ready: bool,
        }

        let lock = Mutex::new(State { ready: false });
        let waiter = Waiter::new();
        let start = Barrier::new(2);

        std::thread::scope(|s| {
            s.spawn(|| {
                let mut guard = lock.lock();
                start.wait();
                while !guard.ready {
                    waiter.wait(&mut guard);
                }
            });

            start.wait();
            {
                let mut guard = lock.lock();
                guard.ready = true;
            }
            waiter.wake_all();
        });
    }
}
