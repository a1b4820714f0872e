// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt watchers.
//!
//! One watcher per registered client descriptor. The watcher's coroutine
//! lives in the simulator domain and counts rising edges of its interrupt
//! line; the count is read (and cleared) from the server domain. The
//! counter mutex is the only state touched from both sides, and neither
//! side holds it across a suspension or a syscall.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sim::{Signal, Sim};

pub struct SimInterrupt {
    signal_name: String,
    counter: Mutex<u64>,
    enabled: AtomicBool,
    should_exit: AtomicBool,
}

impl SimInterrupt {
    pub fn new(signal_name: &str) -> Self {
        Self {
            signal_name: signal_name.to_string(),
            counter: Mutex::new(0),
            enabled: AtomicBool::new(true),
            should_exit: AtomicBool::new(false),
        }
    }

    pub fn signal_name(&self) -> &str {
        &self.signal_name
    }

    pub fn assert_interrupt(&self) {
        *self.counter.lock().unwrap() += 1;
    }

    /// Count since the last call; clearing and reading are one atomic
    /// step so no edge is lost between them.
    pub fn count_and_clear(&self) -> u64 {
        let mut counter = self.counter.lock().unwrap();
        std::mem::take(&mut *counter)
    }

    pub fn count(&self) -> u64 {
        *self.counter.lock().unwrap()
    }

    /// Disables counting and asks the coroutine to exit at its next
    /// suspension point.
    pub fn deregister(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.should_exit.store(true, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::Relaxed)
    }
}

/// The watcher coroutine. Spawned (and killed) by the request pump in the
/// simulator domain.
pub async fn watch(sim: Sim, line: Signal, int: Arc<SimInterrupt>) {
    while !int.should_exit() {
        sim.rising_edge(line).await;
        if int.enabled() {
            int.assert_interrupt();
        }
    }
}

/// Client descriptor to watcher registry, owned by the server domain.
#[derive(Default)]
pub struct InterruptMap {
    map: Mutex<HashMap<i32, Arc<SimInterrupt>>>,
}

impl InterruptMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a watcher for `fd`, returning the one it replaced (if
    /// any) so the caller can deregister it.
    pub fn insert(
        &self,
        fd: i32,
        watcher: Arc<SimInterrupt>,
    ) -> Option<Arc<SimInterrupt>> {
        self.map.lock().unwrap().insert(fd, watcher)
    }

    pub fn remove(&self, fd: i32) -> Option<Arc<SimInterrupt>> {
        self.map.lock().unwrap().remove(&fd)
    }

    pub fn get(&self, fd: i32) -> Option<Arc<SimInterrupt>> {
        self.map.lock().unwrap().get(&fd).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_clears_on_read() {
        let int = SimInterrupt::new("ext_intr_PE_0_0");
        for _ in 0..5 {
            int.assert_interrupt();
        }
        assert_eq!(int.count_and_clear(), 5);
        assert_eq!(int.count_and_clear(), 0);
    }

    #[test]
    fn reregistration_returns_the_old_watcher() {
        let map = InterruptMap::new();
        let first = Arc::new(SimInterrupt::new("ext_intr_PE_0_0"));
        let second = Arc::new(SimInterrupt::new("ext_intr_PE_1_0"));
        assert!(map.insert(7, Arc::clone(&first)).is_none());
        let replaced = map.insert(7, Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert_eq!(
            map.get(7).unwrap().signal_name(),
            "ext_intr_PE_1_0"
        );
        assert!(map.remove(7).is_some());
        assert!(map.remove(7).is_none());
    }

    #[test]
    fn deregistered_watcher_stops_counting() {
        let int = SimInterrupt::new("ext_intr_PE_0_0");
        int.assert_interrupt();
        int.deregister();
        assert!(int.should_exit());
        assert!(!int.enabled());
        // The coroutine checks `enabled` before counting; emulate it.
        if int.enabled() {
            int.assert_interrupt();
        }
        assert_eq!(int.count(), 1);
    }
}
