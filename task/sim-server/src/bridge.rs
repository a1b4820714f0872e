// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cross-thread bridge: operation records and completion events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use task_sim_server_api::{PlatformData, SimResponse};

use crate::interrupt::SimInterrupt;

/// One-shot event with a payload: set once by the simulator thread, waited
/// on (possibly by several threads) in the server domain.
pub struct Completion<T> {
    inner: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        Self { inner: Arc::new((Mutex::new(None), Condvar::new())) }
    }

    /// Publishes the value and releases every waiter. Setting twice keeps
    /// the first value; the pending-request protocol sets exactly once.
    pub fn set(&self, value: T) {
        let (slot, cond) = &*self.inner;
        let mut guard = slot.lock().unwrap();
        if guard.is_none() {
            *guard = Some(value);
        }
        cond.notify_all();
    }

    pub fn try_get(&self) -> Option<T> {
        self.inner.0.lock().unwrap().clone()
    }

    /// Blocks until the value is published.
    pub fn wait(&self) -> T {
        let (slot, cond) = &*self.inner;
        let mut guard = slot.lock().unwrap();
        loop {
            if let Some(value) = guard.as_ref() {
                return value.clone();
            }
            guard = cond.wait(guard).unwrap();
        }
    }

    /// Blocks until the value is published or `stop` is raised. `None`
    /// means the simulation went away before answering.
    pub fn wait_unless_stopped(&self, stop: &AtomicBool) -> Option<T> {
        let (slot, cond) = &*self.inner;
        let mut guard = slot.lock().unwrap();
        loop {
            if let Some(value) = guard.as_ref() {
                return Some(value.clone());
            }
            if stop.load(Ordering::Relaxed) {
                return None;
            }
            let (next, _) = cond
                .wait_timeout(guard, Duration::from_millis(100))
                .unwrap();
            guard = next;
        }
    }
}

/// The status cache: opaque status bytes, published once at simulation
/// start. Requests that arrive earlier park on it.
pub type StatusCache = Completion<Vec<u8>>;

/// A request translated into a plain record the simulator thread can turn
/// into a coroutine locally. Each record carries its completion; the
/// pump's wrapper sets it after the coroutine finishes.
pub enum SimOp {
    WriteMemory {
        addr: u64,
        data: Vec<u8>,
        done: Completion<SimResponse>,
    },
    ReadMemory {
        addr: u64,
        length: u64,
        done: Completion<SimResponse>,
    },
    ReadPlatform {
        addr: u64,
        num_bytes: u32,
        done: Completion<SimResponse>,
    },
    WritePlatform {
        addr: u64,
        data: PlatformData,
        done: Completion<SimResponse>,
    },
    RegisterInterrupt {
        fd: i32,
        watcher: Arc<SimInterrupt>,
        done: Completion<SimResponse>,
    },
    DeregisterInterrupt {
        fd: i32,
        done: Completion<SimResponse>,
    },
    /// Scheduled once, first thing, by the entry function.
    PrefetchStatus { cache: StatusCache },
}

/// Thread-safe FIFO of pending operations. Workers push; the pump drains
/// on its own cadence inside the simulator thread.
#[derive(Default)]
pub struct OpQueue {
    ops: Mutex<VecDeque<SimOp>>,
}

impl OpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, op: SimOp) {
        self.ops.lock().unwrap().push_back(op);
    }

    /// Takes everything queued, preserving submission order.
    pub fn drain(&self) -> Vec<SimOp> {
        self.ops.lock().unwrap().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn completion_releases_every_waiter_with_the_same_value() {
        let c: Completion<Vec<u8>> = Completion::new();
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let c = c.clone();
            waiters.push(thread::spawn(move || c.wait()));
        }
        c.set(vec![0xAB, 0xCD]);
        for w in waiters {
            assert_eq!(w.join().unwrap(), vec![0xAB, 0xCD]);
        }
        // Late waiters see it immediately.
        assert_eq!(c.wait(), vec![0xAB, 0xCD]);
    }

    #[test]
    fn stop_unblocks_an_unanswered_wait() {
        let c: Completion<()> = Completion::new();
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let c2 = c.clone();
        let waiter =
            thread::spawn(move || c2.wait_unless_stopped(&stop2));
        thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn drain_preserves_submission_order() {
        let q = OpQueue::new();
        for addr in [1u64, 2, 3] {
            q.push(SimOp::ReadMemory {
                addr,
                length: 1,
                done: Completion::new(),
            });
        }
        let drained = q.drain();
        let addrs: Vec<u64> = drained
            .iter()
            .map(|op| match op {
                SimOp::ReadMemory { addr, .. } => *addr,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(addrs, vec![1, 2, 3]);
        assert!(q.is_empty());
    }
}
