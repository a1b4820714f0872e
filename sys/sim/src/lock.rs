// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cooperative mutex for the simulation domain.
//!
//! This is not a memory-safety lock -- everything here is single-threaded.
//! It serializes *protocol* access: one in-flight read per master
//! direction, one in-flight write, the way a driver serializes callers of
//! a shared peripheral. `release` broadcasts to all waiters (see the
//! queue module for why); the first one to run re-takes the lock and the
//! rest re-park.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::{Sim, TaskId};

#[derive(Clone)]
pub struct Lock {
    sim: Sim,
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    held: bool,
    waiters: Vec<TaskId>,
}

impl Lock {
    pub(crate) fn new(sim: Sim) -> Self {
        Self {
            sim,
            inner: Rc::new(RefCell::new(Inner {
                held: false,
                waiters: Vec::new(),
            })),
        }
    }

    pub fn acquire(&self) -> AcquireWait {
        AcquireWait { lock: self.clone() }
    }

    pub fn release(&self) {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            assert!(inner.held, "release of a lock that is not held");
            inner.held = false;
            std::mem::take(&mut inner.waiters)
        };
        for id in waiters {
            self.sim.wake_task(id);
        }
    }
}

pub struct AcquireWait {
    lock: Lock,
}

impl Future for AcquireWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let mut inner = this.lock.inner.borrow_mut();
        if inner.held {
            let me = this.lock.sim.current_task();
            inner.waiters.push(me);
            Poll::Pending
        } else {
            inner.held = true;
            Poll::Ready(())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Sim;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn lock_serializes_critical_sections() {
        let sim = Sim::new();
        let lock = sim.lock();
        let trace = Rc::new(RefCell::new(Vec::new()));

        for name in ["a", "b"] {
            let s = sim.clone();
            let lock = lock.clone();
            let trace = Rc::clone(&trace);
            sim.spawn(async move {
                lock.acquire().await;
                trace.borrow_mut().push(format!("{name} in"));
                s.delay_ns(10).await;
                trace.borrow_mut().push(format!("{name} out"));
                lock.release();
            });
        }
        sim.run();
        let trace = trace.borrow();
        assert_eq!(
            *trace,
            vec!["a in", "a out", "b in", "b out"],
            "sections must not interleave"
        );
    }
}
