// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded FIFO for the simulation domain.
//!
//! Capacity 0 means unbounded. `put` suspends the producer while the queue
//! is full, `get` suspends the consumer while it is empty. Wakeups are
//! broadcast to every parked waiter rather than handed to a single one:
//! waiters can be killed while parked (bus reset kills whole channel
//! tasks), and a wakeup aimed at a corpse must not strand the survivors.
//! The survivors re-check the queue state when they run, so a spurious
//! wake is just a retry.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::{Sim, TaskId};

pub struct Queue<T> {
    sim: Sim,
    inner: Rc<RefCell<Inner<T>>>,
}

struct Inner<T> {
    capacity: usize,
    items: VecDeque<T>,
    putters: Vec<TaskId>,
    getters: Vec<TaskId>,
    /// Bumped by `clear`; a `put` parked across a clear aborts instead of
    /// delivering into the reinitialized queue.
    epoch: u64,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self { sim: self.sim.clone(), inner: Rc::clone(&self.inner) }
    }
}

impl<T> Queue<T> {
    pub(crate) fn new(sim: Sim, capacity: usize) -> Self {
        Self {
            sim,
            inner: Rc::new(RefCell::new(Inner {
                capacity,
                items: VecDeque::new(),
                putters: Vec::new(),
                getters: Vec::new(),
                epoch: 0,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.borrow();
        inner.capacity != 0 && inner.items.len() >= inner.capacity
    }

    /// Suspends until the value is enqueued. If the queue is cleared while
    /// the producer is parked, the put aborts and the value is dropped;
    /// clearing reinitializes a channel, and a transfer from before the
    /// clear must not leak into it.
    pub fn put(&self, value: T) -> PutWait<T> {
        PutWait { queue: self.clone(), value: Some(value), parked_epoch: None }
    }

    /// Suspends until a value is available.
    pub fn get(&self) -> GetWait<T> {
        GetWait { queue: self.clone() }
    }

    /// Non-suspending take.
    pub fn try_get(&self) -> Option<T> {
        let value = self.inner.borrow_mut().items.pop_front();
        if value.is_some() {
            self.wake_putters();
        }
        value
    }

    /// Drops all queued items, aborts parked producers, and releases
    /// parked consumers to re-park against the emptied queue. Used by bus
    /// reset to reinitialize a channel.
    pub fn clear(&self) {
        let (putters, getters) = {
            let mut inner = self.inner.borrow_mut();
            inner.items.clear();
            inner.epoch += 1;
            (
                std::mem::take(&mut inner.putters),
                std::mem::take(&mut inner.getters),
            )
        };
        for id in putters.into_iter().chain(getters) {
            self.sim.wake_task(id);
        }
    }

    fn wake_putters(&self) {
        let putters = std::mem::take(&mut self.inner.borrow_mut().putters);
        for id in putters {
            self.sim.wake_task(id);
        }
    }

    fn wake_getters(&self) {
        let getters = std::mem::take(&mut self.inner.borrow_mut().getters);
        for id in getters {
            self.sim.wake_task(id);
        }
    }
}

pub struct PutWait<T> {
    queue: Queue<T>,
    value: Option<T>,
    parked_epoch: Option<u64>,
}

// No self-references; the pending value is only ever moved by value.
impl<T> Unpin for PutWait<T> {}

impl<T> Future for PutWait<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.value.is_none() {
            return Poll::Ready(());
        }
        {
            let mut inner = this.queue.inner.borrow_mut();
            if let Some(parked) = this.parked_epoch {
                if parked != inner.epoch {
                    // Cleared while we were parked: abort the put.
                    this.value = None;
                    return Poll::Ready(());
                }
            }
            let full =
                inner.capacity != 0 && inner.items.len() >= inner.capacity;
            if full {
                let me = this.queue.sim.current_task();
                this.parked_epoch = Some(inner.epoch);
                inner.putters.push(me);
                return Poll::Pending;
            }
            let value = this.value.take().unwrap();
            inner.items.push_back(value);
        }
        this.queue.wake_getters();
        Poll::Ready(())
    }
}

pub struct GetWait<T> {
    queue: Queue<T>,
}

impl<T> Unpin for GetWait<T> {}

impl<T> Future for GetWait<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        let value = this.queue.inner.borrow_mut().items.pop_front();
        match value {
            Some(value) => {
                this.queue.wake_putters();
                Poll::Ready(value)
            }
            None => {
                let me = this.queue.sim.current_task();
                this.queue.inner.borrow_mut().getters.push(me);
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Sim;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn capacity_blocks_producer() {
        let sim = Sim::new();
        let q = sim.queue::<u32>(2);
        let log = Rc::new(RefCell::new(Vec::new()));

        let qp = q.clone();
        let logp = Rc::clone(&log);
        sim.spawn(async move {
            for i in 0..4 {
                qp.put(i).await;
                logp.borrow_mut().push(format!("put {i}"));
            }
        });
        let qc = q.clone();
        let s = sim.clone();
        let logc = Rc::clone(&log);
        sim.spawn(async move {
            // Let the producer run into the bound first.
            s.delay_ns(10).await;
            for _ in 0..4 {
                let v = qc.get().await;
                logc.borrow_mut().push(format!("got {v}"));
            }
        });
        sim.run();
        let log = log.borrow();
        // Exactly two puts land before the consumer starts draining.
        assert_eq!(log[0], "put 0");
        assert_eq!(log[1], "put 1");
        assert_eq!(log[2], "got 0");
        assert!(log.contains(&"got 3".to_string()));
    }

    #[test]
    fn unbounded_never_blocks() {
        let sim = Sim::new();
        let q = sim.queue::<u32>(0);
        let qp = q.clone();
        sim.spawn(async move {
            for i in 0..100 {
                qp.put(i).await;
            }
            assert_eq!(qp.len(), 100);
        });
        sim.run();
        assert_eq!(q.len(), 100);
    }

    #[test]
    fn clear_aborts_parked_producer() {
        let sim = Sim::new();
        let q = sim.queue::<u32>(1);
        let done = Rc::new(RefCell::new(false));

        let qp = q.clone();
        let done2 = Rc::clone(&done);
        sim.spawn(async move {
            qp.put(1).await;
            qp.put(2).await; // parks: queue is full
            *done2.borrow_mut() = true;
        });
        let qc = q.clone();
        let s = sim.clone();
        sim.spawn(async move {
            s.delay_ns(5).await;
            qc.clear();
        });
        sim.run();
        // The parked put resumes but its value must not land in the
        // reinitialized queue.
        assert!(*done.borrow());
        assert_eq!(q.try_get(), None);
    }
}
