// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task identity and lifetime.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::Sim;

/// Identity of a spawned task. Generational: once a task exits or is
/// killed, every outstanding id for it goes stale and all operations on it
/// become no-ops.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId {
    pub(crate) index: u32,
    pub(crate) gen: u32,
}

pub(crate) struct Slot {
    pub gen: u32,
    pub fut: Option<Pin<Box<dyn Future<Output = ()>>>>,
    pub running: bool,
    pub killed: bool,
    pub join_waiters: Vec<TaskId>,
}

impl Slot {
    pub fn new() -> Self {
        Self {
            gen: 0,
            fut: None,
            running: false,
            killed: false,
            join_waiters: Vec::new(),
        }
    }
}

/// Owner-side handle to a spawned task.
#[derive(Clone)]
pub struct TaskHandle {
    sim: Sim,
    id: TaskId,
}

impl TaskHandle {
    pub(crate) fn new(sim: Sim, id: TaskId) -> Self {
        Self { sim, id }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Cancels the task. If it is suspended, its future is dropped the
    /// next time a wakeup reaches it; if it is the currently-running task,
    /// it dies when it next suspends. Joiners are released either way.
    pub fn kill(&self) {
        let mut k = self.sim.kernel().borrow_mut();
        let running = match k.tasks.get_mut(self.id.index as usize) {
            Some(slot) if slot.gen == self.id.gen => {
                slot.killed = true;
                slot.running
            }
            _ => return, // already gone
        };
        if !running {
            // Retire it immediately rather than waiting for a stray
            // wakeup that may never come.
            k.retire(self.id);
        }
    }

    pub fn is_done(&self) -> bool {
        let k = self.sim.kernel().borrow();
        match k.tasks.get(self.id.index as usize) {
            Some(slot) => slot.gen != self.id.gen,
            None => true,
        }
    }

    /// Waits until the task has exited (normally or by kill).
    pub fn join(&self) -> JoinWait {
        JoinWait { sim: self.sim.clone(), id: self.id }
    }
}

pub struct JoinWait {
    sim: Sim,
    id: TaskId,
}

impl Future for JoinWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let me = this.sim.current_task();
        let mut k = this.sim.kernel().borrow_mut();
        match k.tasks.get_mut(this.id.index as usize) {
            Some(slot) if slot.gen == this.id.gen => {
                slot.join_waiters.push(me);
                Poll::Pending
            }
            _ => Poll::Ready(()),
        }
    }
}
