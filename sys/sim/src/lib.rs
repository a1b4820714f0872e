// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bindings to the simulator kernel, plus an in-process event kernel.
//!
//! Everything above this crate -- the bus-functional models, the request
//! pump, the interrupt watchers -- consumes exactly the primitive set a
//! cycle-accurate simulator offers a testbench: named signal handles, edge
//! triggers, a read-only settling phase, timed delays, and cooperative task
//! spawn. This crate pins that surface down and ships a deterministic
//! single-threaded implementation of it, so the bridge runs and its tests
//! execute without a vendor simulator attached. An FFI-backed kernel can
//! replace the implementation behind the same API.
//!
//! # Scheduling model
//!
//! Simulation runs as delta cycles at a fixed timestamp:
//!
//! 1. Every runnable task is polled. Tasks only suspend on the primitives
//!    above, so polling either completes the task or parks it on a trigger.
//! 2. Deferred signal writes (`set`) are applied in one batch. This is the
//!    nonblocking-assignment rule: within a delta, every task observes the
//!    values from before the delta, no matter the polling order. Writes
//!    that cross zero wake edge waiters and open another delta.
//! 3. When no delta makes progress, read-only waiters run against the
//!    settled values.
//! 4. Time advances to the earliest pending timer.
//!
//! `set_now` bypasses step 2 and applies immediately; it exists for driving
//! defaults and reset, where the X-avoidance of an immediate value matters
//! more than delta discipline.
//!
//! # Tasks
//!
//! `spawn` returns a [`TaskHandle`]. Killing a task drops its future at the
//! next suspension point; wakeups aimed at a dead task are discarded via a
//! generation check, so channel tasks can be killed mid-handshake (bus
//! reset does exactly that) without poisoning the waiter lists.

mod lock;
mod queue;
mod task;

pub use lock::Lock;
pub use queue::Queue;
pub use task::{TaskHandle, TaskId};

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

/// Handle to one named signal in the simulated design.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Signal(u32);

struct SignalState {
    name: String,
    width: u32,
    value: u64,
    rising: Vec<TaskId>,
    falling: Vec<TaskId>,
}

pub(crate) struct Kernel {
    signals: Vec<SignalState>,
    names: HashMap<String, Signal>,
    /// Deferred writes for the current delta, applied in submission order
    /// (last write to a signal wins).
    writes: Vec<(Signal, u64)>,
    tasks: Vec<task::Slot>,
    free_slots: Vec<usize>,
    runq: VecDeque<TaskId>,
    timers: BinaryHeap<Reverse<(u64, u64, TaskId)>>,
    timer_seq: u64,
    read_only: Vec<TaskId>,
    next_step: Vec<TaskId>,
    now_ps: u64,
    current: Option<TaskId>,
}

impl Kernel {
    pub(crate) fn wake(&mut self, id: TaskId) {
        // Stale ids are filtered at poll time, not here; this keeps wake
        // O(1) and lets waiter lists hold ids of killed tasks.
        self.runq.push_back(id);
    }

    fn mask(width: u32) -> u64 {
        if width >= 64 {
            !0
        } else {
            (1u64 << width) - 1
        }
    }

    /// Applies `value` to `sig` right now, waking edge waiters on a
    /// zero-crossing. Returns true if any waiter was woken.
    fn commit(&mut self, sig: Signal, value: u64) -> bool {
        let s = &mut self.signals[sig.0 as usize];
        let value = value & Self::mask(s.width);
        let old = s.value;
        if old == value {
            return false;
        }
        s.value = value;
        let woken: Vec<TaskId> = if old == 0 {
            s.rising.drain(..).collect()
        } else if value == 0 {
            s.falling.drain(..).collect()
        } else {
            Vec::new()
        };
        let any = !woken.is_empty();
        for id in woken {
            self.wake(id);
        }
        any
    }

    /// Retires a task slot: wakes joiners and bumps the generation so any
    /// outstanding id for it goes stale.
    pub(crate) fn retire(&mut self, id: TaskId) {
        let slot = &mut self.tasks[id.index as usize];
        slot.fut = None;
        slot.killed = false;
        slot.gen = slot.gen.wrapping_add(1);
        let joiners = std::mem::take(&mut slot.join_waiters);
        self.free_slots.push(id.index as usize);
        for j in joiners {
            self.wake(j);
        }
    }

    /// Write phase: flush all deferred writes. Returns true if anything
    /// was applied (a further delta is then required).
    fn apply_writes(&mut self) -> bool {
        if self.writes.is_empty() {
            return false;
        }
        let writes = std::mem::take(&mut self.writes);
        for (sig, value) in writes {
            self.commit(sig, value);
        }
        true
    }
}

/// Cheap-clone handle to the kernel. One kernel per simulation; the entry
/// function creates it and passes it down explicitly.
#[derive(Clone)]
pub struct Sim {
    k: Rc<RefCell<Kernel>>,
    stop: Arc<AtomicBool>,
}

impl Sim {
    pub fn new() -> Self {
        Self::with_stop_flag(Arc::new(AtomicBool::new(false)))
    }

    /// Builds a kernel that observes an externally-owned stop flag, so a
    /// signal handler or another thread can end the run loop.
    pub fn with_stop_flag(stop: Arc<AtomicBool>) -> Self {
        Self {
            k: Rc::new(RefCell::new(Kernel {
                signals: Vec::new(),
                names: HashMap::new(),
                writes: Vec::new(),
                tasks: Vec::new(),
                free_slots: Vec::new(),
                runq: VecDeque::new(),
                timers: BinaryHeap::new(),
                timer_seq: 0,
                read_only: Vec::new(),
                next_step: Vec::new(),
                now_ps: 0,
                current: None,
            })),
            stop,
        }
    }

    /// Declares a signal. Widths above 64 bits are not representable; the
    /// bus interfaces this bridge drives are 32-bit data / 32-bit address.
    pub fn add_signal(&self, name: &str, width: u32) -> Signal {
        assert!((1..=64).contains(&width), "signal {name}: width {width}");
        let mut k = self.k.borrow_mut();
        assert!(
            !k.names.contains_key(name),
            "signal {name} declared twice"
        );
        let sig = Signal(k.signals.len() as u32);
        k.signals.push(SignalState {
            name: name.to_string(),
            width,
            value: 0,
            rising: Vec::new(),
            falling: Vec::new(),
        });
        k.names.insert(name.to_string(), sig);
        sig
    }

    /// Strongly-typed name lookup; `None` if the design doesn't expose the
    /// signal. This replaces attribute-style probing of the design handle.
    pub fn lookup(&self, name: &str) -> Option<Signal> {
        self.k.borrow().names.get(name).copied()
    }

    pub fn width(&self, sig: Signal) -> u32 {
        self.k.borrow().signals[sig.0 as usize].width
    }

    pub fn signal_name(&self, sig: Signal) -> String {
        self.k.borrow().signals[sig.0 as usize].name.clone()
    }

    pub fn get(&self, sig: Signal) -> u64 {
        self.k.borrow().signals[sig.0 as usize].value
    }

    /// Deferred (nonblocking) write, applied at the end of the current
    /// delta.
    pub fn set(&self, sig: Signal, value: u64) {
        self.k.borrow_mut().writes.push((sig, value));
    }

    /// Immediate write. Edge waiters wake in the current delta.
    pub fn set_now(&self, sig: Signal, value: u64) {
        self.k.borrow_mut().commit(sig, value);
    }

    pub fn now_ps(&self) -> u64 {
        self.k.borrow().now_ps
    }

    pub fn now_ns(&self) -> u64 {
        self.now_ps() / 1000
    }

    pub fn rising_edge(&self, sig: Signal) -> EdgeWait {
        EdgeWait { sim: self.clone(), sig, rising: true, armed: false }
    }

    pub fn falling_edge(&self, sig: Signal) -> EdgeWait {
        EdgeWait { sim: self.clone(), sig, rising: false, armed: false }
    }

    /// Resumes once every write at the current timestamp has settled.
    pub fn read_only(&self) -> ReadOnlyWait {
        ReadOnlyWait { sim: self.clone(), armed: false }
    }

    /// Resumes the first time simulated time advances.
    pub fn next_time_step(&self) -> NextStepWait {
        NextStepWait { sim: self.clone(), armed: false }
    }

    pub fn delay_ns(&self, ns: u64) -> DelayWait {
        self.delay_ps(ns * 1000)
    }

    pub fn delay_ps(&self, ps: u64) -> DelayWait {
        DelayWait { sim: self.clone(), delay_ps: ps, armed: false }
    }

    /// Spawns a cooperative task; it first runs within the current delta.
    pub fn spawn(
        &self,
        fut: impl Future<Output = ()> + 'static,
    ) -> TaskHandle {
        let mut k = self.k.borrow_mut();
        let index = match k.free_slots.pop() {
            Some(index) => index,
            None => {
                k.tasks.push(task::Slot::new());
                k.tasks.len() - 1
            }
        };
        let id = {
            let slot = &mut k.tasks[index];
            slot.fut = Some(Box::pin(fut));
            slot.running = false;
            slot.killed = false;
            TaskId { index: index as u32, gen: slot.gen }
        };
        k.wake(id);
        TaskHandle::new(self.clone(), id)
    }

    pub fn queue<T>(&self, capacity: usize) -> Queue<T> {
        Queue::new(self.clone(), capacity)
    }

    pub fn lock(&self) -> Lock {
        Lock::new(self.clone())
    }

    /// Shareable stop flag; `run` returns once it is set. Safe to hand to
    /// other threads (signal handlers, the request server).
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub(crate) fn current_task(&self) -> TaskId {
        self.k
            .borrow()
            .current
            .expect("kernel primitive awaited outside a simulation task")
    }

    pub(crate) fn wake_task(&self, id: TaskId) {
        self.k.borrow_mut().wake(id);
    }

    /// Drives the kernel until the stop flag is set or no task can ever
    /// run again.
    pub fn run(&self) {
        loop {
            if self.stop_requested() {
                log::debug!("kernel stopped at {} ns", self.now_ns());
                return;
            }
            // Delta: run every runnable task.
            loop {
                let next = self.k.borrow_mut().runq.pop_front();
                match next {
                    Some(id) => self.poll_task(id),
                    None => break,
                }
            }
            if self.stop_requested() {
                return;
            }
            let mut k = self.k.borrow_mut();
            if k.apply_writes() {
                continue;
            }
            if !k.read_only.is_empty() {
                let settled: Vec<TaskId> = k.read_only.drain(..).collect();
                for id in settled {
                    k.wake(id);
                }
                continue;
            }
            // Advance to the earliest timer.
            if let Some(&Reverse((t, _, _))) = k.timers.peek() {
                k.now_ps = t;
                while let Some(&Reverse((due, _, _))) = k.timers.peek() {
                    if due != t {
                        break;
                    }
                    let Reverse((_, _, id)) = k.timers.pop().unwrap();
                    k.wake(id);
                }
                let stepped: Vec<TaskId> = k.next_step.drain(..).collect();
                for id in stepped {
                    k.wake(id);
                }
                continue;
            }
            // Nothing runnable, nothing pending: the simulation is over.
            drop(k);
            log::debug!("kernel drained at {} ns", self.now_ns());
            return;
        }
    }

    fn poll_task(&self, id: TaskId) {
        let mut fut = {
            let mut k = self.k.borrow_mut();
            match k.tasks.get(id.index as usize) {
                Some(slot) if slot.gen == id.gen => (),
                _ => return, // stale wakeup
            }
            if k.tasks[id.index as usize].killed {
                k.retire(id);
                return;
            }
            let Some(fut) = k.tasks[id.index as usize].fut.take() else {
                return;
            };
            k.tasks[id.index as usize].running = true;
            k.current = Some(id);
            fut
        };
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let result = fut.as_mut().poll(&mut cx);
        let mut k = self.k.borrow_mut();
        k.current = None;
        k.tasks[id.index as usize].running = false;
        if k.tasks[id.index as usize].killed {
            // Killed during its own poll; the future dies here.
            k.retire(id);
            return;
        }
        match result {
            Poll::Ready(()) => k.retire(id),
            Poll::Pending => k.tasks[id.index as usize].fut = Some(fut),
        }
    }

    pub(crate) fn kernel(&self) -> &Rc<RefCell<Kernel>> {
        &self.k
    }
}

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EdgeWait {
    sim: Sim,
    sig: Signal,
    rising: bool,
    armed: bool,
}

impl Future for EdgeWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.armed {
            return Poll::Ready(());
        }
        let me = this.sim.current_task();
        let mut k = this.sim.k.borrow_mut();
        let s = &mut k.signals[this.sig.0 as usize];
        if this.rising {
            s.rising.push(me);
        } else {
            s.falling.push(me);
        }
        this.armed = true;
        Poll::Pending
    }
}

pub struct ReadOnlyWait {
    sim: Sim,
    armed: bool,
}

impl Future for ReadOnlyWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.armed {
            return Poll::Ready(());
        }
        let me = this.sim.current_task();
        this.sim.k.borrow_mut().read_only.push(me);
        this.armed = true;
        Poll::Pending
    }
}

pub struct NextStepWait {
    sim: Sim,
    armed: bool,
}

impl Future for NextStepWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.armed {
            return Poll::Ready(());
        }
        let me = this.sim.current_task();
        this.sim.k.borrow_mut().next_step.push(me);
        this.armed = true;
        Poll::Pending
    }
}

pub struct DelayWait {
    sim: Sim,
    delay_ps: u64,
    armed: bool,
}

impl Future for DelayWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.armed {
            return Poll::Ready(());
        }
        let me = this.sim.current_task();
        let mut k = this.sim.k.borrow_mut();
        let due = k.now_ps + this.delay_ps;
        k.timer_seq += 1;
        let seq = k.timer_seq;
        k.timers.push(Reverse((due, seq, me)));
        this.armed = true;
        Poll::Pending
    }
}

/// Starts a free-running square wave on `clock`. The first rising edge is
/// in the current delta.
pub fn start_clock(sim: &Sim, clock: Signal, period_ns: u64) -> TaskHandle {
    assert!(period_ns >= 2, "clock period below resolution");
    let half_ps = period_ns * 1000 / 2;
    let sim = sim.clone();
    let sim2 = sim.clone();
    sim.spawn(async move {
        loop {
            sim2.set(clock, 1);
            sim2.delay_ps(half_ps).await;
            sim2.set(clock, 0);
            sim2.delay_ps(half_ps).await;
        }
    })
}

/// Waits for `n` rising edges of `clock`.
pub async fn wait_cycles(sim: &Sim, clock: Signal, n: usize) {
    for _ in 0..n {
        sim.rising_edge(clock).await;
    }
}

// The kernel reschedules tasks by id, so wakers carry no state. Tasks that
// suspend on anything other than a kernel primitive would never wake; the
// primitives in this crate are the complete suspension vocabulary.
fn noop_waker() -> Waker {
    unsafe fn vt_clone(_: *const ()) -> RawWaker {
        RAW
    }
    unsafe fn vt_noop(_: *const ()) {}
    const VTABLE: RawWakerVTable =
        RawWakerVTable::new(vt_clone, vt_noop, vt_noop, vt_noop);
    const RAW: RawWaker = RawWaker::new(std::ptr::null(), &VTABLE);
    // Safety: every vtable entry is a no-op; there is no state to misuse.
    unsafe { Waker::from_raw(RAW) }
}
