// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Master-side bus-functional model.
//!
//! Drives the design's slave port: five independent channel tasks connected
//! by bounded queues, so address, data and response phases overlap the way
//! real bus traffic does. Callers see two blocking operations, `read` and
//! `write`, which enqueue work and park until the response channel delivers
//! the burst result.
//!
//! The single-beat ("lite") flavor is not a separate model; `read32` and
//! `write32` issue one-beat bursts through the same channels.
//!
//! # Reset
//!
//! A falling edge on the (active-low) reset line kills all five channel
//! tasks mid-whatever, forces the valids low, clears every queue, and
//! hands any parked caller a `None` sentinel. The call wrappers treat the
//! sentinel as "retry from the top", so callers never observe a reset
//! unless they go looking for it. Channels restart one full clock cycle
//! after reset deasserts.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use drv_axi_api::{
    align_addr, burst_lanes, lane_mask, strobe_from_lanes, AxBurst, AxProt,
    AxResp, AxiBus, BusError,
};
use log::{debug, trace};
use sim::{Lock, Queue, Signal, Sim, TaskHandle};

struct ReadRequest {
    id: u64,
    addr: u64,
    beats: u32,
    bytes_per_beat: u32,
    burst: AxBurst,
    prot: AxProt,
}

struct WriteRequest {
    id: u64,
    addr: u64,
    bytes_per_beat: u32,
    beats: u32,
    burst: AxBurst,
    prot: AxProt,
}

struct WriteBurst {
    words: Vec<u64>,
    strobes: Vec<u64>,
}

struct ReadBurst {
    resps: Vec<AxResp>,
    data: Vec<u64>,
    id: u64,
}

/// Outcome of a burst read: masked data words, the worst per-beat
/// response, and the echoed identifier.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub data: Vec<u64>,
    pub resp: AxResp,
    pub id: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteResult {
    pub resp: AxResp,
    pub id: u64,
}

struct Inner {
    sim: Sim,
    bus: AxiBus,
    clock: Signal,
    reset: Signal,

    read_req: Queue<ReadRequest>,
    read_rsp: Queue<Option<ReadBurst>>,
    write_req: Queue<WriteRequest>,
    write_data: Queue<WriteBurst>,
    write_rsp: Queue<Option<(AxResp, u64)>>,

    // The direction locks serialize the enqueue side so requests and
    // responses pair strictly in order; the counters track callers parked
    // on a response, each of which gets one reset sentinel.
    read_busy: Lock,
    write_busy: Lock,
    open_reads: Cell<usize>,
    open_writes: Cell<usize>,

    channels: RefCell<Vec<TaskHandle>>,
}

#[derive(Clone)]
pub struct Axi4Master {
    inner: Rc<Inner>,
}

impl Axi4Master {
    /// Binds to `<prefix>` and starts the channel tasks. `depth` bounds
    /// each per-channel queue (0 means unbounded).
    pub fn new(
        sim: &Sim,
        prefix: &str,
        clock: Signal,
        reset: Signal,
        depth: usize,
    ) -> Result<Self, BusError> {
        let bus = AxiBus::bind(sim, prefix)?;
        let size_bits = bus.n_lanes().trailing_zeros() as u64;

        // Sensible defaults before the first delta, so the design never
        // samples undriven control signals.
        sim.set_now(bus.awvalid, 0);
        sim.set_now(bus.wvalid, 0);
        sim.set_now(bus.arvalid, 0);
        sim.set_now(bus.bready, 1);
        sim.set_now(bus.rready, 1);
        sim.set_now(bus.wlast, 0);
        sim.set_now(bus.arsize, size_bits);
        sim.set_now(bus.awsize, size_bits);
        sim.set_now(bus.arburst, AxBurst::Incr as u64);
        sim.set_now(bus.awburst, AxBurst::Incr as u64);
        for sig in [
            bus.arlen, bus.awlen, bus.arlock, bus.awlock, bus.arcache,
            bus.awcache, bus.arprot, bus.awprot,
        ] {
            sim.set_now(sig, 0);
        }
        if let Some(id) = &bus.id {
            sim.set_now(id.arid, 0);
            sim.set_now(id.awid, 0);
        }

        let inner = Rc::new(Inner {
            sim: sim.clone(),
            bus,
            clock,
            reset,
            read_req: sim.queue(depth),
            read_rsp: sim.queue(depth),
            write_req: sim.queue(depth),
            write_data: sim.queue(depth),
            write_rsp: sim.queue(depth),
            read_busy: sim.lock(),
            write_busy: sim.lock(),
            open_reads: Cell::new(0),
            open_writes: Cell::new(0),
            channels: RefCell::new(Vec::new()),
        });
        start_channels(&inner);
        sim.spawn(reset_task(Rc::clone(&inner)));
        Ok(Self { inner })
    }

    pub fn n_lanes(&self) -> u32 {
        self.inner.bus.n_lanes()
    }

    /// Burst read: `beats` transfers of `bytes_per_beat` (a power of two
    /// no wider than the bus) starting at `addr` aligned down to the beat
    /// size. Returns lane-masked words; a bus reset mid-transfer retries
    /// transparently.
    pub async fn read(
        &self,
        addr: u64,
        beats: u32,
        bytes_per_beat: u32,
        burst: AxBurst,
        prot: AxProt,
        id: u64,
    ) -> Result<ReadResult, BusError> {
        if burst == AxBurst::Wrap {
            return Err(BusError::UnsupportedBurst);
        }
        let m = &self.inner;
        let n_lanes = m.bus.n_lanes() as u64;
        assert!(beats >= 1, "read of zero beats");
        assert!(beats <= 256, "burst length field holds at most 256 beats");
        assert!(
            bytes_per_beat.is_power_of_two()
                && u64::from(bytes_per_beat) <= n_lanes,
            "beat size {bytes_per_beat} on a {n_lanes}-lane bus"
        );
        let size = u64::from(bytes_per_beat);
        loop {
            let aligned = align_addr(addr, size);
            m.read_busy.acquire().await;
            m.read_req
                .put(ReadRequest {
                    id,
                    addr: aligned,
                    beats,
                    bytes_per_beat,
                    burst,
                    prot,
                })
                .await;
            m.open_reads.set(m.open_reads.get() + 1);
            m.read_busy.release();

            let rsp = m.read_rsp.get().await;
            m.open_reads.set(m.open_reads.get().saturating_sub(1));

            let Some(rb) = rsp else {
                debug!("{}: read hit bus reset, retrying", m.bus.prefix());
                continue;
            };
            let lanes =
                burst_lanes(addr, aligned, size, rb.data.len(), n_lanes);
            let mut resp = AxResp::Okay;
            let mut data = Vec::with_capacity(rb.data.len());
            for (i, word) in rb.data.iter().enumerate() {
                let beat_resp = rb.resps[i];
                resp = resp.combine(beat_resp);
                let (lo, hi) = lanes[i];
                data.push(if beat_resp == AxResp::Okay {
                    word & lane_mask(lo, hi)
                } else {
                    0
                });
            }
            return Ok(ReadResult { data, resp, id: rb.id });
        }
    }

    /// Burst write of full-width beats. Strobes mask the unaddressed lanes
    /// of the first beat; fixed bursts repeat that strobe, incrementing
    /// bursts derive each beat's strobe from its own address.
    pub async fn write(
        &self,
        addr: u64,
        data: &[u64],
        burst: AxBurst,
        prot: AxProt,
        id: u64,
    ) -> Result<WriteResult, BusError> {
        if burst == AxBurst::Wrap {
            return Err(BusError::UnsupportedBurst);
        }
        let m = &self.inner;
        assert!(!data.is_empty(), "write of zero beats");
        assert!(
            data.len() <= 256,
            "burst length field holds at most 256 beats"
        );
        let n_lanes = m.bus.n_lanes() as u64;
        let size = n_lanes; // narrow write bursts are not supported
        loop {
            let aligned = align_addr(addr, size);
            m.write_busy.acquire().await;
            m.write_req
                .put(WriteRequest {
                    id,
                    addr: aligned,
                    bytes_per_beat: size as u32,
                    beats: data.len() as u32,
                    burst,
                    prot,
                })
                .await;
            let lanes = burst_lanes(addr, aligned, size, data.len(), n_lanes);
            let strobes: Vec<u64> = match burst {
                AxBurst::Fixed => {
                    let (lo, hi) = lanes[0];
                    vec![strobe_from_lanes(lo, hi); data.len()]
                }
                AxBurst::Incr => lanes
                    .iter()
                    .map(|&(lo, hi)| strobe_from_lanes(lo, hi))
                    .collect(),
                AxBurst::Wrap => unreachable!(),
            };
            m.write_data
                .put(WriteBurst { words: data.to_vec(), strobes })
                .await;
            m.open_writes.set(m.open_writes.get() + 1);
            m.write_busy.release();

            let rsp = m.write_rsp.get().await;
            m.open_writes.set(m.open_writes.get().saturating_sub(1));

            let Some((resp, id)) = rsp else {
                debug!("{}: write hit bus reset, retrying", m.bus.prefix());
                continue;
            };
            return Ok(WriteResult { resp, id });
        }
    }

    /// Single-beat 32-bit read (the lite case).
    pub async fn read32(&self, addr: u64) -> Result<(AxResp, u32), BusError> {
        let r = self
            .read(addr, 1, 4, AxBurst::Incr, AxProt::UnprivSecData, 0)
            .await?;
        Ok((r.resp, r.data[0] as u32))
    }

    /// Single-beat 32-bit write (the lite case).
    pub async fn write32(
        &self,
        addr: u64,
        value: u32,
    ) -> Result<AxResp, BusError> {
        let w = self
            .write(
                addr,
                &[u64::from(value)],
                AxBurst::Incr,
                AxProt::UnprivSecData,
                0,
            )
            .await?;
        Ok(w.resp)
    }
}

fn start_channels(m: &Rc<Inner>) {
    let mut channels = m.channels.borrow_mut();
    channels.push(m.sim.spawn(ar_channel(Rc::clone(m))));
    channels.push(m.sim.spawn(r_channel(Rc::clone(m))));
    channels.push(m.sim.spawn(aw_channel(Rc::clone(m))));
    channels.push(m.sim.spawn(w_channel(Rc::clone(m))));
    channels.push(m.sim.spawn(b_channel(Rc::clone(m))));
}

async fn ar_channel(m: Rc<Inner>) {
    loop {
        let req = m.read_req.get().await;
        m.sim.rising_edge(m.clock).await;
        m.sim.set(m.bus.arvalid, 1);
        if let Some(id) = &m.bus.id {
            m.sim.set(id.arid, req.id);
        }
        m.sim.set(m.bus.araddr, req.addr);
        m.sim.set(m.bus.arlen, u64::from(req.beats - 1));
        m.sim.set(m.bus.arsize, u64::from(req.bytes_per_beat.trailing_zeros()));
        m.sim.set(m.bus.arburst, req.burst as u64);
        m.sim.set(m.bus.arprot, req.prot as u64);
        loop {
            m.sim.read_only().await;
            if m.sim.get(m.bus.arready) != 0 {
                break;
            }
            m.sim.rising_edge(m.clock).await;
        }
        m.sim.rising_edge(m.clock).await;
        trace!(
            "[{} ns] {} AR accepted, addr 0x{:x}",
            m.sim.now_ns(),
            m.bus.prefix(),
            req.addr
        );
        m.sim.set(m.bus.arvalid, 0);
    }
}

async fn r_channel(m: Rc<Inner>) {
    // Per-identifier beat accumulation; a burst is flushed to the caller
    // when its last beat arrives. Interleaved ids each gather in their own
    // buffer.
    let mut pending: HashMap<u64, (Vec<AxResp>, Vec<u64>)> = HashMap::new();
    loop {
        m.sim.set(m.bus.rready, u64::from(!m.read_rsp.is_full()));
        m.sim.rising_edge(m.clock).await;
        if m.sim.get(m.bus.rready) == 0 {
            continue;
        }
        while m.sim.get(m.bus.rvalid) == 0 {
            m.sim.rising_edge(m.clock).await;
        }
        let resp = AxResp::from_bits(m.sim.get(m.bus.rresp));
        let word = m.sim.get(m.bus.rdata);
        let rid = match &m.bus.id {
            Some(id) => m.sim.get(id.rid),
            None => 0,
        };
        let last = m.sim.get(m.bus.rlast) != 0;
        let slot = pending.entry(rid).or_default();
        slot.0.push(resp);
        slot.1.push(word);
        if last {
            let (resps, data) = pending.remove(&rid).unwrap();
            trace!(
                "[{} ns] {} R burst done, id {} ({} beats)",
                m.sim.now_ns(),
                m.bus.prefix(),
                rid,
                data.len()
            );
            m.read_rsp.put(Some(ReadBurst { resps, data, id: rid })).await;
        }
    }
}

async fn aw_channel(m: Rc<Inner>) {
    loop {
        let req = m.write_req.get().await;
        m.sim.rising_edge(m.clock).await;
        m.sim.set(m.bus.awvalid, 1);
        if let Some(id) = &m.bus.id {
            m.sim.set(id.awid, req.id);
        }
        m.sim.set(m.bus.awaddr, req.addr);
        m.sim.set(m.bus.awlen, u64::from(req.beats - 1));
        m.sim.set(m.bus.awsize, u64::from(req.bytes_per_beat.trailing_zeros()));
        m.sim.set(m.bus.awburst, req.burst as u64);
        m.sim.set(m.bus.awprot, req.prot as u64);
        loop {
            m.sim.read_only().await;
            if m.sim.get(m.bus.awready) != 0 {
                break;
            }
            m.sim.rising_edge(m.clock).await;
        }
        m.sim.rising_edge(m.clock).await;
        trace!(
            "[{} ns] {} AW accepted, addr 0x{:x}",
            m.sim.now_ns(),
            m.bus.prefix(),
            req.addr
        );
        m.sim.set(m.bus.awvalid, 0);
    }
}

async fn w_channel(m: Rc<Inner>) {
    loop {
        let burst = m.write_data.get().await;
        let beats = burst.words.len();
        for i in 0..beats {
            m.sim.rising_edge(m.clock).await;
            m.sim.set(m.bus.wdata, burst.words[i]);
            m.sim.set(m.bus.wstrb, burst.strobes[i]);
            m.sim.set(m.bus.wvalid, 1);
            m.sim.set(m.bus.wlast, u64::from(i == beats - 1));
            loop {
                m.sim.read_only().await;
                if m.sim.get(m.bus.wready) != 0 {
                    break;
                }
                m.sim.rising_edge(m.clock).await;
            }
            m.sim.rising_edge(m.clock).await;
            m.sim.set(m.bus.wvalid, 0);
        }
        m.sim.set(m.bus.wlast, 0);
    }
}

async fn b_channel(m: Rc<Inner>) {
    loop {
        m.sim.set(m.bus.bready, u64::from(!m.write_rsp.is_full()));
        m.sim.rising_edge(m.clock).await;
        if m.sim.get(m.bus.bready) == 0 {
            continue;
        }
        while m.sim.get(m.bus.bvalid) == 0 {
            m.sim.rising_edge(m.clock).await;
        }
        let resp = AxResp::from_bits(m.sim.get(m.bus.bresp));
        let bid = match &m.bus.id {
            Some(id) => m.sim.get(id.bid),
            None => 0,
        };
        trace!(
            "[{} ns] {} B accepted, {:?} id {}",
            m.sim.now_ns(),
            m.bus.prefix(),
            resp,
            bid
        );
        m.write_rsp.put(Some((resp, bid))).await;
    }
}

async fn reset_task(m: Rc<Inner>) {
    loop {
        m.sim.falling_edge(m.reset).await;
        debug!(
            "[{} ns] {}: bus reset asserted",
            m.sim.now_ns(),
            m.bus.prefix()
        );
        for handle in m.channels.borrow_mut().drain(..) {
            handle.kill();
        }
        m.sim.set_now(m.bus.awvalid, 0);
        m.sim.set_now(m.bus.wvalid, 0);
        m.sim.set_now(m.bus.arvalid, 0);

        // Unblock any producer parked on a full request queue before
        // taking the direction locks; a caller stuck there would be
        // holding its lock.
        m.read_req.clear();
        m.write_req.clear();
        m.write_data.clear();

        // Every caller parked on a response gets exactly one sentinel.
        m.read_busy.acquire().await;
        m.read_rsp.clear();
        for _ in 0..m.open_reads.get() {
            m.read_rsp.put(None).await;
        }
        m.read_busy.release();

        m.write_busy.acquire().await;
        m.write_rsp.clear();
        for _ in 0..m.open_writes.get() {
            m.write_rsp.put(None).await;
        }
        m.write_busy.release();

        m.sim.rising_edge(m.reset).await;
        // One full cycle of quiet before any valid may assert again.
        m.sim.rising_edge(m.clock).await;
        m.sim.falling_edge(m.clock).await;
        start_channels(&m);
        debug!(
            "[{} ns] {}: master reset finished",
            m.sim.now_ns(),
            m.bus.prefix()
        );
    }
}
