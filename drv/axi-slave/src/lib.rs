// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Slave-side bus-functional model.
//!
//! Answers read and write bursts the design issues on its master port,
//! against a byte-addressable memory this model owns. The five channel
//! tasks mirror the master's; two handler tasks between the request and
//! response queues implement the actual memory semantics:
//!
//! - Reads always put the full bus-width word at the lane-0-aligned
//!   address on the wire; the master discards the lanes it didn't ask for.
//! - Writes apply the strobe byte by byte, shifted by the address offset
//!   within the bus word.
//! - A beat that would run past the end of memory answers `SlvErr`, but
//!   the burst is still consumed to completion so the channel stays
//!   coherent.
//!
//! Memory mutation happens on the falling clock edge, so a read and a
//! write landing in the same cycle see pre-write memory on the read path.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use drv_axi_api::{align_addr, AxBurst, AxProt, AxResp, AxiBus, BusError};
use log::{debug, trace};
use sim::{Queue, Signal, Sim, TaskHandle};

/// Filler word for out-of-range read beats; the response code is what the
/// master acts on, the data is noise.
const FILLER: u64 = 42;

/// Byte-addressable backing store, owned by the slave model. Handles are
/// cheap clones; everything stays on the simulation thread.
#[derive(Clone)]
pub struct Memory {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl Memory {
    pub fn new(size: usize) -> Self {
        Self { bytes: Rc::new(RefCell::new(vec![0; size])) }
    }

    pub fn len(&self) -> usize {
        self.bytes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bounds-checked copy out.
    pub fn read_bytes(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let bytes = self.bytes.borrow();
        let start = usize::try_from(addr).ok()?;
        let end = start.checked_add(len)?;
        bytes.get(start..end).map(|s| s.to_vec())
    }

    /// Bounds-checked copy in; false if any byte would land outside.
    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> bool {
        let mut bytes = self.bytes.borrow_mut();
        let Ok(start) = usize::try_from(addr) else {
            return false;
        };
        let Some(end) = start.checked_add(data.len()) else {
            return false;
        };
        match bytes.get_mut(start..end) {
            Some(slice) => {
                slice.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    fn borrow(&self) -> Ref<'_, Vec<u8>> {
        self.bytes.borrow()
    }

    fn borrow_mut(&self) -> RefMut<'_, Vec<u8>> {
        self.bytes.borrow_mut()
    }
}

struct ReadReq {
    id: u64,
    addr: u64,
    #[allow(dead_code)]
    prot: AxProt,
    bytes_per_beat: u64,
    len: u64,
    burst: AxBurst,
}

struct WriteReq {
    id: u64,
    addr: u64,
    #[allow(dead_code)]
    prot: AxProt,
    bytes_per_beat: u64,
    len: u64,
    burst: AxBurst,
}

struct ReadBeat {
    resp: AxResp,
    data: u64,
    id: u64,
    last: bool,
}

struct WriteBeat {
    data: u64,
    strb: u64,
    last: bool,
}

struct Inner {
    sim: Sim,
    bus: AxiBus,
    clock: Signal,
    reset: Signal,
    memory: Memory,

    read_req: Queue<ReadReq>,
    read_rsp: Queue<ReadBeat>,
    write_req: Queue<WriteReq>,
    write_data: Queue<WriteBeat>,
    write_rsp: Queue<(AxResp, u64)>,

    channels: RefCell<Vec<TaskHandle>>,
}

#[derive(Clone)]
pub struct Axi4Slave {
    inner: Rc<Inner>,
}

impl Axi4Slave {
    /// Binds to `<prefix>` on the design's master port and starts
    /// answering against `memory`.
    pub fn new(
        sim: &Sim,
        prefix: &str,
        clock: Signal,
        reset: Signal,
        memory: Memory,
        depth: usize,
    ) -> Result<Self, BusError> {
        let bus = AxiBus::bind(sim, prefix)?;

        sim.set_now(bus.arready, 0);
        sim.set_now(bus.awready, 0);
        sim.set_now(bus.wready, 0);
        sim.set_now(bus.rvalid, 0);
        sim.set_now(bus.rlast, 0);
        sim.set_now(bus.rresp, 0);
        sim.set_now(bus.bvalid, 0);
        sim.set_now(bus.bresp, 0);
        if let Some(id) = &bus.id {
            sim.set_now(id.rid, 0);
            sim.set_now(id.bid, 0);
        }

        let inner = Rc::new(Inner {
            sim: sim.clone(),
            bus,
            clock,
            reset,
            memory,
            read_req: sim.queue(depth),
            read_rsp: sim.queue(depth),
            write_req: sim.queue(depth),
            write_data: sim.queue(depth),
            write_rsp: sim.queue(depth),
            channels: RefCell::new(Vec::new()),
        });
        start_channels(&inner);
        sim.spawn(reset_task(Rc::clone(&inner)));
        Ok(Self { inner })
    }

    /// The backing store, for direct access by the bridge's memory
    /// operations (which run on the simulation thread).
    pub fn memory(&self) -> Memory {
        self.inner.memory.clone()
    }
}

fn start_channels(s: &Rc<Inner>) {
    let mut channels = s.channels.borrow_mut();
    channels.push(s.sim.spawn(ar_channel(Rc::clone(s))));
    channels.push(s.sim.spawn(r_channel(Rc::clone(s))));
    channels.push(s.sim.spawn(aw_channel(Rc::clone(s))));
    channels.push(s.sim.spawn(w_channel(Rc::clone(s))));
    channels.push(s.sim.spawn(b_channel(Rc::clone(s))));
    channels.push(s.sim.spawn(read_handler(Rc::clone(s))));
    channels.push(s.sim.spawn(write_handler(Rc::clone(s))));
}

fn bytes_in_beat(axsize: u64) -> u64 {
    // AxSIZE is log2 of the beat width; 7 encodings are defined.
    assert!(axsize < 7, "AxSIZE {axsize} out of range");
    1 << axsize
}

async fn ar_channel(s: Rc<Inner>) {
    loop {
        s.sim.set(s.bus.arready, u64::from(!s.read_req.is_full()));
        s.sim.rising_edge(s.clock).await;
        if s.sim.get(s.bus.arready) == 0 {
            continue;
        }
        while s.sim.get(s.bus.arvalid) == 0 {
            s.sim.rising_edge(s.clock).await;
        }
        let req = ReadReq {
            id: match &s.bus.id {
                Some(id) => s.sim.get(id.arid),
                None => 0,
            },
            addr: s.sim.get(s.bus.araddr),
            prot: AxProt::from_bits(s.sim.get(s.bus.arprot)),
            bytes_per_beat: bytes_in_beat(s.sim.get(s.bus.arsize)),
            len: s.sim.get(s.bus.arlen),
            burst: AxBurst::from_bits(s.sim.get(s.bus.arburst)),
        };
        trace!(
            "[{} ns] {} AR captured, addr 0x{:x} len {}",
            s.sim.now_ns(),
            s.bus.prefix(),
            req.addr,
            req.len
        );
        s.read_req.put(req).await;
    }
}

async fn r_channel(s: Rc<Inner>) {
    loop {
        let beat = s.read_rsp.get().await;
        s.sim.set(s.bus.rvalid, 1);
        s.sim.set(s.bus.rdata, beat.data);
        s.sim.set(s.bus.rresp, beat.resp as u64);
        s.sim.set(s.bus.rlast, u64::from(beat.last));
        if let Some(id) = &s.bus.id {
            s.sim.set(id.rid, beat.id);
        }
        s.sim.rising_edge(s.clock).await;
        while s.sim.get(s.bus.rready) == 0 {
            s.sim.rising_edge(s.clock).await;
        }
        s.sim.set(s.bus.rvalid, u64::from(!s.read_rsp.is_empty()));
        s.sim.set(s.bus.rlast, 0);
    }
}

/// Serves one read-address record per burst: one response beat per data
/// beat, paced to the falling edge so same-cycle writes are ordered after
/// the read.
async fn read_handler(s: Rc<Inner>) {
    let n_lanes = u64::from(s.bus.n_lanes());
    loop {
        let req = s.read_req.get().await;
        let n_beats = req.len + 1;
        let mut addr_i = align_addr(req.addr, req.bytes_per_beat);
        for i in 0..n_beats {
            let in_range = addr_i + req.bytes_per_beat
                <= s.memory.len() as u64;
            let (resp, data) = if in_range {
                let lane0 = align_addr(addr_i, n_lanes) as usize;
                let mem = s.memory.borrow();
                // A narrow beat near the end of memory may not have a
                // full bus word behind it; truncate the read and leave
                // the missing lanes zero. The master discards them.
                let end = (lane0 + n_lanes as usize).min(mem.len());
                let word =
                    LittleEndian::read_uint(&mem[lane0..end], end - lane0);
                (AxResp::Okay, word)
            } else {
                (AxResp::SlvErr, FILLER)
            };
            s.read_rsp
                .put(ReadBeat {
                    resp,
                    data,
                    id: req.id,
                    last: i == req.len,
                })
                .await;
            if req.burst != AxBurst::Fixed {
                addr_i += req.bytes_per_beat;
            }
            s.sim.falling_edge(s.clock).await;
        }
    }
}

async fn aw_channel(s: Rc<Inner>) {
    loop {
        s.sim.set(s.bus.awready, u64::from(!s.write_req.is_full()));
        s.sim.rising_edge(s.clock).await;
        if s.sim.get(s.bus.awready) == 0 {
            continue;
        }
        while s.sim.get(s.bus.awvalid) == 0 {
            s.sim.rising_edge(s.clock).await;
        }
        let req = WriteReq {
            id: match &s.bus.id {
                Some(id) => s.sim.get(id.awid),
                None => 0,
            },
            addr: s.sim.get(s.bus.awaddr),
            prot: AxProt::from_bits(s.sim.get(s.bus.awprot)),
            bytes_per_beat: bytes_in_beat(s.sim.get(s.bus.awsize)),
            len: s.sim.get(s.bus.awlen),
            burst: AxBurst::from_bits(s.sim.get(s.bus.awburst)),
        };
        trace!(
            "[{} ns] {} AW captured, addr 0x{:x} len {}",
            s.sim.now_ns(),
            s.bus.prefix(),
            req.addr,
            req.len
        );
        s.write_req.put(req).await;
    }
}

async fn w_channel(s: Rc<Inner>) {
    loop {
        s.sim.set(s.bus.wready, u64::from(!s.write_data.is_full()));
        s.sim.rising_edge(s.clock).await;
        if s.sim.get(s.bus.wready) == 0 {
            continue;
        }
        while s.sim.get(s.bus.wvalid) == 0 {
            s.sim.rising_edge(s.clock).await;
        }
        s.write_data
            .put(WriteBeat {
                data: s.sim.get(s.bus.wdata),
                strb: s.sim.get(s.bus.wstrb),
                last: s.sim.get(s.bus.wlast) != 0,
            })
            .await;
    }
}

/// Serves one write burst: applies each beat's strobe to memory on the
/// falling edge. The final beat must carry the last flag; anything else is
/// a protocol bug in the producer and stops the simulation.
async fn write_handler(s: Rc<Inner>) {
    let n_lanes = u64::from(s.bus.n_lanes());
    loop {
        let req = s.write_req.get().await;
        let n_beats = req.len + 1;
        let mut addr_i = align_addr(req.addr, req.bytes_per_beat);
        let mut resp = AxResp::Okay;
        let mut saw_last = false;
        for _ in 0..n_beats {
            let beat = s.write_data.get().await;
            saw_last = beat.last;
            s.sim.falling_edge(s.clock).await;
            let strb_offset = addr_i % n_lanes;
            let strb = beat.strb >> strb_offset;
            let word = beat.data.to_le_bytes();
            if addr_i + req.bytes_per_beat <= s.memory.len() as u64 {
                let mut mem = s.memory.borrow_mut();
                for j in 0..req.bytes_per_beat {
                    if (strb >> j) & 1 == 1 {
                        mem[(addr_i + j) as usize] =
                            word[(strb_offset + j) as usize];
                    }
                }
            } else {
                // Keep consuming beats so the channel stays coherent.
                resp = resp.combine(AxResp::SlvErr);
            }
            if req.burst != AxBurst::Fixed {
                addr_i += req.bytes_per_beat;
            }
        }
        assert!(
            saw_last,
            "{}: {} write beats consumed without a last flag",
            s.bus.prefix(),
            n_beats
        );
        s.write_rsp.put((resp, req.id)).await;
    }
}

async fn b_channel(s: Rc<Inner>) {
    loop {
        let (resp, bid) = s.write_rsp.get().await;
        s.sim.set(s.bus.bvalid, 1);
        s.sim.set(s.bus.bresp, resp as u64);
        if let Some(id) = &s.bus.id {
            s.sim.set(id.bid, bid);
        }
        s.sim.rising_edge(s.clock).await;
        while s.sim.get(s.bus.bready) == 0 {
            s.sim.rising_edge(s.clock).await;
        }
        s.sim.set(s.bus.bvalid, u64::from(!s.write_rsp.is_empty()));
    }
}

async fn reset_task(s: Rc<Inner>) {
    loop {
        s.sim.falling_edge(s.reset).await;
        debug!(
            "[{} ns] {}: bus reset asserted",
            s.sim.now_ns(),
            s.bus.prefix()
        );
        for handle in s.channels.borrow_mut().drain(..) {
            handle.kill();
        }
        s.sim.set_now(s.bus.bvalid, 0);
        s.sim.set_now(s.bus.rvalid, 0);
        s.sim.set_now(s.bus.rlast, 0);
        s.read_req.clear();
        s.read_rsp.clear();
        s.write_req.clear();
        s.write_data.clear();
        s.write_rsp.clear();
        s.sim.rising_edge(s.reset).await;
        s.sim.rising_edge(s.clock).await;
        s.sim.falling_edge(s.clock).await;
        start_channels(&s);
        debug!(
            "[{} ns] {}: slave reset finished",
            s.sim.now_ns(),
            s.bus.prefix()
        );
    }
}
