// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The request pump.
//!
//! Runs in the simulator domain. On a fixed cadence of simulated time it
//! drains the cross-thread operation FIFO and turns each record into a
//! locally-constructed coroutine, spawned as a child task whose wrapper
//! fires the record's completion when the work is done. This is the only
//! place requests enter the simulator, which is what serializes them
//! against the bus models.

use std::collections::HashMap;
use std::sync::Arc;

use drv_axi_api::{AxBurst, AxProt};
use drv_axi_master::Axi4Master;
use drv_axi_slave::Memory;
use log::{debug, trace};
use sim::{Sim, TaskHandle};
use task_sim_server::interrupt::watch;
use task_sim_server::{OpQueue, SimOp};
use task_sim_server_api::{PlatformData, ResponsePayload, SimResponse};

/// Simulated-time poll period. A performance knob, not a correctness
/// contract; anything at or above one clock period works.
pub const PUMP_PERIOD_NS: u64 = 400;

/// Register-space writes are chunked into bursts of this many beats.
const BEATS_PER_BURST: usize = 256;

pub struct PumpContext {
    pub sim: Sim,
    pub axim: Axi4Master,
    pub memory: Memory,
    pub ops: Arc<OpQueue>,
    /// Watcher coroutines by client descriptor, so re-registration and
    /// deregistration can kill the old task.
    pub watchers: HashMap<i32, TaskHandle>,
}

pub async fn run_pump(mut ctx: PumpContext) {
    let sim = ctx.sim.clone();
    debug!("request pump running, period {PUMP_PERIOD_NS} ns");
    while !sim.stop_requested() {
        sim.delay_ns(PUMP_PERIOD_NS).await;
        for op in ctx.ops.drain() {
            dispatch(&mut ctx, op);
        }
    }
    debug!("request pump stopped");
}

fn dispatch(ctx: &mut PumpContext, op: SimOp) {
    match op {
        SimOp::WriteMemory { addr, data, done } => {
            let sim = ctx.sim.clone();
            let memory = ctx.memory.clone();
            ctx.sim.spawn(async move {
                done.set(write_memory(&sim, &memory, addr, &data).await);
            });
        }
        SimOp::ReadMemory { addr, length, done } => {
            let sim = ctx.sim.clone();
            let memory = ctx.memory.clone();
            ctx.sim.spawn(async move {
                done.set(read_memory(&sim, &memory, addr, length).await);
            });
        }
        SimOp::ReadPlatform { addr, num_bytes, done } => {
            let axim = ctx.axim.clone();
            ctx.sim.spawn(async move {
                done.set(read_platform(&axim, addr, num_bytes).await);
            });
        }
        SimOp::WritePlatform { addr, data, done } => {
            let axim = ctx.axim.clone();
            ctx.sim.spawn(async move {
                done.set(write_platform(&axim, addr, data).await);
            });
        }
        SimOp::RegisterInterrupt { fd, watcher, done } => {
            if let Some(old) = ctx.watchers.remove(&fd) {
                old.kill();
            }
            match ctx.sim.lookup(watcher.signal_name()) {
                Some(line) => {
                    trace!(
                        "watching {} for fd {fd}",
                        watcher.signal_name()
                    );
                    let task = ctx
                        .sim
                        .spawn(watch(ctx.sim.clone(), line, watcher));
                    ctx.watchers.insert(fd, task);
                    done.set(SimResponse::ok_void());
                }
                None => done.set(SimResponse::error(format!(
                    "design has no interrupt line {}",
                    watcher.signal_name()
                ))),
            }
        }
        SimOp::DeregisterInterrupt { fd, done } => {
            if let Some(task) = ctx.watchers.remove(&fd) {
                task.kill();
            }
            done.set(SimResponse::ok_void());
        }
        SimOp::PrefetchStatus { cache } => {
            let axim = ctx.axim.clone();
            ctx.sim.spawn(crate::status::prefetch_status(axim, cache));
        }
    }
}

/// Device memory is written directly; the slave model owns it and the
/// simulator thread is the only mutator. Settling at the read-only phase
/// first keeps the store ordered against bus traffic in the same cycle.
async fn write_memory(
    sim: &Sim,
    memory: &Memory,
    addr: u64,
    data: &[u8],
) -> SimResponse {
    sim.read_only().await;
    if memory.write_bytes(addr, data) {
        SimResponse::ok_void()
    } else {
        SimResponse::error(format!(
            "slave-error: {} bytes at 0x{addr:x} fall outside the \
             {}-byte memory",
            data.len(),
            memory.len()
        ))
    }
}

async fn read_memory(
    sim: &Sim,
    memory: &Memory,
    addr: u64,
    length: u64,
) -> SimResponse {
    sim.read_only().await;
    match memory.read_bytes(addr, length as usize) {
        Some(bytes) => SimResponse::Ok(ResponsePayload::Bytes(bytes)),
        None => SimResponse::error(format!(
            "slave-error: {length} bytes at 0x{addr:x} fall outside the \
             {}-byte memory",
            memory.len()
        )),
    }
}

/// Register space reads go over the bus, one 32-bit word per beat.
async fn read_platform(
    axim: &Axi4Master,
    addr: u64,
    num_bytes: u32,
) -> SimResponse {
    let n_words = u64::from(num_bytes).div_ceil(4);
    let mut words = Vec::with_capacity(n_words as usize);
    for i in 0..n_words {
        let word_addr = addr + 4 * i;
        match axim.read32(word_addr).await {
            Ok((resp, word)) if resp.is_okay() => words.push(word),
            Ok((resp, _)) => {
                return SimResponse::error(format!(
                    "bus response {resp:?} reading 0x{word_addr:x}"
                ))
            }
            Err(e) => return SimResponse::error(e.to_string()),
        }
    }
    SimResponse::Ok(ResponsePayload::Words(words))
}

/// Register space writes: 64-bit values split little-endian into word
/// pairs, then bursts of up to 256 beats.
async fn write_platform(
    axim: &Axi4Master,
    addr: u64,
    data: PlatformData,
) -> SimResponse {
    let words: Vec<u64> = match data {
        PlatformData::U32(values) => {
            values.into_iter().map(u64::from).collect()
        }
        PlatformData::U64(values) => values
            .into_iter()
            .flat_map(|v| [v & 0xFFFF_FFFF, v >> 32])
            .collect(),
    };
    if words.is_empty() {
        return SimResponse::ok_void();
    }
    for (n, burst) in words.chunks(BEATS_PER_BURST).enumerate() {
        let burst_addr = addr + (4 * BEATS_PER_BURST * n) as u64;
        match axim
            .write(
                burst_addr,
                burst,
                AxBurst::Incr,
                AxProt::UnprivSecData,
                0,
            )
            .await
        {
            Ok(w) if w.resp.is_okay() => (),
            Ok(w) => {
                return SimResponse::error(format!(
                    "bus response {:?} writing 0x{burst_addr:x}",
                    w.resp
                ))
            }
            Err(e) => return SimResponse::error(e.to_string()),
        }
    }
    SimResponse::ok_void()
}
