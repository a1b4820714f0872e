// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulation entry: clock, reset sequencing, model construction, server
//! bring-up, and the pump.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use drv_axi_master::Axi4Master;
use drv_axi_slave::{Axi4Slave, Memory};
use log::info;
use sim::{start_clock, Sim};
use task_sim_server::server::{self, ServerConfig};
use task_sim_server::{Completion, InterruptMap, OpQueue, SimOp, StatusCache};

use crate::design::{
    declare_design, start_lock_detector, start_platform_model, Design,
    DesignConfig,
};
use crate::pump::{run_pump, PumpContext};
use crate::CLK_PERIOD_NS;

pub struct BridgeOptions {
    pub port: u16,
    pub workers: usize,
    pub memory_size: usize,
    pub status_image: Vec<u8>,
    pub design: DesignConfig,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            port: 4040,
            workers: 10,
            memory_size: crate::MEMORY_SIZE,
            status_image: vec![0x00], // empty, length-prefix only
            design: DesignConfig::default(),
        }
    }
}

/// Builds the simulation world and runs it until `stop` rises. `ready`
/// (if given) is completed with the server's bound address once the
/// service accepts requests -- the tests bind port 0 and need to learn
/// the real one.
pub fn run_simulation(
    options: BridgeOptions,
    stop: Arc<AtomicBool>,
    ready: Option<Completion<SocketAddr>>,
) {
    let sim = Sim::with_stop_flag(stop);
    let design = declare_design(&sim, &options.design);
    let entry_sim = sim.clone();
    sim.spawn(sim_entry(entry_sim, design, options, ready));
    sim.run();
}

async fn sim_entry(
    sim: Sim,
    design: Design,
    options: BridgeOptions,
    ready: Option<Completion<SocketAddr>>,
) {
    start_clock(&sim, design.clock, CLK_PERIOD_NS);
    start_lock_detector(&sim, &design);

    // The clocking subsystem's resets need stable output clocks; hold
    // everything until lock, then sequence the external reset.
    sim.rising_edge(design.locked).await;
    sim.set_now(design.reset, 0);
    sim.delay_ns(CLK_PERIOD_NS * 12).await;
    sim.set_now(design.reset, 1);
    sim.delay_ns(CLK_PERIOD_NS * 120).await;
    info!("[{} ns] design out of reset", sim.now_ns());

    let _platform =
        start_platform_model(&sim, &design, &options.status_image)
            .expect("S_AXI port must match the declared design");
    let axim = Axi4Master::new(&sim, "S_AXI", design.clock, design.reset, 0)
        .expect("S_AXI port must match the declared design");
    let memory = Memory::new(options.memory_size);
    let _axis = Axi4Slave::new(
        &sim,
        "M_AXI",
        design.clock,
        design.reset,
        memory.clone(),
        0,
    )
    .expect("M_AXI port must match the declared design");

    let ops = Arc::new(OpQueue::new());
    let interrupts = Arc::new(InterruptMap::new());
    let status: StatusCache = Completion::new();

    // The status prefetch is the first thing through the FIFO; requests
    // asking for the status before it lands park on the cache.
    ops.push(SimOp::PrefetchStatus { cache: status.clone() });

    let config =
        ServerConfig { port: options.port, workers: options.workers };
    let server = server::start(
        &config,
        Arc::clone(&ops),
        interrupts,
        status,
        sim.stop_flag(),
    )
    .expect("binding the request server");
    if let Some(ready) = ready {
        ready.set(server.local_addr());
    }

    // The launcher scans stdout for exactly this line.
    println!("[tapasco-message] simulation-started");

    let ctx = PumpContext {
        sim: sim.clone(),
        axim,
        memory,
        ops,
        watchers: HashMap::new(),
    };
    run_pump(ctx).await;
}
