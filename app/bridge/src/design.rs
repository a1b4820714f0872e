// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The simulated design's signal surface, and the behavioral platform
//! model that stands in for it when no RTL backend is attached.
//!
//! The design contract: a clock input `ext_ps_clk_in`, an active-low
//! reset `ext_reset_in`, a lock-detect output `locked`, a slave port
//! `S_AXI_*` the bridge masters, a master port `M_AXI_*` the bridge
//! answers, and one interrupt output `ext_intr_PE_<id>_0` per processing
//! element.

use drv_axi_api::{
    BusError, AXI4_BURST_SIGNALS, AXI4_ID_SIGNALS, AXI4_LITE_SIGNALS,
};
use drv_axi_slave::{Axi4Slave, Memory};
use log::debug;
use sim::{wait_cycles, Signal, Sim};

use crate::status::{STATUS_BASE, STATUS_WINDOW};

/// Shape of the simulated design's ports.
#[derive(Clone, Debug)]
pub struct DesignConfig {
    pub data_width: u32,
    pub addr_width: u32,
    /// 0 disables the identifier signals entirely.
    pub id_width: u32,
    pub n_pes: u32,
}

impl Default for DesignConfig {
    fn default() -> Self {
        Self { data_width: 32, addr_width: 32, id_width: 6, n_pes: 4 }
    }
}

/// Top-level handles the entry sequence drives or observes.
pub struct Design {
    pub clock: Signal,
    pub reset: Signal,
    pub locked: Signal,
    pub interrupts: Vec<Signal>,
}

/// Declares every signal of the design contract.
pub fn declare_design(sim: &Sim, config: &DesignConfig) -> Design {
    let clock = sim.add_signal("ext_ps_clk_in", 1);
    let reset = sim.add_signal("ext_reset_in", 1);
    let locked = sim.add_signal("locked", 1);
    for prefix in ["S_AXI", "M_AXI"] {
        declare_port(sim, prefix, config);
    }
    let interrupts = (0..config.n_pes)
        .map(|id| sim.add_signal(&format!("ext_intr_PE_{id}_0"), 1))
        .collect();
    Design { clock, reset, locked, interrupts }
}

fn declare_port(sim: &Sim, prefix: &str, config: &DesignConfig) {
    let id_signals: &[&str] =
        if config.id_width > 0 { AXI4_ID_SIGNALS } else { &[] };
    let suffixes =
        AXI4_LITE_SIGNALS.iter().chain(AXI4_BURST_SIGNALS).chain(id_signals);
    for &suffix in suffixes {
        let width = signal_width(suffix, config);
        sim.add_signal(&format!("{prefix}_{suffix}"), width);
    }
}

fn signal_width(suffix: &str, config: &DesignConfig) -> u32 {
    match suffix {
        "AWADDR" | "ARADDR" => config.addr_width,
        "WDATA" | "RDATA" => config.data_width,
        "WSTRB" => config.data_width / 8,
        "AWPROT" | "ARPROT" => 3,
        "AWLEN" | "ARLEN" => 8,
        "AWSIZE" | "ARSIZE" => 3,
        "AWBURST" | "ARBURST" => 2,
        "AWCACHE" | "ARCACHE" => 4,
        "BRESP" | "RRESP" => 2,
        "AWID" | "BID" | "ARID" | "RID" => config.id_width,
        _ => 1, // valids, readys, locks, lasts
    }
}

/// Raises `locked` a few cycles after the clock starts, the way a
/// clocking wizard reports stable output clocks.
pub fn start_lock_detector(sim: &Sim, design: &Design) {
    let sim2 = sim.clone();
    let clock = design.clock;
    let locked = design.locked;
    sim.spawn(async move {
        wait_cycles(&sim2, clock, 8).await;
        sim2.set(locked, 1);
        debug!("[{} ns] clock lock detected", sim2.now_ns());
    });
}

/// Answers the `S_AXI` port from a platform memory whose status region is
/// preloaded with `status_image`. This is the stand-in for the design's
/// register file and status core in a backend-less run: every platform
/// read and write lands in plain memory.
pub fn start_platform_model(
    sim: &Sim,
    design: &Design,
    status_image: &[u8],
) -> Result<Axi4Slave, BusError> {
    let memory = Memory::new(STATUS_BASE as usize + STATUS_WINDOW);
    let image_len = status_image.len().min(STATUS_WINDOW);
    memory.write_bytes(STATUS_BASE, &status_image[..image_len]);
    Axi4Slave::new(sim, "S_AXI", design.clock, design.reset, memory, 0)
}
