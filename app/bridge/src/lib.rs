// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The co-simulation bridge.
//!
//! Wires the pieces together: the simulated design's signal set, the
//! clock and reset sequencing, the master and slave bus-functional
//! models, the one-shot status prefetch, the request server's worker
//! pool, and the pump that feeds queued requests into the simulator.
//!
//! The library half exists so the integration tests can build the exact
//! world the binary runs.

pub mod design;
pub mod entry;
pub mod pump;
pub mod status;

/// Bus clock period driven on `ext_ps_clk_in`.
pub const CLK_PERIOD_NS: u64 = 10;

/// Device memory behind the design's master port.
pub const MEMORY_SIZE: usize = 1 << 30;
