// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared wire-level types for the split-channel memory-mapped bus.
//!
//! This is the api crate both bus-functional models build on: the small
//! enums that ride the protection/burst/response fields, the signal-name
//! contract for a port, and the byte-lane arithmetic that turns an
//! unaligned narrow access into strobes and masks.
//!
//! # Naming contract
//!
//! A port named `S_AXI` exposes its channels as `S_AXI_ARVALID`,
//! `S_AXI_RDATA`, and so on. The identifier signals (`ARID`/`RID`/`AWID`/
//! `BID`) are optional as a set: their presence is auto-detected at bind
//! time and switches the master's read path into per-id accumulation.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use sim::{Signal, Sim};

/// Protection level carried in the `AxPROT` field: privilege, security and
/// data/instruction, packed into three bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum AxProt {
    UnprivSecData = 0,
    PrivSecData = 1,
    UnprivNonsecData = 2,
    PrivNonsecData = 3,
    UnprivSecInstr = 4,
    PrivSecInstr = 5,
    UnprivNonsecInstr = 6,
    PrivNonsecInstr = 7,
}

impl AxProt {
    pub fn from_bits(bits: u64) -> Self {
        Self::from_u64(bits & 0b111).unwrap()
    }
}

/// Burst type carried in the `AxBURST` field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum AxBurst {
    Fixed = 0,
    Incr = 1,
    Wrap = 2,
}

impl AxBurst {
    /// Decodes the two-bit field; the reserved encoding 3 has no meaning
    /// and is treated as an incrementing burst.
    pub fn from_bits(bits: u64) -> Self {
        Self::from_u64(bits & 0b11).unwrap_or(AxBurst::Incr)
    }
}

/// Response code carried on the read-data and write-response channels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum AxResp {
    Okay = 0,
    ExOkay = 1,
    SlvErr = 2,
    DecErr = 3,
}

impl AxResp {
    pub fn from_bits(bits: u64) -> Self {
        Self::from_u64(bits & 0b11).unwrap()
    }

    pub fn is_okay(self) -> bool {
        matches!(self, AxResp::Okay | AxResp::ExOkay)
    }

    /// Merges two per-beat responses into the burst response: the more
    /// severe one wins.
    pub fn combine(self, other: AxResp) -> AxResp {
        fn severity(r: AxResp) -> u8 {
            match r {
                AxResp::Okay => 0,
                AxResp::ExOkay => 1,
                AxResp::SlvErr => 2,
                AxResp::DecErr => 3,
            }
        }
        if severity(other) > severity(self) {
            other
        } else {
            self
        }
    }
}

/// Channel suffixes of the single-beat subset.
pub const AXI4_LITE_SIGNALS: &[&str] = &[
    "AWVALID", "AWADDR", "AWREADY", "AWPROT", // write address channel
    "WVALID", "WREADY", "WDATA", "WSTRB", // write data channel
    "BVALID", "BREADY", "BRESP", // write response channel
    "ARVALID", "ARADDR", "ARREADY", "ARPROT", // read address channel
    "RVALID", "RREADY", "RRESP", "RDATA", // read data channel
];

/// Additional suffixes present on a full (bursting) port.
pub const AXI4_BURST_SIGNALS: &[&str] = &[
    "WLAST", "RLAST", "ARSIZE", "AWSIZE", "ARBURST", "AWBURST", "ARLEN",
    "AWLEN", "ARLOCK", "AWLOCK", "ARCACHE", "AWCACHE",
];

/// Optional transaction-identifier suffixes.
pub const AXI4_ID_SIGNALS: &[&str] = &["ARID", "RID", "AWID", "BID"];

/// Errors at the bus-functional-model boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The design does not expose a signal the port contract requires.
    MissingSignal(String),
    /// Wrapping bursts are rejected, not implemented.
    UnsupportedBurst,
}

impl core::fmt::Display for BusError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BusError::MissingSignal(name) => {
                write!(f, "design exposes no signal {name}")
            }
            BusError::UnsupportedBurst => {
                write!(f, "wrapping bursts are not supported")
            }
        }
    }
}

impl std::error::Error for BusError {}

/// Reports whether the port carries transaction identifiers.
pub fn has_id_signals(sim: &Sim, prefix: &str) -> bool {
    sim.lookup(&format!("{prefix}_ARID")).is_some()
}

/// The identifier signals, present as a set or not at all.
#[derive(Copy, Clone, Debug)]
pub struct IdSignals {
    pub awid: Signal,
    pub bid: Signal,
    pub arid: Signal,
    pub rid: Signal,
}

/// One port's bound signal handles. The same bundle serves both sides; who
/// drives which signal is the master/slave split, not a type split.
#[derive(Clone, Debug)]
pub struct AxiBus {
    prefix: String,

    pub awvalid: Signal,
    pub awready: Signal,
    pub awaddr: Signal,
    pub awprot: Signal,
    pub awlen: Signal,
    pub awsize: Signal,
    pub awburst: Signal,
    pub awlock: Signal,
    pub awcache: Signal,

    pub wvalid: Signal,
    pub wready: Signal,
    pub wdata: Signal,
    pub wstrb: Signal,
    pub wlast: Signal,

    pub bvalid: Signal,
    pub bready: Signal,
    pub bresp: Signal,

    pub arvalid: Signal,
    pub arready: Signal,
    pub araddr: Signal,
    pub arprot: Signal,
    pub arlen: Signal,
    pub arsize: Signal,
    pub arburst: Signal,
    pub arlock: Signal,
    pub arcache: Signal,

    pub rvalid: Signal,
    pub rready: Signal,
    pub rdata: Signal,
    pub rresp: Signal,
    pub rlast: Signal,

    pub id: Option<IdSignals>,

    n_lanes: u32,
}

impl AxiBus {
    /// Binds `<prefix>_<SUFFIX>` for the full signal set. Identifier
    /// signals are bound when `<prefix>_ARID` exists; a partial id set is
    /// an error.
    pub fn bind(sim: &Sim, prefix: &str) -> Result<Self, BusError> {
        let find = |suffix: &str| -> Result<Signal, BusError> {
            let name = format!("{prefix}_{suffix}");
            sim.lookup(&name).ok_or(BusError::MissingSignal(name))
        };
        let id = if has_id_signals(sim, prefix) {
            Some(IdSignals {
                awid: find("AWID")?,
                bid: find("BID")?,
                arid: find("ARID")?,
                rid: find("RID")?,
            })
        } else {
            None
        };
        let wdata = find("WDATA")?;
        let n_lanes = sim.width(wdata) / 8;
        assert!(n_lanes.is_power_of_two(), "{prefix}: odd bus width");
        Ok(Self {
            prefix: prefix.to_string(),
            awvalid: find("AWVALID")?,
            awready: find("AWREADY")?,
            awaddr: find("AWADDR")?,
            awprot: find("AWPROT")?,
            awlen: find("AWLEN")?,
            awsize: find("AWSIZE")?,
            awburst: find("AWBURST")?,
            awlock: find("AWLOCK")?,
            awcache: find("AWCACHE")?,
            wvalid: find("WVALID")?,
            wready: find("WREADY")?,
            wdata,
            wstrb: find("WSTRB")?,
            wlast: find("WLAST")?,
            bvalid: find("BVALID")?,
            bready: find("BREADY")?,
            bresp: find("BRESP")?,
            arvalid: find("ARVALID")?,
            arready: find("ARREADY")?,
            araddr: find("ARADDR")?,
            arprot: find("ARPROT")?,
            arlen: find("ARLEN")?,
            arsize: find("ARSIZE")?,
            arburst: find("ARBURST")?,
            arlock: find("ARLOCK")?,
            arcache: find("ARCACHE")?,
            rvalid: find("RVALID")?,
            rready: find("RREADY")?,
            rdata: find("RDATA")?,
            rresp: find("RRESP")?,
            rlast: find("RLAST")?,
            id,
            n_lanes,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Byte width of the data lanes.
    pub fn n_lanes(&self) -> u32 {
        self.n_lanes
    }

    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }
}

/// Aligns `addr` down to a multiple of `size` (a power of two).
pub fn align_addr(addr: u64, size: u64) -> u64 {
    (addr / size) * size
}

/// Inclusive byte-lane range `(lower, upper)` for each beat of a burst.
///
/// The first beat's lanes come from the unaligned address; every later
/// beat `n` uses the lane window of `aligned + (n - 1) * size`. With
/// `size` equal to the bus width the distinction vanishes (every beat is
/// full-width); for narrow transfers this is the canonical masking.
pub fn burst_lanes(
    addr: u64,
    aligned_addr: u64,
    size: u64,
    beats: usize,
    n_lanes: u64,
) -> Vec<(u32, u32)> {
    let mut lanes = Vec::with_capacity(beats);
    if beats == 0 {
        return lanes;
    }
    let lower0 = addr % n_lanes;
    let upper0 = aligned_addr + size - 1 - (addr - addr % n_lanes);
    lanes.push((lower0 as u32, upper0 as u32));
    for n in 1..beats {
        let a_n = aligned_addr + (n as u64 - 1) * size;
        let lower = a_n % n_lanes;
        let upper = lower + size - 1;
        lanes.push((lower as u32, upper as u32));
    }
    lanes
}

/// Write strobe with bits `[lower..=upper]` set.
pub fn strobe_from_lanes(lower: u32, upper: u32) -> u64 {
    debug_assert!(lower <= upper && upper < 64);
    let mut strb = 1u64 << upper;
    for i in lower..upper {
        strb |= 1 << i;
    }
    strb
}

/// Byte mask covering lanes `[lower..=upper]` of a data word.
pub fn lane_mask(lower: u32, upper: u32) -> u64 {
    let mut mask = 0u64;
    for lane in lower..=upper {
        mask |= 0xFF << (lane * 8);
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_full_width_burst_is_all_lanes() {
        let lanes = burst_lanes(0x100, 0x100, 4, 3, 4);
        assert_eq!(lanes, vec![(0, 3), (0, 3), (0, 3)]);
        for (lo, hi) in lanes {
            assert_eq!(strobe_from_lanes(lo, hi), 0b1111);
        }
    }

    #[test]
    fn unaligned_first_beat_masks_low_lanes() {
        // Address 0x102 on a 32-bit bus: only lanes 2 and 3 are live in
        // the first beat.
        let lanes = burst_lanes(0x102, 0x100, 4, 2, 4);
        assert_eq!(lanes[0], (2, 3));
        assert_eq!(strobe_from_lanes(2, 3), 0b1100);
        assert_eq!(lane_mask(2, 3), 0xFFFF_0000);
    }

    #[test]
    fn narrow_beats_walk_the_lanes() {
        // 2-byte beats on a 4-byte bus starting aligned.
        let lanes = burst_lanes(0x200, 0x200, 2, 4, 4);
        assert_eq!(lanes[0], (0, 1));
        // Later beats derive from aligned + (n - 1) * size.
        assert_eq!(lanes[1], (0, 1));
        assert_eq!(lanes[2], (2, 3));
        assert_eq!(lanes[3], (0, 1));
    }

    #[test]
    fn response_combine_keeps_the_worst() {
        assert_eq!(AxResp::Okay.combine(AxResp::SlvErr), AxResp::SlvErr);
        assert_eq!(AxResp::DecErr.combine(AxResp::Okay), AxResp::DecErr);
        assert_eq!(AxResp::Okay.combine(AxResp::ExOkay), AxResp::ExOkay);
        assert!(AxResp::ExOkay.is_okay());
    }

    #[test]
    fn prot_field_round_trips() {
        for bits in 0..8 {
            assert_eq!(AxProt::from_bits(bits) as u64, bits);
        }
        assert_eq!(AxBurst::from_bits(1), AxBurst::Incr);
        assert_eq!(AxResp::from_bits(2), AxResp::SlvErr);
    }
}
