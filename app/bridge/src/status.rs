// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot prefetch of the design's status structure.
//!
//! The status core sits at a fixed base address and holds a length-
//! prefixed blob describing the composition. The prefix is unsigned
//! LEB128; everything after it, for `length` bytes, is opaque to the
//! bridge and handed to the runtime verbatim. The whole window is pulled
//! once at simulation start with full-rate bursts; requests that want the
//! status before the prefetch lands park on the cache.

use drv_axi_api::{AxBurst, AxProt, AxResp};
use drv_axi_master::Axi4Master;
use log::info;
use task_sim_server::StatusCache;

/// Fixed base address of the status core.
pub const STATUS_BASE: u64 = 0x1000_0000;

/// Bytes fetched from the status base; the blob must fit inside.
pub const STATUS_WINDOW: usize = 1 << 13;

/// Beats per fetch burst (the largest a single address phase covers).
const BEATS_PER_BURST: u32 = 256;

/// Reads the status window and publishes the decoded blob. A malformed
/// status structure means the design image and the bridge disagree about
/// the platform; there is nothing sensible to do but stop, loudly.
pub async fn prefetch_status(axim: Axi4Master, cache: StatusCache) {
    let mut raw = Vec::with_capacity(STATUS_WINDOW);
    let mut offset = 0usize;
    while offset < STATUS_WINDOW {
        let burst = axim
            .read(
                STATUS_BASE + offset as u64,
                BEATS_PER_BURST,
                4,
                AxBurst::Incr,
                AxProt::UnprivSecData,
                0,
            )
            .await
            .unwrap_or_else(|e| {
                panic!("status prefetch failed at offset {offset}: {e}")
            });
        assert!(
            burst.resp == AxResp::Okay,
            "status prefetch got {:?} at offset {offset}",
            burst.resp
        );
        for word in burst.data {
            raw.extend_from_slice(&(word as u32).to_le_bytes());
        }
        offset += (BEATS_PER_BURST * 4) as usize;
    }
    let payload = match parse_status(&raw) {
        Ok(payload) => payload,
        Err(e) => panic!("malformed status structure: {e}"),
    };
    info!("status structure prefetched: {} bytes", payload.len());
    cache.set(payload);
}

/// Splits the raw window into the LEB128 length prefix and the payload it
/// announces.
pub fn parse_status(raw: &[u8]) -> Result<Vec<u8>, String> {
    let mut reader = raw;
    let length = leb128::read::unsigned(&mut reader)
        .map_err(|e| format!("bad length prefix: {e}"))?;
    let length = usize::try_from(length)
        .map_err(|_| format!("absurd status length {length}"))?;
    if length > reader.len() {
        return Err(format!(
            "status length {length} exceeds the {}-byte window remainder",
            reader.len()
        ));
    }
    Ok(reader[..length].to_vec())
}
