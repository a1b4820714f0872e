// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus-level scenarios: the master model wired to the slave model through
//! the declared design signals, no server in the loop.

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use drv_axi_api::{AxBurst, AxProt, AxResp};
use drv_axi_master::Axi4Master;
use drv_axi_slave::{Axi4Slave, Memory};
use sim::{start_clock, wait_cycles, Sim};
use sim_bridge::design::{declare_design, Design, DesignConfig};
use sim_bridge::CLK_PERIOD_NS;
use task_sim_server::interrupt::{watch, SimInterrupt};

fn testbench(
    memory_size: usize,
    depth: usize,
) -> (Sim, Design, Axi4Master, Memory) {
    let sim = Sim::new();
    let design = declare_design(&sim, &DesignConfig::default());
    start_clock(&sim, design.clock, CLK_PERIOD_NS);
    sim.set_now(design.reset, 1);
    let memory = Memory::new(memory_size);
    let _slave = Axi4Slave::new(
        &sim,
        "S_AXI",
        design.clock,
        design.reset,
        memory.clone(),
        depth,
    )
    .unwrap();
    let master =
        Axi4Master::new(&sim, "S_AXI", design.clock, design.reset, depth)
            .unwrap();
    (sim, design, master, memory)
}

fn run_to_completion(sim: &Sim, test: impl Future<Output = ()> + 'static) {
    let finished = Rc::new(Cell::new(false));
    let finished2 = Rc::clone(&finished);
    let s = sim.clone();
    sim.spawn(async move {
        test.await;
        finished2.set(true);
        s.request_stop();
    });
    // Watchdog: a wedged scenario must fail the assert below, not spin
    // the kernel forever.
    let w = sim.clone();
    sim.spawn(async move {
        w.delay_ns(10_000_000).await;
        w.request_stop();
    });
    sim.run();
    assert!(finished.get(), "test task deadlocked");
}

#[test]
fn write_then_read_round_trips() {
    let (sim, _design, master, memory) = testbench(0x1000, 4);
    let m = master.clone();
    run_to_completion(&sim, async move {
        let w = m
            .write(
                0x100,
                &[0x0403_0201],
                AxBurst::Incr,
                AxProt::UnprivSecData,
                0,
            )
            .await
            .unwrap();
        assert_eq!(w.resp, AxResp::Okay);
        let r = m
            .read(0x100, 1, 4, AxBurst::Incr, AxProt::UnprivSecData, 0)
            .await
            .unwrap();
        assert_eq!(r.resp, AxResp::Okay);
        assert_eq!(r.data, vec![0x0403_0201]);
    });
    assert_eq!(memory.read_bytes(0x100, 4).unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn unaligned_write_strobes_only_the_addressed_lanes() {
    let (sim, _design, master, memory) = testbench(0x1000, 4);
    // Prefill so untouched bytes are provably untouched.
    memory.write_bytes(0x100, &[0x11; 8]);
    let m = master.clone();
    run_to_completion(&sim, async move {
        // Address 0x102: lanes 2 and 3 carry the payload, which sits in
        // the matching byte positions of the data word.
        let w = m
            .write(
                0x102,
                &[0xAABB_0000],
                AxBurst::Incr,
                AxProt::UnprivSecData,
                0,
            )
            .await
            .unwrap();
        assert_eq!(w.resp, AxResp::Okay);
    });
    assert_eq!(
        memory.read_bytes(0x100, 8).unwrap(),
        vec![0x11, 0x11, 0xBB, 0xAA, 0x11, 0x11, 0x11, 0x11],
    );
}

#[test]
fn burst_read_delivers_every_beat_and_one_last() {
    let (sim, _design, master, memory) = testbench(0x2000, 4);
    let mut seed = Vec::with_capacity(1024);
    for i in 0..1024u32 {
        seed.push(i as u8);
    }
    memory.write_bytes(0x400, &seed);

    // Wire monitor: count accepted read beats and last flags.
    let beats = Rc::new(Cell::new(0u32));
    let lasts = Rc::new(Cell::new(0u32));
    let last_at_beat = Rc::new(Cell::new(0u32));
    {
        let sim2 = sim.clone();
        let clk = sim.lookup("ext_ps_clk_in").unwrap();
        let rvalid = sim.lookup("S_AXI_RVALID").unwrap();
        let rready = sim.lookup("S_AXI_RREADY").unwrap();
        let rlast = sim.lookup("S_AXI_RLAST").unwrap();
        let beats = Rc::clone(&beats);
        let lasts = Rc::clone(&lasts);
        let last_at_beat = Rc::clone(&last_at_beat);
        sim.spawn(async move {
            loop {
                sim2.rising_edge(clk).await;
                if sim2.get(rvalid) != 0 && sim2.get(rready) != 0 {
                    beats.set(beats.get() + 1);
                    if sim2.get(rlast) != 0 {
                        lasts.set(lasts.get() + 1);
                        last_at_beat.set(beats.get());
                    }
                }
            }
        });
    }

    let m = master.clone();
    run_to_completion(&sim, async move {
        let r = m
            .read(0x400, 256, 4, AxBurst::Incr, AxProt::UnprivSecData, 0)
            .await
            .unwrap();
        assert_eq!(r.resp, AxResp::Okay);
        assert_eq!(r.data.len(), 256);
        let mut bytes = Vec::with_capacity(1024);
        for word in &r.data {
            bytes.extend_from_slice(&(*word as u32).to_le_bytes());
        }
        assert_eq!(bytes.len(), 1024);
        for (i, b) in bytes.iter().enumerate() {
            assert_eq!(*b, i as u8, "byte {i}");
        }
    });
    assert_eq!(beats.get(), 256, "beat count");
    assert_eq!(lasts.get(), 1, "last must assert exactly once");
    assert_eq!(last_at_beat.get(), 256, "last must ride the final beat");
}

#[test]
fn access_past_the_end_of_memory_is_a_slave_error() {
    let (sim, _design, master, memory) = testbench(0x1000, 4);
    let m = master.clone();
    run_to_completion(&sim, async move {
        // Last byte of memory: fine.
        let w = m
            .write(
                0xFFF,
                &[0x5A00_0000],
                AxBurst::Incr,
                AxProt::UnprivSecData,
                0,
            )
            .await
            .unwrap();
        assert_eq!(w.resp, AxResp::Okay);
        // First byte past it: slave error on the write...
        let w = m
            .write(
                0x1000,
                &[0x1234_5678],
                AxBurst::Incr,
                AxProt::UnprivSecData,
                0,
            )
            .await
            .unwrap();
        assert_eq!(w.resp, AxResp::SlvErr);
        // ...and on the read, whose data is masked away.
        let r = m
            .read(0x1000, 1, 4, AxBurst::Incr, AxProt::UnprivSecData, 0)
            .await
            .unwrap();
        assert_eq!(r.resp, AxResp::SlvErr);
        assert_eq!(r.data, vec![0]);
    });
    assert_eq!(memory.read_bytes(0xFFF, 1).unwrap(), vec![0x5A]);
}

#[test]
fn wrap_bursts_are_rejected_without_bus_traffic() {
    let (sim, _design, master, _memory) = testbench(0x1000, 4);
    let m = master.clone();
    run_to_completion(&sim, async move {
        let err = m
            .read(0x0, 4, 4, AxBurst::Wrap, AxProt::UnprivSecData, 0)
            .await
            .unwrap_err();
        assert_eq!(err, drv_axi_api::BusError::UnsupportedBurst);
        let err = m
            .write(0x0, &[1, 2], AxBurst::Wrap, AxProt::UnprivSecData, 0)
            .await
            .unwrap_err();
        assert_eq!(err, drv_axi_api::BusError::UnsupportedBurst);
    });
}

#[test]
fn fixed_burst_hammers_one_address() {
    let (sim, _design, master, memory) = testbench(0x1000, 4);
    let m = master.clone();
    run_to_completion(&sim, async move {
        let w = m
            .write(
                0x300,
                &[0x1111_1111, 0x2222_2222, 0x3333_3333],
                AxBurst::Fixed,
                AxProt::UnprivSecData,
                0,
            )
            .await
            .unwrap();
        assert_eq!(w.resp, AxResp::Okay);
        let r = m
            .read(0x300, 2, 4, AxBurst::Fixed, AxProt::UnprivSecData, 0)
            .await
            .unwrap();
        assert_eq!(r.resp, AxResp::Okay);
        // Every beat re-reads the same word, which holds the last beat
        // of the fixed write.
        assert_eq!(r.data, vec![0x3333_3333, 0x3333_3333]);
    });
    assert_eq!(
        memory.read_bytes(0x304, 4).unwrap(),
        vec![0, 0, 0, 0],
        "fixed burst must not advance"
    );
}

#[test]
fn reset_mid_burst_retries_to_success() {
    let (sim, design, master, memory) = testbench(0x4000, 4);
    let data: Vec<u64> = (0..64u64).map(|i| 0x1000_0000 + i).collect();
    let expected: Vec<u8> = data
        .iter()
        .flat_map(|w| (*w as u32).to_le_bytes())
        .collect();

    // Pulse reset while the burst is on the wire.
    {
        let sim2 = sim.clone();
        let clk = design.clock;
        let rst = design.reset;
        sim.spawn(async move {
            wait_cycles(&sim2, clk, 20).await;
            sim2.set_now(rst, 0);
            wait_cycles(&sim2, clk, 3).await;
            sim2.set_now(rst, 1);
        });
    }

    let m = master.clone();
    let data2 = data.clone();
    run_to_completion(&sim, async move {
        let w = m
            .write(0x800, &data2, AxBurst::Incr, AxProt::UnprivSecData, 0)
            .await
            .unwrap();
        // The wrapper retried through the reset; the caller only ever
        // sees the final, successful response.
        assert_eq!(w.resp, AxResp::Okay);
    });
    assert_eq!(memory.read_bytes(0x800, expected.len()).unwrap(), expected);
}

#[test]
fn interrupt_watcher_counts_rising_edges_until_deregistered() {
    let sim = Sim::new();
    let design = declare_design(&sim, &DesignConfig::default());
    start_clock(&sim, design.clock, CLK_PERIOD_NS);
    sim.set_now(design.reset, 1);

    let int = Arc::new(SimInterrupt::new("ext_intr_PE_0_0"));
    let line = design.interrupts[0];
    sim.spawn(watch(sim.clone(), line, Arc::clone(&int)));

    let sim2 = sim.clone();
    let clk = design.clock;
    let int2 = Arc::clone(&int);
    run_to_completion(&sim, async move {
        for _ in 0..5 {
            sim2.set_now(line, 1);
            wait_cycles(&sim2, clk, 1).await;
            sim2.set_now(line, 0);
            wait_cycles(&sim2, clk, 1).await;
        }
        assert_eq!(int2.count_and_clear(), 5);
        assert_eq!(int2.count_and_clear(), 0, "cleared on read");

        // Edges after deregistration must not count.
        int2.deregister();
        for _ in 0..3 {
            sim2.set_now(line, 1);
            wait_cycles(&sim2, clk, 1).await;
            sim2.set_now(line, 0);
            wait_cycles(&sim2, clk, 1).await;
        }
        assert_eq!(int2.count_and_clear(), 0);
    });
}
