// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The whole stack: kernel, models, pump, worker pool, and a TCP client
//! on the other side of the wire.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use sim_bridge::entry::{run_simulation, BridgeOptions};
use task_sim_server::Completion;
use task_sim_server_api::{
    PlatformData, ResponsePayload, SimClient, SimRequest, SimResponse,
};

const MEMORY_SIZE: usize = 1 << 20;

struct Bridge {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Bridge {
    fn start(status_payload: &[u8]) -> Self {
        let mut status_image = Vec::new();
        leb128::write::unsigned(
            &mut status_image,
            status_payload.len() as u64,
        )
        .unwrap();
        status_image.extend_from_slice(status_payload);

        let options = BridgeOptions {
            port: 0, // ephemeral; we learn the real one from `ready`
            workers: 4,
            memory_size: MEMORY_SIZE,
            status_image,
            ..BridgeOptions::default()
        };
        let stop = Arc::new(AtomicBool::new(false));
        let ready: Completion<SocketAddr> = Completion::new();
        let ready2 = ready.clone();
        let stop2 = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("sim-kernel".into())
            .spawn(move || run_simulation(options, stop2, Some(ready2)))
            .unwrap();
        let addr = ready.wait();
        Bridge { addr, stop, thread: Some(thread) }
    }

    fn connect(&self) -> SimClient {
        SimClient::connect(("127.0.0.1", self.addr.port())).unwrap()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[test]
fn the_full_request_surface_over_tcp() {
    let bridge = Bridge::start(b"platform-status");
    let mut client = bridge.connect();

    // get_status parks until the prefetch lands, then returns the blob;
    // a second call sees identical bytes.
    let status = client.call(&SimRequest::GetStatus).unwrap();
    assert_eq!(
        status,
        SimResponse::Ok(ResponsePayload::Status(
            b"platform-status".to_vec()
        ))
    );
    let again = client.call(&SimRequest::GetStatus).unwrap();
    assert_eq!(again, status);

    // Memory round trip.
    let resp = client
        .call(&SimRequest::WriteMemory {
            addr: 0x100,
            data: vec![0x01, 0x02, 0x03, 0x04],
        })
        .unwrap();
    assert_eq!(resp, SimResponse::ok_void());
    let resp = client
        .call(&SimRequest::ReadMemory { addr: 0x100, length: 4 })
        .unwrap();
    assert_eq!(
        resp,
        SimResponse::Ok(ResponsePayload::Bytes(vec![1, 2, 3, 4]))
    );

    // Platform word round trip.
    let resp = client
        .call(&SimRequest::WritePlatform {
            addr: 0x1000_0040,
            data: PlatformData::U32(vec![0xDEAD_BEEF]),
        })
        .unwrap();
    assert_eq!(resp, SimResponse::ok_void());
    let resp = client
        .call(&SimRequest::ReadPlatform { addr: 0x1000_0040, num_bytes: 4 })
        .unwrap();
    assert_eq!(
        resp,
        SimResponse::Ok(ResponsePayload::Words(vec![0xDEAD_BEEF]))
    );

    // 64-bit platform values split little-endian into word pairs.
    let resp = client
        .call(&SimRequest::WritePlatform {
            addr: 0x1000_0080,
            data: PlatformData::U64(vec![0x1122_3344_5566_7788]),
        })
        .unwrap();
    assert_eq!(resp, SimResponse::ok_void());
    let resp = client
        .call(&SimRequest::ReadPlatform { addr: 0x1000_0080, num_bytes: 8 })
        .unwrap();
    assert_eq!(
        resp,
        SimResponse::Ok(ResponsePayload::Words(vec![
            0x5566_7788,
            0x1122_3344
        ]))
    );

    // Interrupt registry.
    let resp = client
        .call(&SimRequest::RegisterInterrupt { fd: 7, interrupt_id: 0 })
        .unwrap();
    assert_eq!(resp, SimResponse::ok_void());
    let resp = client
        .call(&SimRequest::GetInterruptStatus { fd: 7 })
        .unwrap();
    assert_eq!(
        resp,
        SimResponse::Ok(ResponsePayload::InterruptCount(0))
    );
    // Unknown descriptor: a reported error.
    let resp = client
        .call(&SimRequest::GetInterruptStatus { fd: 99 })
        .unwrap();
    match resp {
        SimResponse::Error { reason } => {
            assert!(reason.contains("not registered"), "{reason}");
        }
        other => panic!("expected an error, got {other:?}"),
    }
    // A processing element the design doesn't have: rejected, and the
    // dead registration must not linger.
    let resp = client
        .call(&SimRequest::RegisterInterrupt { fd: 8, interrupt_id: 99 })
        .unwrap();
    assert!(!resp.is_ok());
    let resp = client
        .call(&SimRequest::GetInterruptStatus { fd: 8 })
        .unwrap();
    assert!(!resp.is_ok());
    // Deregistration, known and unknown, is quiet.
    let resp = client
        .call(&SimRequest::DeregisterInterrupt { fd: 7 })
        .unwrap();
    assert_eq!(resp, SimResponse::ok_void());
    let resp = client
        .call(&SimRequest::DeregisterInterrupt { fd: 42 })
        .unwrap();
    assert_eq!(resp, SimResponse::ok_void());

    // Out-of-range memory traffic surfaces as a slave error, not a hang.
    let resp = client
        .call(&SimRequest::WriteMemory {
            addr: MEMORY_SIZE as u64,
            data: vec![0xFF],
        })
        .unwrap();
    match resp {
        SimResponse::Error { reason } => {
            assert!(reason.contains("slave-error"), "{reason}");
        }
        other => panic!("expected an error, got {other:?}"),
    }
    let resp = client
        .call(&SimRequest::ReadMemory {
            addr: (MEMORY_SIZE - 2) as u64,
            length: 4,
        })
        .unwrap();
    assert!(!resp.is_ok());
}

#[test]
fn clients_serialize_their_own_requests() {
    let bridge = Bridge::start(b"");
    // Two independent connections interleave; each sees its own writes
    // in order.
    let mut a = bridge.connect();
    let mut b = bridge.connect();
    for i in 0..8u8 {
        let resp = a
            .call(&SimRequest::WriteMemory {
                addr: 0x1000 + u64::from(i),
                data: vec![i],
            })
            .unwrap();
        assert_eq!(resp, SimResponse::ok_void());
        let resp = b
            .call(&SimRequest::WriteMemory {
                addr: 0x2000 + u64::from(i),
                data: vec![0xF0 | i],
            })
            .unwrap();
        assert_eq!(resp, SimResponse::ok_void());
    }
    let resp = a
        .call(&SimRequest::ReadMemory { addr: 0x1000, length: 8 })
        .unwrap();
    assert_eq!(
        resp,
        SimResponse::Ok(ResponsePayload::Bytes(
            (0..8).collect::<Vec<u8>>()
        ))
    );
    let resp = b
        .call(&SimRequest::ReadMemory { addr: 0x2000, length: 8 })
        .unwrap();
    assert_eq!(
        resp,
        SimResponse::Ok(ResponsePayload::Bytes(
            (0..8).map(|i| 0xF0 | i).collect::<Vec<u8>>()
        ))
    );
}
