// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker pool and request dispatch.
//!
//! A fixed pool of workers shares one listener. Each worker owns one
//! connection at a time and serves it frame by frame: translate the
//! request into an operation record, push it, block on the completion,
//! write the response back. Blocking per request is what gives a single
//! client in-order semantics; across clients no order is promised.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use task_sim_server_api::{
    read_frame, write_frame, ResponsePayload, SimRequest, SimResponse,
};

use crate::bridge::{Completion, OpQueue, SimOp, StatusCache};
use crate::interrupt::{InterruptMap, SimInterrupt};

pub struct ServerConfig {
    pub port: u16,
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 4040, workers: 10 }
    }
}

/// Shared server-side state.
struct Shared {
    ops: Arc<OpQueue>,
    interrupts: Arc<InterruptMap>,
    status: StatusCache,
    stop: Arc<AtomicBool>,
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    workers: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for every worker to exit (they do once the stop flag rises
    /// and their connection closes).
    pub fn join(self) {
        for w in self.workers {
            let _ = w.join();
        }
    }
}

/// Binds the listener and starts the worker pool. Returns once the
/// service is ready to accept requests.
pub fn start(
    config: &ServerConfig,
    ops: Arc<OpQueue>,
    interrupts: Arc<InterruptMap>,
    status: StatusCache,
    stop: Arc<AtomicBool>,
) -> io::Result<ServerHandle> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))?;
    let local_addr = listener.local_addr()?;
    // Nonblocking accept lets idle workers notice the stop flag.
    listener.set_nonblocking(true)?;
    let listener = Arc::new(listener);

    let mut workers = Vec::with_capacity(config.workers);
    for n in 0..config.workers {
        let listener = Arc::clone(&listener);
        let shared = Shared {
            ops: Arc::clone(&ops),
            interrupts: Arc::clone(&interrupts),
            status: status.clone(),
            stop: Arc::clone(&stop),
        };
        workers.push(
            thread::Builder::new()
                .name(format!("sim-server-{n}"))
                .spawn(move || worker_loop(&listener, &shared))
                .expect("spawning server worker"),
        );
    }
    info!("request server listening on {local_addr}");
    Ok(ServerHandle { local_addr, workers })
}

fn worker_loop(listener: &TcpListener, shared: &Shared) {
    while !shared.stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("serving {peer}");
                if let Err(e) = serve_connection(stream, shared) {
                    debug!("connection {peer} ended: {e}");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                warn!("accept failed: {e}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn serve_connection(
    stream: TcpStream,
    shared: &Shared,
) -> Result<(), task_sim_server_api::FrameError> {
    // The accept socket inherits nonblocking from the listener on some
    // platforms; requests are served strictly blocking.
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let mut reader = stream.try_clone()?;
    let mut writer = stream;
    while let Some(request) = read_frame::<_, SimRequest>(&mut reader)? {
        let response = handle(request, shared);
        write_frame(&mut writer, &response)?;
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }
    }
    Ok(())
}

/// Pushes `op` and blocks the worker until the simulator answers.
fn submit(shared: &Shared, op: SimOp, done: &Completion<SimResponse>) -> SimResponse {
    shared.ops.push(op);
    match done.wait_unless_stopped(&shared.stop) {
        Some(response) => response,
        None => SimResponse::error("simulation stopped"),
    }
}

fn handle(request: SimRequest, shared: &Shared) -> SimResponse {
    match request {
        SimRequest::WriteMemory { addr, data } => {
            let done = Completion::new();
            submit(
                shared,
                SimOp::WriteMemory { addr, data, done: done.clone() },
                &done,
            )
        }
        SimRequest::ReadMemory { addr, length } => {
            let done = Completion::new();
            submit(
                shared,
                SimOp::ReadMemory { addr, length, done: done.clone() },
                &done,
            )
        }
        SimRequest::ReadPlatform { addr, num_bytes } => {
            let done = Completion::new();
            submit(
                shared,
                SimOp::ReadPlatform { addr, num_bytes, done: done.clone() },
                &done,
            )
        }
        SimRequest::WritePlatform { addr, data } => {
            let done = Completion::new();
            submit(
                shared,
                SimOp::WritePlatform { addr, data, done: done.clone() },
                &done,
            )
        }
        SimRequest::RegisterInterrupt { fd, interrupt_id } => {
            let watcher = Arc::new(SimInterrupt::new(&format!(
                "ext_intr_PE_{interrupt_id}_0"
            )));
            // A descriptor already in use drops its previous watcher
            // first; the pump kills the old coroutine when it installs
            // the new one.
            if let Some(old) =
                shared.interrupts.insert(fd, Arc::clone(&watcher))
            {
                old.deregister();
            }
            let done = Completion::new();
            let response = submit(
                shared,
                SimOp::RegisterInterrupt { fd, watcher, done: done.clone() },
                &done,
            );
            if !response.is_ok() {
                // The simulator rejected the line (no such processing
                // element); don't leave a dead watcher registered.
                shared.interrupts.remove(fd);
            }
            response
        }
        SimRequest::DeregisterInterrupt { fd } => match shared
            .interrupts
            .remove(fd)
        {
            Some(watcher) => {
                watcher.deregister();
                let done = Completion::new();
                submit(
                    shared,
                    SimOp::DeregisterInterrupt { fd, done: done.clone() },
                    &done,
                )
            }
            // Unknown descriptors are removed silently.
            None => SimResponse::ok_void(),
        },
        SimRequest::GetStatus => {
            match shared.status.wait_unless_stopped(&shared.stop) {
                Some(bytes) => {
                    SimResponse::Ok(ResponsePayload::Status(bytes))
                }
                None => SimResponse::error("simulation stopped"),
            }
        }
        SimRequest::GetInterruptStatus { fd } => {
            match shared.interrupts.get(fd) {
                Some(watcher) => SimResponse::Ok(
                    ResponsePayload::InterruptCount(
                        watcher.count_and_clear(),
                    ),
                ),
                None => SimResponse::error(format!(
                    "Interrupt id {fd} is not registered"
                )),
            }
        }
    }
}
