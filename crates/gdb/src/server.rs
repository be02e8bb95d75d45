// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::session::DebugSession;
use picosim_core::{Machine, StopReason};
use std::io;
use std::net::TcpListener;
use std::time::Duration;

/// Instructions per free-running slice between accept polls.
const FREE_RUN_CHUNK: u64 = 50_000;

/// TCP front end for the debug stub: one accepted connection at a time.
/// Between sessions the machine free-runs, per the detach policy.
pub struct GdbServer {
    port: u16,
}

impl GdbServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn run(&self, mut machine: Machine) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))?;
        tracing::info!("GDB server listening on 0.0.0.0:{}", self.port);

        loop {
            // Wait for a debugger while keeping the machine running.
            let stream = self.accept_while_running(&listener, &mut machine)?;
            tracing::info!("GDB client connected");

            let session = DebugSession::new(stream, machine);
            let (returned, result) = session.serve();
            machine = returned;
            match result {
                Ok(end) => tracing::info!("GDB session ended: {:?}", end),
                Err(e) => tracing::warn!("GDB session error: {}", e),
            }
            // Detached or dropped: fall through, resume free-running.
        }
    }

    fn accept_while_running(
        &self,
        listener: &TcpListener,
        machine: &mut Machine,
    ) -> anyhow::Result<std::net::TcpStream> {
        listener.set_nonblocking(true)?;
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    tracing::debug!("Connection from {}", addr);
                    listener.set_nonblocking(false)?;
                    stream.set_nodelay(true).ok();
                    return Ok(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let (reason, executed) = machine.run(FREE_RUN_CHUNK);
                    match reason {
                        StopReason::LimitReached => {}
                        StopReason::Breakpoint(addr) => {
                            // Nobody is attached to consume the stop, so
                            // step over it and keep going.
                            tracing::debug!("Breakpoint at {:#010x} with no client", addr);
                            let _ = machine.step_single();
                        }
                        StopReason::Fault(fault) => {
                            tracing::error!("Fault while free-running: {}", fault);
                            // Park until a debugger attaches.
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        StopReason::StepDone => {}
                    }
                    if executed == 0 {
                        // Core parked in WFI with nothing pending; avoid
                        // a hot spin while we wait for a client.
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
