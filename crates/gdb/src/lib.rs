// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! GDB remote-protocol debug stub: packet framing, the per-connection
//! session state machine, and a TCP server front end. The stub only ever
//! touches the machine between `run`/`step` calls.

pub mod packet;
pub mod server;
pub mod session;

pub use server::GdbServer;
pub use session::{DebugSession, SessionEnd};

use std::io::{self, Read, Write};

/// Protocol and transport failures. Protocol faults are recovered
/// in-session (negative acks, error replies); the rest tear the
/// session down.
#[derive(Debug, thiserror::Error)]
pub enum GdbError {
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
    #[error("reply retransmission limit exceeded")]
    RetriesExhausted,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// The duplex byte stream a session runs over. `poll_byte` is the
/// non-blocking probe used while the engine is free-running, so an
/// asynchronous interrupt request can be noticed at the next
/// instruction boundary.
pub trait ByteStream: Read + Write {
    fn poll_byte(&mut self) -> io::Result<Option<u8>>;
}

impl ByteStream for std::net::TcpStream {
    fn poll_byte(&mut self) -> io::Result<Option<u8>> {
        self.set_nonblocking(true)?;
        let mut buf = [0u8; 1];
        let res = match self.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        };
        self.set_nonblocking(false)?;
        res
    }
}
