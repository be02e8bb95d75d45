// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::packet::{checksum, decode_hex, decode_reg, encode_hex, encode_reg, frame};
use crate::{ByteStream, GdbError};
use picosim_core::{Machine, StopReason};

/// Instructions executed between transport polls while continuing.
const RUN_CHUNK: u64 = 5_000;
/// Bound on reply retransmissions before the session counts as broken.
const MAX_RETRIES: usize = 5;
/// The asynchronous interrupt byte GDB sends to request a halt.
const INTERRUPT_BYTE: u8 = 0x03;

/// Protocol state of a session. Transitions: a packet arriving in
/// `AwaitingPacket` moves through `ProcessingCommand` into
/// `SendingReply`, then back once the reply is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    AwaitingPacket,
    ProcessingCommand,
    SendingReply,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Debugger detached (`D`) or killed the session (`k`); the machine
    /// resumes free-running per policy.
    Detached,
    /// Transport dropped mid-session; same resume policy.
    TransportClosed,
}

enum Incoming {
    Packet(String),
    Interrupt,
    Eof,
}

enum Action {
    /// Reply already sent; wait for the next packet.
    Handled,
    Resume,
    Step,
    Detach,
    Kill,
}

/// One attached debugger connection: a protocol state machine over an
/// opaque byte stream, owning the machine it controls. Created on
/// connect, dropped on disconnect; the machine survives the session.
pub struct DebugSession<S: ByteStream> {
    stream: S,
    pub machine: Machine,
    state: SessionState,
    /// Kept for retransmission on '-'.
    last_reply: Option<Vec<u8>>,
    pushback: Option<u8>,
}

impl<S: ByteStream> DebugSession<S> {
    pub fn new(stream: S, machine: Machine) -> Self {
        Self {
            stream,
            machine,
            state: SessionState::Idle,
            last_reply: None,
            pushback: None,
        }
    }

    /// Run the request/reply loop until the debugger detaches or the
    /// transport drops. Returns the machine to the caller either way.
    pub fn serve(mut self) -> (Machine, Result<SessionEnd, GdbError>) {
        let result = self.serve_inner();
        (self.machine, result)
    }

    fn serve_inner(&mut self) -> Result<SessionEnd, GdbError> {
        loop {
            self.state = SessionState::AwaitingPacket;
            match self.read_packet()? {
                Incoming::Eof => return Ok(SessionEnd::TransportClosed),
                Incoming::Interrupt => {
                    // Already halted between packets; report the stop.
                    self.send_reply("S02")?;
                }
                Incoming::Packet(payload) => {
                    self.state = SessionState::ProcessingCommand;
                    match self.handle_command(&payload)? {
                        Action::Handled => {}
                        Action::Step => {
                            let reason = self.machine.step_single();
                            self.report_stop(reason.map_err(Into::into))?;
                        }
                        Action::Resume => self.resume()?,
                        Action::Detach => {
                            self.send_reply("OK")?;
                            return Ok(SessionEnd::Detached);
                        }
                        Action::Kill => return Ok(SessionEnd::Detached),
                    }
                }
            }
        }
    }

    fn read_byte(&mut self) -> Result<Option<u8>, GdbError> {
        if let Some(b) = self.pushback.take() {
            return Ok(Some(b));
        }
        let mut buf = [0u8; 1];
        match self.stream.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) => Err(GdbError::Transport(e)),
        }
    }

    /// Read one well-framed packet, acknowledging as we go: a valid
    /// checksum earns '+', an invalid one earns '-' and we keep waiting
    /// for the retransmission.
    fn read_packet(&mut self) -> Result<Incoming, GdbError> {
        loop {
            // Hunt for the packet start. Stray acks between packets carry
            // no information here.
            loop {
                match self.read_byte()? {
                    None => return Ok(Incoming::Eof),
                    Some(INTERRUPT_BYTE) => return Ok(Incoming::Interrupt),
                    Some(b'$') => break,
                    Some(_) => continue,
                }
            }

            let mut payload = Vec::new();
            loop {
                match self.read_byte()? {
                    None => return Ok(Incoming::Eof),
                    Some(b'#') => break,
                    Some(b) => payload.push(b),
                }
            }
            let mut cs = [0u8; 2];
            for slot in &mut cs {
                match self.read_byte()? {
                    None => return Ok(Incoming::Eof),
                    Some(b) => *slot = b,
                }
            }

            let declared = u8::from_str_radix(
                std::str::from_utf8(&cs).unwrap_or("zz"),
                16,
            );
            let valid = declared.map(|d| d == checksum(&payload)).unwrap_or(false);
            if !valid {
                tracing::debug!("Packet checksum mismatch, sending NAK");
                self.stream
                    .write_all(b"-")
                    .map_err(GdbError::Transport)?;
                continue;
            }

            self.stream
                .write_all(b"+")
                .map_err(GdbError::Transport)?;
            let payload = String::from_utf8_lossy(&payload).into_owned();
            tracing::trace!("<- {}", payload);
            return Ok(Incoming::Packet(payload));
        }
    }

    /// Send a framed reply and wait for the acknowledgment, retransmitting
    /// on '-' up to the retry bound.
    fn send_reply(&mut self, payload: &str) -> Result<(), GdbError> {
        self.state = SessionState::SendingReply;
        tracing::trace!("{:?} -> {}", self.state, payload);
        let framed = frame(payload);
        self.stream
            .write_all(&framed)
            .map_err(GdbError::Transport)?;
        self.last_reply = Some(framed);

        let mut retries = 0;
        loop {
            match self.read_byte()? {
                None => return Ok(()), // EOF surfaces on the next read
                Some(b'+') => {
                    self.state = SessionState::Idle;
                    return Ok(());
                }
                Some(b'-') => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(GdbError::RetriesExhausted);
                    }
                    if let Some(framed) = &self.last_reply {
                        self.stream
                            .write_all(framed)
                            .map_err(GdbError::Transport)?;
                    }
                }
                Some(other) => {
                    // The debugger moved on; treat it as an implicit ack.
                    self.pushback = Some(other);
                    self.state = SessionState::Idle;
                    return Ok(());
                }
            }
        }
    }

    fn handle_command(&mut self, payload: &str) -> Result<Action, GdbError> {
        let reply: String = match payload.chars().next() {
            Some('?') => "S05".to_string(),
            Some('g') => self.read_all_registers(),
            Some('G') => self.write_all_registers(&payload[1..]),
            Some('p') => self.read_one_register(&payload[1..]),
            Some('P') => self.write_one_register(&payload[1..]),
            Some('m') => self.read_memory(&payload[1..]),
            Some('M') => self.write_memory(&payload[1..]),
            Some('Z') | Some('z') => self.handle_breakpoint(payload),
            Some('s') => return Ok(Action::Step),
            Some('c') => return Ok(Action::Resume),
            Some('D') => return Ok(Action::Detach),
            Some('k') => return Ok(Action::Kill),
            Some('H') => "OK".to_string(),
            Some('q') => {
                if payload.starts_with("qSupported") {
                    "PacketSize=4000".to_string()
                } else if payload == "qAttached" {
                    "1".to_string()
                } else {
                    String::new()
                }
            }
            // Unknown commands get the empty reply, never an error path
            // into the engine.
            _ => String::new(),
        };
        self.send_reply(&reply)?;
        Ok(Action::Handled)
    }

    fn read_all_registers(&self) -> String {
        let mut s = String::new();
        for i in 0..=16 {
            s.push_str(&encode_reg(self.machine.read_core_reg(i)));
        }
        s
    }

    fn write_all_registers(&mut self, hex: &str) -> String {
        if hex.len() < 17 * 8 {
            return "E01".to_string();
        }
        for i in 0..=16u8 {
            let chunk = &hex[i as usize * 8..i as usize * 8 + 8];
            match decode_reg(chunk) {
                Some(val) => self.machine.write_core_reg(i, val),
                None => return "E01".to_string(),
            }
        }
        "OK".to_string()
    }

    fn gdb_reg_id(id: u32) -> Option<u8> {
        match id {
            0..=15 => Some(id as u8),
            // xPSR in both our compact numbering and GDB's ARM layout.
            16 | 25 => Some(16),
            _ => None,
        }
    }

    fn read_one_register(&self, arg: &str) -> String {
        match u32::from_str_radix(arg, 16).ok().and_then(Self::gdb_reg_id) {
            Some(id) => encode_reg(self.machine.read_core_reg(id)),
            None => "E01".to_string(),
        }
    }

    fn write_one_register(&mut self, arg: &str) -> String {
        let Some((id_str, val_str)) = arg.split_once('=') else {
            return "E01".to_string();
        };
        let id = u32::from_str_radix(id_str, 16).ok().and_then(Self::gdb_reg_id);
        match (id, decode_reg(val_str)) {
            (Some(id), Some(val)) => {
                self.machine.write_core_reg(id, val);
                "OK".to_string()
            }
            _ => "E01".to_string(),
        }
    }

    fn read_memory(&self, arg: &str) -> String {
        let Some((addr_str, len_str)) = arg.split_once(',') else {
            return "E01".to_string();
        };
        let (Ok(addr), Ok(len)) = (
            u32::from_str_radix(addr_str, 16),
            usize::from_str_radix(len_str, 16),
        ) else {
            return "E01".to_string();
        };
        match self.machine.read_memory(addr, len) {
            Ok(bytes) => encode_hex(&bytes),
            Err(fault) => {
                tracing::debug!("Memory read failed: {}", fault);
                "E01".to_string()
            }
        }
    }

    fn write_memory(&mut self, arg: &str) -> String {
        let Some((spec, hex)) = arg.split_once(':') else {
            return "E01".to_string();
        };
        let Some((addr_str, len_str)) = spec.split_once(',') else {
            return "E01".to_string();
        };
        let (Ok(addr), Ok(len)) = (
            u32::from_str_radix(addr_str, 16),
            usize::from_str_radix(len_str, 16),
        ) else {
            return "E01".to_string();
        };
        match decode_hex(hex) {
            Some(bytes) if bytes.len() == len => match self.machine.write_memory(addr, &bytes) {
                Ok(()) => "OK".to_string(),
                Err(_) => "E01".to_string(),
            },
            _ => "E01".to_string(),
        }
    }

    fn handle_breakpoint(&mut self, payload: &str) -> String {
        let parts: Vec<&str> = payload[1..].split(',').collect();
        if parts.len() < 2 || parts[0] != "0" {
            // Only software breakpoints are supported.
            return String::new();
        }
        let Ok(addr) = u32::from_str_radix(parts[1], 16) else {
            return "E01".to_string();
        };
        if payload.starts_with('Z') {
            self.machine.add_breakpoint(addr);
        } else {
            self.machine.remove_breakpoint(addr);
        }
        "OK".to_string()
    }

    /// Continue execution, polling the transport for the asynchronous
    /// interrupt byte between bounded run chunks. The engine only
    /// observes the halt request at an instruction boundary.
    fn resume(&mut self) -> Result<(), GdbError> {
        loop {
            let (reason, _) = self.machine.run(RUN_CHUNK);
            match reason {
                StopReason::LimitReached => match self.stream.poll_byte() {
                    Ok(Some(INTERRUPT_BYTE)) => return self.send_reply("S02"),
                    Ok(Some(other)) => self.pushback = Some(other),
                    Ok(None) => {}
                    Err(e) => return Err(GdbError::Transport(e)),
                },
                other => return self.report_stop(Ok(other)),
            }
        }
    }

    fn report_stop(&mut self, reason: Result<StopReason, GdbError>) -> Result<(), GdbError> {
        let reply = match reason {
            Ok(StopReason::Breakpoint(_)) | Ok(StopReason::StepDone) => "S05".to_string(),
            Ok(StopReason::Fault(fault)) => {
                tracing::info!("Stopped on fault: {}", fault);
                "S0b".to_string()
            }
            Ok(StopReason::LimitReached) => "S05".to_string(),
            Err(_) => "S0b".to_string(),
        };
        self.send_reply(&reply)
    }
}

impl From<picosim_core::Fault> for GdbError {
    fn from(fault: picosim_core::Fault) -> Self {
        GdbError::Protocol(fault.to_string())
    }
}
