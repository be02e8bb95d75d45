// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Session tests over an in-memory byte stream: the stub is transport
//! agnostic, so a scripted buffer stands in for a socket.

use picosim_core::system::rp2040;
use picosim_core::{Machine, PC_START};
use picosim_gdb::packet::{checksum, encode_reg, frame};
use picosim_gdb::{ByteStream, DebugSession, SessionEnd};
use std::collections::VecDeque;
use std::io::{self, Read, Write};

struct ScriptedStream {
    input: VecDeque<u8>,
    output: Vec<u8>,
}

impl ScriptedStream {
    fn new(input: Vec<u8>) -> Self {
        Self {
            input: input.into(),
            output: Vec::new(),
        }
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.input.pop_front() {
            Some(b) => {
                buf[0] = b;
                Ok(1)
            }
            None => Ok(0), // transport closed
        }
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteStream for ScriptedStream {
    fn poll_byte(&mut self) -> io::Result<Option<u8>> {
        Ok(self.input.pop_front())
    }
}

/// Frame each command and append the ack for the stub's reply.
fn script(cmds: &[&str]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for cmd in cmds {
        bytes.extend(frame(cmd));
        bytes.push(b'+');
    }
    bytes
}

fn machine_with_program(halfwords: &[u16]) -> Machine {
    let mut machine = rp2040().unwrap();
    let mut bytes = Vec::new();
    for h in halfwords {
        bytes.extend_from_slice(&h.to_le_bytes());
    }
    assert!(machine.bus.load_segment(PC_START, &bytes));
    machine.reset();
    machine
}

/// Run a session to completion, keeping the stream output for inspection.
fn run_session_capture(machine: Machine, input: Vec<u8>) -> (Machine, SessionEnd, String) {
    struct Capture(std::rc::Rc<std::cell::RefCell<Vec<u8>>>, ScriptedStream);
    impl Read for Capture {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.1.read(buf)
        }
    }
    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            self.1.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl ByteStream for Capture {
        fn poll_byte(&mut self) -> io::Result<Option<u8>> {
            self.1.poll_byte()
        }
    }

    let sink = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let stream = Capture(sink.clone(), ScriptedStream::new(input));
    let session = DebugSession::new(stream, machine);
    let (machine, result) = session.serve();
    let end = result.unwrap();
    let out = String::from_utf8(sink.borrow().clone()).unwrap();
    (machine, end, out)
}

#[test]
fn bad_checksum_gets_nack_then_retry_succeeds() {
    let machine = machine_with_program(&[0x2005]);
    // First attempt carries a wrong checksum, the retry a correct one.
    let mut input = b"$qAttached#00".to_vec();
    input.extend(frame("qAttached"));
    input.push(b'+');

    let (_machine, end, out) = run_session_capture(machine, input);
    assert_eq!(end, SessionEnd::TransportClosed);

    // NAK first, then the ack and the real reply.
    let nak = out.find('-').expect("expected a NAK");
    let ack = out.find('+').expect("expected an ACK");
    assert!(nak < ack);
    let expected = format!("$1#{:02x}", checksum(b"1"));
    assert!(out.contains(&expected), "output was: {}", out);
}

#[test]
fn halt_reason_and_support_queries() {
    let machine = machine_with_program(&[0x2005]);
    let input = script(&["?", "qSupported:multiprocess+", "Hg0", "qUnknownThing"]);
    let (_machine, _end, out) = run_session_capture(machine, input);

    assert!(out.contains(&String::from_utf8(frame("S05")).unwrap()));
    assert!(out.contains(&String::from_utf8(frame("PacketSize=4000")).unwrap()));
    assert!(out.contains(&String::from_utf8(frame("OK")).unwrap()));
    // Unknown commands get the empty reply.
    assert!(out.contains(&String::from_utf8(frame("")).unwrap()));
}

#[test]
fn register_read_reflects_machine_state() {
    let mut machine = machine_with_program(&[0x2005]);
    machine.write_core_reg(0, 0x1234_5678);
    let input = script(&["g"]);
    let (_machine, _end, out) = run_session_capture(machine, input);
    // R0 leads the register dump.
    assert!(out.contains(&format!("${}", encode_reg(0x1234_5678))));
    // PC is in there too, little-endian.
    assert!(out.contains(&encode_reg(PC_START)));
}

#[test]
fn register_write_round_trips() {
    let machine = machine_with_program(&[0x2005]);
    let input = script(&[&format!("P2={}", encode_reg(0xCAFE_F00D)), "p2"]);
    let (machine, _end, out) = run_session_capture(machine, input);
    assert_eq!(machine.read_core_reg(2), 0xCAFE_F00D);
    assert!(out.contains(&encode_reg(0xCAFE_F00D)));
}

#[test]
fn memory_write_then_read_back() {
    let machine = machine_with_program(&[0x2005]);
    let input = script(&["M20000000,4:deadbeef", "m20000000,4"]);
    let (machine, _end, out) = run_session_capture(machine, input);
    assert!(out.contains("deadbeef"));
    assert_eq!(machine.read_memory(0x2000_0000, 4).unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn memory_read_of_unmapped_address_is_an_error_reply() {
    let machine = machine_with_program(&[0x2005]);
    let input = script(&["m30000000,4"]);
    let (_machine, _end, out) = run_session_capture(machine, input);
    assert!(out.contains(&String::from_utf8(frame("E01")).unwrap()));
}

#[test]
fn breakpoint_continue_stops_with_sigtrap() {
    // MOVS R0, #1 ; MOVS R0, #2 ; B .
    let machine = machine_with_program(&[0x2001, 0x2002, 0xE7FE]);
    let bp = format!("Z0,{:x},2", PC_START + 2);
    let input = script(&[&bp, "c"]);
    let (machine, _end, out) = run_session_capture(machine, input);

    assert!(out.contains(&String::from_utf8(frame("S05")).unwrap()));
    assert_eq!(machine.pc(), PC_START + 2);
    assert_eq!(machine.read_core_reg(0), 1);
}

#[test]
fn single_step_executes_one_instruction() {
    let machine = machine_with_program(&[0x2001, 0x2002]);
    let input = script(&["s", "s"]);
    let (machine, _end, _out) = run_session_capture(machine, input);
    assert_eq!(machine.read_core_reg(0), 2);
    assert_eq!(machine.pc(), PC_START + 4);
}

#[test]
fn detach_ends_session_cleanly() {
    let machine = machine_with_program(&[0x2005]);
    let input = script(&["D"]);
    let (_machine, end, out) = run_session_capture(machine, input);
    assert_eq!(end, SessionEnd::Detached);
    assert!(out.contains(&String::from_utf8(frame("OK")).unwrap()));
}

#[test]
fn reply_is_retransmitted_on_nack() {
    let machine = machine_with_program(&[0x2005]);
    let mut input = frame("qAttached");
    input.push(b'-'); // reject the reply once
    input.push(b'+'); // then accept the retransmission
    let (_machine, _end, out) = run_session_capture(machine, input);

    let reply = String::from_utf8(frame("1")).unwrap();
    assert_eq!(out.matches(&reply).count(), 2);
}

#[test]
fn transport_close_resumes_policy() {
    let machine = machine_with_program(&[0x2005]);
    let (_machine, end, _out) = run_session_capture(machine, Vec::new());
    assert_eq!(end, SessionEnd::TransportClosed);
}
