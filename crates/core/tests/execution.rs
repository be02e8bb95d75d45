// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Machine-level scenarios against the default RP2040 system.

use picosim_core::peripherals::uart::Uart;
use picosim_core::system::rp2040;
use picosim_core::{Fault, Machine, StopReason, PC_START};
use std::sync::{Arc, Mutex};

const UART0: u32 = 0x4003_4000;
const TIMER: u32 = 0x4005_4000;
const NVIC_ISER: u32 = 0xE000_E100;

fn load_halfwords(machine: &mut Machine, addr: u32, halfwords: &[u16]) {
    let mut bytes = Vec::new();
    for h in halfwords {
        bytes.extend_from_slice(&h.to_le_bytes());
    }
    assert!(machine.bus.load_segment(addr, &bytes));
}

#[test]
fn movs_adds_with_icount() {
    let mut machine = rp2040().unwrap();
    // MOVS R0, #5 ; ADDS R0, R0, #3
    load_halfwords(&mut machine, PC_START, &[0x2005, 0x1CC0]);
    machine.reset();

    let (reason, executed) = machine.run(2);
    assert_eq!(reason, StopReason::LimitReached);
    assert_eq!(executed, 2);
    assert_eq!(machine.read_core_reg(0), 8);
    // N/Z/C/V all clear.
    assert_eq!(machine.read_core_reg(16) & 0xF000_0000, 0);
}

#[test]
fn breakpoint_halts_before_execution() {
    let mut machine = rp2040().unwrap();
    // MOVS R0, #1 ; MOVS R0, #2 ; B .
    load_halfwords(&mut machine, PC_START, &[0x2001, 0x2002, 0xE7FE]);
    machine.reset();
    machine.add_breakpoint(PC_START + 2);

    let (reason, executed) = machine.run(0);
    assert_eq!(reason, StopReason::Breakpoint(PC_START + 2));
    assert_eq!(executed, 1);
    // The instruction at the breakpoint did not run.
    assert_eq!(machine.read_core_reg(0), 1);
    assert_eq!(machine.pc(), PC_START + 2);

    // Single-step executes exactly that instruction.
    assert_eq!(machine.step_single().unwrap(), StopReason::StepDone);
    assert_eq!(machine.read_core_reg(0), 2);
    assert_eq!(machine.pc(), PC_START + 4);
}

#[test]
fn uart_transmit_reaches_host_sink() {
    let mut machine = rp2040().unwrap();
    let sink = Arc::new(Mutex::new(Vec::new()));
    machine
        .bus
        .device_mut::<Uart>("uart0")
        .unwrap()
        .set_sink(Some(sink.clone()), false);

    // LDR R0, =UART0 ; MOVS R1, #0x41 ; STR R1, [R0] ; B .
    load_halfwords(
        &mut machine,
        PC_START,
        &[0x4802, 0x2141, 0x6001, 0xE7FE, 0x0000, 0x0000],
    );
    machine
        .bus
        .load_segment(PC_START + 0x0C, &UART0.to_le_bytes());
    machine.reset();

    let (reason, _) = machine.run(4);
    assert_eq!(reason, StopReason::LimitReached);
    assert_eq!(sink.lock().unwrap().as_slice(), &[0x41]);
}

#[test]
fn uart_interrupt_line_pends_in_nvic() {
    let mut machine = rp2040().unwrap();
    machine
        .bus
        .device_mut::<Uart>("uart0")
        .unwrap()
        .set_sink(Some(Arc::new(Mutex::new(Vec::new()))), false);

    // Unmask the TX interrupt, then transmit one byte.
    machine.bus.write_u32(UART0 + 0x38, 1 << 5).unwrap(); // UARTIMSC
    load_halfwords(
        &mut machine,
        PC_START,
        &[0x4802, 0x2141, 0x6001, 0xE7FE, 0x0000, 0x0000],
    );
    machine
        .bus
        .load_segment(PC_START + 0x0C, &UART0.to_le_bytes());
    machine.cores[0].set_pc(PC_START);

    machine.run(4);
    // UART0 is IRQ line 20; the level was latched into ISPR.
    use std::sync::atomic::Ordering;
    let pending = machine.irqs[0].state().ispr.load(Ordering::SeqCst);
    assert_ne!(pending & (1 << 20), 0);
}

#[test]
fn bus_fault_reports_address_and_preserves_registers() {
    let mut machine = rp2040().unwrap();
    // LDR R0, =0x30000000 ; LDR R0, [R0] (unmapped)
    load_halfwords(&mut machine, PC_START, &[0x4800, 0x6800, 0x0000, 0x0000]);
    machine
        .bus
        .load_segment(PC_START + 4, &0x3000_0000u32.to_le_bytes());
    machine.reset();
    machine.write_core_reg(1, 0x1234_5678);

    let (reason, executed) = machine.run(0);
    assert_eq!(executed, 1);
    match reason {
        StopReason::Fault(Fault::Bus { addr, .. }) => assert_eq!(addr, 0x3000_0000),
        other => panic!("expected bus fault, got {:?}", other),
    }
    // Unrelated registers are untouched; R0 still holds the address.
    assert_eq!(machine.read_core_reg(0), 0x3000_0000);
    assert_eq!(machine.read_core_reg(1), 0x1234_5678);
}

#[test]
fn timer_alarm_wakes_wfi_and_enters_handler() {
    let mut machine = rp2040().unwrap();

    const HANDLER: u32 = PC_START + 0x40;
    // Vector table lives in the bootrom at address zero; exception 16 is
    // IRQ line 0 (TIMER alarm 0).
    machine
        .bus
        .load_segment(16 * 4, &(HANDLER | 1).to_le_bytes());
    // Main: WFI ; B .  Handler: B .
    load_halfwords(&mut machine, PC_START, &[0xBF30, 0xE7FE]);
    load_halfwords(&mut machine, HANDLER, &[0xE7FE]);
    machine.cores[0].set_pc(PC_START);

    // Arm alarm 0 a few microseconds out and unmask it everywhere.
    machine.bus.write_u32(TIMER + 0x38, 0x1).unwrap(); // INTE
    let now = machine.bus.read_u32(TIMER + 0x28).unwrap(); // TIMERAWL
    machine.bus.write_u32(TIMER + 0x10, now + 5).unwrap(); // ALARM0
    machine.bus.write_u32(NVIC_ISER, 0x1).unwrap();

    let (reason, _) = machine.run(50);
    assert_eq!(reason, StopReason::LimitReached);
    // The core woke from WFI and is spinning in the handler.
    assert_eq!(machine.pc(), HANDLER);
    assert_eq!(machine.cores[0].ipsr(), 16);
}

#[test]
fn unaligned_word_access_faults() {
    let mut machine = rp2040().unwrap();
    // LDR R0, =0x20000002 ; LDR R1, [R0]
    load_halfwords(&mut machine, PC_START, &[0x4800, 0x6801, 0x0000, 0x0000]);
    machine
        .bus
        .load_segment(PC_START + 4, &0x2000_0002u32.to_le_bytes());
    machine.reset();

    let (reason, _) = machine.run(0);
    assert!(matches!(
        reason,
        StopReason::Fault(Fault::Unaligned { addr: 0x2000_0002, .. })
    ));
}

#[test]
fn undefined_instruction_reports_fault() {
    let mut machine = rp2040().unwrap();
    load_halfwords(&mut machine, PC_START, &[0xDE00]); // UDF
    machine.reset();
    let (reason, _) = machine.run(0);
    assert_eq!(
        reason,
        StopReason::Fault(Fault::Undefined {
            addr: PC_START,
            opcode: 0xDE00
        })
    );
}

#[test]
fn fault_escalation_enters_hard_fault() {
    let mut machine = rp2040().unwrap();
    machine.escalate_faults(true);

    const HANDLER: u32 = PC_START + 0x40;
    machine
        .bus
        .load_segment(3 * 4, &(HANDLER | 1).to_le_bytes()); // HardFault vector
    load_halfwords(&mut machine, PC_START, &[0xDE00]); // UDF
    load_halfwords(&mut machine, HANDLER, &[0xE7FE]);
    machine.cores[0].set_pc(PC_START);

    let (reason, _) = machine.run(10);
    assert_eq!(reason, StopReason::LimitReached);
    assert_eq!(machine.pc(), HANDLER);
    assert_eq!(machine.cores[0].ipsr(), 3);
}

#[test]
fn bootrom_vector_table_initializes_sp_and_pc() {
    let mut machine = rp2040().unwrap();
    // Bootrom word 0 is the initial SP, word 1 the reset vector.
    machine.bus.load_segment(0, &0x2004_0800u32.to_le_bytes());
    machine
        .bus
        .load_segment(4, &(0x1000_0355u32).to_le_bytes());
    machine.reset();
    assert_eq!(machine.read_core_reg(13), 0x2004_0800);
    // Thumb bit is dropped from the vector.
    assert_eq!(machine.pc(), 0x1000_0354);
}

#[test]
fn second_core_runs_when_released() {
    let mut machine = rp2040().unwrap();
    const CORE1_ENTRY: u32 = PC_START + 0x80;
    // Core 0: B . (idle loop). Core 1: MOVS R0, #9 ; STR into SRAM ; B .
    load_halfwords(&mut machine, PC_START, &[0xE7FE]);
    load_halfwords(
        &mut machine,
        CORE1_ENTRY,
        &[0x4801, 0x2109, 0x6001, 0xE7FE, 0x0000, 0x0000],
    );
    machine
        .bus
        .load_segment(CORE1_ENTRY + 8, &0x2000_0100u32.to_le_bytes());
    machine.cores[0].set_pc(PC_START);
    machine.start_core1(CORE1_ENTRY, 0x2003_0000);

    machine.run(6);
    assert_eq!(machine.bus.read_u32(0x2000_0100).unwrap(), 9);
}
