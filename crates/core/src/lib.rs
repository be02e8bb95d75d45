// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod bus;
pub mod cpu;
pub mod decoder;
pub mod interrupt;
pub mod memory;
pub mod peripherals;
pub mod system;

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub use bus::SystemBus;
pub use cpu::CortexM0;
pub use interrupt::IrqController;

/// Default reset values when no bootrom provides a vector table.
pub const PC_START: u32 = 0x1000_0000;
pub const SP_START: u32 = 0x2004_1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Fetch,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
            Access::Fetch => write!(f, "fetch"),
        }
    }
}

/// Runtime faults raised by the engine. These are reported to the caller,
/// never allowed to take the process down.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    #[error("bus fault: {access} of {width} byte(s) at {addr:#010x}")]
    Bus { addr: u32, width: u8, access: Access },
    #[error("unaligned {access} of {width} byte(s) at {addr:#010x}")]
    Unaligned { addr: u32, width: u8, access: Access },
    #[error("undefined instruction {opcode:#06x} at {addr:#010x}")]
    Undefined { addr: u32, opcode: u32 },
}

impl Fault {
    /// The address the fault is attributed to, for host-side reporting.
    pub fn address(&self) -> u32 {
        match self {
            Fault::Bus { addr, .. } => *addr,
            Fault::Unaligned { addr, .. } => *addr,
            Fault::Undefined { addr, .. } => *addr,
        }
    }
}

pub type EmuResult<T> = Result<T, Fault>;

/// Trait implemented by every memory-mapped register block.
///
/// Offsets are relative to the block base; `width` is 1, 2 or 4. Reads
/// and writes may have side effects (FIFO push/pop, interrupt state);
/// `peek` must not.
pub trait Peripheral: fmt::Debug + Send {
    fn read(&mut self, offset: u32, width: u8) -> EmuResult<u32>;
    fn write(&mut self, offset: u32, width: u8, value: u32) -> EmuResult<()>;

    /// Side-effect-free view for debugger inspection.
    fn peek(&self, _offset: u32, _width: u8) -> u32 {
        0
    }

    /// Advance device time by `micros` microseconds.
    fn tick(&mut self, _micros: u64) {}

    /// Currently asserted interrupt lines as a bitmask, bit 0 being the
    /// line number configured for this block (devices with several lines
    /// occupy consecutive numbers).
    fn irq_lines(&self) -> u32 {
        0
    }

    /// Number of consecutive interrupt lines this block drives.
    fn irq_span(&self) -> u32 {
        1
    }

    fn as_any(&self) -> Option<&dyn Any> {
        None
    }
    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }
}

/// Result of a single engine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One instruction (or one exception entry) committed.
    Continue,
    /// A breakpoint or BKPT instruction was hit before executing at this PC.
    Breakpoint(u32),
    /// The core is parked in WFI; the instruction counter did not advance.
    WaitForInterrupt,
}

/// Terminal state of a `run` or `step_single` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint(u32),
    Fault(Fault),
    LimitReached,
    StepDone,
}

/// A complete emulated machine: one or two cores against a shared bus,
/// per-core interrupt controllers over shared NVIC state, the breakpoint
/// set, and the instruction counter.
pub struct Machine {
    pub cores: Vec<CortexM0>,
    pub irqs: Vec<IrqController>,
    pub bus: SystemBus,
    pub breakpoints: HashSet<u32>,
    pub instructions: u64,
    /// Which core is currently executing; SIO CPUID reads observe this.
    active_core: Arc<AtomicU32>,
    core1_running: bool,
    escalate_faults: bool,
}

impl Machine {
    pub fn new(
        bus: SystemBus,
        cores: Vec<CortexM0>,
        irqs: Vec<IrqController>,
        active_core: Arc<AtomicU32>,
    ) -> Self {
        assert_eq!(cores.len(), irqs.len());
        Self {
            cores,
            irqs,
            bus,
            breakpoints: HashSet::new(),
            instructions: 0,
            active_core,
            core1_running: false,
            escalate_faults: false,
        }
    }

    /// When enabled, bus and decode faults pend HardFault on the faulting
    /// core instead of stopping the run.
    pub fn escalate_faults(&mut self, enabled: bool) {
        self.escalate_faults = enabled;
    }

    /// Release core 1 from its post-reset parking loop.
    pub fn start_core1(&mut self, entry: u32, sp: u32) {
        if self.cores.len() > 1 {
            self.cores[1].set_sp(sp);
            self.cores[1].set_pc(entry);
            self.core1_running = true;
        }
    }

    pub fn load_firmware(&mut self, image: &memory::ProgramImage) {
        for segment in &image.segments {
            if !self.bus.load_segment(segment.start_addr, &segment.data) {
                tracing::warn!(
                    "Segment at {:#010x} ({} bytes) is outside the memory map",
                    segment.start_addr,
                    segment.data.len()
                );
            }
        }
        self.reset();
        // Without a bootrom vector table, start at the image entry point.
        if self.bus.read_u32(4).unwrap_or(0) == 0 {
            self.cores[0].set_pc(image.entry_point);
        }
    }

    /// Reset all cores: SP/PC from the vector table when a bootrom is
    /// mapped, otherwise the flash-image defaults.
    pub fn reset(&mut self) {
        for core in &mut self.cores {
            core.reset(&mut self.bus);
        }
        for irq in &mut self.irqs {
            irq.reset();
        }
    }

    fn step_cores(&mut self) -> EmuResult<StepOutcome> {
        let outcome = self.step_one_core(0)?;
        if self.core1_running {
            // Core 1 shares the bus but runs its own loop; its faults and
            // breakpoints do not stop the primary engine.
            if let Err(fault) = self.step_one_core(1) {
                tracing::warn!("core1: {}", fault);
            }
        }
        let ticks = self.bus.tick_peripherals(1);
        for irq in &mut self.irqs {
            irq.sync_lines(&ticks);
        }
        Ok(outcome)
    }

    fn step_one_core(&mut self, idx: usize) -> EmuResult<StepOutcome> {
        self.active_core.store(idx as u32, Ordering::Relaxed);
        let res = self.cores[idx].step(&mut self.bus, &mut self.irqs[idx]);
        match res {
            Err(fault) if self.escalate_faults => {
                tracing::debug!("core{}: {} -> HardFault", idx, fault);
                self.irqs[idx].pend_core(interrupt::EXC_HARD_FAULT);
                Ok(StepOutcome::Continue)
            }
            other => other,
        }
    }

    /// Execute exactly one instruction boundary. Checks the breakpoint set
    /// before doing anything; a hit reports without advancing any state.
    pub fn step(&mut self) -> EmuResult<StepOutcome> {
        let pc = self.cores[0].pc() & !1;
        if self.breakpoints.contains(&pc) {
            return Ok(StepOutcome::Breakpoint(pc));
        }
        let outcome = self.step_cores()?;
        if outcome == StepOutcome::Continue {
            self.instructions += 1;
        }
        Ok(outcome)
    }

    /// Single-step over a breakpoint: executes the instruction at PC even
    /// when it is in the breakpoint set.
    pub fn step_single(&mut self) -> EmuResult<StopReason> {
        let outcome = self.step_cores()?;
        match outcome {
            StepOutcome::Breakpoint(addr) => Ok(StopReason::Breakpoint(addr)),
            _ => {
                if outcome == StepOutcome::Continue {
                    self.instructions += 1;
                }
                Ok(StopReason::StepDone)
            }
        }
    }

    /// Run until a breakpoint, fault, or the instruction limit. A limit of
    /// zero means unlimited. Returns the stop reason and the number of
    /// instructions committed by this call.
    ///
    /// The limit is checked at every instruction boundary, including
    /// boundaries where a WFI-parked core committed nothing, so a caller
    /// polling between bounded runs always gets control back.
    pub fn run(&mut self, limit: u64) -> (StopReason, u64) {
        let start = self.instructions;
        let mut boundaries = 0u64;
        loop {
            match self.step() {
                Ok(StepOutcome::Continue) | Ok(StepOutcome::WaitForInterrupt) => {
                    boundaries += 1;
                    if limit != 0 && boundaries >= limit {
                        return (StopReason::LimitReached, self.instructions - start);
                    }
                }
                Ok(StepOutcome::Breakpoint(addr)) => {
                    return (StopReason::Breakpoint(addr), self.instructions - start);
                }
                Err(fault) => {
                    tracing::warn!("{}", fault);
                    return (StopReason::Fault(fault), self.instructions - start);
                }
            }
        }
    }

    // Debugger access. Only valid between `step`/`run` calls; the stub
    // upholds this by never issuing inspection while a run is in flight.

    pub fn add_breakpoint(&mut self, addr: u32) {
        self.breakpoints.insert(addr & !1);
    }

    pub fn remove_breakpoint(&mut self, addr: u32) {
        self.breakpoints.remove(&(addr & !1));
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    pub fn read_core_reg(&self, id: u8) -> u32 {
        self.cores[0].get_register(id)
    }

    pub fn write_core_reg(&mut self, id: u8, val: u32) {
        self.cores[0].set_register(id, val);
    }

    pub fn pc(&self) -> u32 {
        self.cores[0].pc()
    }

    pub fn set_pc(&mut self, addr: u32) {
        self.cores[0].set_pc(addr);
    }

    /// Side-effect-free memory read for the debugger.
    pub fn read_memory(&self, addr: u32, len: usize) -> EmuResult<Vec<u8>> {
        let mut data = Vec::with_capacity(len);
        for i in 0..len {
            data.push(self.bus.peek(addr.wrapping_add(i as u32), 1)? as u8);
        }
        Ok(data)
    }

    pub fn write_memory(&mut self, addr: u32, data: &[u8]) -> EmuResult<()> {
        for (i, byte) in data.iter().enumerate() {
            self.bus
                .write(addr.wrapping_add(i as u32), 1, *byte as u32)?;
        }
        Ok(())
    }
}
