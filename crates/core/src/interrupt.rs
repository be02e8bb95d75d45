// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::bus::IrqLevels;
use picosim_config::IrqTrigger;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// Architectural exception numbers. External IRQ line n is exception 16+n.
pub const EXC_RESET: u16 = 1;
pub const EXC_NMI: u16 = 2;
pub const EXC_HARD_FAULT: u16 = 3;
pub const EXC_SVCALL: u16 = 11;
pub const EXC_PENDSV: u16 = 14;
pub const EXC_SYSTICK: u16 = 15;
pub const EXC_IRQ0: u16 = 16;

/// NVIC register state shared between the CPU-side controller and the
/// memory-mapped register block at 0xE000_E100.
#[derive(Debug)]
pub struct NvicState {
    pub iser: AtomicU32,
    pub ispr: AtomicU32,
    pub ipr: [AtomicU32; 8],
}

impl Default for NvicState {
    fn default() -> Self {
        Self {
            iser: AtomicU32::new(0),
            ispr: AtomicU32::new(0),
            ipr: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }
}

impl NvicState {
    /// Configured priority of an IRQ line: the top two bits of its IPR
    /// byte (ARMv6-M has four priority levels).
    pub fn priority(&self, line: u32) -> u8 {
        let word = self.ipr[(line / 4) as usize].load(Ordering::SeqCst);
        ((word >> (8 * (line % 4) + 6)) & 0x3) as u8
    }

    pub fn reset(&self) {
        self.iser.store(0, Ordering::SeqCst);
        self.ispr.store(0, Ordering::SeqCst);
        for w in &self.ipr {
            w.store(0, Ordering::SeqCst);
        }
    }
}

/// Per-core interrupt controller: pending/enabled line state (shared via
/// `NvicState`), the active-exception stack, and line-level edge
/// detection.
///
/// Preemption rule: lower numeric priority wins, ties broken by lower
/// exception number, and a candidate must be strictly more urgent than
/// the currently active exception. NMI and HardFault carry fixed
/// negative priorities so core faults always outrank peripheral IRQs.
#[derive(Debug)]
pub struct IrqController {
    state: Arc<NvicState>,
    /// Pending core exceptions (NMI, HardFault, ...) as a bitmask over
    /// exception numbers 1..16; these bypass the NVIC enable mask.
    core_pending: u16,
    /// Exception numbers currently being handled, oldest first. An entry
    /// is pushed on exception entry and popped on exception return, so
    /// return restores the exact pre-entry priority context.
    active: Vec<u16>,
    prev_levels: u32,
}

impl IrqController {
    pub fn new(state: Arc<NvicState>) -> Self {
        Self {
            state,
            core_pending: 0,
            active: Vec::new(),
            prev_levels: 0,
        }
    }

    pub fn state(&self) -> &Arc<NvicState> {
        &self.state
    }

    pub fn reset(&mut self) {
        self.core_pending = 0;
        self.active.clear();
        self.prev_levels = 0;
        self.state.reset();
    }

    /// Software pend of a core exception (HardFault escalation, NMI).
    pub fn pend_core(&mut self, exc: u16) {
        debug_assert!(exc < EXC_IRQ0);
        self.core_pending |= 1 << exc;
    }

    // Software-facing line controls, also exercised through the NVIC
    // register block.

    pub fn enable(&self, line: u32) {
        self.state.iser.fetch_or(1 << line, Ordering::SeqCst);
    }

    pub fn disable(&self, line: u32) {
        self.state.iser.fetch_and(!(1 << line), Ordering::SeqCst);
    }

    pub fn set_pending(&self, line: u32) {
        self.state.ispr.fetch_or(1 << line, Ordering::SeqCst);
    }

    pub fn clear_pending(&self, line: u32) {
        self.state.ispr.fetch_and(!(1 << line), Ordering::SeqCst);
    }

    /// Fold sampled peripheral line levels into the pending mask. Level
    /// lines track the line continuously (pend while high, clear again
    /// when it drops); edge lines latch on a rising edge and stay pended
    /// until exception entry or an explicit clear.
    pub fn sync_lines(&mut self, levels: &[IrqLevels]) {
        let mut new_levels = 0u32;
        for l in levels {
            let shifted = l.mask.checked_shl(l.base).unwrap_or(0);
            new_levels |= shifted;
            match l.trigger {
                IrqTrigger::Level => {
                    let span_mask = (1u32.checked_shl(l.span).map_or(!0, |v| v - 1))
                        .checked_shl(l.base)
                        .unwrap_or(0);
                    if span_mask != 0 {
                        self.state
                            .ispr
                            .fetch_and(!(span_mask & !shifted), Ordering::SeqCst);
                    }
                    if shifted != 0 {
                        self.state.ispr.fetch_or(shifted, Ordering::SeqCst);
                    }
                }
                IrqTrigger::Edge => {
                    let rising = shifted & !self.prev_levels;
                    if rising != 0 {
                        self.state.ispr.fetch_or(rising, Ordering::SeqCst);
                    }
                }
            }
        }
        self.prev_levels = new_levels;
    }

    fn exception_priority(&self, exc: u16) -> i16 {
        match exc {
            EXC_RESET => -3,
            EXC_NMI => -2,
            EXC_HARD_FAULT => -1,
            e if e >= EXC_IRQ0 => self.state.priority((e - EXC_IRQ0) as u32) as i16,
            _ => 0,
        }
    }

    /// Priority of the exception currently being handled; exceptions
    /// nest strictly, so the newest active entry is the most urgent.
    fn current_priority(&self) -> i16 {
        self.active
            .last()
            .map(|&e| self.exception_priority(e))
            .unwrap_or(i16::MAX)
    }

    /// The exception the core must take next, if any: the most urgent
    /// pending-and-enabled exception strictly above the active priority.
    /// PRIMASK raises the execution priority to 0, masking everything
    /// except NMI and HardFault.
    pub fn highest_pending_enabled(&self, primask: bool) -> Option<u16> {
        let mut best: Option<(i16, u16)> = None;
        let mut consider = |exc: u16, prio: i16| match best {
            Some((bp, be)) if (bp, be) <= (prio, exc) => {}
            _ => best = Some((prio, exc)),
        };

        let mut core = self.core_pending;
        while core != 0 {
            let exc = core.trailing_zeros() as u16;
            core &= core - 1;
            consider(exc, self.exception_priority(exc));
        }

        let mut lines = self.state.ispr.load(Ordering::SeqCst)
            & self.state.iser.load(Ordering::SeqCst);
        while lines != 0 {
            let line = lines.trailing_zeros();
            lines &= lines - 1;
            let exc = EXC_IRQ0 + line as u16;
            consider(exc, self.exception_priority(exc));
        }

        let (prio, exc) = best?;
        let mut threshold = self.current_priority();
        if primask {
            threshold = threshold.min(0);
        }
        (prio < threshold).then_some(exc)
    }

    /// True when any pending-and-enabled interrupt exists, regardless of
    /// priority masking. WFI wakes on this.
    pub fn wake_pending(&self) -> bool {
        if self.core_pending != 0 {
            return true;
        }
        self.state.ispr.load(Ordering::SeqCst) & self.state.iser.load(Ordering::SeqCst) != 0
    }

    /// Exception entry: clear the pending bit and push the active stack.
    pub fn acknowledge(&mut self, exc: u16) {
        if exc >= EXC_IRQ0 {
            self.clear_pending((exc - EXC_IRQ0) as u32);
        } else {
            self.core_pending &= !(1 << exc);
        }
        self.active.push(exc);
    }

    /// Exception return: pop the active stack.
    pub fn complete(&mut self) -> Option<u16> {
        self.active.pop()
    }

    pub fn active_exception(&self) -> Option<u16> {
        self.active.last().copied()
    }
}
