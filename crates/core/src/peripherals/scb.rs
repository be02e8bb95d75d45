// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::peripherals::{lane_get, lane_put};
use crate::{EmuResult, Peripheral};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const CPUID: u32 = 0x00;
const ICSR: u32 = 0x04;
const VTOR: u32 = 0x08;
const AIRCR: u32 = 0x0C;
const SCR: u32 = 0x10;
const CCR: u32 = 0x14;
const SHPR2: u32 = 0x1C;
const SHPR3: u32 = 0x20;

/// System Control Block. VTOR is shared with the CPU so vector table
/// relocation takes effect at the next exception entry.
#[derive(Debug)]
pub struct Scb {
    vtor: Arc<AtomicU32>,
    icsr: u32,
    aircr: u32,
    scr: u32,
    ccr: u32,
    shpr2: u32,
    shpr3: u32,
}

impl Scb {
    pub fn new(vtor: Arc<AtomicU32>) -> Self {
        Self {
            vtor,
            icsr: 0,
            aircr: 0,
            scr: 0,
            ccr: 0,
            shpr2: 0,
            shpr3: 0,
        }
    }

    fn read_reg(&self, offset: u32) -> u32 {
        match offset {
            CPUID => 0x410C_C601, // Cortex-M0+ r0p1
            ICSR => self.icsr,
            VTOR => self.vtor.load(Ordering::SeqCst),
            AIRCR => self.aircr,
            SCR => self.scr,
            CCR => self.ccr,
            SHPR2 => self.shpr2,
            SHPR3 => self.shpr3,
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u32, value: u32) {
        match offset {
            ICSR => self.icsr = value,
            // ARMv6-M requires the vector table base to be 256-byte aligned.
            VTOR => self.vtor.store(value & 0xFFFF_FF00, Ordering::SeqCst),
            AIRCR => self.aircr = value,
            SCR => self.scr = value,
            CCR => self.ccr = value,
            SHPR2 => self.shpr2 = value,
            SHPR3 => self.shpr3 = value,
            _ => {}
        }
    }
}

impl Peripheral for Scb {
    fn read(&mut self, offset: u32, width: u8) -> EmuResult<u32> {
        Ok(lane_get(self.read_reg(offset & !3), offset, width))
    }

    fn write(&mut self, offset: u32, width: u8, value: u32) -> EmuResult<()> {
        let reg_offset = offset & !3;
        let merged = lane_put(self.read_reg(reg_offset), offset, width, value);
        self.write_reg(reg_offset, merged);
        Ok(())
    }

    fn peek(&self, offset: u32, width: u8) -> u32 {
        lane_get(self.read_reg(offset & !3), offset, width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vtor_shared_and_aligned() {
        let vtor = Arc::new(AtomicU32::new(0));
        let mut scb = Scb::new(vtor.clone());
        scb.write(VTOR, 4, 0x1000_0123).unwrap();
        // Low byte is forced clear.
        assert_eq!(vtor.load(Ordering::SeqCst), 0x1000_0100);
        assert_eq!(scb.read(VTOR, 4).unwrap(), 0x1000_0100);
    }

    #[test]
    fn test_cpuid_is_m0plus() {
        let mut scb = Scb::new(Arc::new(AtomicU32::new(0)));
        assert_eq!(scb.read(CPUID, 4).unwrap(), 0x410C_C601);
    }
}
