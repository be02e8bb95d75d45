// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{EmuResult, Peripheral};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// SIO register offsets
const CPUID: u32 = 0x00;
const GPIO_IN: u32 = 0x04;
const GPIO_OUT: u32 = 0x10;
const GPIO_OUT_SET: u32 = 0x14;
const GPIO_OUT_CLR: u32 = 0x18;
const GPIO_OUT_XOR: u32 = 0x1C;
const GPIO_OE: u32 = 0x20;
const GPIO_OE_SET: u32 = 0x24;
const GPIO_OE_CLR: u32 = 0x28;

/// Single-cycle IO block. CPUID reads the index of whichever core is
/// currently executing (shared with the machine); the GPIO output and
/// output-enable registers have the RP2040's set/clear/xor aliases.
#[derive(Debug)]
pub struct Sio {
    cpuid: Arc<AtomicU32>,
    gpio_out: u32,
    gpio_oe: u32,
}

impl Sio {
    pub fn new(cpuid: Arc<AtomicU32>) -> Self {
        Self {
            cpuid,
            gpio_out: 0,
            gpio_oe: 0,
        }
    }

    pub fn gpio_out(&self) -> u32 {
        self.gpio_out
    }
}

impl Peripheral for Sio {
    fn read(&mut self, offset: u32, width: u8) -> EmuResult<u32> {
        Ok(self.peek(offset, width))
    }

    fn write(&mut self, offset: u32, _width: u8, value: u32) -> EmuResult<()> {
        match offset {
            GPIO_OUT => self.gpio_out = value,
            GPIO_OUT_SET => {
                self.gpio_out |= value;
                tracing::debug!("GPIO set -> {:#010x}", self.gpio_out);
            }
            GPIO_OUT_CLR => {
                self.gpio_out &= !value;
                tracing::debug!("GPIO clear -> {:#010x}", self.gpio_out);
            }
            GPIO_OUT_XOR => self.gpio_out ^= value,
            GPIO_OE => self.gpio_oe = value,
            GPIO_OE_SET => self.gpio_oe |= value,
            GPIO_OE_CLR => self.gpio_oe &= !value,
            _ => {}
        }
        Ok(())
    }

    fn peek(&self, offset: u32, _width: u8) -> u32 {
        match offset {
            CPUID => self.cpuid.load(Ordering::Relaxed),
            GPIO_IN => 0,
            GPIO_OUT => self.gpio_out,
            GPIO_OE => self.gpio_oe,
            _ => 0,
        }
    }

    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }
}
