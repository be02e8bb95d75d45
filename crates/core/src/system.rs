// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::bus::SystemBus;
use crate::cpu::CortexM0;
use crate::interrupt::{IrqController, NvicState};
use crate::memory::LinearMemory;
use crate::peripherals::{nvic::Nvic, resets::Resets, scb::Scb, sio::Sio, timer::Timer, uart::Uart};
use crate::{Machine, Peripheral};
use anyhow::{Context, Result};
use picosim_config::{parse_size, ChipDescriptor, IrqTrigger};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

const SCB_BASE: u32 = 0xE000_ED00;
const NVIC_BASE: u32 = 0xE000_E100;

/// Build a machine from a chip descriptor: memories and peripherals as
/// configured, the private peripheral blocks (SCB, NVIC) always mapped,
/// and two cores sharing the bus, the vector table base and the NVIC
/// state. Core 1 stays parked until released.
pub fn build_machine(chip: &ChipDescriptor) -> Result<Machine> {
    let mut bus = SystemBus::new();

    let bootrom_size = parse_size(&chip.bootrom.size)
        .with_context(|| format!("bootrom size for chip '{}'", chip.name))?;
    let flash_size = parse_size(&chip.flash.size)
        .with_context(|| format!("flash size for chip '{}'", chip.name))?;
    let ram_size =
        parse_size(&chip.ram.size).with_context(|| format!("ram size for chip '{}'", chip.name))?;

    bus.add_memory(
        "bootrom",
        chip.bootrom.base,
        LinearMemory::new(bootrom_size as usize),
    )?;
    // Flash erases to all-ones.
    bus.add_memory(
        "flash",
        chip.flash.base,
        LinearMemory::new_filled(flash_size as usize, 0xFF),
    )?;
    bus.add_memory("sram", chip.ram.base, LinearMemory::new(ram_size as usize))?;

    let active_core = Arc::new(AtomicU32::new(0));

    for p_cfg in &chip.peripherals {
        let dev: Box<dyn Peripheral> = match p_cfg.r#type.as_str() {
            "uart" => Box::new(Uart::new()),
            "timer" => Box::new(Timer::new()),
            "sio" => Box::new(Sio::new(active_core.clone())),
            "resets" => Box::new(Resets::new()),
            other => {
                tracing::warn!(
                    "Unsupported peripheral type '{}' for id '{}'; skipping",
                    other,
                    p_cfg.id
                );
                continue;
            }
        };

        let size = match &p_cfg.size {
            Some(s) => parse_size(s)
                .with_context(|| format!("size of peripheral '{}'", p_cfg.id))?
                as u32,
            None => 0x1000, // Default 4 KiB page
        };

        bus.add_device(&p_cfg.id, p_cfg.base_address, size, p_cfg.irq, p_cfg.trigger, dev)?;
    }

    // Private peripheral blocks exist regardless of configuration.
    let vtor = Arc::new(AtomicU32::new(0));
    let nvic_state = Arc::new(NvicState::default());
    bus.add_device(
        "scb",
        SCB_BASE,
        0x40,
        None,
        IrqTrigger::Level,
        Box::new(Scb::new(vtor.clone())),
    )?;
    bus.add_device(
        "nvic",
        NVIC_BASE,
        0x400,
        None,
        IrqTrigger::Level,
        Box::new(Nvic::new(nvic_state.clone())),
    )?;

    let mut cores = Vec::new();
    let mut irqs = Vec::new();
    for _ in 0..2 {
        let mut core = CortexM0::new();
        core.set_shared_vtor(vtor.clone());
        cores.push(core);
        irqs.push(IrqController::new(nvic_state.clone()));
    }

    Ok(Machine::new(bus, cores, irqs, active_core))
}

/// The default RP2040 machine.
pub fn rp2040() -> Result<Machine> {
    build_machine(&ChipDescriptor::rp2040())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Access;

    #[test]
    fn test_rp2040_memory_map() {
        let mut machine = rp2040().unwrap();
        // Flash erased to ones, SRAM zeroed.
        assert_eq!(machine.bus.read_u32(0x1000_0000).unwrap(), 0xFFFF_FFFF);
        assert_eq!(machine.bus.read_u32(0x2000_0000).unwrap(), 0);
        // RESET_DONE answers all-done.
        assert_eq!(machine.bus.read_u32(0x4000_C008).unwrap(), 0x01FF_FFFF);
        // SIO CPUID reads core 0.
        assert_eq!(machine.bus.read_u32(0xD000_0000).unwrap(), 0);
        // Unmapped space faults.
        assert!(machine.bus.read(0x3000_0000, 4, Access::Read).is_err());
    }

    #[test]
    fn test_vtor_relocation_via_scb() {
        let mut machine = rp2040().unwrap();
        machine.bus.write_u32(SCB_BASE + 0x08, 0x2000_0000).unwrap();
        assert_eq!(machine.bus.read_u32(SCB_BASE + 0x08).unwrap(), 0x2000_0000);
    }

    #[test]
    fn test_nvic_enable_reaches_controller() {
        let mut machine = rp2040().unwrap();
        machine.bus.write_u32(NVIC_BASE, 1 << 20).unwrap(); // ISER, UART0 line
        machine.irqs[0].set_pending(20);
        assert_eq!(
            machine.irqs[0].highest_pending_enabled(false),
            Some(crate::interrupt::EXC_IRQ0 + 20)
        );
    }
}
