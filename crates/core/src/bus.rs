// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::memory::LinearMemory;
use crate::{Access, EmuResult, Fault, Peripheral};
use anyhow::bail;
use picosim_config::IrqTrigger;

enum Backing {
    Memory(LinearMemory),
    Device(Box<dyn Peripheral>),
}

/// One mapped address range. Ranges are validated disjoint at
/// registration time.
struct Region {
    name: String,
    base: u32,
    size: u32,
    irq: Option<u32>,
    trigger: IrqTrigger,
    backing: Backing,
}

impl Region {
    fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr - self.base) < self.size
    }
}

/// Asserted interrupt line levels of one device, sampled after a step.
#[derive(Debug, Clone, Copy)]
pub struct IrqLevels {
    pub base: u32,
    pub trigger: IrqTrigger,
    pub mask: u32,
    /// How many consecutive lines (from `base`) the device drives.
    pub span: u32,
}

/// The system bus: routes an address to exactly one backing region.
///
/// Accesses outside every region fault; they are never silently dropped.
/// Word and halfword data accesses must be naturally aligned (ARMv6-M
/// has no unaligned support).
pub struct SystemBus {
    regions: Vec<Region>,
}

impl Default for SystemBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemBus {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
        }
    }

    fn check_overlap(&self, name: &str, base: u32, size: u32) -> anyhow::Result<()> {
        if size == 0 {
            bail!("Region '{}' has zero size", name);
        }
        if base.checked_add(size - 1).is_none() {
            bail!("Region '{}' wraps the address space", name);
        }
        for r in &self.regions {
            let end = base + (size - 1);
            let r_end = r.base + (r.size - 1);
            if base <= r_end && r.base <= end {
                bail!(
                    "Region '{}' [{:#010x}..{:#010x}] overlaps '{}' [{:#010x}..{:#010x}]",
                    name,
                    base,
                    end,
                    r.name,
                    r.base,
                    r_end
                );
            }
        }
        Ok(())
    }

    /// Map flat storage. Overlapping an existing region is a
    /// configuration error and fails before any instruction executes.
    pub fn add_memory(&mut self, name: &str, base: u32, mem: LinearMemory) -> anyhow::Result<()> {
        self.check_overlap(name, base, mem.len() as u32)?;
        tracing::debug!(
            "Mapped {} at {:#010x} ({} bytes)",
            name,
            base,
            mem.len()
        );
        self.regions.push(Region {
            name: name.to_string(),
            base,
            size: mem.len() as u32,
            irq: None,
            trigger: IrqTrigger::Level,
            backing: Backing::Memory(mem),
        });
        Ok(())
    }

    /// Map a peripheral register block, optionally wired to an IRQ line.
    pub fn add_device(
        &mut self,
        name: &str,
        base: u32,
        size: u32,
        irq: Option<u32>,
        trigger: IrqTrigger,
        dev: Box<dyn Peripheral>,
    ) -> anyhow::Result<()> {
        self.check_overlap(name, base, size)?;
        tracing::debug!("Mapped {} at {:#010x} (irq {:?})", name, base, irq);
        self.regions.push(Region {
            name: name.to_string(),
            base,
            size,
            irq,
            trigger,
            backing: Backing::Device(dev),
        });
        Ok(())
    }

    fn check_alignment(addr: u32, width: u8, access: Access) -> EmuResult<()> {
        if width > 1 && addr % width as u32 != 0 {
            return Err(Fault::Unaligned {
                addr,
                width,
                access,
            });
        }
        Ok(())
    }

    pub fn read(&mut self, addr: u32, width: u8, access: Access) -> EmuResult<u32> {
        Self::check_alignment(addr, width, access)?;
        for r in &mut self.regions {
            if r.contains(addr) {
                let offset = addr - r.base;
                return match &mut r.backing {
                    Backing::Memory(mem) => {
                        if offset as usize + width as usize > mem.len() {
                            return Err(Fault::Bus {
                                addr,
                                width,
                                access,
                            });
                        }
                        Ok(mem.read(offset as usize, width as usize))
                    }
                    Backing::Device(dev) => dev.read(offset, width),
                };
            }
        }
        Err(Fault::Bus {
            addr,
            width,
            access,
        })
    }

    pub fn write(&mut self, addr: u32, width: u8, value: u32) -> EmuResult<()> {
        Self::check_alignment(addr, width, Access::Write)?;
        for r in &mut self.regions {
            if r.contains(addr) {
                let offset = addr - r.base;
                return match &mut r.backing {
                    Backing::Memory(mem) => {
                        if offset as usize + width as usize > mem.len() {
                            return Err(Fault::Bus {
                                addr,
                                width,
                                access: Access::Write,
                            });
                        }
                        mem.write(offset as usize, width as usize, value);
                        Ok(())
                    }
                    Backing::Device(dev) => dev.write(offset, width, value),
                };
            }
        }
        Err(Fault::Bus {
            addr,
            width,
            access: Access::Write,
        })
    }

    /// Side-effect-free read for debugger inspection. Flat memory reads
    /// normally; devices answer through their `peek` view.
    pub fn peek(&self, addr: u32, width: u8) -> EmuResult<u32> {
        Self::check_alignment(addr, width, Access::Read)?;
        for r in &self.regions {
            if r.contains(addr) {
                let offset = addr - r.base;
                return match &r.backing {
                    Backing::Memory(mem) => {
                        if offset as usize + width as usize > mem.len() {
                            return Err(Fault::Bus {
                                addr,
                                width,
                                access: Access::Read,
                            });
                        }
                        Ok(mem.read(offset as usize, width as usize))
                    }
                    Backing::Device(dev) => Ok(dev.peek(offset, width)),
                };
            }
        }
        Err(Fault::Bus {
            addr,
            width,
            access: Access::Read,
        })
    }

    pub fn read_u8(&mut self, addr: u32) -> EmuResult<u8> {
        Ok(self.read(addr, 1, Access::Read)? as u8)
    }

    pub fn read_u16(&mut self, addr: u32) -> EmuResult<u16> {
        Ok(self.read(addr, 2, Access::Read)? as u16)
    }

    pub fn read_u32(&mut self, addr: u32) -> EmuResult<u32> {
        self.read(addr, 4, Access::Read)
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> EmuResult<()> {
        self.write(addr, 1, value as u32)
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) -> EmuResult<()> {
        self.write(addr, 2, value as u32)
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> EmuResult<()> {
        self.write(addr, 4, value)
    }

    /// Copy a loader segment into whichever flat region contains it,
    /// bypassing access checks. Returns false when no region fits it.
    pub fn load_segment(&mut self, start_addr: u32, data: &[u8]) -> bool {
        for r in &mut self.regions {
            if r.contains(start_addr) {
                if let Backing::Memory(mem) = &mut r.backing {
                    return mem.load((start_addr - r.base) as usize, data);
                }
            }
        }
        false
    }

    /// Advance device time and sample interrupt line levels.
    pub fn tick_peripherals(&mut self, micros: u64) -> Vec<IrqLevels> {
        let mut levels = Vec::new();
        for r in &mut self.regions {
            if let Backing::Device(dev) = &mut r.backing {
                dev.tick(micros);
                if let Some(base) = r.irq {
                    levels.push(IrqLevels {
                        base,
                        trigger: r.trigger,
                        mask: dev.irq_lines(),
                        span: dev.irq_span(),
                    });
                }
            }
        }
        levels
    }

    /// Fetch a mapped device for host-side wiring (UART sinks and the
    /// like). Registration order is the lookup order.
    pub fn device_mut<T: 'static>(&mut self, name: &str) -> Option<&mut T> {
        for r in &mut self.regions {
            if r.name == name {
                if let Backing::Device(dev) = &mut r.backing {
                    return dev.as_any_mut()?.downcast_mut::<T>();
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_access_faults() {
        let mut bus = SystemBus::new();
        bus.add_memory("sram", 0x2000_0000, LinearMemory::new(1024))
            .unwrap();

        assert!(bus.read_u32(0x2000_0000).is_ok());
        let err = bus.read_u32(0x4000_0000).unwrap_err();
        assert_eq!(
            err,
            Fault::Bus {
                addr: 0x4000_0000,
                width: 4,
                access: Access::Read
            }
        );
    }

    #[test]
    fn test_overlap_registration_fails_fast() {
        let mut bus = SystemBus::new();
        bus.add_memory("a", 0x1000, LinearMemory::new(0x100)).unwrap();
        assert!(bus.add_memory("b", 0x10FF, LinearMemory::new(0x10)).is_err());
        assert!(bus.add_memory("c", 0x0F01, LinearMemory::new(0x100)).is_err());
        // Adjacent is fine.
        bus.add_memory("d", 0x1100, LinearMemory::new(0x100)).unwrap();
    }

    #[test]
    fn test_unaligned_word_access_faults() {
        let mut bus = SystemBus::new();
        bus.add_memory("sram", 0x2000_0000, LinearMemory::new(1024))
            .unwrap();

        let err = bus.read_u32(0x2000_0002).unwrap_err();
        assert!(matches!(err, Fault::Unaligned { addr: 0x2000_0002, .. }));
        let err = bus.write_u16(0x2000_0001, 1).unwrap_err();
        assert!(matches!(err, Fault::Unaligned { .. }));
        // Byte access never needs alignment.
        assert!(bus.read_u8(0x2000_0003).is_ok());
    }

    #[test]
    fn test_access_past_region_end_faults() {
        let mut bus = SystemBus::new();
        bus.add_memory("sram", 0x0, LinearMemory::new(6)).unwrap();
        assert!(bus.read_u32(0x0).is_ok());
        assert!(bus.read_u32(0x4).is_err());
        assert!(bus.read_u16(0x4).is_ok());
    }

    #[test]
    fn test_load_segment() {
        let mut bus = SystemBus::new();
        bus.add_memory("flash", 0x1000_0000, LinearMemory::new(0x100))
            .unwrap();
        assert!(bus.load_segment(0x1000_0010, &[0xAA, 0xBB]));
        assert_eq!(bus.read_u8(0x1000_0010).unwrap(), 0xAA);
        assert!(!bus.load_segment(0x9000_0000, &[1]));
    }
}
