// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default schema version for YAML descriptors
fn default_schema_version() -> String {
    "1.0".to_string()
}

/// How a peripheral's interrupt line latches into the controller.
///
/// `Level` lines re-pend while the line is held high; `Edge` lines pend
/// only on a low-to-high transition. RP2040 peripherals expose a masked
/// status (INTS) and are level-sensitive by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IrqTrigger {
    #[default]
    Level,
    Edge,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryRange {
    pub base: u32,
    pub size: String, // e.g. "264 KiB"
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PeripheralConfig {
    pub id: String,
    pub r#type: String, // "uart", "timer", "sio", "resets"
    pub base_address: u32,
    #[serde(default)]
    pub size: Option<String>,
    /// First IRQ line driven by this peripheral; devices with several
    /// lines (the RP2040 timer has one per alarm) use consecutive numbers.
    #[serde(default)]
    pub irq: Option<u32>,
    #[serde(default)]
    pub trigger: IrqTrigger,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChipDescriptor {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub name: String,
    pub bootrom: MemoryRange,
    pub flash: MemoryRange,
    pub ram: MemoryRange,
    pub peripherals: Vec<PeripheralConfig>,
}

impl ChipDescriptor {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read chip descriptor {:?}", path))?;
        let chip: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse chip descriptor {:?}", path))?;
        tracing::debug!("Loaded chip descriptor '{}'", chip.name);
        Ok(chip)
    }

    /// The built-in RP2040 description: bootrom at zero, XIP flash at
    /// 0x1000_0000, 264 KiB of SRAM, and the peripheral subset this
    /// emulator models. IRQ numbers follow the RP2040 datasheet
    /// (TIMER_IRQ_0..3 = 0..3, UART0_IRQ = 20).
    pub fn rp2040() -> Self {
        Self {
            schema_version: default_schema_version(),
            name: "rp2040".to_string(),
            bootrom: MemoryRange {
                base: 0x0000_0000,
                size: "16 KiB".to_string(),
            },
            flash: MemoryRange {
                base: 0x1000_0000,
                size: "16 MiB".to_string(),
            },
            ram: MemoryRange {
                base: 0x2000_0000,
                size: "264 KiB".to_string(),
            },
            peripherals: vec![
                PeripheralConfig {
                    id: "timer".to_string(),
                    r#type: "timer".to_string(),
                    base_address: 0x4005_4000,
                    size: Some("4 KiB".to_string()),
                    irq: Some(0),
                    trigger: IrqTrigger::Level,
                },
                PeripheralConfig {
                    id: "uart0".to_string(),
                    r#type: "uart".to_string(),
                    base_address: 0x4003_4000,
                    size: Some("4 KiB".to_string()),
                    irq: Some(20),
                    trigger: IrqTrigger::Level,
                },
                PeripheralConfig {
                    id: "resets".to_string(),
                    r#type: "resets".to_string(),
                    base_address: 0x4000_C000,
                    size: Some("4 KiB".to_string()),
                    irq: None,
                    trigger: IrqTrigger::Level,
                },
                PeripheralConfig {
                    id: "sio".to_string(),
                    r#type: "sio".to_string(),
                    base_address: 0xD000_0000,
                    size: Some("16 MiB".to_string()),
                    irq: None,
                    trigger: IrqTrigger::Level,
                },
            ],
        }
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format '{}': {}", size_str, e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("16 KiB").unwrap(), 16 * 1024);
        assert_eq!(parse_size("264 KiB").unwrap(), 264 * 1024);
        assert_eq!(parse_size("16 MiB").unwrap(), 16 * 1024 * 1024);
        assert!(parse_size("sixteen").is_err());
    }

    #[test]
    fn test_rp2040_defaults() {
        let chip = ChipDescriptor::rp2040();
        assert_eq!(chip.flash.base, 0x1000_0000);
        assert_eq!(chip.ram.base, 0x2000_0000);
        assert_eq!(parse_size(&chip.ram.size).unwrap(), 264 * 1024);

        let uart = chip.peripherals.iter().find(|p| p.id == "uart0").unwrap();
        assert_eq!(uart.base_address, 0x4003_4000);
        assert_eq!(uart.irq, Some(20));
    }
}
