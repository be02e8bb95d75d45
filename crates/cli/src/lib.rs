// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Shared setup for the two runner binaries.

use anyhow::{Context, Result};
use picosim_config::ChipDescriptor;
use picosim_core::{system, Machine};
use std::path::{Path, PathBuf};

pub const EXIT_OK: u8 = 0;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_RUNTIME_ERROR: u8 = 3;

const DEFAULT_BOOTROM: &str = "bootrom.bin";

pub fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let trimmed = s.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex address '{}': {}", s, e))
}

pub fn init_tracing(trace: bool) {
    let level = if trace {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// Image and platform options shared by both runners.
pub struct ImageOptions {
    pub filename: PathBuf,
    pub entry_point: Option<u32>,
    pub bootrom: Option<PathBuf>,
    pub chip: Option<PathBuf>,
}

/// Build the machine, map the bootrom if there is one, load the
/// firmware image and apply the entry-point override.
pub fn build_loaded_machine(opts: &ImageOptions) -> Result<Machine> {
    let chip = match &opts.chip {
        Some(path) => ChipDescriptor::from_file(path)?,
        None => ChipDescriptor::rp2040(),
    };
    let mut machine = system::build_machine(&chip)?;

    // An explicitly named bootrom must exist; the default one is mapped
    // only when present.
    match &opts.bootrom {
        Some(path) => {
            let rom = picosim_loader::load_bootrom(path)?;
            if !machine.bus.load_segment(chip.bootrom.base, &rom) {
                anyhow::bail!("Bootrom image does not fit the bootrom region");
            }
            tracing::info!("Bootrom loaded from {:?}", path);
        }
        None => {
            let default = Path::new(DEFAULT_BOOTROM);
            if default.exists() {
                let rom = picosim_loader::load_bootrom(default)?;
                if machine.bus.load_segment(chip.bootrom.base, &rom) {
                    tracing::info!("Bootrom loaded from {:?}", default);
                }
            }
        }
    }

    let image = picosim_loader::load_image(&opts.filename, chip.flash.base)
        .with_context(|| format!("Failed to load firmware {:?}", opts.filename))?;
    machine.load_firmware(&image);

    if let Some(entry) = opts.entry_point {
        machine.set_pc(entry);
    }
    tracing::info!(
        "Loaded {:?}, starting at {:#010x}",
        opts.filename,
        machine.pc()
    );
    Ok(machine)
}
