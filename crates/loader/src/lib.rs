// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Firmware image loaders. Flat binaries, UF2 containers and ELF files
//! all resolve to a [`ProgramImage`] before the machine sees anything.

use anyhow::{anyhow, bail, Context, Result};
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use picosim_core::memory::ProgramImage;
use picosim_core::PC_START;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

// UF2 block layout (32-byte header, 476-byte payload area, magic tail).
const UF2_BLOCK_SIZE: usize = 512;
const UF2_MAGIC_START0: u32 = 0x0A32_4655;
const UF2_MAGIC_START1: u32 = 0x9E5D_5157;
const UF2_MAGIC_END: u32 = 0x0AB1_6F30;
const UF2_FLAG_NOT_MAIN_FLASH: u32 = 0x0000_0001;
const UF2_MAX_PAYLOAD: u32 = 476;

/// Load a firmware image, dispatching on the file extension: `.uf2` is
/// parsed as a block container, anything recognizable as ELF goes
/// through goblin, and everything else is treated as a flat binary at
/// `base_addr`.
pub fn load_image(path: &Path, base_addr: u32) -> Result<ProgramImage> {
    let buffer =
        fs::read(path).with_context(|| format!("Failed to read firmware file {:?}", path))?;

    if path.extension().is_some_and(|ext| ext == "uf2") {
        return load_uf2_bytes(&buffer);
    }
    if buffer.starts_with(&[0x7F, b'E', b'L', b'F']) {
        return load_elf_bytes(&buffer);
    }
    Ok(load_bin_bytes(&buffer, base_addr))
}

/// Flat binary: raw bytes placed at `base_addr`, entry at the start.
pub fn load_bin(path: &Path, base_addr: u32) -> Result<ProgramImage> {
    let buffer =
        fs::read(path).with_context(|| format!("Failed to read binary file {:?}", path))?;
    Ok(load_bin_bytes(&buffer, base_addr))
}

pub fn load_bin_bytes(buffer: &[u8], base_addr: u32) -> ProgramImage {
    let mut image = ProgramImage::new(base_addr);
    image.add_segment(base_addr, buffer.to_vec());
    image
}

/// UF2 container: 512-byte blocks, each declaring a target address and
/// payload. Blocks with bad magics, non-flash flags or oversized
/// payloads are skipped, matching the reference tooling.
pub fn load_uf2(path: &Path) -> Result<ProgramImage> {
    let buffer = fs::read(path).with_context(|| format!("Failed to read UF2 file {:?}", path))?;
    load_uf2_bytes(&buffer)
}

pub fn load_uf2_bytes(buffer: &[u8]) -> Result<ProgramImage> {
    let mut image = ProgramImage::new(PC_START);
    let mut loaded = 0usize;

    for (blockno, block) in buffer.chunks(UF2_BLOCK_SIZE).enumerate() {
        if block.len() < UF2_BLOCK_SIZE {
            warn!("UF2 block {} is short ({} bytes), stopping", blockno, block.len());
            break;
        }

        let word = |i: usize| u32::from_le_bytes(block[i..i + 4].try_into().unwrap());
        let magic0 = word(0);
        let magic1 = word(4);
        let flags = word(8);
        let target_addr = word(12);
        let payload_size = word(16);
        let magic_end = word(UF2_BLOCK_SIZE - 4);

        if magic0 != UF2_MAGIC_START0 || magic1 != UF2_MAGIC_START1 || magic_end != UF2_MAGIC_END {
            warn!("UF2 block {} has bad magic values, skipping", blockno);
            continue;
        }
        if flags & UF2_FLAG_NOT_MAIN_FLASH != 0 {
            debug!("UF2 block {} is not main flash, skipping", blockno);
            continue;
        }
        if payload_size > UF2_MAX_PAYLOAD {
            warn!(
                "UF2 block {} payload size {} exceeds {}, skipping",
                blockno, payload_size, UF2_MAX_PAYLOAD
            );
            continue;
        }

        image.add_segment(
            target_addr,
            block[32..32 + payload_size as usize].to_vec(),
        );
        loaded += 1;
    }

    if loaded == 0 {
        bail!("UF2 file contained no loadable blocks");
    }
    info!("Loaded {} UF2 block(s)", loaded);
    Ok(image)
}

/// ELF: PT_LOAD segments at their physical (load) addresses, entry from
/// the header.
pub fn load_elf(path: &Path) -> Result<ProgramImage> {
    let buffer = fs::read(path).with_context(|| format!("Failed to read ELF file {:?}", path))?;
    load_elf_bytes(&buffer)
}

pub fn load_elf_bytes(buffer: &[u8]) -> Result<ProgramImage> {
    let elf = Elf::parse(buffer).context("Failed to parse ELF binary")?;

    if elf.header.e_machine != goblin::elf::header::EM_ARM {
        warn!("ELF machine type {} is not ARM", elf.header.e_machine);
    }
    info!("ELF entry point: {:#x}", elf.entry);

    let mut image = ProgramImage::new(elf.entry as u32);
    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_filesz == 0 {
            continue;
        }
        let start_addr = ph.p_paddr as u32;
        let offset = ph.p_offset as usize;
        let size = ph.p_filesz as usize;

        if offset + size > buffer.len() {
            return Err(anyhow!("Segment out of bounds in ELF file"));
        }
        debug!(
            "Loadable segment: addr={:#010x}, {} bytes",
            start_addr, size
        );
        image.add_segment(start_addr, buffer[offset..offset + size].to_vec());
    }

    if image.segments.is_empty() {
        warn!("No loadable segments found in ELF file");
    }
    Ok(image)
}

/// Bootrom image: a flat binary mapped at the boot ROM base. The reset
/// vector pair (initial SP, initial PC) lives in its first two words.
pub fn load_bootrom(path: &Path) -> Result<Vec<u8>> {
    let buffer =
        fs::read(path).with_context(|| format!("Failed to read bootrom file {:?}", path))?;
    if buffer.len() < 8 {
        bail!("Bootrom image {:?} is too small to hold a vector table", path);
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uf2_block(target_addr: u32, payload: &[u8], flags: u32) -> Vec<u8> {
        let mut block = vec![0u8; UF2_BLOCK_SIZE];
        block[0..4].copy_from_slice(&UF2_MAGIC_START0.to_le_bytes());
        block[4..8].copy_from_slice(&UF2_MAGIC_START1.to_le_bytes());
        block[8..12].copy_from_slice(&flags.to_le_bytes());
        block[12..16].copy_from_slice(&target_addr.to_le_bytes());
        block[16..20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        block[32..32 + payload.len()].copy_from_slice(payload);
        block[UF2_BLOCK_SIZE - 4..].copy_from_slice(&UF2_MAGIC_END.to_le_bytes());
        block
    }

    #[test]
    fn test_uf2_block_lands_at_target() {
        let block = uf2_block(0x1000_0100, &[1, 2, 3, 4], 0);
        let image = load_uf2_bytes(&block).unwrap();
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].start_addr, 0x1000_0100);
        assert_eq!(image.segments[0].data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_uf2_skips_non_flash_and_bad_magic() {
        let mut data = uf2_block(0x1000_0000, &[0xAA], UF2_FLAG_NOT_MAIN_FLASH);
        data.extend(uf2_block(0x1000_0200, &[0xBB], 0));
        // Corrupt the end magic of a third block.
        let mut bad = uf2_block(0x1000_0400, &[0xCC], 0);
        let len = bad.len();
        bad[len - 4..].copy_from_slice(&0u32.to_le_bytes());
        data.extend(bad);

        let image = load_uf2_bytes(&data).unwrap();
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].start_addr, 0x1000_0200);
    }

    #[test]
    fn test_uf2_empty_is_an_error() {
        assert!(load_uf2_bytes(&[]).is_err());
        let only_bad = uf2_block(0, &[1], UF2_FLAG_NOT_MAIN_FLASH);
        assert!(load_uf2_bytes(&only_bad).is_err());
    }

    #[test]
    fn test_bin_uses_base_address() {
        let image = load_bin_bytes(&[0x05, 0x20], 0x1000_0000);
        assert_eq!(image.entry_point, 0x1000_0000);
        assert_eq!(image.segments[0].start_addr, 0x1000_0000);
    }
}
