// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::Context;
use clap::Parser;
use picosim_cli::{build_loaded_machine, init_tracing, parse_hex_u32, ImageOptions};
use picosim_core::peripherals::uart::Uart;
use picosim_gdb::GdbServer;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "PicoSim - an RP2040 emulator with GDB stub",
    long_about = None
)]
struct Cli {
    /// The firmware image (.bin, .uf2 or .elf) to execute
    filename: PathBuf,

    /// Entry point in hex (e.g. 0x10000354). Defaults to 0x10000000, or
    /// the bootrom reset vector when a bootrom is loaded.
    #[arg(short, long, value_parser = parse_hex_u32)]
    entry_point: Option<u32>,

    /// Bootrom image mapped at the boot ROM base (bootrom.bin when present)
    #[arg(short, long)]
    bootrom: Option<PathBuf>,

    /// Chip descriptor (YAML) overriding the built-in RP2040
    #[arg(long)]
    chip: Option<PathBuf>,

    /// TCP port for the debug transport
    #[arg(short, long, default_value_t = 3333)]
    port: u16,

    /// Serial device backing UART0 instead of the internal buffer
    #[arg(long)]
    serial: Option<PathBuf>,

    /// Enable debug-level tracing
    #[arg(short, long)]
    trace: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.trace);

    let opts = ImageOptions {
        filename: cli.filename.clone(),
        entry_point: cli.entry_point,
        bootrom: cli.bootrom.clone(),
        chip: cli.chip.clone(),
    };
    let mut machine = build_loaded_machine(&opts)?;

    if let Some(device) = &cli.serial {
        attach_serial(&mut machine, device)?;
    }

    GdbServer::new(cli.port).run(machine)
}

/// Bridge UART0 to a real serial device: TX bytes drain into the port,
/// inbound bytes queue into the RX FIFO.
fn attach_serial(machine: &mut picosim_core::Machine, device: &PathBuf) -> anyhow::Result<()> {
    let tx_sink = Arc::new(Mutex::new(Vec::new()));
    let rx_queue = Arc::new(Mutex::new(VecDeque::new()));

    let uart = machine
        .bus
        .device_mut::<Uart>("uart0")
        .context("Chip has no 'uart0' peripheral to back with a serial device")?;
    uart.set_sink(Some(tx_sink.clone()), false);
    uart.set_rx_source(Some(rx_queue.clone()));

    let mut port = serialport::new(device.to_string_lossy(), 115_200)
        .timeout(Duration::from_millis(10))
        .open()
        .with_context(|| format!("Failed to open serial device {:?}", device))?;
    tracing::info!("UART0 backed by serial device {:?}", device);

    std::thread::spawn(move || {
        let mut buf = [0u8; 64];
        loop {
            match port.read(&mut buf) {
                Ok(n) if n > 0 => {
                    if let Ok(mut queue) = rx_queue.lock() {
                        queue.extend(&buf[..n]);
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    tracing::warn!("Serial read error: {}", e);
                    break;
                }
            }

            let pending: Vec<u8> = match tx_sink.lock() {
                Ok(mut sink) => sink.drain(..).collect(),
                Err(_) => break,
            };
            if !pending.is_empty() {
                if let Err(e) = port.write_all(&pending) {
                    tracing::warn!("Serial write error: {}", e);
                    break;
                }
            }
        }
    });

    Ok(())
}
