// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use clap::Parser;
use picosim_cli::{
    build_loaded_machine, init_tracing, parse_hex_u32, ImageOptions, EXIT_CONFIG_ERROR, EXIT_OK,
    EXIT_RUNTIME_ERROR,
};
use picosim_core::{Machine, StopReason};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "PicoSim - an RP2040 emulator",
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

    /// Limit the number of instructions to execute (0 = unlimited)
    #[arg(short = 'n', long, default_value_t = 0)]
    icount: u64,

    /// Prompt before each instruction
    #[arg(short, long)]
    step: bool,

    /// Chip descriptor (YAML) overriding the built-in RP2040
    #[arg(long)]
    chip: Option<PathBuf>,

    /// Enable debug-level tracing
    #[arg(short, long)]
    trace: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.trace);

    let opts = ImageOptions {
        filename: cli.filename.clone(),
        entry_point: cli.entry_point,
        bootrom: cli.bootrom.clone(),
        chip: cli.chip.clone(),
    };
    let mut machine = match build_loaded_machine(&opts) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let (reason, executed) = if cli.step {
        run_stepped(&mut machine, cli.icount)
    } else {
        machine.run(cli.icount)
    };

    report(&machine, reason, executed)
}

/// Interactive stepping: one instruction per Enter keypress.
fn run_stepped(machine: &mut Machine, icount: u64) -> (StopReason, u64) {
    let stdin = io::stdin();
    let mut executed = 0u64;
    loop {
        if icount != 0 && executed >= icount {
            return (StopReason::LimitReached, executed);
        }
        println!(
            "PC: {:#010x}  SP: {:#010x}  R0: {:#010x}",
            machine.pc(),
            machine.read_core_reg(13),
            machine.read_core_reg(0)
        );
        print!("* Press Enter to execute next instruction...");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            return (StopReason::LimitReached, executed);
        }

        match machine.step_single() {
            Ok(StopReason::StepDone) => executed += 1,
            Ok(other) => return (other, executed),
            Err(fault) => return (StopReason::Fault(fault), executed),
        }
    }
}

fn report(machine: &Machine, reason: StopReason, executed: u64) -> ExitCode {
    match reason {
        StopReason::Fault(fault) => {
            tracing::error!(
                "Fault after {} instruction(s): {} (PC={:#010x})",
                executed,
                fault,
                machine.pc()
            );
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
        StopReason::Breakpoint(addr) => {
            tracing::info!(
                "Stopped at breakpoint {:#010x} after {} instruction(s)",
                addr,
                executed
            );
            ExitCode::from(EXIT_OK)
        }
        StopReason::LimitReached | StopReason::StepDone => {
            tracing::info!("Executed {} instruction(s), PC={:#010x}", executed, machine.pc());
            ExitCode::from(EXIT_OK)
        }
    }
}
