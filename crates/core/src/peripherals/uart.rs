// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{EmuResult, Peripheral};
use bitflags::bitflags;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

// PL011 register offsets (RP2040 UART)
const UARTDR: u32 = 0x00;
const UARTFR: u32 = 0x18;
const UARTIMSC: u32 = 0x38;
const UARTRIS: u32 = 0x3C;
const UARTMIS: u32 = 0x40;
const UARTICR: u32 = 0x44;

const RX_FIFO_DEPTH: usize = 32;

bitflags! {
    /// UARTFR flag register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlagReg: u32 {
        const RXFE = 1 << 4;
        const TXFF = 1 << 5;
        const RXFF = 1 << 6;
        const TXFE = 1 << 7;
    }
}

bitflags! {
    /// Interrupt bits shared by UARTIMSC/RIS/MIS/ICR.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UartIntr: u32 {
        const RX = 1 << 4;
        const TX = 1 << 5;
    }
}

/// RP2040 UART (PL011 subset).
///
/// The transmit path lands in a host-drained sink; the receive FIFO is
/// filled by the host (`inject_rx`). Status bits reflect FIFO occupancy,
/// and the interrupt line follows the masked status.
#[derive(Debug)]
pub struct Uart {
    rx: VecDeque<u8>,
    sink: Option<Arc<Mutex<Vec<u8>>>>,
    /// Shared inbound queue, drained into the RX FIFO on each tick.
    /// Lets a host-side transport thread feed the UART without a
    /// reference into the machine.
    rx_source: Option<Arc<Mutex<VecDeque<u8>>>>,
    echo_stdout: bool,
    imsc: u32,
    /// Transmit interrupt latches on each completed write (the emulated
    /// FIFO drains instantly) and clears through UARTICR.
    tx_intr: bool,
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}

impl Uart {
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            sink: None,
            rx_source: None,
            echo_stdout: true,
            imsc: 0,
            tx_intr: false,
        }
    }

    /// Attach a TX capture sink. When `echo_stdout` is false, transmitted
    /// bytes are no longer printed to stdout.
    pub fn set_sink(&mut self, sink: Option<Arc<Mutex<Vec<u8>>>>, echo_stdout: bool) {
        self.sink = sink;
        self.echo_stdout = echo_stdout;
    }

    /// Attach a shared inbound queue (serial-device passthrough).
    pub fn set_rx_source(&mut self, source: Option<Arc<Mutex<VecDeque<u8>>>>) {
        self.rx_source = source;
    }

    /// Host-side receive path: queue a byte for the firmware to read.
    pub fn inject_rx(&mut self, byte: u8) {
        if self.rx.len() < RX_FIFO_DEPTH {
            self.rx.push_back(byte);
        } else {
            tracing::warn!("UART RX FIFO overrun, dropping {:#04x}", byte);
        }
    }

    fn push_tx(&mut self, value: u8) {
        if let Some(sink) = &self.sink {
            if let Ok(mut guard) = sink.lock() {
                guard.push(value);
            }
        }
        if self.echo_stdout {
            #[allow(unused_must_use)]
            {
                print!("{}", value as char);
                io::stdout().flush();
            }
        }
        self.tx_intr = true;
    }

    fn flag_reg(&self) -> u32 {
        let mut fr = FlagReg::TXFE;
        if self.rx.is_empty() {
            fr |= FlagReg::RXFE;
        }
        if self.rx.len() >= RX_FIFO_DEPTH {
            fr |= FlagReg::RXFF;
        }
        fr.bits()
    }

    fn raw_status(&self) -> u32 {
        let mut ris = UartIntr::empty();
        if !self.rx.is_empty() {
            ris |= UartIntr::RX;
        }
        if self.tx_intr {
            ris |= UartIntr::TX;
        }
        ris.bits()
    }
}

impl Peripheral for Uart {
    fn read(&mut self, offset: u32, _width: u8) -> EmuResult<u32> {
        let val = match offset {
            UARTDR => self.rx.pop_front().unwrap_or(0) as u32,
            UARTFR => self.flag_reg(),
            UARTIMSC => self.imsc,
            UARTRIS => self.raw_status(),
            UARTMIS => self.raw_status() & self.imsc,
            _ => 0,
        };
        Ok(val)
    }

    fn write(&mut self, offset: u32, _width: u8, value: u32) -> EmuResult<()> {
        match offset {
            UARTDR => self.push_tx(value as u8),
            UARTIMSC => self.imsc = value & UartIntr::all().bits(),
            UARTICR => {
                if value & UartIntr::TX.bits() != 0 {
                    self.tx_intr = false;
                }
                // The RX interrupt is cleared by draining the FIFO.
            }
            _ => {}
        }
        Ok(())
    }

    fn peek(&self, offset: u32, _width: u8) -> u32 {
        match offset {
            UARTDR => self.rx.front().copied().unwrap_or(0) as u32,
            UARTFR => self.flag_reg(),
            UARTIMSC => self.imsc,
            UARTRIS => self.raw_status(),
            UARTMIS => self.raw_status() & self.imsc,
            _ => 0,
        }
    }

    fn tick(&mut self, _micros: u64) {
        if let Some(source) = &self.rx_source {
            if let Ok(mut queue) = source.lock() {
                while self.rx.len() < RX_FIFO_DEPTH {
                    match queue.pop_front() {
                        Some(b) => self.rx.push_back(b),
                        None => break,
                    }
                }
            }
        }
    }

    fn irq_lines(&self) -> u32 {
        (self.raw_status() & self.imsc != 0) as u32
    }

    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uart_with_sink() -> (Uart, Arc<Mutex<Vec<u8>>>) {
        let mut uart = Uart::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        uart.set_sink(Some(sink.clone()), false);
        (uart, sink)
    }

    #[test]
    fn test_tx_byte_reaches_sink() {
        let (mut uart, sink) = uart_with_sink();
        uart.write(UARTDR, 1, 0x41).unwrap();
        assert_eq!(sink.lock().unwrap().as_slice(), &[0x41]);
    }

    #[test]
    fn test_tx_interrupt_until_cleared() {
        let (mut uart, _sink) = uart_with_sink();
        uart.write(UARTIMSC, 4, UartIntr::TX.bits()).unwrap();
        assert_eq!(uart.irq_lines(), 0);

        uart.write(UARTDR, 1, 0x41).unwrap();
        assert_eq!(uart.irq_lines(), 1);
        assert_eq!(uart.read(UARTMIS, 4).unwrap(), UartIntr::TX.bits());

        uart.write(UARTICR, 4, UartIntr::TX.bits()).unwrap();
        assert_eq!(uart.irq_lines(), 0);
    }

    #[test]
    fn test_rx_fifo_and_status() {
        let (mut uart, _sink) = uart_with_sink();
        assert_eq!(uart.read(UARTFR, 4).unwrap() & FlagReg::RXFE.bits(), FlagReg::RXFE.bits());

        uart.inject_rx(b'h');
        uart.inject_rx(b'i');
        assert_eq!(uart.read(UARTFR, 4).unwrap() & FlagReg::RXFE.bits(), 0);

        // Masked RX interrupt asserts while the FIFO holds data.
        uart.write(UARTIMSC, 4, UartIntr::RX.bits()).unwrap();
        assert_eq!(uart.irq_lines(), 1);

        assert_eq!(uart.read(UARTDR, 1).unwrap(), b'h' as u32);
        assert_eq!(uart.read(UARTDR, 1).unwrap(), b'i' as u32);
        assert_eq!(uart.irq_lines(), 0);
        assert_eq!(uart.read(UARTFR, 4).unwrap() & FlagReg::RXFE.bits(), FlagReg::RXFE.bits());
    }

    #[test]
    fn test_peek_does_not_drain() {
        let (mut uart, _sink) = uart_with_sink();
        uart.inject_rx(0x55);
        assert_eq!(uart.peek(UARTDR, 1), 0x55);
        assert_eq!(uart.peek(UARTDR, 1), 0x55);
        assert_eq!(uart.read(UARTDR, 1).unwrap(), 0x55);
        assert_eq!(uart.peek(UARTDR, 1), 0);
    }

    #[test]
    fn test_imsc_round_trip() {
        let (mut uart, _sink) = uart_with_sink();
        uart.write(UARTIMSC, 4, 0x30).unwrap();
        assert_eq!(uart.read(UARTIMSC, 4).unwrap(), 0x30);
    }
}
