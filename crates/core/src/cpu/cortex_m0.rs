// PicoSim - RP2040 Instruction-Level Emulator
// Copyright (C) 2026 PicoSim Developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::bus::SystemBus;
use crate::decoder::{decode_thumb_16, decode_thumb_32, is_32bit, Instruction};
use crate::interrupt::{IrqController, EXC_SVCALL};
use crate::{Access, EmuResult, Fault, StepOutcome, PC_START, SP_START};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// xPSR bit positions
const PSR_N: u32 = 1 << 31;
const PSR_Z: u32 = 1 << 30;
const PSR_C: u32 = 1 << 29;
const PSR_V: u32 = 1 << 28;
const PSR_T: u32 = 1 << 24;
const IPSR_MASK: u32 = 0x3F;

/// Branch targets in this range are EXC_RETURN markers, not addresses.
const EXC_RETURN_BASE: u32 = 0xF000_0000;

/// One Cortex-M0+ core: thirteen general registers, SP/LR/PC, xPSR and
/// PRIMASK. The vector table base is shared with the SCB register block.
#[derive(Debug)]
pub struct CortexM0 {
    pub regs: [u32; 13],
    pub sp: u32,
    pub lr: u32,
    pc: u32,
    pub xpsr: u32,
    pub primask: bool,
    sleeping: bool,
    vtor: Arc<AtomicU32>,
}

impl Default for CortexM0 {
    fn default() -> Self {
        Self {
            regs: [0; 13],
            sp: SP_START,
            lr: 0,
            pc: PC_START,
            xpsr: PSR_T,
            primask: false,
            sleeping: false,
            vtor: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl CortexM0 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_shared_vtor(&mut self, vtor: Arc<AtomicU32>) {
        self.vtor = vtor;
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Thumb convention: bit 0 of a PC write is ignored.
    pub fn set_pc(&mut self, val: u32) {
        self.pc = val & !1;
    }

    pub fn set_sp(&mut self, val: u32) {
        self.sp = val;
    }

    pub fn ipsr(&self) -> u32 {
        self.xpsr & IPSR_MASK
    }

    /// Reset: SP/PC come from the vector table when a bootrom is mapped
    /// at the vector base, otherwise the flash-image defaults apply.
    pub fn reset(&mut self, bus: &mut SystemBus) {
        self.regs = [0; 13];
        self.sp = SP_START;
        self.pc = PC_START;
        self.lr = 0;
        self.xpsr = PSR_T;
        self.primask = false;
        self.sleeping = false;

        let vtor = self.vtor.load(Ordering::SeqCst);
        if let Ok(sp) = bus.read_u32(vtor) {
            if sp != 0 {
                self.sp = sp;
            }
        }
        if let Ok(pc) = bus.read_u32(vtor.wrapping_add(4)) {
            if pc != 0 {
                self.pc = pc & !1;
            }
        }
    }

    // Register file access. Reading PC yields the pipeline value
    // (instruction address + 4), matching what instructions observe.

    fn read_reg(&self, n: u8) -> u32 {
        match n {
            0..=12 => self.regs[n as usize],
            13 => self.sp,
            14 => self.lr,
            15 => self.pc.wrapping_add(4),
            _ => 0,
        }
    }

    fn write_reg(&mut self, n: u8, val: u32) {
        match n {
            0..=12 => self.regs[n as usize] = val,
            13 => self.sp = val,
            14 => self.lr = val,
            15 => self.pc = val & !1,
            _ => {}
        }
    }

    /// Debugger view: raw PC (no pipeline offset), 16 = xPSR.
    pub fn get_register(&self, id: u8) -> u32 {
        match id {
            15 => self.pc,
            16 => self.xpsr,
            n => self.read_reg(n),
        }
    }

    pub fn set_register(&mut self, id: u8, val: u32) {
        match id {
            16 => self.xpsr = val,
            n => self.write_reg(n, val),
        }
    }

    // Flag handling

    fn flag(&self, bit: u32) -> bool {
        self.xpsr & bit != 0
    }

    fn update_nz(&mut self, result: u32) {
        self.xpsr &= !(PSR_N | PSR_Z);
        if result & 0x8000_0000 != 0 {
            self.xpsr |= PSR_N;
        }
        if result == 0 {
            self.xpsr |= PSR_Z;
        }
    }

    /// Shift-style update: N and Z from the result, C only when the
    /// shifter produced a carry (amount zero leaves it untouched).
    fn update_nzc(&mut self, result: u32, carry: Option<bool>) {
        self.update_nz(result);
        if let Some(c) = carry {
            self.xpsr &= !PSR_C;
            if c {
                self.xpsr |= PSR_C;
            }
        }
    }

    fn update_nzcv(&mut self, result: u32, carry: bool, overflow: bool) {
        self.xpsr &= !(PSR_N | PSR_Z | PSR_C | PSR_V);
        if result & 0x8000_0000 != 0 {
            self.xpsr |= PSR_N;
        }
        if result == 0 {
            self.xpsr |= PSR_Z;
        }
        if carry {
            self.xpsr |= PSR_C;
        }
        if overflow {
            self.xpsr |= PSR_V;
        }
    }

    fn check_condition(&self, cond: u8) -> bool {
        let n = self.flag(PSR_N);
        let z = self.flag(PSR_Z);
        let c = self.flag(PSR_C);
        let v = self.flag(PSR_V);

        match cond {
            0x0 => z,              // EQ
            0x1 => !z,             // NE
            0x2 => c,              // CS/HS
            0x3 => !c,             // CC/LO
            0x4 => n,              // MI
            0x5 => !n,             // PL
            0x6 => v,              // VS
            0x7 => !v,             // VC
            0x8 => c && !z,        // HI
            0x9 => !c || z,        // LS
            0xA => n == v,         // GE
            0xB => n != v,         // LT
            0xC => !z && (n == v), // GT
            0xD => z || (n != v),  // LE
            _ => true,             // AL
        }
    }

    // Exception machinery

    /// Exception entry: push the eight-word frame, mark LR with the
    /// return marker, load the handler address from the vector table.
    /// Runs only at an instruction boundary.
    fn exception_entry(
        &mut self,
        bus: &mut SystemBus,
        irq: &mut IrqController,
        exc: u16,
        return_addr: u32,
    ) -> EmuResult<()> {
        let frame = self.sp.wrapping_sub(32);
        bus.write_u32(frame, self.regs[0])?;
        bus.write_u32(frame.wrapping_add(4), self.regs[1])?;
        bus.write_u32(frame.wrapping_add(8), self.regs[2])?;
        bus.write_u32(frame.wrapping_add(12), self.regs[3])?;
        bus.write_u32(frame.wrapping_add(16), self.regs[12])?;
        bus.write_u32(frame.wrapping_add(20), self.lr)?;
        bus.write_u32(frame.wrapping_add(24), return_addr | 1)?;
        bus.write_u32(frame.wrapping_add(28), self.xpsr)?;
        self.sp = frame;

        self.lr = 0xFFFF_FFF9;
        self.xpsr = (self.xpsr & !IPSR_MASK) | (exc as u32 & IPSR_MASK);

        let vtor = self.vtor.load(Ordering::SeqCst);
        let vector = vtor.wrapping_add(4 * exc as u32);
        let handler = bus.read_u32(vector)?;
        self.pc = handler & !1;
        irq.acknowledge(exc);
        self.sleeping = false;

        tracing::debug!("Exception {} entry, handler {:#010x}", exc, self.pc);
        Ok(())
    }

    /// Exception return: unstack the frame in reverse, restore xPSR
    /// (including the prior IPSR value), pop the active-exception stack.
    fn exception_return(&mut self, bus: &mut SystemBus, irq: &mut IrqController) -> EmuResult<()> {
        let frame = self.sp;
        self.regs[0] = bus.read_u32(frame)?;
        self.regs[1] = bus.read_u32(frame.wrapping_add(4))?;
        self.regs[2] = bus.read_u32(frame.wrapping_add(8))?;
        self.regs[3] = bus.read_u32(frame.wrapping_add(12))?;
        self.regs[12] = bus.read_u32(frame.wrapping_add(16))?;
        self.lr = bus.read_u32(frame.wrapping_add(20))?;
        self.pc = bus.read_u32(frame.wrapping_add(24))? & !1;
        self.xpsr = bus.read_u32(frame.wrapping_add(28))?;
        self.sp = frame.wrapping_add(32);

        let finished = irq.complete();
        tracing::debug!(
            "Exception {:?} return to {:#010x}",
            finished,
            self.pc
        );
        Ok(())
    }

    fn branch_to(
        &mut self,
        addr: u32,
        bus: &mut SystemBus,
        irq: &mut IrqController,
    ) -> EmuResult<()> {
        if addr >= EXC_RETURN_BASE {
            self.exception_return(bus, irq)
        } else {
            self.pc = addr & !1;
            Ok(())
        }
    }

    /// Execute one instruction or one exception-entry sequence.
    pub fn step(&mut self, bus: &mut SystemBus, irq: &mut IrqController) -> EmuResult<StepOutcome> {
        if self.sleeping {
            if irq.wake_pending() {
                self.sleeping = false;
            } else {
                return Ok(StepOutcome::WaitForInterrupt);
            }
        }

        // Preemption happens between instructions only: the previous
        // instruction fully committed before we get here.
        if let Some(exc) = irq.highest_pending_enabled(self.primask) {
            self.exception_entry(bus, irq, exc, self.pc)?;
            return Ok(StepOutcome::Continue);
        }

        let fetch_pc = self.pc & !1;
        let h1 = bus.read(fetch_pc, 2, Access::Fetch)? as u16;
        let (instr, width) = if is_32bit(h1) {
            let h2 = bus.read(fetch_pc.wrapping_add(2), 2, Access::Fetch)? as u16;
            (decode_thumb_32(h1, h2), 4u32)
        } else {
            (decode_thumb_16(h1), 2u32)
        };

        self.execute(instr, width, bus, irq)
    }

    fn execute(
        &mut self,
        instr: Instruction,
        width: u32,
        bus: &mut SystemBus,
        irq: &mut IrqController,
    ) -> EmuResult<StepOutcome> {
        // Branch instructions set PC directly and clear this; everything
        // else advances by the consumed instruction width.
        let mut next_pc = self.pc.wrapping_add(width);

        match instr {
            Instruction::Nop
            | Instruction::Sev
            | Instruction::Yield
            | Instruction::Wfe
            | Instruction::Dmb
            | Instruction::Dsb
            | Instruction::Isb => {}

            Instruction::Wfi => {
                // Park the core; the machine stops advancing the counter
                // until a pending-enabled interrupt exists.
                self.sleeping = true;
            }

            // Shift (immediate)
            Instruction::LslImm { rd, rm, imm } => {
                let (res, c) = lsl_c(self.read_reg(rm), imm as u32);
                self.write_reg(rd, res);
                self.update_nzc(res, c);
            }
            Instruction::LsrImm { rd, rm, imm } => {
                let amount = if imm == 0 { 32 } else { imm as u32 };
                let (res, c) = lsr_c(self.read_reg(rm), amount);
                self.write_reg(rd, res);
                self.update_nzc(res, c);
            }
            Instruction::AsrImm { rd, rm, imm } => {
                let amount = if imm == 0 { 32 } else { imm as u32 };
                let (res, c) = asr_c(self.read_reg(rm), amount);
                self.write_reg(rd, res);
                self.update_nzc(res, c);
            }

            // Add/subtract
            Instruction::AddReg { rd, rn, rm } => {
                let (res, c, v) = add_with_carry(self.read_reg(rn), self.read_reg(rm), false);
                self.write_reg(rd, res);
                self.update_nzcv(res, c, v);
            }
            Instruction::SubReg { rd, rn, rm } => {
                let (res, c, v) = add_with_carry(self.read_reg(rn), !self.read_reg(rm), true);
                self.write_reg(rd, res);
                self.update_nzcv(res, c, v);
            }
            Instruction::AddImm3 { rd, rn, imm } => {
                let (res, c, v) = add_with_carry(self.read_reg(rn), imm as u32, false);
                self.write_reg(rd, res);
                self.update_nzcv(res, c, v);
            }
            Instruction::SubImm3 { rd, rn, imm } => {
                let (res, c, v) = add_with_carry(self.read_reg(rn), !(imm as u32), true);
                self.write_reg(rd, res);
                self.update_nzcv(res, c, v);
            }
            Instruction::MovImm { rd, imm } => {
                self.write_reg(rd, imm as u32);
                self.update_nz(imm as u32);
            }
            Instruction::CmpImm { rn, imm } => {
                let (res, c, v) = add_with_carry(self.read_reg(rn), !(imm as u32), true);
                self.update_nzcv(res, c, v);
            }
            Instruction::AddImm8 { rd, imm } => {
                let (res, c, v) = add_with_carry(self.read_reg(rd), imm as u32, false);
                self.write_reg(rd, res);
                self.update_nzcv(res, c, v);
            }
            Instruction::SubImm8 { rd, imm } => {
                let (res, c, v) = add_with_carry(self.read_reg(rd), !(imm as u32), true);
                self.write_reg(rd, res);
                self.update_nzcv(res, c, v);
            }

            // Data processing (register)
            Instruction::And { rd, rm } => {
                let res = self.read_reg(rd) & self.read_reg(rm);
                self.write_reg(rd, res);
                self.update_nz(res);
            }
            Instruction::Eor { rd, rm } => {
                let res = self.read_reg(rd) ^ self.read_reg(rm);
                self.write_reg(rd, res);
                self.update_nz(res);
            }
            Instruction::LslReg { rd, rm } => {
                let (res, c) = lsl_c(self.read_reg(rd), self.read_reg(rm) & 0xFF);
                self.write_reg(rd, res);
                self.update_nzc(res, c);
            }
            Instruction::LsrReg { rd, rm } => {
                let (res, c) = lsr_c(self.read_reg(rd), self.read_reg(rm) & 0xFF);
                self.write_reg(rd, res);
                self.update_nzc(res, c);
            }
            Instruction::AsrReg { rd, rm } => {
                let (res, c) = asr_c(self.read_reg(rd), self.read_reg(rm) & 0xFF);
                self.write_reg(rd, res);
                self.update_nzc(res, c);
            }
            Instruction::Adc { rd, rm } => {
                let (res, c, v) =
                    add_with_carry(self.read_reg(rd), self.read_reg(rm), self.flag(PSR_C));
                self.write_reg(rd, res);
                self.update_nzcv(res, c, v);
            }
            Instruction::Sbc { rd, rm } => {
                let (res, c, v) =
                    add_with_carry(self.read_reg(rd), !self.read_reg(rm), self.flag(PSR_C));
                self.write_reg(rd, res);
                self.update_nzcv(res, c, v);
            }
            Instruction::RorReg { rd, rm } => {
                let (res, c) = ror_c(self.read_reg(rd), self.read_reg(rm) & 0xFF);
                self.write_reg(rd, res);
                self.update_nzc(res, c);
            }
            Instruction::Tst { rn, rm } => {
                let res = self.read_reg(rn) & self.read_reg(rm);
                self.update_nz(res);
            }
            Instruction::Rsb { rd, rn } => {
                let (res, c, v) = add_with_carry(!self.read_reg(rn), 0, true);
                self.write_reg(rd, res);
                self.update_nzcv(res, c, v);
            }
            Instruction::CmpReg { rn, rm } | Instruction::CmpRegHigh { rn, rm } => {
                let (res, c, v) = add_with_carry(self.read_reg(rn), !self.read_reg(rm), true);
                self.update_nzcv(res, c, v);
            }
            Instruction::Cmn { rn, rm } => {
                let (res, c, v) = add_with_carry(self.read_reg(rn), self.read_reg(rm), false);
                self.update_nzcv(res, c, v);
            }
            Instruction::Orr { rd, rm } => {
                let res = self.read_reg(rd) | self.read_reg(rm);
                self.write_reg(rd, res);
                self.update_nz(res);
            }
            Instruction::Mul { rd, rn } => {
                let res = self.read_reg(rn).wrapping_mul(self.read_reg(rd));
                self.write_reg(rd, res);
                self.update_nz(res);
            }
            Instruction::Bic { rd, rm } => {
                let res = self.read_reg(rd) & !self.read_reg(rm);
                self.write_reg(rd, res);
                self.update_nz(res);
            }
            Instruction::Mvn { rd, rm } => {
                let res = !self.read_reg(rm);
                self.write_reg(rd, res);
                self.update_nz(res);
            }

            // High-register operations (flags untouched)
            Instruction::AddRegHigh { rd, rm } => {
                let res = self.read_reg(rd).wrapping_add(self.read_reg(rm));
                if rd == 15 {
                    self.pc = res & !1;
                    next_pc = self.pc;
                } else {
                    self.write_reg(rd, res);
                }
            }
            Instruction::MovReg { rd, rm } => {
                let val = self.read_reg(rm);
                if rd == 15 {
                    self.pc = val & !1;
                    next_pc = self.pc;
                } else {
                    self.write_reg(rd, val);
                }
            }
            Instruction::Bx { rm } => {
                let target = self.read_reg(rm);
                self.branch_to(target, bus, irq)?;
                next_pc = self.pc;
            }
            Instruction::Blx { rm } => {
                let target = self.read_reg(rm);
                self.lr = self.pc.wrapping_add(2) | 1;
                self.branch_to(target, bus, irq)?;
                next_pc = self.pc;
            }

            // Loads/stores
            Instruction::LdrLit { rt, imm } => {
                let base = self.pc.wrapping_add(4) & !3;
                let val = bus.read_u32(base.wrapping_add(imm as u32))?;
                self.write_reg(rt, val);
            }
            Instruction::StrReg { rt, rn, rm } => {
                let addr = self.read_reg(rn).wrapping_add(self.read_reg(rm));
                bus.write_u32(addr, self.read_reg(rt))?;
            }
            Instruction::StrhReg { rt, rn, rm } => {
                let addr = self.read_reg(rn).wrapping_add(self.read_reg(rm));
                bus.write_u16(addr, self.read_reg(rt) as u16)?;
            }
            Instruction::StrbReg { rt, rn, rm } => {
                let addr = self.read_reg(rn).wrapping_add(self.read_reg(rm));
                bus.write_u8(addr, self.read_reg(rt) as u8)?;
            }
            Instruction::LdrsbReg { rt, rn, rm } => {
                let addr = self.read_reg(rn).wrapping_add(self.read_reg(rm));
                let val = bus.read_u8(addr)? as i8 as i32 as u32;
                self.write_reg(rt, val);
            }
            Instruction::LdrReg { rt, rn, rm } => {
                let addr = self.read_reg(rn).wrapping_add(self.read_reg(rm));
                let val = bus.read_u32(addr)?;
                self.write_reg(rt, val);
            }
            Instruction::LdrhReg { rt, rn, rm } => {
                let addr = self.read_reg(rn).wrapping_add(self.read_reg(rm));
                let val = bus.read_u16(addr)? as u32;
                self.write_reg(rt, val);
            }
            Instruction::LdrbReg { rt, rn, rm } => {
                let addr = self.read_reg(rn).wrapping_add(self.read_reg(rm));
                let val = bus.read_u8(addr)? as u32;
                self.write_reg(rt, val);
            }
            Instruction::LdrshReg { rt, rn, rm } => {
                let addr = self.read_reg(rn).wrapping_add(self.read_reg(rm));
                let val = bus.read_u16(addr)? as i16 as i32 as u32;
                self.write_reg(rt, val);
            }
            Instruction::StrImm { rt, rn, imm } => {
                let addr = self.read_reg(rn).wrapping_add(imm as u32);
                bus.write_u32(addr, self.read_reg(rt))?;
            }
            Instruction::LdrImm { rt, rn, imm } => {
                let addr = self.read_reg(rn).wrapping_add(imm as u32);
                let val = bus.read_u32(addr)?;
                self.write_reg(rt, val);
            }
            Instruction::StrbImm { rt, rn, imm } => {
                let addr = self.read_reg(rn).wrapping_add(imm as u32);
                bus.write_u8(addr, self.read_reg(rt) as u8)?;
            }
            Instruction::LdrbImm { rt, rn, imm } => {
                let addr = self.read_reg(rn).wrapping_add(imm as u32);
                let val = bus.read_u8(addr)? as u32;
                self.write_reg(rt, val);
            }
            Instruction::StrhImm { rt, rn, imm } => {
                let addr = self.read_reg(rn).wrapping_add(imm as u32);
                bus.write_u16(addr, self.read_reg(rt) as u16)?;
            }
            Instruction::LdrhImm { rt, rn, imm } => {
                let addr = self.read_reg(rn).wrapping_add(imm as u32);
                let val = bus.read_u16(addr)? as u32;
                self.write_reg(rt, val);
            }
            Instruction::StrSp { rt, imm } => {
                let addr = self.sp.wrapping_add(imm as u32);
                bus.write_u32(addr, self.read_reg(rt))?;
            }
            Instruction::LdrSp { rt, imm } => {
                let addr = self.sp.wrapping_add(imm as u32);
                let val = bus.read_u32(addr)?;
                self.write_reg(rt, val);
            }

            // Address generation
            Instruction::Adr { rd, imm } => {
                let base = self.pc.wrapping_add(4) & !3;
                self.write_reg(rd, base.wrapping_add(imm as u32));
            }
            Instruction::AddSpImm { rd, imm } => {
                self.write_reg(rd, self.sp.wrapping_add(imm as u32));
            }
            Instruction::AddSp { imm } => {
                self.sp = self.sp.wrapping_add(imm as u32);
            }
            Instruction::SubSp { imm } => {
                self.sp = self.sp.wrapping_sub(imm as u32);
            }

            // Extend
            Instruction::Sxth { rd, rm } => {
                let val = self.read_reg(rm) as u16 as i16 as i32 as u32;
                self.write_reg(rd, val);
            }
            Instruction::Sxtb { rd, rm } => {
                let val = self.read_reg(rm) as u8 as i8 as i32 as u32;
                self.write_reg(rd, val);
            }
            Instruction::Uxth { rd, rm } => {
                self.write_reg(rd, self.read_reg(rm) & 0xFFFF);
            }
            Instruction::Uxtb { rd, rm } => {
                self.write_reg(rd, self.read_reg(rm) & 0xFF);
            }

            // Stack / multiple. Lowest register lands at the lowest
            // address; the base register update commits last, so a bus
            // fault mid-sequence leaves SP/Rn untouched.
            Instruction::Push { registers, m } => {
                let count = registers.count_ones() + m as u32;
                let mut addr = self.sp.wrapping_sub(4 * count);
                let new_sp = addr;
                for i in 0..8 {
                    if registers & (1 << i) != 0 {
                        bus.write_u32(addr, self.read_reg(i))?;
                        addr = addr.wrapping_add(4);
                    }
                }
                if m {
                    bus.write_u32(addr, self.lr)?;
                }
                self.sp = new_sp;
            }
            Instruction::Pop { registers, p } => {
                let mut addr = self.sp;
                let mut vals = [0u32; 8];
                for i in 0..8 {
                    if registers & (1 << i) != 0 {
                        vals[i as usize] = bus.read_u32(addr)?;
                        addr = addr.wrapping_add(4);
                    }
                }
                let pc_val = if p {
                    let v = bus.read_u32(addr)?;
                    addr = addr.wrapping_add(4);
                    Some(v)
                } else {
                    None
                };
                for i in 0..8 {
                    if registers & (1 << i) != 0 {
                        self.write_reg(i, vals[i as usize]);
                    }
                }
                self.sp = addr;
                if let Some(v) = pc_val {
                    self.branch_to(v, bus, irq)?;
                    next_pc = self.pc;
                }
            }
            Instruction::Stm { rn, registers } => {
                let mut addr = self.read_reg(rn);
                for i in 0..8 {
                    if registers & (1 << i) != 0 {
                        bus.write_u32(addr, self.read_reg(i))?;
                        addr = addr.wrapping_add(4);
                    }
                }
                self.write_reg(rn, addr);
            }
            Instruction::Ldm { rn, registers } => {
                let mut addr = self.read_reg(rn);
                let mut vals = [0u32; 8];
                for i in 0..8 {
                    if registers & (1 << i) != 0 {
                        vals[i as usize] = bus.read_u32(addr)?;
                        addr = addr.wrapping_add(4);
                    }
                }
                for i in 0..8 {
                    if registers & (1 << i) != 0 {
                        self.write_reg(i, vals[i as usize]);
                    }
                }
                // Writeback is suppressed when Rn is in the list.
                if registers & (1 << rn) == 0 {
                    self.write_reg(rn, addr);
                }
            }

            // Misc
            Instruction::Cpsie => self.primask = false,
            Instruction::Cpsid => self.primask = true,
            Instruction::Rev { rd, rm } => {
                self.write_reg(rd, self.read_reg(rm).swap_bytes());
            }
            Instruction::Rev16 { rd, rm } => {
                let val = self.read_reg(rm);
                let low = ((val & 0xFF) << 8) | ((val >> 8) & 0xFF);
                let high = ((val & 0x00FF_0000) << 8) | ((val & 0xFF00_0000) >> 8);
                self.write_reg(rd, high | low);
            }
            Instruction::RevSh { rd, rm } => {
                let val = self.read_reg(rm);
                let low = ((val & 0xFF) << 8) | ((val >> 8) & 0xFF);
                self.write_reg(rd, low as u16 as i16 as i32 as u32);
            }
            Instruction::Bkpt { .. } => {
                // Report without advancing; the debugger owns this PC.
                return Ok(StepOutcome::Breakpoint(self.pc));
            }

            // Control flow
            Instruction::BranchCond { cond, offset } => {
                if self.check_condition(cond) {
                    next_pc = self
                        .pc
                        .wrapping_add(4)
                        .wrapping_add(offset as u32);
                }
            }
            Instruction::Branch { offset } => {
                next_pc = self.pc.wrapping_add(4).wrapping_add(offset as u32);
            }
            Instruction::Bl { offset } => {
                self.lr = self.pc.wrapping_add(4) | 1;
                next_pc = self.pc.wrapping_add(4).wrapping_add(offset as u32);
            }
            Instruction::Svc { .. } => {
                let return_addr = self.pc.wrapping_add(2);
                self.exception_entry(bus, irq, EXC_SVCALL, return_addr)?;
                next_pc = self.pc;
            }

            // System
            Instruction::Mrs { rd, sysm } => {
                let val = match sysm {
                    0..=7 => self.xpsr & (PSR_N | PSR_Z | PSR_C | PSR_V | IPSR_MASK),
                    8 | 9 => self.sp,
                    16 => self.primask as u32,
                    _ => 0,
                };
                self.write_reg(rd, val);
            }
            Instruction::Msr { rn, sysm } => {
                let val = self.read_reg(rn);
                match sysm {
                    0..=3 => {
                        self.xpsr = (self.xpsr & !(PSR_N | PSR_Z | PSR_C | PSR_V))
                            | (val & (PSR_N | PSR_Z | PSR_C | PSR_V));
                    }
                    8 | 9 => self.sp = val & !3,
                    16 => self.primask = val & 1 != 0,
                    _ => {}
                }
            }

            Instruction::Undefined(op) => {
                return Err(Fault::Undefined {
                    addr: self.pc,
                    opcode: op as u32,
                });
            }
            Instruction::Undefined32(h1, h2) => {
                return Err(Fault::Undefined {
                    addr: self.pc,
                    opcode: ((h1 as u32) << 16) | h2 as u32,
                });
            }
        }

        self.pc = next_pc;
        Ok(StepOutcome::Continue)
    }
}

/// ARM AddWithCarry: returns (result, carry-out, signed overflow). All
/// arithmetic flag computation funnels through here so subtraction
/// (x + !y + 1) gets the inverted-borrow carry for free.
fn add_with_carry(x: u32, y: u32, carry_in: bool) -> (u32, bool, bool) {
    let unsigned_sum = x as u64 + y as u64 + carry_in as u64;
    let result = unsigned_sum as u32;
    let carry = unsigned_sum > u32::MAX as u64;
    let signed_sum = x as i32 as i64 + y as i32 as i64 + carry_in as i64;
    let overflow = signed_sum != result as i32 as i64;
    (result, carry, overflow)
}

// Shifter primitives. Amount zero returns None for carry: the flag is
// left as it was.

fn lsl_c(value: u32, amount: u32) -> (u32, Option<bool>) {
    match amount {
        0 => (value, None),
        1..=31 => (value << amount, Some((value >> (32 - amount)) & 1 == 1)),
        32 => (0, Some(value & 1 == 1)),
        _ => (0, Some(false)),
    }
}

fn lsr_c(value: u32, amount: u32) -> (u32, Option<bool>) {
    match amount {
        0 => (value, None),
        1..=31 => (value >> amount, Some((value >> (amount - 1)) & 1 == 1)),
        32 => (0, Some(value & 0x8000_0000 != 0)),
        _ => (0, Some(false)),
    }
}

fn asr_c(value: u32, amount: u32) -> (u32, Option<bool>) {
    match amount {
        0 => (value, None),
        1..=31 => (
            ((value as i32) >> amount) as u32,
            Some((value >> (amount - 1)) & 1 == 1),
        ),
        _ => {
            let fill = if value & 0x8000_0000 != 0 { 0xFFFF_FFFF } else { 0 };
            (fill, Some(value & 0x8000_0000 != 0))
        }
    }
}

fn ror_c(value: u32, amount: u32) -> (u32, Option<bool>) {
    if amount == 0 {
        return (value, None);
    }
    let rot = amount % 32;
    if rot == 0 {
        (value, Some(value & 0x8000_0000 != 0))
    } else {
        let res = value.rotate_right(rot);
        (res, Some(res & 0x8000_0000 != 0))
    }
}
