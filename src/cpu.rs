// SM83 interpreter: fetch/decode/execute for the full 256-entry primary
// opcode table plus the 256-entry 0xCB-prefixed table, interrupt dispatch,
// and HALT/STOP/EI-delay semantics.

use crate::bus::MemoryBus;
use crate::error::{CoreError, CoreResult};
use crate::registers::{Registers, FLAG_C, FLAG_H, FLAG_N, FLAG_Z};

pub struct Cpu {
    pub regs: Registers,
    pub ime: bool,
    ime_delay_counter: u8,
    pub halted: bool,
    halt_bug: bool,
}

impl Cpu {
    pub fn new() -> Self {
        Cpu {
            regs: Registers::post_boot(),
            ime: false,
            ime_delay_counter: 0,
            halted: false,
            halt_bug: false,
        }
    }

    pub fn step(&mut self, bus: &mut MemoryBus) -> CoreResult<u8> {
        bus.poll_joypad();

        if self.ime_delay_counter > 0 {
            self.ime_delay_counter -= 1;
            if self.ime_delay_counter == 0 {
                self.ime = true;
            }
        }

        if self.halted {
            if bus.has_any_pending_interrupt() {
                self.halted = false;
            } else {
                return Ok(4);
            }
        }

        if self.ime {
            if let Some(bit) = bus.pending_interrupt() {
                self.ime = false;
                bus.clear_interrupt(bit);
                let pc = self.regs.pc;
                self.push16(bus, pc);
                self.regs.pc = 0x0040 + (bit as u16) * 8;
                return Ok(20);
            }
        }

        let opcode = self.fetch8(bus);
        if self.halt_bug {
            self.regs.pc = self.regs.pc.wrapping_sub(1);
            self.halt_bug = false;
        }
        self.execute(bus, opcode)
    }

    fn fetch8(&mut self, bus: &mut MemoryBus) -> u8 {
        let v = bus.read8(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        v
    }

    fn fetch16(&mut self, bus: &mut MemoryBus) -> u16 {
        let lo = self.fetch8(bus) as u16;
        let hi = self.fetch8(bus) as u16;
        (hi << 8) | lo
    }

    fn push16(&mut self, bus: &mut MemoryBus, value: u16) {
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        bus.write8(self.regs.sp, (value >> 8) as u8);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        bus.write8(self.regs.sp, value as u8);
    }

    fn pop16(&mut self, bus: &mut MemoryBus) -> u16 {
        let lo = bus.read8(self.regs.sp) as u16;
        self.regs.sp = self.regs.sp.wrapping_add(1);
        let hi = bus.read8(self.regs.sp) as u16;
        self.regs.sp = self.regs.sp.wrapping_add(1);
        (hi << 8) | lo
    }

    fn r8_get(&mut self, bus: &mut MemoryBus, idx: u8) -> u8 {
        match idx {
            0 => self.regs.b,
            1 => self.regs.c,
            2 => self.regs.d,
            3 => self.regs.e,
            4 => self.regs.h,
            5 => self.regs.l,
            6 => bus.read8(self.regs.hl()),
            7 => self.regs.a,
            _ => unreachable!(),
        }
    }

    fn r8_set(&mut self, bus: &mut MemoryBus, idx: u8, value: u8) {
        match idx {
            0 => self.regs.b = value,
            1 => self.regs.c = value,
            2 => self.regs.d = value,
            3 => self.regs.e = value,
            4 => self.regs.h = value,
            5 => self.regs.l = value,
            6 => bus.write8(self.regs.hl(), value),
            7 => self.regs.a = value,
            _ => unreachable!(),
        }
    }

    fn rp_get(&self, idx: u8) -> u16 {
        match idx {
            0 => self.regs.bc(),
            1 => self.regs.de(),
            2 => self.regs.hl(),
            3 => self.regs.sp,
            _ => unreachable!(),
        }
    }

    fn rp_set(&mut self, idx: u8, value: u16) {
        match idx {
            0 => self.regs.set_bc(value),
            1 => self.regs.set_de(value),
            2 => self.regs.set_hl(value),
            3 => self.regs.sp = value,
            _ => unreachable!(),
        }
    }

    fn rp2_get(&self, idx: u8) -> u16 {
        match idx {
            0 => self.regs.bc(),
            1 => self.regs.de(),
            2 => self.regs.hl(),
            3 => self.regs.af(),
            _ => unreachable!(),
        }
    }

    fn rp2_set(&mut self, idx: u8, value: u16) {
        match idx {
            0 => self.regs.set_bc(value),
            1 => self.regs.set_de(value),
            2 => self.regs.set_hl(value),
            3 => self.regs.set_af(value),
            _ => unreachable!(),
        }
    }

    fn cc_test(&self, idx: u8) -> bool {
        match idx {
            0 => !self.regs.flag(FLAG_Z),
            1 => self.regs.flag(FLAG_Z),
            2 => !self.regs.flag(FLAG_C),
            3 => self.regs.flag(FLAG_C),
            _ => unreachable!(),
        }
    }

    fn alu_add(&mut self, value: u8, use_carry: bool) {
        let carry_in = if use_carry && self.regs.flag(FLAG_C) { 1u8 } else { 0 };
        let a = self.regs.a;
        let (r1, o1) = a.overflowing_add(value);
        let (result, o2) = r1.overflowing_add(carry_in);
        let half = (a & 0x0F) + (value & 0x0F) + carry_in > 0x0F;
        self.regs.a = result;
        self.regs.set_flag(FLAG_Z, result == 0);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, half);
        self.regs.set_flag(FLAG_C, o1 || o2);
    }

    fn alu_sub(&mut self, value: u8, use_carry: bool, store: bool) {
        let carry_in = if use_carry && self.regs.flag(FLAG_C) { 1u8 } else { 0 };
        let a = self.regs.a;
        let (r1, o1) = a.overflowing_sub(value);
        let (result, o2) = r1.overflowing_sub(carry_in);
        let half = (a & 0x0F) < (value & 0x0F) + carry_in;
        if store {
            self.regs.a = result;
        }
        self.regs.set_flag(FLAG_Z, result == 0);
        self.regs.set_flag(FLAG_N, true);
        self.regs.set_flag(FLAG_H, half);
        self.regs.set_flag(FLAG_C, o1 || o2);
    }

    fn alu_and(&mut self, value: u8) {
        self.regs.a &= value;
        self.regs.set_flag(FLAG_Z, self.regs.a == 0);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, true);
        self.regs.set_flag(FLAG_C, false);
    }

    fn alu_or(&mut self, value: u8) {
        self.regs.a |= value;
        self.regs.set_flag(FLAG_Z, self.regs.a == 0);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, false);
        self.regs.set_flag(FLAG_C, false);
    }

    fn alu_xor(&mut self, value: u8) {
        self.regs.a ^= value;
        self.regs.set_flag(FLAG_Z, self.regs.a == 0);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, false);
        self.regs.set_flag(FLAG_C, false);
    }

    fn alu_dispatch(&mut self, op: u8, value: u8) {
        match op {
            0 => self.alu_add(value, false),
            1 => self.alu_add(value, true),
            2 => self.alu_sub(value, false, true),
            3 => self.alu_sub(value, true, true),
            4 => self.alu_and(value),
            5 => self.alu_xor(value),
            6 => self.alu_or(value),
            7 => self.alu_sub(value, false, false),
            _ => unreachable!(),
        }
    }

    fn inc8(&mut self, v: u8) -> u8 {
        let r = v.wrapping_add(1);
        self.regs.set_flag(FLAG_Z, r == 0);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, (v & 0x0F) + 1 > 0x0F);
        r
    }

    fn dec8(&mut self, v: u8) -> u8 {
        let r = v.wrapping_sub(1);
        self.regs.set_flag(FLAG_Z, r == 0);
        self.regs.set_flag(FLAG_N, true);
        self.regs.set_flag(FLAG_H, v & 0x0F == 0);
        r
    }

    fn add_hl(&mut self, value: u16) {
        let hl = self.regs.hl();
        let (result, carry) = hl.overflowing_add(value);
        let half = (hl & 0x0FFF) + (value & 0x0FFF) > 0x0FFF;
        self.regs.set_hl(result);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, half);
        self.regs.set_flag(FLAG_C, carry);
    }

    fn add_sp_e(&mut self, e: i8) -> u16 {
        let sp = self.regs.sp;
        let unsigned_byte = e as u8 as u16;
        let result = sp.wrapping_add(e as i16 as u16);
        let half = (sp & 0x0F) + (unsigned_byte & 0x0F) > 0x0F;
        let carry = (sp & 0xFF) + (unsigned_byte & 0xFF) > 0xFF;
        self.regs.set_flag(FLAG_Z, false);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, half);
        self.regs.set_flag(FLAG_C, carry);
        result
    }

    fn daa(&mut self) {
        let mut a = self.regs.a;
        let n = self.regs.flag(FLAG_N);
        let mut carry = self.regs.flag(FLAG_C);
        let half = self.regs.flag(FLAG_H);
        if !n {
            if carry || a > 0x99 {
                a = a.wrapping_add(0x60);
                carry = true;
            }
            if half || (a & 0x0F) > 0x09 {
                a = a.wrapping_add(0x06);
            }
        } else {
            if carry {
                a = a.wrapping_sub(0x60);
            }
            if half {
                a = a.wrapping_sub(0x06);
            }
        }
        self.regs.a = a;
        self.regs.set_flag(FLAG_Z, a == 0);
        self.regs.set_flag(FLAG_H, false);
        self.regs.set_flag(FLAG_C, carry);
    }

    fn rlc(&mut self, v: u8) -> u8 {
        let carry = (v >> 7) & 1;
        let r = (v << 1) | carry;
        self.regs.set_flag(FLAG_Z, r == 0);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, false);
        self.regs.set_flag(FLAG_C, carry != 0);
        r
    }
    fn rrc(&mut self, v: u8) -> u8 {
        let carry = v & 1;
        let r = (v >> 1) | (carry << 7);
        self.regs.set_flag(FLAG_Z, r == 0);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, false);
        self.regs.set_flag(FLAG_C, carry != 0);
        r
    }
    fn rl(&mut self, v: u8) -> u8 {
        let carry_in = if self.regs.flag(FLAG_C) { 1 } else { 0 };
        let carry_out = (v >> 7) & 1;
        let r = (v << 1) | carry_in;
        self.regs.set_flag(FLAG_Z, r == 0);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, false);
        self.regs.set_flag(FLAG_C, carry_out != 0);
        r
    }
    fn rr(&mut self, v: u8) -> u8 {
        let carry_in = if self.regs.flag(FLAG_C) { 0x80 } else { 0 };
        let carry_out = v & 1;
        let r = (v >> 1) | carry_in;
        self.regs.set_flag(FLAG_Z, r == 0);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, false);
        self.regs.set_flag(FLAG_C, carry_out != 0);
        r
    }
    fn sla(&mut self, v: u8) -> u8 {
        let carry = (v >> 7) & 1;
        let r = v << 1;
        self.regs.set_flag(FLAG_Z, r == 0);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, false);
        self.regs.set_flag(FLAG_C, carry != 0);
        r
    }
    fn sra(&mut self, v: u8) -> u8 {
        let carry = v & 1;
        let r = (v >> 1) | (v & 0x80);
        self.regs.set_flag(FLAG_Z, r == 0);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, false);
        self.regs.set_flag(FLAG_C, carry != 0);
        r
    }
    fn swap(&mut self, v: u8) -> u8 {
        let r = (v << 4) | (v >> 4);
        self.regs.set_flag(FLAG_Z, r == 0);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, false);
        self.regs.set_flag(FLAG_C, false);
        r
    }
    fn srl(&mut self, v: u8) -> u8 {
        let carry = v & 1;
        let r = v >> 1;
        self.regs.set_flag(FLAG_Z, r == 0);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, false);
        self.regs.set_flag(FLAG_C, carry != 0);
        r
    }
    fn bit_test(&mut self, bit: u8, v: u8) {
        self.regs.set_flag(FLAG_Z, v & (1 << bit) == 0);
        self.regs.set_flag(FLAG_N, false);
        self.regs.set_flag(FLAG_H, true);
    }

    fn execute(&mut self, bus: &mut MemoryBus, opcode: u8) -> CoreResult<u8> {
        match opcode {
            0x00 => Ok(4),
            0x01 | 0x11 | 0x21 | 0x31 => {
                let v = self.fetch16(bus);
                self.rp_set((opcode >> 4) & 3, v);
                Ok(12)
            }
            0x02 => {
                bus.write8(self.regs.bc(), self.regs.a);
                Ok(8)
            }
            0x12 => {
                bus.write8(self.regs.de(), self.regs.a);
                Ok(8)
            }
            0x22 => {
                let addr = self.regs.hl();
                bus.write8(addr, self.regs.a);
                self.regs.set_hl(addr.wrapping_add(1));
                Ok(8)
            }
            0x32 => {
                let addr = self.regs.hl();
                bus.write8(addr, self.regs.a);
                self.regs.set_hl(addr.wrapping_sub(1));
                Ok(8)
            }
            0x03 | 0x13 | 0x23 | 0x33 => {
                let idx = (opcode >> 4) & 3;
                let v = self.rp_get(idx).wrapping_add(1);
                self.rp_set(idx, v);
                Ok(8)
            }
            0x0B | 0x1B | 0x2B | 0x3B => {
                let idx = (opcode >> 4) & 3;
                let v = self.rp_get(idx).wrapping_sub(1);
                self.rp_set(idx, v);
                Ok(8)
            }
            0x09 | 0x19 | 0x29 | 0x39 => {
                let v = self.rp_get((opcode >> 4) & 3);
                self.add_hl(v);
                Ok(8)
            }
            0x0A => {
                self.regs.a = bus.read8(self.regs.bc());
                Ok(8)
            }
            0x1A => {
                self.regs.a = bus.read8(self.regs.de());
                Ok(8)
            }
            0x2A => {
                let addr = self.regs.hl();
                self.regs.a = bus.read8(addr);
                self.regs.set_hl(addr.wrapping_add(1));
                Ok(8)
            }
            0x3A => {
                let addr = self.regs.hl();
                self.regs.a = bus.read8(addr);
                self.regs.set_hl(addr.wrapping_sub(1));
                Ok(8)
            }
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let idx = (opcode >> 3) & 7;
                let v = self.r8_get(bus, idx);
                let r = self.inc8(v);
                self.r8_set(bus, idx, r);
                Ok(if idx == 6 { 12 } else { 4 })
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let idx = (opcode >> 3) & 7;
                let v = self.r8_get(bus, idx);
                let r = self.dec8(v);
                self.r8_set(bus, idx, r);
                Ok(if idx == 6 { 12 } else { 4 })
            }
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let idx = (opcode >> 3) & 7;
                let v = self.fetch8(bus);
                self.r8_set(bus, idx, v);
                Ok(if idx == 6 { 12 } else { 8 })
            }
            0x07 => {
                let r = self.rlc(self.regs.a);
                self.regs.a = r;
                self.regs.set_flag(FLAG_Z, false);
                Ok(4)
            }
            0x0F => {
                let r = self.rrc(self.regs.a);
                self.regs.a = r;
                self.regs.set_flag(FLAG_Z, false);
                Ok(4)
            }
            0x17 => {
                let r = self.rl(self.regs.a);
                self.regs.a = r;
                self.regs.set_flag(FLAG_Z, false);
                Ok(4)
            }
            0x1F => {
                let r = self.rr(self.regs.a);
                self.regs.a = r;
                self.regs.set_flag(FLAG_Z, false);
                Ok(4)
            }
            0x08 => {
                let addr = self.fetch16(bus);
                bus.write8(addr, self.regs.sp as u8);
                bus.write8(addr.wrapping_add(1), (self.regs.sp >> 8) as u8);
                Ok(20)
            }
            0x10 => {
                self.fetch8(bus);
                Ok(4)
            }
            0x18 => {
                let e = self.fetch8(bus) as i8;
                self.regs.pc = self.regs.pc.wrapping_add(e as i16 as u16);
                Ok(12)
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let idx = (opcode >> 3) & 3;
                let e = self.fetch8(bus) as i8;
                if self.cc_test(idx) {
                    self.regs.pc = self.regs.pc.wrapping_add(e as i16 as u16);
                    Ok(12)
                } else {
                    Ok(8)
                }
            }
            0x27 => {
                self.daa();
                Ok(4)
            }
            0x2F => {
                self.regs.a = !self.regs.a;
                self.regs.set_flag(FLAG_N, true);
                self.regs.set_flag(FLAG_H, true);
                Ok(4)
            }
            0x37 => {
                self.regs.set_flag(FLAG_N, false);
                self.regs.set_flag(FLAG_H, false);
                self.regs.set_flag(FLAG_C, true);
                Ok(4)
            }
            0x3F => {
                let c = self.regs.flag(FLAG_C);
                self.regs.set_flag(FLAG_N, false);
                self.regs.set_flag(FLAG_H, false);
                self.regs.set_flag(FLAG_C, !c);
                Ok(4)
            }
            0x76 => {
                if !self.ime && bus.has_any_pending_interrupt() {
                    self.halt_bug = true;
                } else {
                    self.halted = true;
                }
                Ok(4)
            }
            0x40..=0x7F => {
                let dst = (opcode >> 3) & 7;
                let src = opcode & 7;
                let v = self.r8_get(bus, src);
                self.r8_set(bus, dst, v);
                Ok(if dst == 6 || src == 6 { 8 } else { 4 })
            }
            0x80..=0xBF => {
                let op = (opcode >> 3) & 7;
                let src = opcode & 7;
                let v = self.r8_get(bus, src);
                self.alu_dispatch(op, v);
                Ok(if src == 6 { 8 } else { 4 })
            }
            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                let idx = (opcode >> 3) & 3;
                if self.cc_test(idx) {
                    let pc = self.pop16(bus);
                    self.regs.pc = pc;
                    Ok(20)
                } else {
                    Ok(8)
                }
            }
            0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                let idx = (opcode >> 4) & 3;
                let v = self.pop16(bus);
                self.rp2_set(idx, v);
                Ok(12)
            }
            0xC2 | 0xCA | 0xD2 | 0xDA => {
                let idx = (opcode >> 3) & 3;
                let addr = self.fetch16(bus);
                if self.cc_test(idx) {
                    self.regs.pc = addr;
                    Ok(16)
                } else {
                    Ok(12)
                }
            }
            0xC3 => {
                let addr = self.fetch16(bus);
                self.regs.pc = addr;
                Ok(16)
            }
            0xC4 | 0xCC | 0xD4 | 0xDC => {
                let idx = (opcode >> 3) & 3;
                let addr = self.fetch16(bus);
                if self.cc_test(idx) {
                    let pc = self.regs.pc;
                    self.push16(bus, pc);
                    self.regs.pc = addr;
                    Ok(24)
                } else {
                    Ok(12)
                }
            }
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                let idx = (opcode >> 4) & 3;
                let v = self.rp2_get(idx);
                self.push16(bus, v);
                Ok(16)
            }
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let op = (opcode >> 3) & 7;
                let v = self.fetch8(bus);
                self.alu_dispatch(op, v);
                Ok(8)
            }
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                let vector = (opcode & 0x38) as u16;
                let pc = self.regs.pc;
                self.push16(bus, pc);
                self.regs.pc = vector;
                Ok(16)
            }
            0xC9 => {
                let pc = self.pop16(bus);
                self.regs.pc = pc;
                Ok(16)
            }
            0xD9 => {
                let pc = self.pop16(bus);
                self.regs.pc = pc;
                self.ime = true;
                Ok(16)
            }
            0xE9 => {
                self.regs.pc = self.regs.hl();
                Ok(4)
            }
            0xCB => {
                let sub = self.fetch8(bus);
                self.execute_cb(bus, sub)
            }
            0xE0 => {
                let off = self.fetch8(bus);
                bus.write8(0xFF00 + off as u16, self.regs.a);
                Ok(12)
            }
            0xE2 => {
                bus.write8(0xFF00 + self.regs.c as u16, self.regs.a);
                Ok(8)
            }
            0xE8 => {
                let e = self.fetch8(bus) as i8;
                let r = self.add_sp_e(e);
                self.regs.sp = r;
                Ok(16)
            }
            0xEA => {
                let addr = self.fetch16(bus);
                bus.write8(addr, self.regs.a);
                Ok(16)
            }
            0xF0 => {
                let off = self.fetch8(bus);
                self.regs.a = bus.read8(0xFF00 + off as u16);
                Ok(12)
            }
            0xF2 => {
                self.regs.a = bus.read8(0xFF00 + self.regs.c as u16);
                Ok(8)
            }
            0xF3 => {
                self.ime = false;
                self.ime_delay_counter = 0;
                Ok(4)
            }
            0xF8 => {
                let e = self.fetch8(bus) as i8;
                let r = self.add_sp_e(e);
                self.regs.set_hl(r);
                Ok(12)
            }
            0xF9 => {
                self.regs.sp = self.regs.hl();
                Ok(8)
            }
            0xFA => {
                let addr = self.fetch16(bus);
                self.regs.a = bus.read8(addr);
                Ok(16)
            }
            0xFB => {
                self.ime_delay_counter = 2;
                Ok(4)
            }
            0xD3 | 0xDB | 0xDD | 0xE3 | 0xE4 | 0xEB | 0xEC | 0xED | 0xF4 | 0xFC | 0xFD => {
                Err(CoreError::InvalidOpcode { opcode, pc: self.regs.pc.wrapping_sub(1) })
            }
        }
    }

    fn execute_cb(&mut self, bus: &mut MemoryBus, opcode: u8) -> CoreResult<u8> {
        let z = opcode & 7;
        let y = (opcode >> 3) & 7;
        let x = (opcode >> 6) & 3;
        match x {
            0 => {
                let v = self.r8_get(bus, z);
                let r = match y {
                    0 => self.rlc(v),
                    1 => self.rrc(v),
                    2 => self.rl(v),
                    3 => self.rr(v),
                    4 => self.sla(v),
                    5 => self.sra(v),
                    6 => self.swap(v),
                    7 => self.srl(v),
                    _ => unreachable!(),
                };
                self.r8_set(bus, z, r);
                Ok(if z == 6 { 16 } else { 8 })
            }
            1 => {
                let v = self.r8_get(bus, z);
                self.bit_test(y, v);
                Ok(if z == 6 { 12 } else { 8 })
            }
            2 => {
                let v = self.r8_get(bus, z);
                self.r8_set(bus, z, v & !(1 << y));
                Ok(if z == 6 { 16 } else { 8 })
            }
            3 => {
                let v = self.r8_get(bus, z);
                self.r8_set(bus, z, v | (1 << y));
                Ok(if z == 6 { 16 } else { 8 })
            }
            _ => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::Cartridge;
    use crate::input::InputState;
    use chrono::Utc;

    fn test_bus_with_program(program: &[u8]) -> MemoryBus {
        let mut rom = vec![0u8; 0x8000];
        rom[0x147] = 0x00;
        rom[0x148] = 0x00;
        rom[0x149] = 0x00;
        rom[0x0100..0x0100 + program.len()].copy_from_slice(program);
        let now = Utc::now();
        let cart = Cartridge::from_bytes(rom, now).unwrap();
        let (bus, _frames, _audio) = MemoryBus::new(cart, InputState::new(), now);
        bus
    }

    #[test]
    fn ld_b_d8_loads_immediate_and_consumes_8_cycles() {
        let mut bus = test_bus_with_program(&[0x06, 0x42]);
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x0100;
        let cycles = cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.regs.b, 0x42);
        assert_eq!(cycles, 8);
    }

    #[test]
    fn add_a_b_sets_carry_and_half_carry_on_overflow() {
        let mut bus = test_bus_with_program(&[0x80]);
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x0100;
        cpu.regs.a = 0xFF;
        cpu.regs.b = 0x01;
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.regs.a, 0x00);
        assert!(cpu.regs.flag(FLAG_Z));
        assert!(cpu.regs.flag(FLAG_H));
        assert!(cpu.regs.flag(FLAG_C));
    }

    #[test]
    fn reserved_opcode_is_rejected() {
        let mut bus = test_bus_with_program(&[0xD3]);
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x0100;
        let err = cpu.step(&mut bus).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOpcode { opcode: 0xD3, .. }));
    }

    #[test]
    fn jr_nz_takes_branch_when_zero_flag_clear() {
        let mut bus = test_bus_with_program(&[0x20, 0x02, 0x00, 0x00, 0x3E, 0x07]);
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x0100;
        cpu.regs.set_flag(FLAG_Z, false);
        let cycles = cpu.step(&mut bus).unwrap();
        assert_eq!(cycles, 12);
        assert_eq!(cpu.regs.pc, 0x0104);
    }

    #[test]
    fn ei_takes_effect_after_the_following_instruction() {
        let mut bus = test_bus_with_program(&[0xFB, 0x00, 0x00]);
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x0100;
        cpu.step(&mut bus).unwrap(); // EI
        assert!(!cpu.ime);
        cpu.step(&mut bus).unwrap(); // NOP right after EI
        assert!(!cpu.ime);
        cpu.step(&mut bus).unwrap(); // only now does IME take effect at start of fetch
        assert!(cpu.ime);
    }

    #[test]
    fn daa_corrects_bcd_addition() {
        let mut bus = test_bus_with_program(&[0x27]);
        let mut cpu = Cpu::new();
        cpu.regs.pc = 0x0100;
        cpu.regs.a = 0x9A;
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.regs.a, 0x00);
        assert!(cpu.regs.flag(FLAG_C));
    }
}
