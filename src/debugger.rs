// Interactive step debugger, gated behind the host binary's `--debug` flag:
// disassembles upcoming instructions, lets the user set breakpoints/watch
// memory addresses, and single-steps or frees the interpreter to run.

use std::collections::HashSet;
use std::io::{self, Write};

use termion::{clear, color, cursor};

use crate::bus::MemoryBus;
use crate::cartridge::Cartridge;
use crate::cpu::Cpu;
use crate::error::CoreResult;
use crate::host::HostCallbacks;
use crate::input::InputState;

const DISASSEMBLY_LINES: usize = 12;

fn reg8_name(idx: u8) -> &'static str {
    match idx {
        0 => "B",
        1 => "C",
        2 => "D",
        3 => "E",
        4 => "H",
        5 => "L",
        6 => "(HL)",
        7 => "A",
        _ => unreachable!(),
    }
}

fn rp_name(idx: u8) -> &'static str {
    match idx {
        0 => "BC",
        1 => "DE",
        2 => "HL",
        3 => "SP",
        _ => unreachable!(),
    }
}

fn rp2_name(idx: u8) -> &'static str {
    match idx {
        0 => "BC",
        1 => "DE",
        2 => "HL",
        3 => "AF",
        _ => unreachable!(),
    }
}

fn cc_name(idx: u8) -> &'static str {
    match idx {
        0 => "NZ",
        1 => "Z",
        2 => "NC",
        3 => "C",
        _ => unreachable!(),
    }
}

fn alu_name(idx: u8) -> &'static str {
    match idx {
        0 => "ADD",
        1 => "ADC",
        2 => "SUB",
        3 => "SBC",
        4 => "AND",
        5 => "XOR",
        6 => "OR",
        7 => "CP",
        _ => unreachable!(),
    }
}

fn rot_name(idx: u8) -> &'static str {
    match idx {
        0 => "RLC",
        1 => "RRC",
        2 => "RL",
        3 => "RR",
        4 => "SLA",
        5 => "SRA",
        6 => "SWAP",
        7 => "SRL",
        _ => unreachable!(),
    }
}

/// Decodes the instruction at `addr` into its mnemonic text and byte length,
/// without mutating CPU or machine state (memory reads in this core have no
/// side effects observable from disassembly).
fn disassemble_one(bus: &mut MemoryBus, addr: u16) -> (u16, String) {
    let opcode = bus.read8(addr);
    let imm8 = || bus.read8(addr.wrapping_add(1));
    let imm16 =
        |bus: &mut MemoryBus| bus.read8(addr.wrapping_add(1)) as u16 | ((bus.read8(addr.wrapping_add(2)) as u16) << 8);

    if opcode == 0xCB {
        let sub = bus.read8(addr.wrapping_add(1));
        let z = sub & 7;
        let y = (sub >> 3) & 7;
        let x = (sub >> 6) & 3;
        let text = match x {
            0 => format!("{} {}", rot_name(y), reg8_name(z)),
            1 => format!("BIT {},{}", y, reg8_name(z)),
            2 => format!("RES {},{}", y, reg8_name(z)),
            3 => format!("SET {},{}", y, reg8_name(z)),
            _ => unreachable!(),
        };
        return (addr.wrapping_add(2), text);
    }

    let text = match opcode {
        0x00 => "NOP".to_string(),
        0x01 | 0x11 | 0x21 | 0x31 => format!("LD {},0x{:04X}", rp_name((opcode >> 4) & 3), imm16(bus)),
        0x02 => "LD (BC),A".to_string(),
        0x12 => "LD (DE),A".to_string(),
        0x22 => "LD (HL+),A".to_string(),
        0x32 => "LD (HL-),A".to_string(),
        0x03 | 0x13 | 0x23 | 0x33 => format!("INC {}", rp_name((opcode >> 4) & 3)),
        0x0B | 0x1B | 0x2B | 0x3B => format!("DEC {}", rp_name((opcode >> 4) & 3)),
        0x09 | 0x19 | 0x29 | 0x39 => format!("ADD HL,{}", rp_name((opcode >> 4) & 3)),
        0x0A => "LD A,(BC)".to_string(),
        0x1A => "LD A,(DE)".to_string(),
        0x2A => "LD A,(HL+)".to_string(),
        0x3A => "LD A,(HL-)".to_string(),
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => format!("INC {}", reg8_name((opcode >> 3) & 7)),
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => format!("DEC {}", reg8_name((opcode >> 3) & 7)),
        0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
            format!("LD {},0x{:02X}", reg8_name((opcode >> 3) & 7), imm8())
        }
        0x07 => "RLCA".to_string(),
        0x0F => "RRCA".to_string(),
        0x17 => "RLA".to_string(),
        0x1F => "RRA".to_string(),
        0x08 => format!("LD (0x{:04X}),SP", imm16(bus)),
        0x10 => "STOP".to_string(),
        0x18 => format!("JR {}", imm8() as i8),
        0x20 | 0x28 | 0x30 | 0x38 => format!("JR {},{}", cc_name((opcode >> 3) & 3), imm8() as i8),
        0x27 => "DAA".to_string(),
        0x2F => "CPL".to_string(),
        0x37 => "SCF".to_string(),
        0x3F => "CCF".to_string(),
        0x76 => "HALT".to_string(),
        0x40..=0x7F => format!("LD {},{}", reg8_name((opcode >> 3) & 7), reg8_name(opcode & 7)),
        0x80..=0xBF => format!("{} A,{}", alu_name((opcode >> 3) & 7), reg8_name(opcode & 7)),
        0xC0 | 0xC8 | 0xD0 | 0xD8 => format!("RET {}", cc_name((opcode >> 3) & 3)),
        0xC1 | 0xD1 | 0xE1 | 0xF1 => format!("POP {}", rp2_name((opcode >> 4) & 3)),
        0xC2 | 0xCA | 0xD2 | 0xDA => format!("JP {},0x{:04X}", cc_name((opcode >> 3) & 3), imm16(bus)),
        0xC3 => format!("JP 0x{:04X}", imm16(bus)),
        0xC4 | 0xCC | 0xD4 | 0xDC => format!("CALL {},0x{:04X}", cc_name((opcode >> 3) & 3), imm16(bus)),
        0xC5 | 0xD5 | 0xE5 | 0xF5 => format!("PUSH {}", rp2_name((opcode >> 4) & 3)),
        0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
            format!("{} A,0x{:02X}", alu_name((opcode >> 3) & 7), imm8())
        }
        0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => format!("RST 0x{:02X}", opcode & 0x38),
        0xC9 => "RET".to_string(),
        0xD9 => "RETI".to_string(),
        0xE9 => "JP (HL)".to_string(),
        0xE0 => format!("LDH (0xFF00+0x{:02X}),A", imm8()),
        0xE2 => "LD (0xFF00+C),A".to_string(),
        0xE8 => format!("ADD SP,{}", imm8() as i8),
        0xEA => format!("LD (0x{:04X}),A", imm16(bus)),
        0xF0 => format!("LDH A,(0xFF00+0x{:02X})", imm8()),
        0xF2 => "LD A,(0xFF00+C)".to_string(),
        0xF3 => "DI".to_string(),
        0xF8 => format!("LD HL,SP+{}", imm8() as i8),
        0xF9 => "LD SP,HL".to_string(),
        0xFA => format!("LD A,(0x{:04X})", imm16(bus)),
        0xFB => "EI".to_string(),
        _ => format!("DB 0x{:02X} ; reserved", opcode),
    };

    let length = match opcode {
        0x01 | 0x11 | 0x21 | 0x31 | 0x08 | 0xC2 | 0xCA | 0xD2 | 0xDA | 0xC3 | 0xC4 | 0xCC | 0xD4 | 0xDC | 0xEA
        | 0xFA => 3,
        0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 | 0xE0 | 0xE8
        | 0xF0 | 0xF8 | 0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => 2,
        0xCB => 2,
        _ => 1,
    };
    (addr.wrapping_add(length), text)
}

#[derive(Clone, PartialEq)]
enum DebugCommand {
    Quit,
    Step,
    Continue,
    SetBreakpoint(Option<String>),
    DeleteBreakpoint(Option<String>),
    Watch(Option<String>),
    Unwatch(Option<String>),
}

pub enum DebugSignal {
    Step,
    Continue,
    Quit,
}

pub struct Debugger {
    breakpoints: HashSet<u16>,
    watched: HashSet<u16>,
    running_free: bool,
    last_cmd: DebugCommand,
}

impl Debugger {
    pub fn new() -> Self {
        Debugger {
            breakpoints: HashSet::new(),
            watched: HashSet::new(),
            running_free: false,
            last_cmd: DebugCommand::Step,
        }
    }

    fn get_command(&mut self) -> DebugCommand {
        let mut input = String::new();
        io::stdin().read_line(&mut input).unwrap();
        let mut parts = input.split_whitespace();
        match parts.next() {
            Some("q") => DebugCommand::Quit,
            Some("s") | Some("n") => DebugCommand::Step,
            Some("c") => DebugCommand::Continue,
            Some("b") => DebugCommand::SetBreakpoint(parts.next().map(String::from)),
            Some("d") => DebugCommand::DeleteBreakpoint(parts.next().map(String::from)),
            Some("w") => DebugCommand::Watch(parts.next().map(String::from)),
            Some("u") => DebugCommand::Unwatch(parts.next().map(String::from)),
            _ => self.last_cmd.clone(),
        }
    }

    fn draw(&self, cpu: &Cpu, bus: &mut MemoryBus) {
        println!("{}", clear::All);
        print!(
            "{r}╔══════════════════════════════════╗\n",
            r = cursor::Goto(1, 1)
        );
        print!(
            "{r}║ AF {af:04X}  BC {bc:04X}  DE {de:04X}  ║\n",
            r = cursor::Goto(1, 2),
            af = cpu.regs.af(),
            bc = cpu.regs.bc(),
            de = cpu.regs.de(),
        );
        print!(
            "{r}║ HL {hl:04X}  SP {sp:04X}  PC {pc:04X}  ║\n",
            r = cursor::Goto(1, 3),
            hl = cpu.regs.hl(),
            sp = cpu.regs.sp,
            pc = cpu.regs.pc,
        );
        print!(
            "{r}║ IME {ime}  HALT {halted}              ║\n",
            r = cursor::Goto(1, 4),
            ime = cpu.ime as u8,
            halted = cpu.halted as u8,
        );
        print!("{r}╚══════════════════════════════════╝\n", r = cursor::Goto(1, 5));

        let mut pc = cpu.regs.pc;
        for row in 0..DISASSEMBLY_LINES {
            let (next_pc, text) = disassemble_one(bus, pc);
            let marker = if pc == cpu.regs.pc {
                format!("{}>{}", color::Fg(color::Green), color::Fg(color::Reset))
            } else if self.breakpoints.contains(&pc) {
                format!("{}*{}", color::Fg(color::Red), color::Fg(color::Reset))
            } else {
                " ".to_string()
            };
            print!(
                "{r}{marker}0x{pc:04X}  {text}\n",
                r = cursor::Goto(1, (row + 7) as u16),
                marker = marker,
                pc = pc,
                text = text,
            );
            pc = next_pc;
        }

        if !self.watched.is_empty() {
            let base = DISASSEMBLY_LINES as u16 + 8;
            println!("{r}Watched addresses:", r = cursor::Goto(1, base));
            for (i, addr) in self.watched.iter().enumerate() {
                println!(
                    "{r}0x{addr:04X} = 0x{val:02X}",
                    r = cursor::Goto(1, base + 1 + i as u16),
                    addr = addr,
                    val = bus.read8(*addr),
                );
            }
        }

        println!(
            "\ns/n step, c continue, b/d <hex addr> set/delete breakpoint, w/u <hex addr> watch/unwatch, q quit"
        );
        print!("> ");
        io::stdout().flush().ok();
    }

    /// Call once before each `Cpu::step`. Returns what the interpreter loop
    /// should do: single-step once more, run free until the next
    /// breakpoint, or quit.
    pub fn update(&mut self, cpu: &Cpu, bus: &mut MemoryBus) -> DebugSignal {
        if self.running_free && !self.breakpoints.contains(&cpu.regs.pc) {
            return DebugSignal::Continue;
        }
        self.running_free = false;
        self.draw(cpu, bus);
        loop {
            match self.get_command() {
                DebugCommand::Quit => return DebugSignal::Quit,
                DebugCommand::Step => {
                    self.last_cmd = DebugCommand::Step;
                    return DebugSignal::Step;
                }
                DebugCommand::Continue => {
                    self.running_free = true;
                    return DebugSignal::Continue;
                }
                DebugCommand::SetBreakpoint(addr) => {
                    if let Some(addr) = parse_address(&addr) {
                        self.breakpoints.insert(addr);
                    }
                    self.draw(cpu, bus);
                }
                DebugCommand::DeleteBreakpoint(addr) => {
                    if let Some(addr) = parse_address(&addr) {
                        self.breakpoints.remove(&addr);
                    }
                    self.draw(cpu, bus);
                }
                DebugCommand::Watch(addr) => {
                    if let Some(addr) = parse_address(&addr) {
                        self.watched.insert(addr);
                    }
                    self.draw(cpu, bus);
                }
                DebugCommand::Unwatch(addr) => {
                    if let Some(addr) = parse_address(&addr) {
                        self.watched.remove(&addr);
                    }
                    self.draw(cpu, bus);
                }
            }
        }
    }
}

fn parse_address(addr: &Option<String>) -> Option<u16> {
    addr.as_ref().and_then(|a| u16::from_str_radix(a.trim_start_matches("0x"), 16).ok())
}

/// Runs a cartridge under the step debugger on the calling thread: no
/// interpreter thread, no timing coordinator, no audio/video publishing.
/// The user drives instruction stepping directly, the way the host binary's
/// `--debug` flag is meant to be used.
pub fn run_debug_session<H: HostCallbacks>(path: &str, host: &H) -> CoreResult<()> {
    let rom = host
        .load_file(path)
        .map_err(|e| crate::error::CoreError::InvalidCartridge(format!("failed to read {path}: {e}")))?;
    let now = host.local_now();
    let cartridge = Cartridge::from_bytes(rom, now)?;
    let (mut bus, _frames, _audio) = MemoryBus::new(cartridge, InputState::new(), now);
    let mut cpu = Cpu::new();
    let mut debugger = Debugger::new();

    loop {
        match debugger.update(&cpu, &mut bus) {
            DebugSignal::Quit => return Ok(()),
            DebugSignal::Step | DebugSignal::Continue => {}
        }
        bus.set_current_time(host.local_now());
        let cycles = cpu.step(&mut bus)?;
        bus.step(cycles);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::Cartridge;
    use crate::input::InputState;
    use chrono::Utc;

    fn bus_with(program: &[u8]) -> MemoryBus {
        let mut rom = vec![0u8; 0x8000];
        rom[0x147] = 0x00;
        rom[0x148] = 0x00;
        rom[0x149] = 0x00;
        rom[0x0100..0x0100 + program.len()].copy_from_slice(program);
        let now = Utc::now();
        let cart = Cartridge::from_bytes(rom, now).unwrap();
        let (bus, _f, _a) = MemoryBus::new(cart, InputState::new(), now);
        bus
    }

    #[test]
    fn disassembles_ld_b_immediate() {
        let mut bus = bus_with(&[0x06, 0x99]);
        let (next, text) = disassemble_one(&mut bus, 0x0100);
        assert_eq!(next, 0x0102);
        assert_eq!(text, "LD B,0x99");
    }

    #[test]
    fn disassembles_cb_prefixed_bit_test() {
        let mut bus = bus_with(&[0xCB, 0x7C]);
        let (next, text) = disassemble_one(&mut bus, 0x0100);
        assert_eq!(next, 0x0102);
        assert_eq!(text, "BIT 7,H");
    }

    #[test]
    fn reserved_opcode_disassembles_as_db() {
        let mut bus = bus_with(&[0xD3]);
        let (_, text) = disassemble_one(&mut bus, 0x0100);
        assert!(text.contains("reserved"));
    }
}
