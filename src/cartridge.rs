// Cartridge header parsing and bank controller variants. Collapses the
// virtual/polymorphic cartridge hierarchy of the original into a single
// tagged `MbcState` enum, per the design notes: one arena (`Cartridge`)
// holding ROM/RAM buffers plus a small per-variant state tag.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Duration, TimeZone, Utc};
use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcKind {
    RomOnly,
    Mbc1,
    Mbc2,
    Mbc3,
    Mbc5,
}

#[derive(Debug, Clone)]
pub struct CartridgeHeader {
    pub cartridge_type_byte: u8,
    pub memory_controller_kind: MbcKind,
    pub rom_bank_count: u32,
    pub ram_size_bytes: u32,
    pub has_battery: bool,
    pub has_timer: bool,
    pub has_rumble: bool,
    pub title: String,
    pub is_cgb: bool,
}

fn decode_type(byte: u8) -> CoreResult<(MbcKind, bool, bool, bool)> {
    // (kind, battery, timer, rumble). MBC3 timer/battery assignment follows
    // the scenario fixed by spec.md S2 (type 0x13 carries a timer), which
    // differs from some historical cartridges but is authoritative here.
    let entry = match byte {
        0x00 => (MbcKind::RomOnly, false, false, false),
        0x01 | 0x02 => (MbcKind::Mbc1, false, false, false),
        0x03 => (MbcKind::Mbc1, true, false, false),
        0x05 => (MbcKind::Mbc2, false, false, false),
        0x06 => (MbcKind::Mbc2, true, false, false),
        0x0F => (MbcKind::Mbc3, true, true, false),
        0x10 => (MbcKind::Mbc3, true, true, false),
        0x11 | 0x12 => (MbcKind::Mbc3, false, false, false),
        0x13 => (MbcKind::Mbc3, true, true, false),
        0x19 | 0x1A => (MbcKind::Mbc5, false, false, false),
        0x1B => (MbcKind::Mbc5, true, false, false),
        0x1C | 0x1D => (MbcKind::Mbc5, false, false, true),
        0x1E => (MbcKind::Mbc5, true, false, true),
        other => {
            return Err(CoreError::NotImplemented(format!(
                "cartridge controller for type byte 0x{other:02X}"
            )))
        }
    };
    Ok(entry)
}

fn ram_size_bytes(code: u8) -> CoreResult<u32> {
    match code {
        0x00 => Ok(0),
        0x01 => Ok(2 * 1024),
        0x02 => Ok(8 * 1024),
        0x03 => Ok(32 * 1024),
        0x04 => Ok(128 * 1024),
        0x05 => Ok(64 * 1024),
        other => Err(CoreError::InvalidCartridge(format!(
            "unrecognized RAM size code 0x{other:02X}"
        ))),
    }
}

impl CartridgeHeader {
    pub fn parse(rom: &[u8]) -> CoreResult<Self> {
        if rom.len() < 0x150 {
            return Err(CoreError::InvalidCartridge(
                "ROM too short to contain a valid header".into(),
            ));
        }
        let cartridge_type_byte = rom[0x147];
        let (memory_controller_kind, has_battery, has_timer, has_rumble) =
            decode_type(cartridge_type_byte)?;
        let rom_size_code = rom[0x148];
        if rom_size_code > 0x08 {
            return Err(CoreError::InvalidCartridge(format!(
                "unrecognized ROM size code 0x{rom_size_code:02X}"
            )));
        }
        let rom_bank_count = 2u32 << rom_size_code;
        let ram_size_bytes = ram_size_bytes(rom[0x149])?;
        let title = String::from_utf8_lossy(&rom[0x134..0x144])
            .trim_matches('\0')
            .to_string();
        let is_cgb = rom[0x143] == 0x80 || rom[0x143] == 0xC0;
        Ok(CartridgeHeader {
            cartridge_type_byte,
            memory_controller_kind,
            rom_bank_count,
            ram_size_bytes,
            has_battery,
            has_timer,
            has_rumble,
            title,
            is_cgb,
        })
    }
}

const RTC_EPOCH_YEAR: i32 = 1900;

fn days_since_epoch(now: DateTime<Utc>) -> f64 {
    let epoch = Utc.ymd(RTC_EPOCH_YEAR, 1, 1).and_hms(0, 0, 0);
    (now - epoch).num_milliseconds() as f64 / 86_400_000.0
}

fn datetime_from_days(days: f64) -> DateTime<Utc> {
    let epoch = Utc.ymd(RTC_EPOCH_YEAR, 1, 1).and_hms(0, 0, 0);
    epoch + Duration::milliseconds((days * 86_400_000.0).round() as i64)
}

const RTC_HALT_BIT: u8 = 0x40;
const RTC_DAY_CARRY_BIT: u8 = 0x80;
const RTC_DAY_HIGH_BIT: u8 = 0x01;

/// MBC3 real-time clock: a running anchor plus a latch snapshot copied out
/// on the 0-then-1 write sequence to 0x6000-0x7FFF.
#[derive(Debug, Clone)]
pub struct Rtc {
    anchor: DateTime<Utc>,
    frozen_elapsed_secs: Option<i64>,
    latch_prev: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub day_low: u8,
    pub day_high: u8,
}

impl Rtc {
    fn new(now: DateTime<Utc>) -> Self {
        Rtc {
            anchor: now,
            frozen_elapsed_secs: None,
            latch_prev: 0,
            seconds: 0,
            minutes: 0,
            hours: 0,
            day_low: 0,
            day_high: 0,
        }
    }

    fn elapsed_secs(&self, now: DateTime<Utc>) -> i64 {
        match self.frozen_elapsed_secs {
            Some(frozen) => frozen,
            None => (now - self.anchor).num_seconds().max(0),
        }
    }

    pub fn latch(&mut self, write_value: u8, now: DateTime<Utc>) {
        if self.latch_prev == 0 && write_value == 1 {
            let mut elapsed = self.elapsed_secs(now);
            let days = elapsed / 86400;
            elapsed %= 86400;
            let hours = elapsed / 3600;
            elapsed %= 3600;
            let minutes = elapsed / 60;
            let seconds = elapsed % 60;
            self.seconds = seconds as u8;
            self.minutes = minutes as u8;
            self.hours = hours as u8;
            self.day_low = (days & 0xFF) as u8;
            let mut high = self.day_high & RTC_HALT_BIT;
            if days & 0x100 != 0 {
                high |= RTC_DAY_HIGH_BIT;
            }
            if days >= 512 {
                high |= RTC_DAY_CARRY_BIT;
            }
            self.day_high = high;
        }
        self.latch_prev = write_value;
    }

    pub fn write_register(&mut self, index: u8, value: u8, now: DateTime<Utc>) {
        match index {
            0x08 => self.seconds = value,
            0x09 => self.minutes = value,
            0x0A => self.hours = value,
            0x0B => self.day_low = value,
            0x0C => self.set_day_high(value, now),
            _ => {}
        }
    }

    fn set_day_high(&mut self, value: u8, now: DateTime<Utc>) {
        let was_halted = self.day_high & RTC_HALT_BIT != 0;
        let now_halted = value & RTC_HALT_BIT != 0;
        self.day_high = value;
        if was_halted && !now_halted {
            if let Some(frozen) = self.frozen_elapsed_secs.take() {
                self.anchor = now - Duration::seconds(frozen);
            }
        } else if !was_halted && now_halted {
            self.frozen_elapsed_secs = Some(self.elapsed_secs(now));
        }
    }

    pub fn read_register(&self, index: u8) -> u8 {
        match index {
            0x08 => self.seconds,
            0x09 => self.minutes,
            0x0A => self.hours,
            0x0B => self.day_low,
            0x0C => self.day_high,
            // open question per spec.md design notes: unselected RTC reads as 0xFF.
            _ => 0xFF,
        }
    }

    pub fn save_bytes(&self, now: DateTime<Utc>) -> [u8; 12] {
        let days = days_since_epoch(self.anchor_equivalent(now));
        let mut out = [0u8; 12];
        out[0..8].copy_from_slice(&days.to_le_bytes());
        out
    }

    // Saves the anchor such that reloading reproduces the same elapsed time
    // regardless of the wall-clock gap between save and load, by folding any
    // halt freeze into the persisted anchor.
    fn anchor_equivalent(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.frozen_elapsed_secs {
            Some(frozen) => now - Duration::seconds(frozen),
            None => self.anchor,
        }
    }

    pub fn load_bytes(bytes: &[u8; 12], now: DateTime<Utc>) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[0..8]);
        let days = f64::from_le_bytes(buf);
        let anchor = datetime_from_days(days);
        let mut rtc = Rtc::new(anchor);
        rtc.latch(0, now);
        rtc.latch(1, now);
        rtc
    }
}

#[derive(Debug, Clone)]
enum MbcState {
    RomOnly,
    Mbc1 {
        rom_bank: u8,
        ram_bank_or_upper: u8,
        ram_enabled: bool,
        banking_mode: u8,
    },
    Mbc2 {
        rom_bank: u8,
        ram_enabled: bool,
    },
    Mbc3 {
        rom_bank: u8,
        ram_bank: u8,
        selected_rtc_register: Option<u8>,
        ram_enabled: bool,
        rtc: Rtc,
    },
    Mbc5 {
        rom_bank: u16,
        ram_bank: u8,
        ram_enabled: bool,
    },
}

pub struct Cartridge {
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
    pub header: CartridgeHeader,
    state: MbcState,
    pub ram_dirty: bool,
}

impl Cartridge {
    pub fn from_bytes(rom: Vec<u8>, now: DateTime<Utc>) -> CoreResult<Self> {
        let header = CartridgeHeader::parse(&rom)?;
        let ram_len = if header.memory_controller_kind == MbcKind::Mbc2 {
            512
        } else {
            header.ram_size_bytes as usize
        };
        let state = match header.memory_controller_kind {
            MbcKind::RomOnly => MbcState::RomOnly,
            MbcKind::Mbc1 => MbcState::Mbc1 {
                rom_bank: 1,
                ram_bank_or_upper: 0,
                ram_enabled: false,
                banking_mode: 0,
            },
            MbcKind::Mbc2 => MbcState::Mbc2 {
                rom_bank: 1,
                ram_enabled: false,
            },
            MbcKind::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                ram_bank: 0,
                selected_rtc_register: None,
                ram_enabled: false,
                rtc: Rtc::new(now),
            },
            MbcKind::Mbc5 => MbcState::Mbc5 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enabled: false,
            },
        };
        Ok(Cartridge {
            rom,
            ram: vec![0; ram_len],
            header,
            state,
            ram_dirty: false,
        })
    }

    pub fn has_rtc(&self) -> bool {
        matches!(self.state, MbcState::Mbc3 { .. }) && self.header.has_timer
    }

    pub fn load_ram(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.ram.len());
        self.ram[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn save_ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn load_rtc(&mut self, bytes: &[u8; 12], now: DateTime<Utc>) {
        if let MbcState::Mbc3 { rtc, .. } = &mut self.state {
            *rtc = Rtc::load_bytes(bytes, now);
        }
    }

    pub fn save_rtc(&self, now: DateTime<Utc>) -> Option<[u8; 12]> {
        match &self.state {
            MbcState::Mbc3 { rtc, .. } => Some(rtc.save_bytes(now)),
            _ => None,
        }
    }

    fn rom_bank_index(&self) -> usize {
        let raw = match &self.state {
            MbcState::RomOnly => 1,
            MbcState::Mbc1 {
                rom_bank,
                ram_bank_or_upper,
                banking_mode,
                ..
            } => {
                let low = if *rom_bank == 0 { 1 } else { *rom_bank } as usize;
                if *banking_mode == 0 {
                    low | ((*ram_bank_or_upper as usize) << 5)
                } else {
                    low
                }
            }
            MbcState::Mbc2 { rom_bank, .. } => {
                if *rom_bank == 0 {
                    1
                } else {
                    *rom_bank as usize
                }
            }
            MbcState::Mbc3 { rom_bank, .. } => {
                if *rom_bank == 0 {
                    1
                } else {
                    *rom_bank as usize
                }
            }
            MbcState::Mbc5 { rom_bank, .. } => *rom_bank as usize,
        };
        raw % self.header.rom_bank_count.max(1) as usize
    }

    pub fn read_rom(&self, addr: u16) -> u8 {
        let offset = if addr < 0x4000 {
            addr as usize
        } else {
            self.rom_bank_index() * 0x4000 + (addr as usize - 0x4000)
        };
        self.rom.get(offset).copied().unwrap_or(0xFF)
    }

    pub fn write_rom(&mut self, addr: u16, value: u8, now: DateTime<Utc>) {
        match &mut self.state {
            MbcState::RomOnly => {}
            MbcState::Mbc1 {
                rom_bank,
                ram_bank_or_upper,
                ram_enabled,
                banking_mode,
            } => match addr {
                0x0000..=0x1FFF => *ram_enabled = value & 0x0F == 0x0A,
                0x2000..=0x3FFF => *rom_bank = value & 0x1F,
                0x4000..=0x5FFF => *ram_bank_or_upper = value & 0x03,
                0x6000..=0x7FFF => *banking_mode = value & 0x01,
                _ => {}
            },
            MbcState::Mbc2 { rom_bank, ram_enabled } => {
                if addr < 0x4000 {
                    if addr & 0x0100 == 0 {
                        *ram_enabled = value & 0x0F == 0x0A;
                    } else {
                        *rom_bank = value & 0x0F;
                    }
                }
            }
            MbcState::Mbc3 {
                rom_bank,
                ram_bank,
                selected_rtc_register,
                ram_enabled,
                rtc,
            } => match addr {
                0x0000..=0x1FFF => *ram_enabled = value & 0x0F == 0x0A,
                0x2000..=0x3FFF => *rom_bank = value & 0x7F,
                0x4000..=0x5FFF => {
                    if value <= 0x03 {
                        *ram_bank = value;
                        *selected_rtc_register = None;
                    } else if (0x08..=0x0C).contains(&value) {
                        *selected_rtc_register = Some(value);
                    }
                }
                0x6000..=0x7FFF => rtc.latch(value & 1, now),
                _ => {}
            },
            MbcState::Mbc5 {
                rom_bank,
                ram_bank,
                ram_enabled,
            } => match addr {
                0x0000..=0x1FFF => *ram_enabled = value & 0x0F == 0x0A,
                0x2000..=0x2FFF => *rom_bank = (*rom_bank & 0x100) | value as u16,
                0x3000..=0x3FFF => *rom_bank = (*rom_bank & 0xFF) | (((value & 1) as u16) << 8),
                0x4000..=0x5FFF => *ram_bank = value & 0x0F,
                _ => {}
            },
        }
    }

    pub fn read_ram(&mut self, addr: u16) -> u8 {
        match &self.state {
            MbcState::RomOnly => 0xFF,
            MbcState::Mbc1 {
                ram_enabled,
                ram_bank_or_upper,
                banking_mode,
                ..
            } => {
                if !ram_enabled || self.ram.is_empty() {
                    return 0xFF;
                }
                let bank = if *banking_mode == 1 {
                    *ram_bank_or_upper as usize
                } else {
                    0
                };
                let off = bank * 0x2000 + (addr as usize - 0xA000);
                self.ram.get(off % self.ram.len().max(1)).copied().unwrap_or(0xFF)
            }
            MbcState::Mbc2 { ram_enabled, .. } => {
                if !ram_enabled {
                    return 0xFF;
                }
                let idx = (addr as usize - 0xA000) % 512;
                0xF0 | self.ram[idx]
            }
            MbcState::Mbc3 {
                ram_enabled,
                ram_bank,
                selected_rtc_register,
                rtc,
                ..
            } => {
                if let Some(reg) = selected_rtc_register {
                    return rtc.read_register(*reg);
                }
                if !ram_enabled || self.ram.is_empty() {
                    return 0xFF;
                }
                let off = *ram_bank as usize * 0x2000 + (addr as usize - 0xA000);
                self.ram.get(off % self.ram.len().max(1)).copied().unwrap_or(0xFF)
            }
            MbcState::Mbc5 {
                ram_enabled, ram_bank, ..
            } => {
                if !ram_enabled || self.ram.is_empty() {
                    return 0xFF;
                }
                let off = *ram_bank as usize * 0x2000 + (addr as usize - 0xA000);
                self.ram.get(off % self.ram.len().max(1)).copied().unwrap_or(0xFF)
            }
        }
    }

    pub fn write_ram(&mut self, addr: u16, value: u8, now: DateTime<Utc>) {
        match &mut self.state {
            MbcState::RomOnly => {}
            MbcState::Mbc1 {
                ram_enabled,
                ram_bank_or_upper,
                banking_mode,
                ..
            } => {
                if !*ram_enabled || self.ram.is_empty() {
                    return;
                }
                let bank = if *banking_mode == 1 {
                    *ram_bank_or_upper as usize
                } else {
                    0
                };
                let len = self.ram.len();
                let off = (bank * 0x2000 + (addr as usize - 0xA000)) % len.max(1);
                self.ram[off] = value;
                self.ram_dirty = true;
            }
            MbcState::Mbc2 { ram_enabled, .. } => {
                if !*ram_enabled {
                    return;
                }
                let idx = (addr as usize - 0xA000) % 512;
                self.ram[idx] = value & 0x0F;
                self.ram_dirty = true;
            }
            MbcState::Mbc3 {
                ram_enabled,
                ram_bank,
                selected_rtc_register,
                rtc,
                ..
            } => {
                if let Some(reg) = *selected_rtc_register {
                    rtc.write_register(reg, value, now);
                    self.ram_dirty = true;
                    return;
                }
                if !*ram_enabled || self.ram.is_empty() {
                    return;
                }
                let len = self.ram.len();
                let off = (*ram_bank as usize * 0x2000 + (addr as usize - 0xA000)) % len.max(1);
                self.ram[off] = value;
                self.ram_dirty = true;
            }
            MbcState::Mbc5 {
                ram_enabled, ram_bank, ..
            } => {
                if !*ram_enabled || self.ram.is_empty() {
                    warn!("write to disabled/unmapped MBC5 RAM at 0x{addr:04X}");
                    return;
                }
                let len = self.ram.len();
                let off = (*ram_bank as usize * 0x2000 + (addr as usize - 0xA000)) % len.max(1);
                self.ram[off] = value;
                self.ram_dirty = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_rom(type_byte: u8, rom_size_code: u8, ram_size_code: u8) -> Vec<u8> {
        let banks = 2usize << rom_size_code;
        let mut rom = vec![0u8; banks * 0x4000];
        rom[0x147] = type_byte;
        rom[0x148] = rom_size_code;
        rom[0x149] = ram_size_code;
        rom
    }

    #[test]
    fn mbc3_ram_bank_select_and_write() {
        // S2: type 0x13 (MBC3+TIMER+RAM+BATTERY), rom size 0x03 (4 banks), ram size 0x03 (32 KiB).
        let rom = blank_rom(0x13, 0x03, 0x03);
        let now = Utc::now();
        let mut cart = Cartridge::from_bytes(rom, now).unwrap();
        cart.write_rom(0x0000, 0x0A, now);
        cart.write_rom(0x4000, 0x01, now);
        cart.write_ram(0xA000, 0x42, now);
        assert_eq!(cart.ram[0x2000], 0x42);
        assert!(cart.ram_dirty);
    }

    #[test]
    fn mbc1_rom_bank_zero_becomes_one() {
        let rom = blank_rom(0x01, 0x00, 0x00);
        let now = Utc::now();
        let mut cart = Cartridge::from_bytes(rom, now).unwrap();
        cart.write_rom(0x2000, 0x00, now);
        assert_eq!(cart.rom_bank_index(), 1);
    }

    #[test]
    fn unselected_rtc_register_reads_ff() {
        let rom = blank_rom(0x13, 0x00, 0x03);
        let now = Utc::now();
        let mut cart = Cartridge::from_bytes(rom, now).unwrap();
        cart.write_rom(0x0000, 0x0A, now);
        assert_eq!(cart.read_ram(0xA000), 0x00);
        cart.write_rom(0x4000, 0x08, now);
        assert_ne!(cart.read_ram(0xA000), 0xFF); // selected seconds register returns latched state
    }
}
