// Integration tests exercising the public `gb_core` facade end to end,
// modeled on the teacher's own test-ROM harness (`tests/tests.rs`): build a
// ROM in memory, run it through a fake host, and check on the externally
// observable behavior rather than internal interpreter state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use gb_core::cartridge::Cartridge;
use gb_core::host::HostCallbacks;
use gb_core::save::SaveManager;
use gb_core::{GameBoy, FRAME_BYTE_LEN};

/// An in-memory host: ROM/save files live in a map rather than on disk, and
/// the ~1ms pacing notification is a no-op since tests drive a very high
/// speed multiplier instead of relying on it.
struct FakeHost {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeHost {
    fn new() -> Self {
        FakeHost { files: Mutex::new(HashMap::new()) }
    }

    fn with_file(path: &str, bytes: Vec<u8>) -> Self {
        let host = FakeHost::new();
        host.files.lock().unwrap().insert(path.to_string(), bytes);
        host
    }
}

impl HostCallbacks for FakeHost {
    fn local_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
    fn load_file(&self, path: &str) -> std::io::Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"))
    }
    fn write_file(&self, path: &str, data: &[u8]) -> std::io::Result<()> {
        self.files.lock().unwrap().insert(path.to_string(), data.to_vec());
        Ok(())
    }
    fn register_periodic_notification(&self, _cb: Arc<dyn Fn() + Send + Sync>) {}
    fn unregister_periodic_notification(&self) {}
    fn stdout(&self, _message: &str) {}
}

fn rom_header(type_byte: u8, rom_size_code: u8, ram_size_code: u8, banks: usize) -> Vec<u8> {
    let mut rom = vec![0u8; banks * 0x4000];
    rom[0x147] = type_byte;
    rom[0x148] = rom_size_code;
    rom[0x149] = ram_size_code;
    rom
}

/// S1: a NOP pad followed by `JR -2` (`18 FE`), an infinite tight loop.
fn nop_loop_rom() -> Vec<u8> {
    let mut rom = rom_header(0x00, 0x00, 0x00, 2);
    rom[0x100] = 0x00;
    rom[0x101] = 0x18;
    rom[0x102] = 0xFE;
    rom
}

#[test]
fn boot_with_a_nop_loop_runs_without_raising_an_exception() {
    let host = Arc::new(FakeHost::with_file("game.gb", nop_loop_rom()));
    let gb = GameBoy::create(host);
    gb.configure(true, true);
    gb.load("game.gb").expect("well-formed ROM-only cartridge loads");
    // A huge speed multiplier collapses the real-time pacing wait so the
    // interpreter thread blows through a second of emulated time almost
    // immediately rather than the test sleeping for a full second.
    gb.set_speed_multiplier(1_000_000.0);

    std::thread::sleep(Duration::from_millis(150));

    assert_eq!(gb.get_exception_message(), None);

    let mut frame = vec![0u8; FRAME_BYTE_LEN];
    gb.get_current_frame(&mut frame);
    assert_eq!(frame.len(), FRAME_BYTE_LEN);
}

#[test]
fn truncated_rom_is_rejected_before_emulation_starts() {
    let host = Arc::new(FakeHost::with_file("broken.gb", vec![0u8; 16]));
    let gb = GameBoy::create(host);
    gb.configure(true, true);
    let err = gb.load("broken.gb").expect_err("a 16-byte file has no valid header");
    assert!(err.to_string().contains("invalid cartridge"));
}

#[test]
fn missing_rom_file_surfaces_as_invalid_cartridge() {
    let host = Arc::new(FakeHost::new());
    let gb = GameBoy::create(host);
    assert!(gb.load("does-not-exist.gb").is_err());
}

/// Property #7: persisting cartridge RAM and reloading it yields
/// byte-identical RAM, exercised through the same `SaveManager` path
/// `GameBoy::load` uses rather than poking the cartridge directly.
#[test]
fn mbc1_battery_ram_round_trips_through_the_save_manager() {
    let host = FakeHost::new();
    let now = Utc::now();

    let mut original = Cartridge::from_bytes(rom_header(0x03, 0x00, 0x02, 2), now).unwrap();
    original.write_rom(0x0000, 0x0A, now); // enable RAM
    original.write_ram(0xA000, 0x7E, now);
    original.write_ram(0xA001, 0x99, now);

    let mut manager = SaveManager::new("slot".to_string());
    manager.flush(&mut original, &host);
    assert!(!original.ram_dirty);

    let mut reloaded = Cartridge::from_bytes(rom_header(0x03, 0x00, 0x02, 2), now).unwrap();
    manager.load(&mut reloaded, &host);

    assert_eq!(reloaded.save_ram(), original.save_ram());
    assert_eq!(reloaded.read_ram(0xA000), 0x7E);
    assert_eq!(reloaded.read_ram(0xA001), 0x99);
}

#[test]
fn toggle_pause_is_a_no_op_without_a_loaded_cartridge() {
    let host = Arc::new(FakeHost::new());
    let gb = GameBoy::create(host);
    // No session exists yet; this must not panic.
    gb.toggle_pause();
    assert_eq!(gb.get_exception_message(), None);
}
