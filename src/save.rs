// Debounced persistence for cartridge RAM and RTC state: flushes on a
// steady interval while the cartridge reports unsaved writes, and always
// makes a best-effort flush at teardown.

use std::time::{Duration, Instant};

use log::warn;

use crate::cartridge::Cartridge;
use crate::host::HostCallbacks;

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub struct SaveManager {
    rom_basename: String,
    flush_interval: Duration,
    last_flush: Instant,
}

impl SaveManager {
    pub fn new(rom_basename: String) -> Self {
        SaveManager {
            rom_basename,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            last_flush: Instant::now(),
        }
    }

    fn sav_path(&self) -> String {
        format!("{}.sav", self.rom_basename)
    }

    fn rtc_path(&self) -> String {
        format!("{}.rtc", self.rom_basename)
    }

    /// Loads any existing save/RTC files into `cartridge` at startup.
    /// A missing file is not an error: a fresh cartridge has none yet.
    pub fn load(&self, cartridge: &mut Cartridge, host: &dyn HostCallbacks) {
        if let Ok(bytes) = host.load_file(&self.sav_path()) {
            cartridge.load_ram(&bytes);
        }
        if cartridge.has_rtc() {
            if let Ok(bytes) = host.load_file(&self.rtc_path()) {
                if bytes.len() == 12 {
                    let mut buf = [0u8; 12];
                    buf.copy_from_slice(&bytes);
                    cartridge.load_rtc(&buf, host.local_now());
                } else {
                    warn!("ignoring malformed RTC save file ({} bytes, expected 12)", bytes.len());
                }
            }
        }
    }

    /// Called once per frame (or similar cadence); flushes only if the
    /// cartridge has unsaved writes and the debounce interval has elapsed.
    pub fn maybe_flush(&mut self, cartridge: &mut Cartridge, host: &dyn HostCallbacks) {
        if !cartridge.ram_dirty {
            return;
        }
        if self.last_flush.elapsed() < self.flush_interval {
            return;
        }
        self.flush(cartridge, host);
    }

    /// Unconditional flush, used both by `maybe_flush` and at teardown.
    /// A write failure is logged and left for the next tick to retry; it
    /// never panics or stops emulation per the core's HostIoFailure policy.
    pub fn flush(&mut self, cartridge: &mut Cartridge, host: &dyn HostCallbacks) {
        match host.write_file(&self.sav_path(), cartridge.save_ram()) {
            Ok(()) => {
                cartridge.ram_dirty = false;
                self.last_flush = Instant::now();
            }
            Err(err) => warn!("failed to write cartridge save file: {err}"),
        }
        if cartridge.has_rtc() {
            if let Some(rtc_bytes) = cartridge.save_rtc(host.local_now()) {
                if let Err(err) = host.write_file(&self.rtc_path(), &rtc_bytes) {
                    warn!("failed to write RTC save file: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    struct FakeHost {
        files: Mutex<HashMap<String, Vec<u8>>>,
        fail_writes: RefCell<bool>,
    }

    impl FakeHost {
        fn new() -> Self {
            FakeHost { files: Mutex::new(HashMap::new()), fail_writes: RefCell::new(false) }
        }
    }

    impl HostCallbacks for FakeHost {
        fn local_now(&self) -> chrono::DateTime<Utc> {
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
            if *self.fail_writes.borrow() {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
            }
            self.files.lock().unwrap().insert(path.to_string(), data.to_vec());
            Ok(())
        }
        fn register_periodic_notification(&self, _cb: Arc<dyn Fn() + Send + Sync>) {}
        fn unregister_periodic_notification(&self) {}
        fn stdout(&self, _message: &str) {}
    }

    fn rom_only_cartridge() -> Cartridge {
        let mut rom = vec![0u8; 0x8000];
        rom[0x147] = 0x00;
        rom[0x148] = 0x00;
        rom[0x149] = 0x00;
        Cartridge::from_bytes(rom, Utc::now()).unwrap()
    }

    #[test]
    fn flush_clears_the_dirty_flag_on_success() {
        let host = FakeHost::new();
        let mut cart = rom_only_cartridge();
        cart.ram_dirty = true;
        let mut manager = SaveManager::new("game".to_string());
        manager.flush(&mut cart, &host);
        assert!(!cart.ram_dirty);
        assert!(host.files.lock().unwrap().contains_key("game.sav"));
    }

    #[test]
    fn maybe_flush_skips_when_not_dirty() {
        let host = FakeHost::new();
        let mut cart = rom_only_cartridge();
        cart.ram_dirty = false;
        let mut manager = SaveManager::new("game".to_string());
        manager.maybe_flush(&mut cart, &host);
        assert!(host.files.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_write_leaves_dirty_flag_set_for_retry() {
        let host = FakeHost::new();
        *host.fail_writes.borrow_mut() = true;
        let mut cart = rom_only_cartridge();
        cart.ram_dirty = true;
        let mut manager = SaveManager::new("game".to_string());
        manager.flush(&mut cart, &host);
        assert!(cart.ram_dirty);
    }
}
