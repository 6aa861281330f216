// The surface the embedding host implements and the surface the core
// exposes back to it: file/clock callbacks, the eight-byte input snapshot,
// run configuration, and the mutex-guarded exception slot the interpreter
// thread uses to report a fatal error without panicking across threads.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::input::{BUTTON_A, BUTTON_B, BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_SELECT, BUTTON_START, BUTTON_UP};

/// Callbacks the host wrapper provides; the core never touches the
/// filesystem, a clock, or a UI thread directly.
pub trait HostCallbacks: Send + Sync {
    fn local_now(&self) -> DateTime<Utc>;
    fn load_file(&self, path: &str) -> std::io::Result<Vec<u8>>;
    fn write_file(&self, path: &str, data: &[u8]) -> std::io::Result<()>;
    /// The host must invoke the returned callback at roughly 1 ms intervals
    /// until `unregister_periodic_notification` is called; this is the
    /// pacing signal source the timing coordinator waits on.
    fn register_periodic_notification(&self, cb: Arc<dyn Fn() + Send + Sync>);
    fn unregister_periodic_notification(&self);
    fn stdout(&self, message: &str);
}

/// `enable_video`/`enable_audio` let a headless host (e.g. a test harness)
/// skip publishing frames/audio it will never consume.
#[derive(Clone, Copy, Debug)]
pub struct Configuration {
    pub enable_video: bool,
    pub enable_audio: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration { enable_video: true, enable_audio: true }
    }
}

/// Eight-byte input snapshot as the host wrapper hands it across the API
/// boundary: each field is 0xFF when held, 0x00 when released.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawInputState {
    pub up: u8,
    pub down: u8,
    pub left: u8,
    pub right: u8,
    pub a: u8,
    pub b: u8,
    pub start: u8,
    pub select: u8,
}

impl RawInputState {
    pub fn direction_mask(&self) -> u8 {
        (if self.right != 0 { BUTTON_RIGHT } else { 0 })
            | (if self.left != 0 { BUTTON_LEFT } else { 0 })
            | (if self.up != 0 { BUTTON_UP } else { 0 })
            | (if self.down != 0 { BUTTON_DOWN } else { 0 })
    }

    pub fn action_mask(&self) -> u8 {
        (if self.a != 0 { BUTTON_A } else { 0 })
            | (if self.b != 0 { BUTTON_B } else { 0 })
            | (if self.select != 0 { BUTTON_SELECT } else { 0 })
            | (if self.start != 0 { BUTTON_START } else { 0 })
    }
}

/// Mutex-guarded optional fatal-error message. The interpreter thread
/// writes once on a fatal `CoreError` and then exits; the host polls via
/// `get_exception_message` on its own event loop.
#[derive(Default)]
pub struct ExceptionSlot(Mutex<Option<String>>);

impl ExceptionSlot {
    pub fn new() -> Self {
        ExceptionSlot(Mutex::new(None))
    }

    pub fn set(&self, message: String) {
        *self.0.lock().unwrap() = Some(message);
    }

    pub fn take(&self) -> Option<String> {
        self.0.lock().unwrap().take()
    }

    pub fn peek(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_input_state_masks_only_set_bits_for_pressed_fields() {
        let raw = RawInputState { up: 0xFF, a: 0xFF, ..Default::default() };
        assert_eq!(raw.direction_mask(), BUTTON_UP);
        assert_eq!(raw.action_mask(), BUTTON_A);
    }

    #[test]
    fn exception_slot_take_clears_the_message() {
        let slot = ExceptionSlot::new();
        slot.set("boom".to_string());
        assert_eq!(slot.peek(), Some("boom".to_string()));
        assert_eq!(slot.take(), Some("boom".to_string()));
        assert_eq!(slot.take(), None);
    }
}
