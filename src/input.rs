// Joypad: the P1 register multiplexes action and direction button state
// depending on which selection lines the program drives low, and raises
// the joypad interrupt on any newly-pressed button while selected.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub const BUTTON_RIGHT: u8 = 1 << 0;
pub const BUTTON_LEFT: u8 = 1 << 1;
pub const BUTTON_UP: u8 = 1 << 2;
pub const BUTTON_DOWN: u8 = 1 << 3;
pub const BUTTON_A: u8 = 1 << 0;
pub const BUTTON_B: u8 = 1 << 1;
pub const BUTTON_SELECT: u8 = 1 << 2;
pub const BUTTON_START: u8 = 1 << 3;

/// Host-facing handle: the frontend sets the current button mask from its
/// own input thread, the interpreter thread reads it once per joypad poll.
#[derive(Clone)]
pub struct InputState {
    directions: Arc<AtomicU8>,
    actions: Arc<AtomicU8>,
}

impl InputState {
    pub fn new() -> Self {
        InputState {
            directions: Arc::new(AtomicU8::new(0)),
            actions: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn set_directions(&self, mask: u8) {
        self.directions.store(mask, Ordering::Relaxed);
    }
    pub fn set_actions(&self, mask: u8) {
        self.actions.store(mask, Ordering::Relaxed);
    }
}

pub struct Joypad {
    select_directions: bool,
    select_actions: bool,
    state: InputState,
    previous_pressed: u8,
}

impl Joypad {
    pub fn new(state: InputState) -> Self {
        Joypad {
            select_directions: false,
            select_actions: false,
            state,
            previous_pressed: 0,
        }
    }

    fn current_pressed(&self) -> u8 {
        let mut pressed = 0u8;
        if self.select_directions {
            pressed |= self.state.directions.load(Ordering::Relaxed) & 0x0F;
        }
        if self.select_actions {
            pressed |= self.state.actions.load(Ordering::Relaxed) & 0x0F;
        }
        pressed
    }

    pub fn read(&self) -> u8 {
        let pressed = self.current_pressed();
        0xC0 | (if self.select_directions { 0 } else { 0x10 })
            | (if self.select_actions { 0 } else { 0x20 })
            | !pressed & 0x0F
    }

    /// Writes the selection bits, returning true if a joypad interrupt
    /// should be raised because a previously-unpressed button is now held.
    pub fn write(&mut self, value: u8) -> bool {
        self.select_directions = value & 0x10 == 0;
        self.select_actions = value & 0x20 == 0;
        let pressed = self.current_pressed();
        let newly_pressed = pressed & !self.previous_pressed != 0;
        self.previous_pressed = pressed;
        newly_pressed
    }

    /// Called once per instruction step so that a button pressed while the
    /// selection lines were already active is still detected.
    pub fn poll(&mut self) -> bool {
        let pressed = self.current_pressed();
        let newly_pressed = pressed & !self.previous_pressed != 0;
        self.previous_pressed = pressed;
        newly_pressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unselected_lines_read_as_not_pressed() {
        let state = InputState::new();
        state.set_directions(BUTTON_DOWN);
        let joypad = Joypad::new(state);
        assert_eq!(joypad.read() & 0x0F, 0x0F);
    }

    #[test]
    fn selecting_directions_reports_pressed_bits_low() {
        let state = InputState::new();
        state.set_directions(BUTTON_DOWN | BUTTON_UP);
        let mut joypad = Joypad::new(state);
        joypad.write(0x10); // select_actions bit cleared -> actions selected; clear select_directions too
        joypad.write(0x20); // select_directions lines active (bit4=0)
        let value = joypad.read();
        assert_eq!(value & BUTTON_DOWN, 0);
        assert_eq!(value & BUTTON_UP, 0);
    }

    #[test]
    fn pressing_a_button_raises_joypad_interrupt_once() {
        let state = InputState::new();
        let mut joypad = Joypad::new(state.clone());
        joypad.write(0x20);
        assert!(!joypad.poll());
        state.set_directions(BUTTON_RIGHT);
        assert!(joypad.poll());
        assert!(!joypad.poll());
    }
}
