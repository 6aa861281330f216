// Top-level facade: owns the interpreter thread and exposes the host-facing
// core API (create/configure/load/get_current_frame/get_audio_data/
// set_input_state/toggle_pause/get_exception_message) described in the
// external interfaces section of the design.

mod bus;
pub mod cartridge;
mod cpu;
pub mod debugger;
pub mod display;
pub mod error;
pub mod host;
pub mod input;
pub mod publish;
mod registers;
pub mod save;
pub mod sound;
mod timer;
pub mod timing;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{error, info};

use bus::MemoryBus;
use cartridge::Cartridge;
use cpu::Cpu;
use display::{Frame, LCD_HEIGHT, LCD_WIDTH};
use host::{Configuration, ExceptionSlot, HostCallbacks, RawInputState};
use input::InputState;
use publish::Consumer;
use save::SaveManager;
use sound::AudioFrame;
use timing::{PaceOutcome, TimingCoordinator, WakeEvent};

pub const FRAME_BYTE_LEN: usize = LCD_WIDTH * LCD_HEIGHT * 4;

struct RunningSession {
    frame_consumer: Consumer<Frame>,
    audio_consumer: Consumer<AudioFrame>,
    continue_running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    wake: Arc<WakeEvent>,
    pause_wake: Arc<WakeEvent>,
    speed_multiplier: Arc<Mutex<f64>>,
    thread: JoinHandle<()>,
}

/// Owns the emulator core for one loaded cartridge. Generic over the host's
/// callback implementation so the core never depends on any concrete I/O or
/// windowing crate.
pub struct GameBoy<H: HostCallbacks + 'static> {
    host: Arc<H>,
    configuration: Mutex<Configuration>,
    input_state: InputState,
    exceptions: Arc<ExceptionSlot>,
    last_frame: Mutex<Box<Frame>>,
    audio_queue: Mutex<VecDeque<(i16, i16)>>,
    session: Mutex<Option<RunningSession>>,
}

impl<H: HostCallbacks + 'static> GameBoy<H> {
    /// `create(user_data)` from the external interface: `host` plays the
    /// role of the opaque user-data pointer, carrying the callbacks the
    /// core invokes for file IO, the clock, and pacing notifications.
    pub fn create(host: Arc<H>) -> Self {
        GameBoy {
            host,
            configuration: Mutex::new(Configuration::default()),
            input_state: InputState::new(),
            exceptions: Arc::new(ExceptionSlot::new()),
            last_frame: Mutex::new(Box::new(Frame::default())),
            audio_queue: Mutex::new(VecDeque::new()),
            session: Mutex::new(None),
        }
    }

    pub fn configure(&self, enable_video: bool, enable_audio: bool) {
        *self.configuration.lock().unwrap() = Configuration { enable_video, enable_audio };
    }

    /// Loads the cartridge at `path`, restores any existing save data, and
    /// starts the interpreter thread. Replaces any previously running
    /// session (stopping it first).
    pub fn load(&self, path: &str) -> error::CoreResult<()> {
        self.stop();

        let rom = self
            .host
            .load_file(path)
            .map_err(|e| error::CoreError::InvalidCartridge(format!("failed to read {path}: {e}")))?;
        let now = self.host.local_now();
        let mut cartridge = Cartridge::from_bytes(rom, now)?;

        let rom_basename = path.strip_suffix(".gb").unwrap_or(path).to_string();
        let save_manager = SaveManager::new(rom_basename);
        save_manager.load(&mut cartridge, self.host.as_ref());

        let (bus, frame_consumer, audio_consumer) =
            MemoryBus::new(cartridge, self.input_state.clone(), now);
        let cpu = Cpu::new();

        let continue_running = Arc::new(AtomicBool::new(true));
        let paused = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(WakeEvent::new());
        let pause_wake = Arc::new(WakeEvent::new());
        let speed_multiplier = Arc::new(Mutex::new(1.0));

        {
            let wake = wake.clone();
            self.host.register_periodic_notification(Arc::new(move || wake.notify()));
        }

        let host = self.host.clone();
        let exceptions = self.exceptions.clone();
        let thread_continue_running = continue_running.clone();
        let thread_paused = paused.clone();
        let thread_wake = wake.clone();
        let thread_pause_wake = pause_wake.clone();
        let thread_speed_multiplier = speed_multiplier.clone();

        // `Cpu::new` already seeds post-boot register state matching real
        // hardware immediately after the boot ROM hands off control, so no
        // separate boot-ROM execution pass is needed here.
        let thread = std::thread::spawn(move || {
            run_interpreter(
                cpu,
                bus,
                save_manager,
                host,
                exceptions,
                thread_continue_running,
                thread_paused,
                thread_wake,
                thread_pause_wake,
                thread_speed_multiplier,
            );
        });

        *self.session.lock().unwrap() = Some(RunningSession {
            frame_consumer,
            audio_consumer,
            continue_running,
            paused,
            wake,
            pause_wake,
            speed_multiplier,
            thread,
        });
        Ok(())
    }

    /// Sets the fast/slow-forward multiplier for the running session (1.0
    /// is normal speed); has no effect if no cartridge is loaded.
    pub fn set_speed_multiplier(&self, multiplier: f64) {
        if let Some(session) = self.session.lock().unwrap().as_ref() {
            *session.speed_multiplier.lock().unwrap() = multiplier;
        }
    }

    fn stop(&self) {
        if let Some(session) = self.session.lock().unwrap().take() {
            timing::request_stop(&session.continue_running, &session.wake, &session.pause_wake);
            self.host.unregister_periodic_notification();
            let _ = session.thread.join();
        }
    }

    /// Non-blocking: writes the most recently published frame as 160x144
    /// RGBA8888 into `out`, or the last-known frame (a solid white default
    /// before the first frame is ever produced) if nothing new has
    /// published since the previous call.
    pub fn get_current_frame(&self, out: &mut [u8]) {
        if let Some(session) = self.session.lock().unwrap().as_ref() {
            if let Some(new_frame) = session.frame_consumer.take() {
                let mut last_frame = self.last_frame.lock().unwrap();
                let old = std::mem::replace(&mut *last_frame, new_frame);
                session.frame_consumer.return_buffer(old);
            }
        }
        self.last_frame.lock().unwrap().to_rgba_bytes(out);
    }

    /// Consumer pull of interleaved 16-bit stereo samples. Drains published
    /// `AudioFrame`s into an internal queue and hands out up to
    /// `sample_count` stereo frames (2 * sample_count i16 values); pads the
    /// tail with silence on underrun rather than blocking.
    pub fn get_audio_data(&self, out: &mut [i16], sample_count: usize) {
        let mut queue = self.audio_queue.lock().unwrap();
        if let Some(session) = self.session.lock().unwrap().as_ref() {
            while queue.len() < sample_count {
                match session.audio_consumer.take() {
                    Some(frame) => {
                        queue.extend(frame.samples.iter().copied());
                        session.audio_consumer.return_buffer(frame);
                    }
                    None => break,
                }
            }
        }
        for i in 0..sample_count {
            let (l, r) = queue.pop_front().unwrap_or((0, 0));
            if out.len() > 2 * i + 1 {
                out[2 * i] = l;
                out[2 * i + 1] = r;
            }
        }
    }

    pub fn set_input_state(&self, raw: RawInputState) {
        self.input_state.set_directions(raw.direction_mask());
        self.input_state.set_actions(raw.action_mask());
    }

    pub fn toggle_pause(&self) {
        if let Some(session) = self.session.lock().unwrap().as_ref() {
            let now_paused = !session.paused.load(Ordering::Acquire);
            session.paused.store(now_paused, Ordering::Release);
            session.pause_wake.notify();
        }
    }

    pub fn get_exception_message(&self) -> Option<String> {
        self.exceptions.take()
    }
}

impl<H: HostCallbacks + 'static> Drop for GameBoy<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn run_interpreter<H: HostCallbacks>(
    mut cpu: Cpu,
    mut bus: MemoryBus,
    mut save_manager: SaveManager,
    host: Arc<H>,
    exceptions: Arc<ExceptionSlot>,
    continue_running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    wake: Arc<WakeEvent>,
    pause_wake: Arc<WakeEvent>,
    speed_multiplier: Arc<Mutex<f64>>,
) {
    let mut coordinator = TimingCoordinator::new(continue_running.clone(), paused, wake, pause_wake);
    let mut last_seen_frame = bus.display.frames_rendered();
    info!("interpreter thread started");

    while continue_running.load(Ordering::Acquire) {
        match cpu.step(&mut bus) {
            Ok(cycles) => bus.step(cycles),
            Err(err) => {
                error!("interpreter stopped on fatal error: {err}");
                exceptions.set(err.to_string());
                break;
            }
        }

        let frames_rendered = bus.display.frames_rendered();
        if frames_rendered != last_seen_frame {
            last_seen_frame = frames_rendered;
            // Refreshed once per frame (~59.7 Hz), not per instruction: the
            // RTC only needs wall-clock resolution to the second, and this
            // keeps the host callback off the instruction hot path.
            bus.set_current_time(host.local_now());
            save_manager.maybe_flush(&mut bus.cartridge, host.as_ref());
            coordinator.speed_multiplier = *speed_multiplier.lock().unwrap();
            if coordinator.pace(bus.timer.clock_value()) == PaceOutcome::Stop {
                break;
            }
        }
    }

    save_manager.flush(&mut bus.cartridge, host.as_ref());
    info!("interpreter thread stopped");
}
