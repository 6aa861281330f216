// Desktop host wrapper: a minifb window for video, a rodio sink for audio,
// a clap CLI, and a serde/toml config file under the user's config
// directory. Implements `HostCallbacks` against the real filesystem and
// wall clock; everything cycle-accurate lives in the library crate.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use log::warn;
use minifb::{Key, KeyRepeat, Window, WindowOptions};
use rodio::{OutputStream, Sink, Source};
use serde::{Deserialize, Serialize};

use gb_core::display::{LCD_HEIGHT, LCD_WIDTH};
use gb_core::host::{HostCallbacks, RawInputState};
use gb_core::{GameBoy, FRAME_BYTE_LEN};

#[derive(Parser)]
#[command(name = "gb", about = "Game Boy (DMG) emulator")]
struct Args {
    /// Path to a .gb ROM image.
    rom: PathBuf,

    /// Attach the interactive step debugger instead of running freely.
    #[arg(long)]
    debug: bool,

    /// Emulation speed multiplier (2.0 = double speed, 0.5 = half speed).
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Disable audio output.
    #[arg(long)]
    mute: bool,

    /// Directory to read/write .sav and .rtc files from, instead of next
    /// to the ROM.
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Run without a window or audio device, e.g. for scripted playback.
    #[arg(long)]
    headless: bool,
}

#[derive(Serialize, Deserialize, Default)]
struct AppConfig {
    #[serde(default)]
    mute: bool,
    #[serde(default)]
    last_rom: Option<PathBuf>,
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("gb-core").join("config.toml"))
}

fn load_config() -> AppConfig {
    let Some(path) = config_path() else { return AppConfig::default() };
    match fs::read_to_string(&path) {
        Ok(text) => toml::from_str(&text).unwrap_or_default(),
        Err(_) => AppConfig::default(),
    }
}

fn save_config(config: &AppConfig) {
    let Some(path) = config_path() else { return };
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    if let Ok(text) = toml::to_string_pretty(config) {
        let _ = fs::write(path, text);
    }
}

struct DesktopHost {
    periodic: Mutex<Option<(timer::Timer, timer::Guard)>>,
    save_dir: Option<PathBuf>,
}

impl DesktopHost {
    fn new(save_dir: Option<PathBuf>) -> Self {
        DesktopHost { periodic: Mutex::new(None), save_dir }
    }

    /// Redirects `.sav`/`.rtc` paths (the only files `SaveManager` ever
    /// asks for) into `save_dir` when one was configured; everything else
    /// (the ROM itself) is read from wherever it was given.
    fn resolve(&self, path: &str) -> PathBuf {
        match &self.save_dir {
            Some(dir) if path.ends_with(".sav") || path.ends_with(".rtc") => {
                let name = PathBuf::from(path);
                dir.join(name.file_name().unwrap_or_default())
            }
            _ => PathBuf::from(path),
        }
    }
}

impl HostCallbacks for DesktopHost {
    fn local_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn load_file(&self, path: &str) -> std::io::Result<Vec<u8>> {
        fs::read(self.resolve(path))
    }

    fn write_file(&self, path: &str, data: &[u8]) -> std::io::Result<()> {
        let resolved = self.resolve(path);
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(resolved, data)
    }

    fn register_periodic_notification(&self, cb: Arc<dyn Fn() + Send + Sync>) {
        let timer = timer::Timer::new();
        let guard = timer.schedule_repeating(chrono::Duration::milliseconds(1), move || cb());
        *self.periodic.lock().unwrap() = Some((timer, guard));
    }

    fn unregister_periodic_notification(&self) {
        *self.periodic.lock().unwrap() = None;
    }

    fn stdout(&self, message: &str) {
        println!("{message}");
    }
}

/// Adapts `GameBoy::get_audio_data` pull semantics to rodio's push-style
/// `Iterator`/`Source` interface, buffering a small batch of stereo frames
/// at a time rather than crossing the API boundary one sample at a time.
struct EmulatorAudioSource {
    gb: Arc<GameBoy<DesktopHost>>,
    pending: VecDeque<i16>,
}

impl Iterator for EmulatorAudioSource {
    type Item = i16;

    fn next(&mut self) -> Option<i16> {
        if self.pending.is_empty() {
            const BATCH_STEREO_FRAMES: usize = 256;
            let mut buf = vec![0i16; BATCH_STEREO_FRAMES * 2];
            self.gb.get_audio_data(&mut buf, BATCH_STEREO_FRAMES);
            self.pending.extend(buf);
        }
        self.pending.pop_front()
    }
}

impl Source for EmulatorAudioSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }
    fn channels(&self) -> u16 {
        2
    }
    fn sample_rate(&self) -> u32 {
        44_100
    }
    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

fn poll_input(window: &Window) -> RawInputState {
    let held = |key| if window.is_key_down(key) { 0xFF } else { 0x00 };
    RawInputState {
        up: held(Key::Up),
        down: held(Key::Down),
        left: held(Key::Left),
        right: held(Key::Right),
        a: held(Key::Z),
        b: held(Key::X),
        start: held(Key::Enter),
        select: held(Key::RightShift),
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let mut config = load_config();
    config.last_rom = Some(args.rom.clone());
    save_config(&config);

    let rom_path = args.rom.to_string_lossy().to_string();

    if args.debug {
        let host = DesktopHost::new(args.save_dir);
        if let Err(err) = gb_core::debugger::run_debug_session(&rom_path, &host) {
            eprintln!("debug session ended with an error: {err}");
            std::process::exit(1);
        }
        return;
    }

    let host = Arc::new(DesktopHost::new(args.save_dir.clone()));
    let gb = Arc::new(GameBoy::create(host));
    gb.configure(!args.headless, !(args.headless || args.mute || config.mute));

    if let Err(err) = gb.load(&rom_path) {
        eprintln!("failed to load {rom_path}: {err}");
        std::process::exit(1);
    }
    gb.set_speed_multiplier(args.speed);

    if args.headless {
        loop {
            std::thread::sleep(Duration::from_millis(100));
            if let Some(message) = gb.get_exception_message() {
                eprintln!("emulation stopped: {message}");
                break;
            }
        }
        return;
    }

    let mut window = Window::new(
        "gb-core",
        LCD_WIDTH,
        LCD_HEIGHT,
        WindowOptions { resize: true, ..WindowOptions::default() },
    )
    .expect("failed to open emulator window");
    window.limit_update_rate(Some(Duration::from_micros(16_600)));

    let audio_sink = if !args.mute && !config.mute {
        match OutputStream::try_default() {
            Ok((stream, handle)) => {
                let sink = Sink::try_new(&handle).expect("failed to build audio sink");
                sink.append(EmulatorAudioSource { gb: gb.clone(), pending: VecDeque::new() });
                Some((stream, sink))
            }
            Err(err) => {
                warn!("no audio output device available: {err}");
                None
            }
        }
    } else {
        None
    };

    let mut rgba = vec![0u8; FRAME_BYTE_LEN];
    let mut pixels = vec![0u32; LCD_WIDTH * LCD_HEIGHT];

    while window.is_open() && !window.is_key_down(Key::Escape) {
        gb.get_current_frame(&mut rgba);
        for i in 0..LCD_WIDTH * LCD_HEIGHT {
            let r = rgba[i * 4] as u32;
            let g = rgba[i * 4 + 1] as u32;
            let b = rgba[i * 4 + 2] as u32;
            pixels[i] = (r << 16) | (g << 8) | b;
        }
        window.update_with_buffer(&pixels, LCD_WIDTH, LCD_HEIGHT).expect("failed to present frame");

        gb.set_input_state(poll_input(&window));

        if window.is_key_pressed(Key::P, KeyRepeat::No) {
            gb.toggle_pause();
        }

        if let Some(message) = gb.get_exception_message() {
            eprintln!("emulation stopped: {message}");
            break;
        }
    }

    drop(audio_sink);
}
