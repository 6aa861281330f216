// Paces the interpreter thread's emulated clock against real wall-clock
// time: after each finished frame the interpreter blocks here until real
// time has caught up with emulated time, honoring pause/resume and a
// fast/slow speed multiplier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const CPU_FREQ_HZ: f64 = 4_194_304.0;
const WAKE_TIMEOUT: Duration = Duration::from_millis(250);

/// A level-triggered wake event: `notify` latches, `wait_timeout` consumes
/// the latch if set or returns after the timeout either way. Used both for
/// the ~1 ms pacing notifications the host delivers and for the
/// pause/unpause edge.
pub struct WakeEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl WakeEvent {
    pub fn new() -> Self {
        WakeEvent { signaled: Mutex::new(false), condvar: Condvar::new() }
    }

    pub fn notify(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.condvar.notify_all();
    }

    fn wait_timeout(&self, timeout: Duration) {
        let signaled = self.signaled.lock().unwrap();
        let (mut signaled, _) = self
            .condvar
            .wait_timeout_while(signaled, timeout, |s| !*s)
            .unwrap();
        *signaled = false;
    }
}

impl Default for WakeEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PaceOutcome {
    Continue,
    Stop,
}

pub struct TimingCoordinator {
    accumulated_emulated_seconds: f64,
    anchor_real_tick: Instant,
    pub speed_multiplier: f64,
    continue_running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    wake: Arc<WakeEvent>,
    pause_wake: Arc<WakeEvent>,
}

impl TimingCoordinator {
    pub fn new(
        continue_running: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
        wake: Arc<WakeEvent>,
        pause_wake: Arc<WakeEvent>,
    ) -> Self {
        TimingCoordinator {
            accumulated_emulated_seconds: 0.0,
            anchor_real_tick: Instant::now(),
            speed_multiplier: 1.0,
            continue_running,
            paused,
            wake,
            pause_wake,
        }
    }

    /// Blocks until real time has caught up with the emulated clock value
    /// reached at the end of the most recently rendered frame, honoring
    /// pause and the 250 ms liveness timeout. Returns `Stop` once
    /// `continue_running` is cleared so the interpreter thread can unwind.
    pub fn pace(&mut self, clock_value: u64) -> PaceOutcome {
        let emulated_seconds_now = clock_value as f64 / CPU_FREQ_HZ;
        loop {
            if !self.continue_running.load(Ordering::Acquire) {
                return PaceOutcome::Stop;
            }
            if self.paused.load(Ordering::Acquire) {
                self.accumulated_emulated_seconds = emulated_seconds_now;
                self.pause_wake.wait_timeout(WAKE_TIMEOUT);
                if !self.paused.load(Ordering::Acquire) {
                    self.anchor_real_tick = Instant::now();
                }
                continue;
            }
            let elapsed_emulated = emulated_seconds_now - self.accumulated_emulated_seconds;
            let target_real_seconds = elapsed_emulated / self.speed_multiplier;
            let real_elapsed = self.anchor_real_tick.elapsed().as_secs_f64();
            if real_elapsed >= target_real_seconds {
                return PaceOutcome::Continue;
            }
            self.wake.wait_timeout(WAKE_TIMEOUT);
        }
    }
}

/// Signals a running interpreter thread to stop and wakes it out of both
/// wait points so it can observe `continue_running` and unwind. The caller
/// is responsible for joining the thread afterwards.
pub fn request_stop(continue_running: &AtomicBool, wake: &WakeEvent, pause_wake: &WakeEvent) {
    continue_running.store(false, Ordering::Release);
    wake.notify();
    pause_wake.notify();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn pace_returns_immediately_once_real_time_has_caught_up() {
        let continue_running = Arc::new(AtomicBool::new(true));
        let paused = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(WakeEvent::new());
        let pause_wake = Arc::new(WakeEvent::new());
        let mut coordinator = TimingCoordinator::new(continue_running, paused, wake, pause_wake);
        // Clock value of 0 means zero emulated seconds elapsed; real time is
        // always already caught up.
        assert_eq!(coordinator.pace(0), PaceOutcome::Continue);
    }

    #[test]
    fn stop_request_wakes_a_blocked_coordinator() {
        let continue_running = Arc::new(AtomicBool::new(true));
        let paused = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(WakeEvent::new());
        let pause_wake = Arc::new(WakeEvent::new());
        let mut coordinator = TimingCoordinator::new(
            continue_running.clone(),
            paused,
            wake.clone(),
            pause_wake.clone(),
        );
        let handle = thread::spawn(move || {
            // A huge clock value demands a long real-time wait; without the
            // stop signal this would block for a long time.
            coordinator.pace(4_194_304 * 3600)
        });
        thread::sleep(Duration::from_millis(20));
        request_stop(&continue_running, &wake, &pause_wake);
        assert_eq!(handle.join().unwrap(), PaceOutcome::Stop);
    }

    #[test]
    fn pause_then_resume_reanchors_without_demanding_the_paused_interval() {
        let continue_running = Arc::new(AtomicBool::new(true));
        let paused = Arc::new(AtomicBool::new(true));
        let wake = Arc::new(WakeEvent::new());
        let pause_wake = Arc::new(WakeEvent::new());
        let mut coordinator = TimingCoordinator::new(
            continue_running.clone(),
            paused.clone(),
            wake.clone(),
            pause_wake.clone(),
        );
        let handle = thread::spawn(move || coordinator.pace(4_194_304));
        thread::sleep(Duration::from_millis(20));
        paused.store(false, Ordering::Release);
        pause_wake.notify();
        assert_eq!(handle.join().unwrap(), PaceOutcome::Continue);
    }
}
