//! Shared frame clock.
//!
//! Each sender owns one [`Timer`]. The frame-timer thread advances it, the
//! network-callback thread starts it and reads it, and the render thread reads
//! it. All access goes through the inner mutex and every call holds the lock
//! only for the duration of that call.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Copy of a timer's state taken under its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerState {
    /// Frame currently displayed/sent, always inside `0..frame_count - 1`
    /// once the timer runs.
    pub frame: i32,
    /// Monotonic frame counter. Negative values are pre-roll.
    pub total_frame: i64,
    pub running: bool,
}

impl Default for TimerState {
    fn default() -> Self {
        Self {
            frame: -1,
            total_frame: -1,
            running: false,
        }
    }
}

impl TimerState {
    /// Advances the counter by `steps` and re-derives the display frame.
    pub fn advance(&mut self, steps: u64, frame_count: usize) {
        self.total_frame += steps as i64;
        self.frame = display_frame(self.total_frame, frame_count);
    }
}

/// Maps a total frame counter onto the looping animation.
///
/// The animation loops over `frame_count - 1` frames; pre-roll maps to 0.
pub fn display_frame(total_frame: i64, frame_count: usize) -> i32 {
    if total_frame < 0 || frame_count < 2 {
        return 0;
    }
    (total_frame % (frame_count as i64 - 1)) as i32
}

/// Mutex-guarded frame clock.
#[derive(Debug, Default)]
pub struct Timer {
    state: Mutex<TimerState>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the clock at `total_frame` unless it is already running.
    ///
    /// Returns `true` if this call started it.
    pub fn start(&self, total_frame: i64, frame_count: usize) -> bool {
        let mut state = self.lock();
        if state.running {
            return false;
        }
        state.running = true;
        state.total_frame = total_frame;
        state.frame = display_frame(total_frame, frame_count);
        true
    }

    /// Advances a running clock by `steps` ticks. Stopped clocks are left alone.
    pub fn tick(&self, steps: u64, frame_count: usize) {
        let mut state = self.lock();
        if state.running {
            state.advance(steps, frame_count);
        }
    }

    pub fn stop(&self) {
        *self.lock() = TimerState::default();
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Current display frame.
    pub fn frame(&self) -> i32 {
        self.lock().frame
    }

    pub fn snapshot(&self) -> TimerState {
        *self.lock()
    }
}
